//! Synthetic CPU state for the partial emulator

use crate::disasm::Register;

use std::collections::HashMap;

/// High bits shared by every sentinel; the low 16 bits stay free so that
/// `sentinel + small offset` is still recognizable.
pub const SENTINEL_TAG: u64 = 0x5E71_0000_0000_0000;
const SENTINEL_MASK: u64 = 0xFFFF_0000_0000_0000;

/// Pushed as the return address of the emulated frame
pub const RETURN_SENTINEL: u64 = SENTINEL_TAG | 0xFFFF_FFFF_0000;

/// Synthetic stack in non-canonical space next to the sentinel tag, so no
/// real mapping and no plausible pointer can alias it
pub const STACK_BASE: usize = 0x5E70_0000_0000_0000;
pub const STACK_SIZE: usize = 0x10000;

pub fn is_sentinel(value: u64) -> bool {
    value & SENTINEL_MASK == SENTINEL_TAG
}

/// Sentinel id with any small offset stripped
pub fn sentinel_base(value: u64) -> u64 {
    value & !0xFFFF
}

#[derive(Debug, Default)]
pub struct SentinelAllocator {
    issued: u64,
}

impl SentinelAllocator {
    pub fn fresh(&mut self) -> u64 {
        self.issued += 1;
        SENTINEL_TAG | (self.issued << 16)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub zf: bool,
    pub sf: bool,
    pub cf: bool,
    pub of: bool,
}

/// Register file, flags and the emulator's private memory overlay
#[derive(Debug, Clone)]
pub struct Context {
    regs: [u64; 16],
    pub rip: usize,
    pub flags: Flags,
    overlay: HashMap<usize, u8>,
}

impl Context {
    pub fn new(start: usize) -> Self {
        let mut regs = [0u64; 16];
        regs[4] = (STACK_BASE + STACK_SIZE / 2) as u64;
        Self {
            regs,
            rip: start,
            flags: Flags::default(),
            overlay: HashMap::new(),
        }
    }

    pub fn is_stack(address: usize) -> bool {
        (STACK_BASE..STACK_BASE + STACK_SIZE).contains(&address)
    }

    pub fn rsp(&self) -> u64 {
        self.regs[4]
    }

    pub fn set_rsp(&mut self, value: u64) {
        self.regs[4] = value;
    }

    pub fn register(&self, reg: Register) -> u64 {
        match slot(reg) {
            Some((index, shift, size)) => (self.regs[index] >> shift) & mask(size),
            None => 0,
        }
    }

    /// Write with x86-64 semantics: 32-bit writes zero-extend, narrower
    /// writes merge into the full register.
    pub fn set_register(&mut self, reg: Register, value: u64) {
        let Some((index, shift, size)) = slot(reg) else {
            return;
        };
        self.regs[index] = match size {
            8 => value,
            4 => value & 0xFFFF_FFFF,
            _ => {
                let field = mask(size) << shift;
                (self.regs[index] & !field) | ((value & mask(size)) << shift)
            }
        };
    }

    /// Byte previously written by the emulator, if any
    pub fn overlay_byte(&self, address: usize) -> Option<u8> {
        self.overlay.get(&address).copied()
    }

    pub fn store(&mut self, address: usize, size: usize, value: u64) {
        for (i, byte) in value.to_le_bytes().iter().take(size).enumerate() {
            self.overlay.insert(address.wrapping_add(i), *byte);
        }
    }

    /// All 16 general-purpose registers in encoding order
    pub fn registers(&self) -> &[u64; 16] {
        &self.regs
    }
}

pub(crate) fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// (index, bit shift, byte width) of a general-purpose register
fn slot(reg: Register) -> Option<(usize, u32, usize)> {
    let high = match reg {
        Register::AH => Some(0),
        Register::CH => Some(1),
        Register::DH => Some(2),
        Register::BH => Some(3),
        _ => None,
    };
    if let Some(index) = high {
        return Some((index, 8, 1));
    }
    if !reg.is_gpr() {
        return None;
    }
    let index = reg.full_register() as usize - Register::RAX as usize;
    (index < 16).then_some((index, 0, reg.size()))
}
