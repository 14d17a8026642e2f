//! Instruction decoder
//!
//! Thin structured layer over iced-x86. Every component that needs to know
//! what the bytes at an address mean asks this module; nothing else
//! interprets raw instruction bytes.

use crate::error::{Result, ScanError};
use crate::memory::MemoryView;

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Formatter, InstructionInfoFactory, IntelFormatter,
    OpAccess, OpKind,
};
use std::fmt;

pub use iced_x86::{Mnemonic, Register};

/// Longest legal x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Control-flow class of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Sequential,
    Call,
    IndirectCall,
    Jump,
    IndirectJump,
    ConditionalJump,
    Return,
    /// int3, int n, ud2 and friends
    Interrupt,
}

impl From<FlowControl> for Flow {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::Next | FlowControl::XbeginXabortXend => Flow::Sequential,
            FlowControl::UnconditionalBranch => Flow::Jump,
            FlowControl::IndirectBranch => Flow::IndirectJump,
            FlowControl::ConditionalBranch => Flow::ConditionalJump,
            FlowControl::Return => Flow::Return,
            FlowControl::Call => Flow::Call,
            FlowControl::IndirectCall => Flow::IndirectCall,
            FlowControl::Interrupt | FlowControl::Exception => Flow::Interrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Register,
    pub index: Register,
    pub scale: u32,
    /// Signed displacement; for RIP-relative operands see `rip_target`
    pub displacement: i64,
    /// Absolute address of a RIP-relative operand
    pub rip_target: Option<usize>,
    /// Access width in bytes (0 when the instruction doesn't access memory)
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Memory(MemoryOperand),
    Immediate(u64),
    Branch(usize),
    Other,
}

/// One decoded instruction
#[derive(Clone)]
pub struct Instruction {
    address: usize,
    len: usize,
    flow: Flow,
    operands: Vec<Operand>,
    /// (offset, size) of the displacement field within the encoding
    displacement_field: Option<(usize, usize)>,
    raw: iced_x86::Instruction,
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.address, self)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut formatter = IntelFormatter::new();
        let mut text = String::new();
        formatter.format(&self.raw, &mut text);
        f.write_str(&text)
    }
}

impl Instruction {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn next_address(&self) -> usize {
        self.address + self.len
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.raw.mnemonic()
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Option<Operand> {
        self.operands.get(index).copied()
    }

    /// The underlying iced instruction, for the emulator
    pub fn raw(&self) -> &iced_x86::Instruction {
        &self.raw
    }

    /// Direct call/jump target
    pub fn branch_target(&self) -> Option<usize> {
        self.operands.iter().find_map(|op| match op {
            Operand::Branch(target) => Some(*target),
            _ => None,
        })
    }

    /// Resolved absolute address of a RIP-relative memory operand
    pub fn rip_target(&self) -> Option<usize> {
        self.memory_operand().and_then(|m| m.rip_target)
    }

    pub fn memory_operand(&self) -> Option<MemoryOperand> {
        self.operands.iter().find_map(|op| match op {
            Operand::Memory(m) => Some(*m),
            _ => None,
        })
    }

    /// Address the encoded displacement field starts at
    pub fn displacement_address(&self) -> Option<usize> {
        self.displacement_field
            .map(|(offset, _)| self.address + offset)
    }

    /// Any address this instruction encodes: branch target or RIP operand
    pub fn referenced_address(&self) -> Option<usize> {
        self.branch_target().or_else(|| self.rip_target())
    }

    pub fn writes_memory(&self) -> bool {
        self.memory_access(|access| {
            matches!(
                access,
                OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
            )
        })
    }

    pub fn reads_memory(&self) -> bool {
        self.memory_access(|access| {
            matches!(
                access,
                OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
            )
        })
    }

    fn memory_access(&self, wanted: impl Fn(OpAccess) -> bool) -> bool {
        let mut factory = InstructionInfoFactory::new();
        let info = factory.info(&self.raw);
        info.used_memory().iter().any(|m| wanted(m.access()))
    }

    /// Access width of the memory operand in bytes
    pub fn memory_size(&self) -> usize {
        self.raw.memory_size().size()
    }

    pub fn is_nop(&self) -> bool {
        matches!(self.raw.mnemonic(), Mnemonic::Nop | Mnemonic::Int3)
    }
}

/// Decode one instruction from `bytes`, which start at `address`
pub fn decode_slice(bytes: &[u8], address: usize) -> Result<Instruction> {
    let mut decoder = Decoder::with_ip(64, bytes, address as u64, DecoderOptions::NONE);
    let raw = decoder.decode();
    if raw.is_invalid() {
        return Err(ScanError::Decode { address });
    }

    let offsets = decoder.get_constant_offsets(&raw);
    let displacement_field = offsets
        .has_displacement()
        .then(|| (offsets.displacement_offset(), offsets.displacement_size()));

    let operands = (0..raw.op_count())
        .map(|i| convert_operand(&raw, i))
        .collect();

    Ok(Instruction {
        address,
        len: raw.len(),
        flow: raw.flow_control().into(),
        operands,
        displacement_field,
        raw,
    })
}

/// Decode the instruction at `address`
pub fn decode_at(view: &MemoryView, address: usize) -> Result<Instruction> {
    let bytes = view.read_up_to(address, MAX_INSTRUCTION_LEN)?;
    decode_slice(&bytes, address)
}

fn convert_operand(raw: &iced_x86::Instruction, index: u32) -> Operand {
    match raw.op_kind(index) {
        OpKind::Register => Operand::Register(raw.op_register(index)),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Operand::Branch(raw.near_branch_target() as usize)
        }
        OpKind::Immediate8
        | OpKind::Immediate8_2nd
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Operand::Immediate(raw.immediate(index)),
        OpKind::Memory => {
            let rip = raw.is_ip_rel_memory_operand();
            Operand::Memory(MemoryOperand {
                base: raw.memory_base(),
                index: raw.memory_index(),
                scale: raw.memory_index_scale(),
                displacement: if rip {
                    0
                } else {
                    raw.memory_displacement64() as i64
                },
                rip_target: rip.then(|| raw.ip_rel_memory_address() as usize),
                size: raw.memory_size().size(),
            })
        }
        _ => Operand::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rip_relative_load() {
        // mov rax, [rip+0x100]
        let insn = decode_slice(&[0x48, 0x8B, 0x05, 0x00, 0x01, 0x00, 0x00], 0x1000).unwrap();
        assert_eq!(insn.len(), 7);
        assert_eq!(insn.mnemonic(), Mnemonic::Mov);
        assert_eq!(insn.flow(), Flow::Sequential);
        assert_eq!(insn.rip_target(), Some(0x1107));
        assert_eq!(insn.displacement_address(), Some(0x1003));
        assert_eq!(insn.operand(0), Some(Operand::Register(Register::RAX)));
        assert!(insn.reads_memory());
        assert!(!insn.writes_memory());
        assert_eq!(insn.memory_size(), 8);
    }

    #[test]
    fn test_decode_store_and_lea() {
        // mov [rip+0x10], rcx
        let store = decode_slice(&[0x48, 0x89, 0x0D, 0x10, 0x00, 0x00, 0x00], 0x2000).unwrap();
        assert!(store.writes_memory());
        assert_eq!(store.rip_target(), Some(0x2017));

        // lea rcx, [rip-0x10]
        let lea = decode_slice(&[0x48, 0x8D, 0x0D, 0xF0, 0xFF, 0xFF, 0xFF], 0x2000).unwrap();
        assert_eq!(lea.mnemonic(), Mnemonic::Lea);
        assert_eq!(lea.rip_target(), Some(0x1FF7));
        assert!(!lea.reads_memory());
        assert!(!lea.writes_memory());
    }

    #[test]
    fn test_decode_branches() {
        let call = decode_slice(&[0xE8, 0x10, 0x00, 0x00, 0x00], 0x1000).unwrap();
        assert_eq!(call.flow(), Flow::Call);
        assert_eq!(call.branch_target(), Some(0x1015));

        let jz = decode_slice(&[0x74, 0x05], 0x1000).unwrap();
        assert_eq!(jz.flow(), Flow::ConditionalJump);
        assert_eq!(jz.branch_target(), Some(0x1007));

        let loop_self = decode_slice(&[0xEB, 0xFE], 0x1000).unwrap();
        assert_eq!(loop_self.flow(), Flow::Jump);
        assert_eq!(loop_self.branch_target(), Some(0x1000));

        assert_eq!(decode_slice(&[0xC3], 0).unwrap().flow(), Flow::Return);
        assert_eq!(decode_slice(&[0xCC], 0).unwrap().flow(), Flow::Interrupt);
        assert_eq!(
            decode_slice(&[0xFF, 0xE0], 0).unwrap().flow(),
            Flow::IndirectJump
        );
        assert_eq!(
            decode_slice(&[0xFF, 0x10], 0).unwrap().flow(),
            Flow::IndirectCall
        );
    }

    #[test]
    fn test_decode_immediate_and_memory_operand() {
        // mov dword ptr [rcx+0x58], 0x20
        let insn =
            decode_slice(&[0xC7, 0x41, 0x58, 0x20, 0x00, 0x00, 0x00], 0x1000).unwrap();
        let mem = insn.memory_operand().unwrap();
        assert_eq!(mem.base, Register::RCX);
        assert_eq!(mem.displacement, 0x58);
        assert_eq!(mem.rip_target, None);
        assert_eq!(insn.operand(1), Some(Operand::Immediate(0x20)));
        assert!(insn.writes_memory());
    }

    #[test]
    fn test_decode_invalid_and_truncated() {
        // 0x06 (push es) is invalid in 64-bit mode
        assert!(matches!(
            decode_slice(&[0x06], 0x1234),
            Err(ScanError::Decode { address: 0x1234 })
        ));
        // Truncated mov rax, [rip+...]
        assert!(decode_slice(&[0x48, 0x8B, 0x05, 0x00], 0x1000).is_err());
    }

    #[test]
    fn test_display_uses_intel_syntax() {
        let insn = decode_slice(&[0x48, 0x89, 0xC8], 0x1000).unwrap();
        assert_eq!(insn.to_string(), "mov rax,rcx");
    }
}
