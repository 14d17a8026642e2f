//! Partial x86-64 emulator
//!
//! Interprets decoded instructions against a synthetic [`Context`]. Data
//! movement and integer arithmetic take effect; calls are never entered
//! (RAX receives a fresh sentinel instead); memory writes outside the
//! synthetic stack only land if the injected [`WritePolicy`] authorizes
//! them. Real memory is only ever read, through the checked view.

use super::context::{
    is_sentinel, mask, Context, SentinelAllocator, RETURN_SENTINEL,
};
use crate::disasm::{decode_at, Flow, Instruction, Register};
use crate::memory::MemoryView;

use iced_x86::{ConditionCode, Mnemonic, OpKind};
use std::ops::Range;
use tracing::trace;

/// Decides whether a non-stack memory write is applied to the overlay
pub trait WritePolicy {
    fn allows(&self, address: usize, size: usize, value: u64) -> bool;
}

impl<F> WritePolicy for F
where
    F: Fn(usize, usize, u64) -> bool,
{
    fn allows(&self, address: usize, size: usize, value: u64) -> bool {
        self(address, size, value)
    }
}

/// Skip every write outside the stack
pub struct AllowNone;

impl WritePolicy for AllowNone {
    fn allows(&self, _: usize, _: usize, _: u64) -> bool {
        false
    }
}

/// Apply writes that fall entirely inside a range
pub struct AllowRange(pub Range<usize>);

impl WritePolicy for AllowRange {
    fn allows(&self, address: usize, size: usize, _: u64) -> bool {
        address >= self.0.start && address.checked_add(size).is_some_and(|end| end <= self.0.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryWrite {
    pub address: usize,
    pub size: usize,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// Caller's predicate fired
    Predicate,
    /// Instruction budget exhausted
    Budget,
    DecodeFailed,
    /// Returned out of the emulated frame
    Return,
    /// Read of unreadable memory or control transfer to non-code
    Fault,
    /// int3, ud2 or another trapping instruction
    Trap,
}

/// What the predicate sees after each instruction
pub struct Step<'s> {
    pub instruction: &'s Instruction,
    pub context: &'s Context,
    /// Non-stack write performed by this instruction
    pub write: Option<MemoryWrite>,
    pub write_applied: bool,
}

#[derive(Debug)]
pub struct Emulation {
    pub halt: Halt,
    /// Address of the last instruction executed (or attempted)
    pub at: usize,
    pub steps: usize,
    pub unsupported: usize,
    pub writes: Vec<MemoryWrite>,
    pub skipped: Vec<MemoryWrite>,
    pub context: Context,
}

impl Emulation {
    pub fn register(&self, reg: Register) -> u64 {
        self.context.register(reg)
    }

    /// Address of the most recent applied write of `value` that the
    /// overlay still holds
    pub fn location_of(&self, value: u64) -> Option<usize> {
        self.writes
            .iter()
            .rev()
            .filter(|w| w.value == value && w.size == 8)
            .find(|w| {
                value
                    .to_le_bytes()
                    .iter()
                    .enumerate()
                    .all(|(i, b)| self.context.overlay_byte(w.address + i) == Some(*b))
            })
            .map(|w| w.address)
    }

    /// Applied and skipped writes, in execution order within each list
    pub fn stores(&self) -> impl Iterator<Item = &MemoryWrite> {
        self.writes.iter().chain(self.skipped.iter())
    }
}

pub struct Emulator<'a> {
    view: &'a MemoryView,
    ctx: Context,
    policy: Box<dyn WritePolicy + 'a>,
    sentinels: SentinelAllocator,
    budget: usize,
    steps: usize,
    unsupported: usize,
    writes: Vec<MemoryWrite>,
    skipped: Vec<MemoryWrite>,
    last_write: Option<(MemoryWrite, bool)>,
}

impl<'a> Emulator<'a> {
    pub fn new(view: &'a MemoryView, start: usize, budget: usize) -> Self {
        let mut ctx = Context::new(start);
        let rsp = ctx.rsp() - 8;
        ctx.set_rsp(rsp);
        ctx.store(rsp as usize, 8, RETURN_SENTINEL);

        Self {
            view,
            ctx,
            policy: Box::new(AllowNone),
            sentinels: SentinelAllocator::default(),
            budget,
            steps: 0,
            unsupported: 0,
            writes: Vec::new(),
            skipped: Vec::new(),
            last_write: None,
        }
    }

    pub fn with_policy<P: WritePolicy + 'a>(mut self, policy: P) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn set_register(&mut self, reg: Register, value: u64) {
        self.ctx.set_register(reg, value);
    }

    pub fn fresh_sentinel(&mut self) -> u64 {
        self.sentinels.fresh()
    }

    /// Seed `reg` with a fresh sentinel and return it
    pub fn seed_sentinel(&mut self, reg: Register) -> u64 {
        let value = self.sentinels.fresh();
        self.ctx.set_register(reg, value);
        value
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Step until the budget, a halt condition, or `predicate` returns true
    pub fn run<P>(mut self, mut predicate: P) -> Emulation
    where
        P: FnMut(&Step<'_>) -> bool,
    {
        let halt = loop {
            if self.steps >= self.budget {
                break Halt::Budget;
            }
            let insn = match decode_at(self.view, self.ctx.rip) {
                Ok(insn) => insn,
                Err(e) => {
                    trace!("emulation stops: {}", e);
                    break Halt::DecodeFailed;
                }
            };
            self.steps += 1;
            self.last_write = None;

            if let Err(halt) = self.execute(&insn) {
                self.ctx.rip = insn.address();
                break halt;
            }

            let step = Step {
                instruction: &insn,
                context: &self.ctx,
                write: self.last_write.map(|(w, _)| w),
                write_applied: self.last_write.map(|(_, applied)| applied).unwrap_or(false),
            };
            if predicate(&step) {
                self.ctx.rip = insn.address();
                break Halt::Predicate;
            }
        };

        Emulation {
            halt,
            at: self.ctx.rip,
            steps: self.steps,
            unsupported: self.unsupported,
            writes: self.writes,
            skipped: self.skipped,
            context: self.ctx,
        }
    }

    fn execute(&mut self, insn: &Instruction) -> Result<(), Halt> {
        let raw = insn.raw();
        self.ctx.rip = insn.next_address();

        match insn.flow() {
            Flow::Call | Flow::IndirectCall => {
                let value = self.sentinels.fresh();
                self.ctx.set_register(Register::RAX, value);
            }
            Flow::Return => {
                let target = self.pop()?;
                if target == RETURN_SENTINEL {
                    return Err(Halt::Return);
                }
                self.transfer(target)?;
            }
            Flow::Interrupt => return Err(Halt::Trap),
            Flow::Jump => {
                if let Some(target) = insn.branch_target() {
                    self.ctx.rip = target;
                }
            }
            Flow::IndirectJump => {
                let target = self.read_operand(raw, 0)?;
                self.transfer(target)?;
            }
            Flow::ConditionalJump => match raw.condition_code() {
                ConditionCode::None => self.unsupported += 1,
                cc => {
                    if self.condition(cc) {
                        if let Some(target) = insn.branch_target() {
                            self.ctx.rip = target;
                        }
                    }
                }
            },
            Flow::Sequential => self.execute_data(raw)?,
        }
        Ok(())
    }

    fn transfer(&mut self, target: u64) -> Result<(), Halt> {
        if self.view.is_executable(target as usize) {
            self.ctx.rip = target as usize;
            Ok(())
        } else {
            Err(Halt::Fault)
        }
    }

    fn execute_data(&mut self, raw: &iced_x86::Instruction) -> Result<(), Halt> {
        match raw.mnemonic() {
            Mnemonic::Mov | Mnemonic::Movzx => {
                let value = self.read_operand(raw, 1)?;
                self.write_operand(raw, 0, value)?;
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let value = self.read_operand(raw, 1)?;
                let extended = sign_extend(value, self.operand_size(raw, 1));
                self.write_operand(raw, 0, extended)?;
            }
            Mnemonic::Lea => {
                let address = self.effective_address(raw);
                self.write_operand(raw, 0, address as u64)?;
            }
            Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Cmp
            | Mnemonic::Test => self.binary(raw)?,
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => self.unary(raw)?,
            Mnemonic::Shl | Mnemonic::Sal | Mnemonic::Shr | Mnemonic::Sar => self.shift(raw)?,
            Mnemonic::Imul if raw.op_count() >= 2 => {
                let size = self.operand_size(raw, 0);
                let (a, b) = if raw.op_count() == 3 {
                    (self.read_operand(raw, 1)?, self.read_operand(raw, 2)?)
                } else {
                    (self.read_operand(raw, 0)?, self.read_operand(raw, 1)?)
                };
                let result = sign_extend(a, size).wrapping_mul(sign_extend(b, size));
                self.set_flags(size, result, false, false);
                self.write_operand(raw, 0, result)?;
            }
            Mnemonic::Push => {
                let value = self.read_operand(raw, 0)?;
                self.push(value)?;
            }
            Mnemonic::Pop => {
                let value = self.pop()?;
                self.write_operand(raw, 0, value)?;
            }
            Mnemonic::Xchg => {
                let a = self.read_operand(raw, 0)?;
                let b = self.read_operand(raw, 1)?;
                self.write_operand(raw, 0, b)?;
                self.write_operand(raw, 1, a)?;
            }
            Mnemonic::Nop | Mnemonic::Endbr64 | Mnemonic::Pause => {}
            m if is_cmov(m) => {
                if self.condition(raw.condition_code()) {
                    let value = self.read_operand(raw, 1)?;
                    self.write_operand(raw, 0, value)?;
                }
            }
            m if is_setcc(m) => {
                let value = self.condition(raw.condition_code()) as u64;
                self.write_operand(raw, 0, value)?;
            }
            _ => self.unsupported += 1,
        }
        Ok(())
    }

    fn binary(&mut self, raw: &iced_x86::Instruction) -> Result<(), Halt> {
        let size = self.operand_size(raw, 0);
        let a = self.read_operand(raw, 0)?;
        let b = self.read_operand(raw, 1)? & mask(size);
        let sign = 1u64 << (size * 8 - 1);

        let (result, cf, of) = match raw.mnemonic() {
            Mnemonic::Add => {
                let r = a.wrapping_add(b) & mask(size);
                (r, r < (a & mask(size)), (a ^ r) & (b ^ r) & sign != 0)
            }
            Mnemonic::Sub | Mnemonic::Cmp => {
                let r = a.wrapping_sub(b) & mask(size);
                (r, (a & mask(size)) < b, (a ^ b) & (a ^ r) & sign != 0)
            }
            Mnemonic::And | Mnemonic::Test => (a & b, false, false),
            Mnemonic::Or => (a | b, false, false),
            _ => (a ^ b, false, false),
        };
        self.set_flags(size, result, cf, of);

        if !matches!(raw.mnemonic(), Mnemonic::Cmp | Mnemonic::Test) {
            self.write_operand(raw, 0, result)?;
        }
        Ok(())
    }

    fn unary(&mut self, raw: &iced_x86::Instruction) -> Result<(), Halt> {
        let size = self.operand_size(raw, 0);
        let a = self.read_operand(raw, 0)?;
        let result = match raw.mnemonic() {
            Mnemonic::Inc => a.wrapping_add(1),
            Mnemonic::Dec => a.wrapping_sub(1),
            Mnemonic::Neg => 0u64.wrapping_sub(a),
            _ => !a,
        } & mask(size);

        match raw.mnemonic() {
            // inc/dec preserve CF
            Mnemonic::Inc | Mnemonic::Dec => {
                let cf = self.ctx.flags.cf;
                self.set_flags(size, result, cf, false);
            }
            Mnemonic::Neg => self.set_flags(size, result, a & mask(size) != 0, false),
            _ => {}
        }
        self.write_operand(raw, 0, result)
    }

    fn shift(&mut self, raw: &iced_x86::Instruction) -> Result<(), Halt> {
        let size = self.operand_size(raw, 0);
        let value = self.read_operand(raw, 0)? & mask(size);
        let raw_count = if raw.op_count() > 1 {
            self.read_operand(raw, 1)?
        } else {
            1
        };
        let count = raw_count & if size == 8 { 63 } else { 31 };

        if count == 0 {
            return Ok(());
        }
        let result = match raw.mnemonic() {
            Mnemonic::Shr => value >> count,
            Mnemonic::Sar => (sign_extend(value, size) as i64 >> count) as u64,
            _ => value << count,
        } & mask(size);
        self.set_flags(size, result, false, false);
        self.write_operand(raw, 0, result)
    }

    fn set_flags(&mut self, size: usize, result: u64, cf: bool, of: bool) {
        let result = result & mask(size);
        self.ctx.flags.zf = result == 0;
        self.ctx.flags.sf = result & (1u64 << (size * 8 - 1)) != 0;
        self.ctx.flags.cf = cf;
        self.ctx.flags.of = of;
    }

    fn condition(&self, cc: ConditionCode) -> bool {
        let f = self.ctx.flags;
        match cc {
            ConditionCode::o => f.of,
            ConditionCode::no => !f.of,
            ConditionCode::b => f.cf,
            ConditionCode::ae => !f.cf,
            ConditionCode::e => f.zf,
            ConditionCode::ne => !f.zf,
            ConditionCode::be => f.cf || f.zf,
            ConditionCode::a => !f.cf && !f.zf,
            ConditionCode::s => f.sf,
            ConditionCode::ns => !f.sf,
            // parity is not tracked
            ConditionCode::p => false,
            ConditionCode::np => true,
            ConditionCode::l => f.sf != f.of,
            ConditionCode::ge => f.sf == f.of,
            ConditionCode::le => f.zf || f.sf != f.of,
            ConditionCode::g => !f.zf && f.sf == f.of,
            ConditionCode::None => true,
        }
    }

    fn operand_size(&self, raw: &iced_x86::Instruction, index: u32) -> usize {
        match raw.op_kind(index) {
            OpKind::Register => raw.op_register(index).size(),
            OpKind::Memory => raw.memory_size().size(),
            OpKind::Immediate8 | OpKind::Immediate8_2nd => 1,
            OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
            OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
            _ => 8,
        }
    }

    fn effective_address(&self, raw: &iced_x86::Instruction) -> usize {
        if raw.is_ip_rel_memory_operand() {
            return raw.ip_rel_memory_address() as usize;
        }
        let base = match raw.memory_base() {
            Register::None => 0,
            reg => self.ctx.register(reg),
        };
        let index = match raw.memory_index() {
            Register::None => 0,
            reg => self.ctx.register(reg).wrapping_mul(raw.memory_index_scale() as u64),
        };
        base.wrapping_add(index)
            .wrapping_add(raw.memory_displacement64()) as usize
    }

    fn is_thread_local(raw: &iced_x86::Instruction) -> bool {
        matches!(raw.segment_prefix(), Register::FS | Register::GS)
    }

    fn read_operand(&mut self, raw: &iced_x86::Instruction, index: u32) -> Result<u64, Halt> {
        match raw.op_kind(index) {
            OpKind::Register => Ok(self.ctx.register(raw.op_register(index))),
            OpKind::Memory => {
                let size = raw.memory_size().size().min(8);
                if Self::is_thread_local(raw) {
                    return Ok(self.sentinels.fresh() & mask(size));
                }
                let address = self.effective_address(raw);
                self.load(address, size)
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(raw.near_branch_target())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(raw.immediate(index)),
            _ => Ok(0),
        }
    }

    fn write_operand(
        &mut self,
        raw: &iced_x86::Instruction,
        index: u32,
        value: u64,
    ) -> Result<(), Halt> {
        match raw.op_kind(index) {
            OpKind::Register => {
                self.ctx.set_register(raw.op_register(index), value);
            }
            OpKind::Memory => {
                let size = raw.memory_size().size().min(8);
                let address = self.effective_address(raw);
                if Self::is_thread_local(raw) {
                    self.record(address, size, value, false);
                } else {
                    self.store(address, size, value)?;
                }
            }
            _ => self.unsupported += 1,
        }
        Ok(())
    }

    /// Read `size` bytes: overlay first, then the synthetic stack, then
    /// real memory
    fn load(&mut self, address: usize, size: usize) -> Result<u64, Halt> {
        if is_sentinel(address as u64) {
            // Memory behind a sentinel is unknown; keep it traceable
            return Ok(if size == 8 { self.sentinels.fresh() } else { 0 });
        }

        if address.checked_add(size).is_none() {
            return Err(Halt::Fault);
        }

        let mut bytes = [0u8; 8];
        let mut missing = false;
        for (i, byte) in bytes.iter_mut().enumerate().take(size) {
            match self.ctx.overlay_byte(address + i) {
                Some(b) => *byte = b,
                None if Context::is_stack(address + i) => *byte = 0,
                None => missing = true,
            }
        }

        if missing {
            let real = self
                .view
                .read_bytes(address, size)
                .map_err(|_| Halt::Fault)?;
            for (i, byte) in bytes.iter_mut().enumerate().take(size) {
                if self.ctx.overlay_byte(address + i).is_none()
                    && !Context::is_stack(address + i)
                {
                    *byte = real[i];
                }
            }
        }
        Ok(u64::from_le_bytes(bytes) & mask(size))
    }

    /// A write whose span wraps the address space faults
    fn store(&mut self, address: usize, size: usize, value: u64) -> Result<(), Halt> {
        if address.checked_add(size).is_none() {
            return Err(Halt::Fault);
        }
        let value = value & mask(size);
        if Context::is_stack(address) {
            self.ctx.store(address, size, value);
            return Ok(());
        }
        let applied = self.policy.allows(address, size, value);
        if applied {
            self.ctx.store(address, size, value);
        }
        self.record(address, size, value, applied);
        Ok(())
    }

    fn record(&mut self, address: usize, size: usize, value: u64, applied: bool) {
        let write = MemoryWrite {
            address,
            size,
            value,
        };
        if applied {
            self.writes.push(write);
        } else {
            trace!("skipped write of {:#x} to {:#x}", value, address);
            self.skipped.push(write);
        }
        self.last_write = Some((write, applied));
    }

    fn push(&mut self, value: u64) -> Result<(), Halt> {
        let rsp = self.ctx.rsp().wrapping_sub(8);
        self.ctx.set_rsp(rsp);
        self.store(rsp as usize, 8, value)
    }

    fn pop(&mut self) -> Result<u64, Halt> {
        let rsp = self.ctx.rsp();
        let value = self.load(rsp as usize, 8)?;
        self.ctx.set_rsp(rsp.wrapping_add(8));
        Ok(value)
    }
}

fn is_cmov(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Cmova
            | Mnemonic::Cmovae
            | Mnemonic::Cmovb
            | Mnemonic::Cmovbe
            | Mnemonic::Cmove
            | Mnemonic::Cmovg
            | Mnemonic::Cmovge
            | Mnemonic::Cmovl
            | Mnemonic::Cmovle
            | Mnemonic::Cmovne
            | Mnemonic::Cmovno
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovns
            | Mnemonic::Cmovo
            | Mnemonic::Cmovp
            | Mnemonic::Cmovs
    )
}

fn is_setcc(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Seta
            | Mnemonic::Setae
            | Mnemonic::Setb
            | Mnemonic::Setbe
            | Mnemonic::Sete
            | Mnemonic::Setg
            | Mnemonic::Setge
            | Mnemonic::Setl
            | Mnemonic::Setle
            | Mnemonic::Setne
            | Mnemonic::Setno
            | Mnemonic::Setnp
            | Mnemonic::Setns
            | Mnemonic::Seto
            | Mnemonic::Setp
            | Mnemonic::Sets
    )
}

fn sign_extend(value: u64, size: usize) -> u64 {
    match size {
        1 => value as u8 as i8 as i64 as u64,
        2 => value as u16 as i16 as i64 as u64,
        4 => value as u32 as i32 as i64 as u64,
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulate::context::STACK_BASE;
    use crate::memory::MockMemorySource;

    const CODE: usize = 0x140001000;
    const DATA: usize = 0x140010000;

    fn view(code: &[u8]) -> MemoryView {
        let mut data = vec![0u8; 0x100];
        data[0..8].copy_from_slice(&0x1234u64.to_le_bytes());
        MemoryView::from_source(
            MockMemorySource::default()
                .with_segment(CODE, code.to_vec(), "r-xp")
                .with_segment(DATA, data, "rw-p"),
        )
    }

    fn rel32(next: usize, target: usize) -> [u8; 4] {
        ((target as i64 - next as i64) as i32).to_le_bytes()
    }

    #[test]
    fn test_sentinel_propagates_to_memory() {
        let mut code = Vec::new();
        code.extend_from_slice(&[0x48, 0x89, 0xC8]); // mov rax, rcx
        code.extend_from_slice(&[0x48, 0x89, 0xC2]); // mov rdx, rax
        code.push(0xE8); // call (skipped, rax <- fresh sentinel)
        code.extend_from_slice(&rel32(CODE + 11, CODE + 0x800));
        // mov [rip+X], rax  -> DATA+0x40, unauthorized, skipped
        let at = CODE + code.len();
        code.extend_from_slice(&[0x48, 0x89, 0x05]);
        code.extend_from_slice(&rel32(at + 7, DATA + 0x40));
        code.extend_from_slice(&[0x49, 0x89, 0x50, 0x10]); // mov [r8+0x10], rdx
        code.push(0xC3); // ret

        let view = view(&code);
        let mut emu = Emulator::new(&view, CODE, 64)
            .with_policy(AllowRange(DATA + 0x80..DATA + 0x100));
        let sentinel = emu.seed_sentinel(Register::RCX);
        emu.set_register(Register::R8, (DATA + 0x80) as u64);

        let run = emu.run(|_| false);
        assert_eq!(run.halt, Halt::Return);
        assert_eq!(run.steps, 6);
        assert_eq!(run.location_of(sentinel), Some(DATA + 0x90));
        assert_eq!(run.register(Register::RDX), sentinel);

        assert_eq!(run.skipped.len(), 1);
        assert_eq!(run.skipped[0].address, DATA + 0x40);
        assert_ne!(run.skipped[0].value, sentinel);
        assert!(is_sentinel(run.skipped[0].value));
        assert!(is_sentinel(run.register(Register::RAX)));
    }

    #[test]
    fn test_skipped_write_leaves_memory_unchanged() {
        // mov qword ptr [rip+X], 0x77 ; mov rax, [rip+X] ; ret
        let mut code = vec![0x48, 0xC7, 0x05];
        code.extend_from_slice(&rel32(CODE + 11, DATA));
        code.extend_from_slice(&0x77u32.to_le_bytes());
        code.extend_from_slice(&[0x48, 0x8B, 0x05]);
        code.extend_from_slice(&rel32(CODE + 18, DATA));
        code.push(0xC3);

        let view = view(&code);
        let run = Emulator::new(&view, CODE, 16).run(|_| false);
        assert_eq!(run.register(Register::RAX), 0x1234);
        assert_eq!(run.skipped.len(), 1);

        let run = Emulator::new(&view, CODE, 16)
            .with_policy(|address: usize, _: usize, _: u64| address == DATA)
            .run(|_| false);
        assert_eq!(run.register(Register::RAX), 0x77);
        assert_eq!(view.read_u64(DATA).unwrap(), 0x1234);
    }

    #[test]
    fn test_budget_halts_infinite_loop() {
        let view = view(&[0xEB, 0xFE]);
        let run = Emulator::new(&view, CODE, 100).run(|_| false);
        assert_eq!(run.halt, Halt::Budget);
        assert_eq!(run.steps, 100);
    }

    #[test]
    fn test_predicate_halts_on_store() {
        // mov [rip+X], rcx ; ret
        let mut code = vec![0x48, 0x89, 0x0D];
        code.extend_from_slice(&rel32(CODE + 7, DATA + 8));
        code.push(0xC3);

        let view = view(&code);
        let mut emu = Emulator::new(&view, CODE, 16);
        let sentinel = emu.seed_sentinel(Register::RCX);
        let run = emu.run(|step| step.write.map(|w| w.value == sentinel).unwrap_or(false));
        assert_eq!(run.halt, Halt::Predicate);
        assert_eq!(run.at, CODE);
        assert_eq!(run.skipped[0].address, DATA + 8);
    }

    #[test]
    fn test_arithmetic_and_conditional_branch() {
        let code = [
            0x31, 0xC0, // xor eax, eax
            0x48, 0x83, 0xC0, 0x05, // add rax, 5
            0x48, 0x83, 0xF8, 0x05, // cmp rax, 5
            0x75, 0x04, // jne +4 (not taken)
            0x48, 0xC1, 0xE0, 0x02, // shl rax, 2
            0x48, 0x8D, 0x48, 0xFF, // lea rcx, [rax-1]
            0x0F, 0x94, 0xC2, // sete dl
            0x48, 0x0F, 0x44, 0xD9, // cmove rbx, rcx
            0xC3,
        ];
        let view = view(&code);
        let run = Emulator::new(&view, CODE, 32).run(|_| false);
        assert_eq!(run.halt, Halt::Return);
        assert_eq!(run.register(Register::RAX), 20);
        assert_eq!(run.register(Register::RCX), 19);
        // flags from shl: result nonzero -> ZF clear
        assert_eq!(run.register(Register::DL), 0);
        assert_eq!(run.register(Register::RBX), 0);
    }

    #[test]
    fn test_stack_round_trip_and_movsx() {
        let code = [
            0x48, 0xC7, 0xC0, 0xFE, 0xFF, 0xFF, 0xFF, // mov rax, -2
            0x50, // push rax
            0x5B, // pop rbx
            0xB1, 0x80, // mov cl, 0x80
            0x48, 0x0F, 0xBE, 0xD1, // movsx rdx, cl
            0xC3,
        ];
        let view = view(&code);
        let run = Emulator::new(&view, CODE, 32).run(|_| false);
        assert_eq!(run.register(Register::RBX), (-2i64) as u64);
        assert_eq!(run.register(Register::RDX), (-128i64) as u64);
        assert!(run.skipped.is_empty());
        assert!(Context::is_stack(run.context.rsp() as usize));
        assert!(run.context.rsp() as usize > STACK_BASE);
    }

    #[test]
    fn test_fault_and_trap() {
        // mov rax, [rcx] with rcx = 0
        let faulting = view(&[0x48, 0x8B, 0x01]);
        let run = Emulator::new(&faulting, CODE, 8).run(|_| false);
        assert_eq!(run.halt, Halt::Fault);
        assert_eq!(run.at, CODE);

        let trapping = view(&[0x90, 0xCC]);
        let run = Emulator::new(&trapping, CODE, 8).run(|_| false);
        assert_eq!(run.halt, Halt::Trap);
        assert_eq!(run.at, CODE + 1);
    }

    #[test]
    fn test_wrapping_address_faults() {
        // mov rax, [rcx-4] with rcx = 0
        let load = view(&[0x48, 0x8B, 0x41, 0xFC, 0xC3]);
        let run = Emulator::new(&load, CODE, 8).run(|_| false);
        assert_eq!(run.halt, Halt::Fault);
        assert_eq!(run.at, CODE);

        // mov [rcx-4], rax
        let store = view(&[0x48, 0x89, 0x41, 0xFC, 0xC3]);
        let run = Emulator::new(&store, CODE, 8)
            .with_policy(AllowRange(0..usize::MAX))
            .run(|_| false);
        assert_eq!(run.halt, Halt::Fault);
        assert!(run.writes.is_empty());

        assert!(!AllowRange(0..usize::MAX).allows(usize::MAX - 3, 8, 0));
    }

    #[test]
    fn test_taken_conditional_moves() {
        let code = [
            0x31, 0xC0, // xor eax, eax
            0xB9, 0x07, 0x00, 0x00, 0x00, // mov ecx, 7
            0x0F, 0x44, 0xD9, // cmove ebx, ecx
            0x0F, 0x94, 0xC2, // sete dl
            0x0F, 0x95, 0xC0, // setne al
            0xC3,
        ];
        let view = view(&code);
        let run = Emulator::new(&view, CODE, 16).run(|_| false);
        assert_eq!(run.halt, Halt::Return);
        assert_eq!(run.register(Register::RBX), 7);
        assert_eq!(run.register(Register::DL), 1);
        assert_eq!(run.register(Register::AL), 0);
        assert_eq!(run.unsupported, 0);
    }

    #[test]
    fn test_reads_through_sentinel_stay_traceable() {
        // mov rax, [rcx+8] ; mov rdx, [rax] ; ret
        let view = view(&[0x48, 0x8B, 0x41, 0x08, 0x48, 0x8B, 0x10, 0xC3]);
        let mut emu = Emulator::new(&view, CODE, 8);
        emu.seed_sentinel(Register::RCX);
        let run = emu.run(|_| false);
        assert_eq!(run.halt, Halt::Return);
        assert!(is_sentinel(run.register(Register::RAX)));
        assert!(is_sentinel(run.register(Register::RDX)));
    }

    #[test]
    fn test_unsupported_instructions_are_counted() {
        // cpuid ; ret
        let view = view(&[0x0F, 0xA2, 0xC3]);
        let run = Emulator::new(&view, CODE, 8).run(|_| false);
        assert_eq!(run.unsupported, 1);
        assert_eq!(run.halt, Halt::Return);
    }
}
