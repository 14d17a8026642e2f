//! Instruction decoding and control-flow walking

mod decoder;
mod walker;

pub use decoder::{
    decode_at, decode_slice, Flow, Instruction, MemoryOperand, Mnemonic, Operand, Register,
    MAX_INSTRUCTION_LEN,
};
pub use walker::{Visit, WalkOptions, WalkOutcome, Walker};
