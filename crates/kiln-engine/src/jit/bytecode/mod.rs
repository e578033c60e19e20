//! Bytecode: opcodes, decoding and assembly

pub mod asm;
pub mod decoder;
pub mod opcode;

pub use asm::{AsmError, Assembler, Label};
pub use decoder::{decode_method, DecodeError, Insn, Operand};
pub use opcode::Opcode;
