//! Method compilation for the Kiln execution core
//!
//! This module turns stack-machine bytecode into executable code:
//! - Bytecode decoding and a small assembler
//! - Exploration (blocks, handler regions, subroutines) and reference liveness
//! - A typed basic-block IR with lazily resolved handles
//! - The emit pass: guards, handler dispatch, devirtualization and inlining
//! - The IR executor and an optional Cranelift backend for numeric methods
//! - A per-runtime code cache

pub mod analysis;
pub mod backend;
pub mod bytecode;
pub mod code_cache;
pub mod compiler;
pub mod emit;
pub mod ir;

pub use code_cache::CodeCache;
pub use compiler::{CompileError, CompileStats, CompiledMethod, MethodCompiler};
