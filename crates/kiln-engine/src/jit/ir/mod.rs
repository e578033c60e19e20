//! IR: typed basic-block intermediate representation produced by the emit pass

pub mod types;
pub mod instr;
pub mod builder;
pub mod display;
pub mod handle;

pub use types::JitType;
pub use instr::{BinOp, Block, BlockCall, BlockId, CallTarget, CmpOp, Function, Instr, Reg, Terminator};
pub use builder::Builder;
pub use handle::{FieldSlot, Handle, StaticSlot, Symbol};
