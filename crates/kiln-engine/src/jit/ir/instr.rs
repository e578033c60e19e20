//! IR instructions, blocks and functions
//!
//! Registers are typed, function-wide variables. A register may be assigned
//! on several paths; values flowing into a join point travel as block
//! arguments, which are assigned to the target's parameters in parallel.
//! Bytecode locals live in numbered slots accessed with `LoadLocal` and
//! `StoreLocal`, so an exception handler sees every store made before the
//! fault.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::handle::{FieldSlot, Handle, StaticSlot};
use super::types::JitType;
use crate::vm::class::Class;
use crate::vm::dispatch::Enveloppe;
use crate::vm::exceptions::ExceptionKind;
use crate::vm::method::Method;
use crate::vm::object::ElemKind;

/// Virtual register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Two-operand arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// Wrapping add
    Add,
    /// Wrapping subtract
    Sub,
    /// Wrapping multiply
    Mul,
    /// Division; the divisor of an integer division is checked beforehand
    Div,
    /// Remainder with the sign of the dividend
    Rem,
    /// Bitwise and
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Shift left; the count is an `I32` masked to the operand width
    Shl,
    /// Arithmetic shift right
    Shr,
    /// Logical shift right
    Ushr,
}

impl BinOp {
    /// Printer mnemonic
    pub fn mnemonic(&self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::Shr => "shr",
            BinOp::Ushr => "ushr",
        }
    }

    /// Shift operator
    pub fn is_shift(&self) -> bool {
        matches!(self, BinOp::Shl | BinOp::Shr | BinOp::Ushr)
    }
}

/// Comparison producing an `I32` 0 or 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equal (references compare by identity)
    Eq,
    /// Not equal
    Ne,
    /// Signed less than
    Lt,
    /// Signed less or equal
    Le,
    /// Signed greater than
    Gt,
    /// Signed greater or equal
    Ge,
    /// Unsigned less than (bounds checks)
    ULt,
}

impl CmpOp {
    /// Printer mnemonic
    pub fn mnemonic(&self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
            CmpOp::ULt => "ult",
        }
    }
}

/// What a call instruction invokes
#[derive(Clone)]
pub enum CallTarget {
    /// Exactly this method (static, special and devirtualized calls)
    Static(Handle<Arc<Method>>),
    /// Selected through the receiver's VirtualTable at the method's offset
    Virtual(Handle<Arc<Method>>),
    /// Resolved per receiver class through the call site's inline cache
    Cached(Arc<Enveloppe>),
}

/// IR instruction
#[derive(Clone)]
pub enum Instr {
    // ===== Constants =====
    /// 32-bit integer constant
    ConstI32 { dest: Reg, value: i32 },
    /// 64-bit integer constant
    ConstI64 { dest: Reg, value: i64 },
    /// 32-bit float constant
    ConstF32 { dest: Reg, value: f32 },
    /// 64-bit float constant
    ConstF64 { dest: Reg, value: f64 },
    /// Null reference
    ConstNull { dest: Reg },
    /// Interned string literal
    ConstString { dest: Reg, value: Arc<str> },
    /// Register copy
    Move { dest: Reg, src: Reg },

    // ===== Locals =====
    /// Read a local slot
    LoadLocal { dest: Reg, slot: u16 },
    /// Write a local slot
    StoreLocal { slot: u16, src: Reg },

    // ===== Arithmetic =====
    /// Binary operator; operand types follow the registers
    Binary { op: BinOp, dest: Reg, left: Reg, right: Reg },
    /// Negation
    Neg { dest: Reg, src: Reg },
    /// Numeric conversion between the register types
    Convert { dest: Reg, src: Reg },
    /// Truncate an `I32` to a sub-word kind and widen back
    Narrow { dest: Reg, src: Reg, kind: ElemKind },
    /// Two-way comparison
    Cmp { op: CmpOp, dest: Reg, left: Reg, right: Reg },
    /// Three-way comparison yielding -1, 0 or 1; `nan` is the result for
    /// unordered float operands
    Compare3 { dest: Reg, left: Reg, right: Reg, nan: i32 },
    /// 1 if the reference is null
    IsNull { dest: Reg, src: Reg },

    // ===== Objects =====
    /// Run the class's static initializer if it has not run
    InitCheck { class: Handle<Arc<Class>> },
    /// Lock object of a class (static synchronized methods)
    ClassMonitor { dest: Reg, class: Handle<Arc<Class>> },
    /// Allocate an instance
    New { dest: Reg, class: Handle<Arc<Class>> },
    /// Allocate an array of the given array class; the length is checked
    /// beforehand
    NewArray { dest: Reg, class: Handle<Arc<Class>>, length: Reg },
    /// Allocate nested arrays, outermost dimension first
    NewMultiArray { dest: Reg, class: Handle<Arc<Class>>, dims: Vec<Reg> },
    /// Array length
    ArrayLength { dest: Reg, array: Reg },
    /// Array element read; bounds are checked beforehand
    ArrayLoad { dest: Reg, array: Reg, index: Reg },
    /// Array element write
    ArrayStore { array: Reg, index: Reg, value: Reg },
    /// 1 if `value` may be stored into `array`
    StoreCheck { dest: Reg, array: Reg, value: Reg },
    /// Instance field read
    GetField { dest: Reg, object: Reg, field: Handle<FieldSlot> },
    /// Instance field write
    PutField { object: Reg, field: Handle<FieldSlot>, value: Reg },
    /// Static field read
    GetStatic { dest: Reg, field: Handle<StaticSlot> },
    /// Static field write
    PutStatic { field: Handle<StaticSlot>, value: Reg },
    /// 1 if the object is a non-null instance of the class
    InstanceOf { dest: Reg, object: Reg, class: Handle<Arc<Class>> },
    /// 1 if the object is null or an instance of the class
    CanCast { dest: Reg, object: Reg, class: Handle<Arc<Class>> },
    /// Acquire an object's monitor
    MonitorEnter { object: Reg },
    /// Release an object's monitor
    MonitorExit { object: Reg },

    // ===== Calls and runtime =====
    /// Call; `args` include the receiver for instance methods
    Call { dest: Option<Reg>, target: CallTarget, args: Vec<Reg> },
    /// Poll the rendezvous flag
    Safepoint,
    /// 1 if the native stack is above the guard region
    StackCheck { dest: Reg },
}

impl Instr {
    /// Register written by this instruction
    pub fn dest(&self) -> Option<Reg> {
        match self {
            Instr::ConstI32 { dest, .. }
            | Instr::ConstI64 { dest, .. }
            | Instr::ConstF32 { dest, .. }
            | Instr::ConstF64 { dest, .. }
            | Instr::ConstNull { dest }
            | Instr::ConstString { dest, .. }
            | Instr::Move { dest, .. }
            | Instr::LoadLocal { dest, .. }
            | Instr::Binary { dest, .. }
            | Instr::Neg { dest, .. }
            | Instr::Convert { dest, .. }
            | Instr::Narrow { dest, .. }
            | Instr::Cmp { dest, .. }
            | Instr::Compare3 { dest, .. }
            | Instr::IsNull { dest, .. }
            | Instr::ClassMonitor { dest, .. }
            | Instr::New { dest, .. }
            | Instr::NewArray { dest, .. }
            | Instr::NewMultiArray { dest, .. }
            | Instr::ArrayLength { dest, .. }
            | Instr::ArrayLoad { dest, .. }
            | Instr::StoreCheck { dest, .. }
            | Instr::GetField { dest, .. }
            | Instr::GetStatic { dest, .. }
            | Instr::InstanceOf { dest, .. }
            | Instr::CanCast { dest, .. }
            | Instr::StackCheck { dest } => Some(*dest),
            Instr::Call { dest, .. } => *dest,
            Instr::StoreLocal { .. }
            | Instr::InitCheck { .. }
            | Instr::ArrayStore { .. }
            | Instr::PutField { .. }
            | Instr::PutStatic { .. }
            | Instr::MonitorEnter { .. }
            | Instr::MonitorExit { .. }
            | Instr::Safepoint => None,
        }
    }

    /// Registers read by this instruction
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Instr::ConstI32 { .. }
            | Instr::ConstI64 { .. }
            | Instr::ConstF32 { .. }
            | Instr::ConstF64 { .. }
            | Instr::ConstNull { .. }
            | Instr::ConstString { .. }
            | Instr::LoadLocal { .. }
            | Instr::InitCheck { .. }
            | Instr::ClassMonitor { .. }
            | Instr::New { .. }
            | Instr::GetStatic { .. }
            | Instr::Safepoint
            | Instr::StackCheck { .. } => Vec::new(),
            Instr::Move { src, .. }
            | Instr::StoreLocal { src, .. }
            | Instr::Neg { src, .. }
            | Instr::Convert { src, .. }
            | Instr::Narrow { src, .. }
            | Instr::IsNull { src, .. } => vec![*src],
            Instr::Binary { left, right, .. } | Instr::Cmp { left, right, .. } | Instr::Compare3 { left, right, .. } => {
                vec![*left, *right]
            }
            Instr::NewArray { length, .. } => vec![*length],
            Instr::NewMultiArray { dims, .. } => dims.clone(),
            Instr::ArrayLength { array, .. } => vec![*array],
            Instr::ArrayLoad { array, index, .. } => vec![*array, *index],
            Instr::ArrayStore { array, index, value } => vec![*array, *index, *value],
            Instr::StoreCheck { array, value, .. } => vec![*array, *value],
            Instr::GetField { object, .. }
            | Instr::InstanceOf { object, .. }
            | Instr::CanCast { object, .. }
            | Instr::MonitorEnter { object }
            | Instr::MonitorExit { object } => vec![*object],
            Instr::PutField { object, value, .. } => vec![*object, *value],
            Instr::PutStatic { value, .. } => vec![*value],
            Instr::Call { args, .. } => args.clone(),
        }
    }

    /// Whether a stack map is recorded for this instruction
    pub fn is_gc_point(&self) -> bool {
        matches!(self, Instr::Call { .. } | Instr::Safepoint)
    }

    /// Whether the instruction only computes on registers, locals and
    /// constants (the subset the native backend lowers)
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Instr::ConstI32 { .. }
                | Instr::ConstI64 { .. }
                | Instr::ConstF32 { .. }
                | Instr::ConstF64 { .. }
                | Instr::Move { .. }
                | Instr::LoadLocal { .. }
                | Instr::StoreLocal { .. }
                | Instr::Binary { .. }
                | Instr::Neg { .. }
                | Instr::Convert { .. }
                | Instr::Narrow { .. }
                | Instr::Cmp { .. }
                | Instr::Compare3 { .. }
                | Instr::Safepoint
                | Instr::StackCheck { .. }
        )
    }
}

/// Jump target with the values assigned to its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCall {
    /// Target block
    pub block: BlockId,
    /// One argument per target parameter
    pub args: Vec<Reg>,
}

impl BlockCall {
    /// Call with no arguments
    pub fn bare(block: BlockId) -> Self {
        Self { block, args: Vec::new() }
    }
}

/// How a block ends
#[derive(Clone)]
pub enum Terminator {
    /// Unconditional jump
    Jump(BlockCall),
    /// Two-way branch on a nonzero `I32`
    Branch {
        /// Condition register
        cond: Reg,
        /// Taken when `cond != 0`
        then_call: BlockCall,
        /// Taken when `cond == 0`
        else_call: BlockCall,
    },
    /// Multi-way branch on an `I32`
    Switch {
        /// Selector
        value: Reg,
        /// `(key, target)` pairs
        cases: Vec<(i32, BlockCall)>,
        /// Taken when no key matches
        default: BlockCall,
    },
    /// Return to the caller
    Return(Option<Reg>),
    /// Throw a reference; goes to the block's handler or to the caller
    Throw(Reg),
    /// Build an exception of `kind` from `args` and throw it
    Raise {
        /// Exception kind
        kind: ExceptionKind,
        /// Operands describing the fault
        args: Vec<Reg>,
        /// Static detail (class names, member names)
        detail: Option<Arc<str>>,
    },
    /// Propagate a caught exception to the caller, bypassing any handler
    Resume(Reg),
    /// Control never reaches the end of this block
    Unreachable,
}

impl Terminator {
    /// Registers read by the terminator
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Terminator::Jump(call) => call.args.clone(),
            Terminator::Branch { cond, then_call, else_call } => {
                let mut uses = vec![*cond];
                uses.extend(&then_call.args);
                uses.extend(&else_call.args);
                uses
            }
            Terminator::Switch { value, cases, default } => {
                let mut uses = vec![*value];
                for (_, call) in cases {
                    uses.extend(&call.args);
                }
                uses.extend(&default.args);
                uses
            }
            Terminator::Return(value) => value.iter().copied().collect(),
            Terminator::Throw(reg) | Terminator::Resume(reg) => vec![*reg],
            Terminator::Raise { args, .. } => args.clone(),
            Terminator::Unreachable => Vec::new(),
        }
    }

    /// Normal-flow successors
    pub fn successors(&self) -> Vec<&BlockCall> {
        match self {
            Terminator::Jump(call) => vec![call],
            Terminator::Branch { then_call, else_call, .. } => vec![then_call, else_call],
            Terminator::Switch { cases, default, .. } => {
                let mut all: Vec<&BlockCall> = cases.iter().map(|(_, c)| c).collect();
                all.push(default);
                all
            }
            _ => Vec::new(),
        }
    }
}

/// A basic block
#[derive(Clone)]
pub struct Block {
    /// Identifier
    pub id: BlockId,
    /// Parameters assigned by incoming block calls
    pub params: Vec<Reg>,
    /// Instructions
    pub instrs: Vec<Instr>,
    /// Bytecode offset of each instruction
    pub pcs: Vec<u32>,
    /// Terminator
    pub terminator: Terminator,
    /// Bytecode offset of the terminator
    pub term_pc: u32,
    /// Exception dispatch block for faults raised in this block
    pub handler: Option<BlockId>,
}

/// A compiled method body
#[derive(Clone)]
pub struct Function {
    /// `Class.name(descriptor)`
    pub name: String,
    /// Parameter types, receiver first
    pub params: Vec<JitType>,
    /// Return type
    pub ret: Option<JitType>,
    /// Local slots, including those of inlined callees
    pub max_locals: usize,
    /// Blocks; `blocks[i].id == BlockId(i)`
    pub blocks: Vec<Block>,
    /// Entry block; its parameters receive the arguments
    pub entry: BlockId,
    /// Next unused register
    pub next_reg: u32,
    /// Type of every register
    pub reg_types: FxHashMap<Reg, JitType>,
}

impl Function {
    /// Create a function with no blocks
    pub fn new(name: String, params: Vec<JitType>, ret: Option<JitType>, max_locals: usize) -> Self {
        Function {
            name,
            params,
            ret,
            max_locals,
            blocks: Vec::new(),
            entry: BlockId(0),
            next_reg: 0,
            reg_types: FxHashMap::default(),
        }
    }

    /// Allocate a register
    pub fn alloc_reg(&mut self, ty: JitType) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        self.reg_types.insert(reg, ty);
        reg
    }

    /// Type of a register
    pub fn reg_type(&self, reg: Reg) -> Option<JitType> {
        self.reg_types.get(&reg).copied()
    }

    /// Block by id
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Mutable block by id
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    /// Append an empty block
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            params: Vec::new(),
            instrs: Vec::new(),
            pcs: Vec::new(),
            terminator: Terminator::Unreachable,
            term_pc: 0,
            handler: None,
        });
        id
    }

    /// Instructions across all blocks
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Whether any block routes faults to a handler
    pub fn has_handlers(&self) -> bool {
        self.blocks.iter().any(|b| b.handler.is_some())
    }

    /// Whether every instruction and terminator is in the numeric subset
    pub fn is_numeric(&self) -> bool {
        self.params.iter().chain(self.ret.iter()).all(|t| *t != JitType::Ref)
            && self.blocks.iter().all(|b| {
                b.handler.is_none()
                    && b.instrs.iter().all(Instr::is_numeric)
                    && !matches!(b.terminator, Terminator::Throw(_) | Terminator::Resume(_))
            })
    }
}
