//! IR builder helpers
//!
//! Utilities for constructing IR during the emit pass. The builder tracks the
//! block being filled and the bytecode offset instructions are attributed to.

use super::instr::{BinOp, BlockId, CmpOp, Function, Instr, Reg, Terminator};
use super::types::JitType;

/// Builder that simplifies IR construction
pub struct Builder<'a> {
    func: &'a mut Function,
    current_block: BlockId,
    pc: u32,
}

impl<'a> Builder<'a> {
    /// Create a builder targeting an existing function
    pub fn new(func: &'a mut Function) -> Self {
        let entry = func.entry;
        Builder {
            func,
            current_block: entry,
            pc: 0,
        }
    }

    /// Switch to emitting into a different block
    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = block;
    }

    /// Get the current block ID
    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    /// Attribute subsequent instructions to bytecode offset `pc`
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    /// Bytecode offset instructions are currently attributed to
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Allocate a new virtual register with the given type
    pub fn alloc_reg(&mut self, ty: JitType) -> Reg {
        self.func.alloc_reg(ty)
    }

    /// Type of a register
    pub fn reg_type(&self, reg: Reg) -> Option<JitType> {
        self.func.reg_type(reg)
    }

    /// Create a new basic block
    pub fn create_block(&mut self) -> BlockId {
        self.func.add_block()
    }

    /// Create a block that raises faults into `handler`
    pub fn create_block_with_handler(&mut self, handler: Option<BlockId>) -> BlockId {
        let block = self.func.add_block();
        self.func.block_mut(block).handler = handler;
        block
    }

    /// Append a parameter of type `ty` to `block`
    pub fn add_param(&mut self, block: BlockId, ty: JitType) -> Reg {
        let reg = self.func.alloc_reg(ty);
        self.func.block_mut(block).params.push(reg);
        reg
    }

    /// Route faults raised in `block` to `handler`
    pub fn set_handler(&mut self, block: BlockId, handler: Option<BlockId>) {
        self.func.block_mut(block).handler = handler;
    }

    /// Handler of the current block
    pub fn handler(&self) -> Option<BlockId> {
        self.func.block(self.current_block).handler
    }

    /// Emit an instruction into the current block
    pub fn emit(&mut self, instr: Instr) {
        let pc = self.pc;
        let block = self.func.block_mut(self.current_block);
        block.instrs.push(instr);
        block.pcs.push(pc);
    }

    /// Set the terminator for the current block
    pub fn terminate(&mut self, term: Terminator) {
        let pc = self.pc;
        let block = self.func.block_mut(self.current_block);
        block.terminator = term;
        block.term_pc = pc;
    }

    /// Emit a constant i32 and return the destination register
    pub fn const_i32(&mut self, value: i32) -> Reg {
        let dest = self.alloc_reg(JitType::I32);
        self.emit(Instr::ConstI32 { dest, value });
        dest
    }

    /// Emit a constant i64
    pub fn const_i64(&mut self, value: i64) -> Reg {
        let dest = self.alloc_reg(JitType::I64);
        self.emit(Instr::ConstI64 { dest, value });
        dest
    }

    /// Emit a constant f32
    pub fn const_f32(&mut self, value: f32) -> Reg {
        let dest = self.alloc_reg(JitType::F32);
        self.emit(Instr::ConstF32 { dest, value });
        dest
    }

    /// Emit a constant f64
    pub fn const_f64(&mut self, value: f64) -> Reg {
        let dest = self.alloc_reg(JitType::F64);
        self.emit(Instr::ConstF64 { dest, value });
        dest
    }

    /// Emit a null constant
    pub fn const_null(&mut self) -> Reg {
        let dest = self.alloc_reg(JitType::Ref);
        self.emit(Instr::ConstNull { dest });
        dest
    }

    /// Emit a LoadLocal instruction
    pub fn load_local(&mut self, slot: u16, ty: JitType) -> Reg {
        let dest = self.alloc_reg(ty);
        self.emit(Instr::LoadLocal { dest, slot });
        dest
    }

    /// Emit a StoreLocal instruction
    pub fn store_local(&mut self, slot: u16, src: Reg) {
        self.emit(Instr::StoreLocal { slot, src });
    }

    /// Emit a binary operator whose result has type `ty`
    pub fn binary(&mut self, op: BinOp, ty: JitType, left: Reg, right: Reg) -> Reg {
        let dest = self.alloc_reg(ty);
        self.emit(Instr::Binary { op, dest, left, right });
        dest
    }

    /// Emit a two-way comparison
    pub fn cmp(&mut self, op: CmpOp, left: Reg, right: Reg) -> Reg {
        let dest = self.alloc_reg(JitType::I32);
        self.emit(Instr::Cmp { op, dest, left, right });
        dest
    }

    /// Access the underlying function
    pub fn func(&self) -> &Function {
        self.func
    }

    /// Access the underlying function mutably
    pub fn func_mut(&mut self) -> &mut Function {
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::instr::BlockCall;

    #[test]
    fn test_builder_records_pcs() {
        let mut func = Function::new("T.f()I".to_string(), vec![], Some(JitType::I32), 0);
        let entry = func.add_block();
        let mut b = Builder::new(&mut func);
        b.switch_to_block(entry);
        b.set_pc(3);
        let one = b.const_i32(1);
        b.set_pc(4);
        let two = b.const_i32(2);
        let sum = b.binary(BinOp::Add, JitType::I32, one, two);
        let exit = b.create_block();
        let param = b.add_param(exit, JitType::I32);
        b.terminate(Terminator::Jump(BlockCall { block: exit, args: vec![sum] }));
        b.switch_to_block(exit);
        b.terminate(Terminator::Return(Some(param)));

        assert_eq!(func.block(entry).pcs, vec![3, 4, 4]);
        assert_eq!(func.block(entry).term_pc, 4);
        assert_eq!(func.reg_type(param), Some(JitType::I32));
        assert_eq!(func.instr_count(), 3);
    }
}
