//! Constants, locals, operand-stack shuffles and arithmetic

use crate::jit::bytecode::{Insn, Opcode, Operand};
use crate::jit::compiler::CompileError;
use crate::jit::ir::{BinOp, CmpOp, Instr, JitType};
use crate::vm::exceptions::ExceptionKind;
use crate::vm::object::ElemKind;
use crate::vm::pool::PoolConstant;

use super::{BodyEmitter, StackState};

impl BodyEmitter<'_, '_> {
    // ===== Constants =====

    pub(super) fn emit_constant(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        use Opcode::*;
        let (reg, ty) = match insn.op {
            AconstNull => (self.b.const_null(), JitType::Ref),
            IconstM1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 => {
                let value = insn.op as u8 as i32 - Iconst0 as u8 as i32;
                (self.b.const_i32(value), JitType::I32)
            }
            Lconst0 | Lconst1 => {
                let value = (insn.op as u8 - Lconst0 as u8) as i64;
                (self.b.const_i64(value), JitType::I64)
            }
            Fconst0 | Fconst1 | Fconst2 => {
                let value = (insn.op as u8 - Fconst0 as u8) as f32;
                (self.b.const_f32(value), JitType::F32)
            }
            Dconst0 | Dconst1 => {
                let value = (insn.op as u8 - Dconst0 as u8) as f64;
                (self.b.const_f64(value), JitType::F64)
            }
            Bipush | Sipush => (self.b.const_i32(Self::int_operand(insn)?), JitType::I32),
            _ => return self.emit_pool_constant(insn, stack),
        };
        stack.push(reg, ty);
        Ok(())
    }

    fn emit_pool_constant(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let pc = insn.pc;
        let index = Self::pool_operand(insn)?;
        let constant = self
            .pool
            .constant(index)
            .map_err(|source| CompileError::Pool { pc, source })?;
        let wide = insn.op == Opcode::Ldc2W;
        let (reg, ty) = match constant {
            PoolConstant::Int(v) if !wide => (self.b.const_i32(v), JitType::I32),
            PoolConstant::Float(v) if !wide => (self.b.const_f32(v), JitType::F32),
            PoolConstant::Long(v) if wide => (self.b.const_i64(v), JitType::I64),
            PoolConstant::Double(v) if wide => (self.b.const_f64(v), JitType::F64),
            PoolConstant::String(value) if !wide => {
                let dest = self.b.alloc_reg(JitType::Ref);
                self.b.emit(Instr::ConstString { dest, value });
                self.non_null.insert(dest);
                (dest, JitType::Ref)
            }
            PoolConstant::Class(_) if !wide => {
                return Err(CompileError::Unsupported {
                    pc,
                    op: insn.op,
                    reason: "class literals are not loadable",
                })
            }
            _ => return Err(CompileError::BadConstant { pc, index }),
        };
        stack.push(reg, ty);
        Ok(())
    }

    // ===== Locals =====

    fn local_type(op: Opcode) -> JitType {
        use Opcode::*;
        match op {
            Lload | Lstore => JitType::I64,
            Fload | Fstore => JitType::F32,
            Dload | Dstore => JitType::F64,
            Aload | Astore => JitType::Ref,
            _ => JitType::I32,
        }
    }

    pub(super) fn emit_load(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let ty = Self::local_type(insn.op);
        let slot = self.local_slot(Self::local_operand(insn)?, ty, insn.pc)?;
        let reg = self.b.load_local(slot, ty);
        stack.push(reg, ty);
        Ok(())
    }

    pub(super) fn emit_store(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let expected = Self::local_type(insn.op);
        let (reg, found) = stack.pop(insn.pc)?;
        // astore also stores subroutine return addresses
        let accepted = found == expected || (insn.op == Opcode::Astore && found == JitType::I32);
        if !accepted {
            return Err(CompileError::TypeMismatch {
                pc: insn.pc,
                expected,
                found,
            });
        }
        let slot = self.local_slot(Self::local_operand(insn)?, found, insn.pc)?;
        self.b.store_local(slot, reg);
        Ok(())
    }

    pub(super) fn emit_iinc(&mut self, insn: &Insn) -> Result<(), CompileError> {
        let Operand::Iinc { local, delta } = insn.operand else {
            return Err(CompileError::Unsupported {
                pc: insn.pc,
                op: insn.op,
                reason: "missing increment operand",
            });
        };
        let slot = self.local_slot(local, JitType::I32, insn.pc)?;
        let value = self.b.load_local(slot, JitType::I32);
        let delta = self.b.const_i32(delta);
        let sum = self.b.binary(BinOp::Add, JitType::I32, value, delta);
        self.b.store_local(slot, sum);
        Ok(())
    }

    // ===== Stack =====

    pub(super) fn emit_stack_op(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        use Opcode::*;
        let pc = insn.pc;
        match insn.op {
            Pop => {
                stack.pop_slots(1, pc)?;
            }
            Pop2 => {
                stack.pop_slots(2, pc)?;
            }
            Dup | Dup2 => {
                let top = stack.pop_slots(if insn.op == Dup { 1 } else { 2 }, pc)?;
                stack.extend(&top);
                stack.extend(&top);
            }
            DupX1 | DupX2 | Dup2X1 | Dup2X2 => {
                let (top_slots, under_slots) = match insn.op {
                    DupX1 => (1, 1),
                    DupX2 => (1, 2),
                    Dup2X1 => (2, 1),
                    _ => (2, 2),
                };
                let top = stack.pop_slots(top_slots, pc)?;
                let under = stack.pop_slots(under_slots, pc)?;
                stack.extend(&top);
                stack.extend(&under);
                stack.extend(&top);
            }
            _ => {
                let top = stack.pop_slots(1, pc)?;
                let under = stack.pop_slots(1, pc)?;
                stack.extend(&top);
                stack.extend(&under);
            }
        }
        Ok(())
    }

    // ===== Arithmetic =====

    fn arith_op(op: Opcode) -> (BinOp, JitType) {
        use Opcode::*;
        let bin = match op {
            Iadd | Ladd | Fadd | Dadd => BinOp::Add,
            Isub | Lsub | Fsub | Dsub => BinOp::Sub,
            Imul | Lmul | Fmul | Dmul => BinOp::Mul,
            Idiv | Ldiv | Fdiv | Ddiv => BinOp::Div,
            Irem | Lrem | Frem | Drem => BinOp::Rem,
            Ishl | Lshl => BinOp::Shl,
            Ishr | Lshr => BinOp::Shr,
            Iushr | Lushr => BinOp::Ushr,
            Iand | Land => BinOp::And,
            Ior | Lor => BinOp::Or,
            _ => BinOp::Xor,
        };
        let ty = match op {
            Ladd | Lsub | Lmul | Ldiv | Lrem | Lshl | Lshr | Lushr | Land | Lor | Lxor => JitType::I64,
            Fadd | Fsub | Fmul | Fdiv | Frem => JitType::F32,
            Dadd | Dsub | Dmul | Ddiv | Drem => JitType::F64,
            _ => JitType::I32,
        };
        (bin, ty)
    }

    pub(super) fn emit_binary(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let (op, ty) = Self::arith_op(insn.op);
        let right_ty = if op.is_shift() { JitType::I32 } else { ty };
        let right = stack.pop_typed(right_ty, insn.pc)?;
        let left = stack.pop_typed(ty, insn.pc)?;

        if matches!(op, BinOp::Div | BinOp::Rem) && ty.is_integer() {
            let zero = if ty == JitType::I64 {
                self.b.const_i64(0)
            } else {
                self.b.const_i32(0)
            };
            let is_zero = self.b.cmp(CmpOp::Eq, right, zero);
            self.raise_if(is_zero, ExceptionKind::Arithmetic, Vec::new(), Some("/ by zero".into()));
        }

        let dest = self.b.binary(op, ty, left, right);
        stack.push(dest, ty);
        Ok(())
    }

    pub(super) fn emit_neg(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let ty = match insn.op {
            Opcode::Lneg => JitType::I64,
            Opcode::Fneg => JitType::F32,
            Opcode::Dneg => JitType::F64,
            _ => JitType::I32,
        };
        let src = stack.pop_typed(ty, insn.pc)?;
        let dest = self.b.alloc_reg(ty);
        self.b.emit(Instr::Neg { dest, src });
        stack.push(dest, ty);
        Ok(())
    }

    pub(super) fn emit_convert(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        use JitType::*;
        use Opcode::*;
        let narrow = match insn.op {
            I2b => Some(ElemKind::Byte),
            I2c => Some(ElemKind::Char),
            I2s => Some(ElemKind::Short),
            _ => None,
        };
        if let Some(kind) = narrow {
            let src = stack.pop_typed(I32, insn.pc)?;
            let dest = self.b.alloc_reg(I32);
            self.b.emit(Instr::Narrow { dest, src, kind });
            stack.push(dest, I32);
            return Ok(());
        }

        let (from, to) = match insn.op {
            I2l => (I32, I64),
            I2f => (I32, F32),
            I2d => (I32, F64),
            L2i => (I64, I32),
            L2f => (I64, F32),
            L2d => (I64, F64),
            F2i => (F32, I32),
            F2l => (F32, I64),
            F2d => (F32, F64),
            D2i => (F64, I32),
            D2l => (F64, I64),
            _ => (F64, F32),
        };
        let src = stack.pop_typed(from, insn.pc)?;
        let dest = self.b.alloc_reg(to);
        self.b.emit(Instr::Convert { dest, src });
        stack.push(dest, to);
        Ok(())
    }

    pub(super) fn emit_compare3(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let (ty, nan) = match insn.op {
            Opcode::Lcmp => (JitType::I64, 0),
            Opcode::Fcmpl => (JitType::F32, -1),
            Opcode::Fcmpg => (JitType::F32, 1),
            Opcode::Dcmpl => (JitType::F64, -1),
            _ => (JitType::F64, 1),
        };
        let right = stack.pop_typed(ty, insn.pc)?;
        let left = stack.pop_typed(ty, insn.pc)?;
        let dest = self.b.alloc_reg(JitType::I32);
        self.b.emit(Instr::Compare3 { dest, left, right, nan });
        stack.push(dest, JitType::I32);
        Ok(())
    }
}
