//! Arrays, fields, allocation, type checks and monitors

use std::sync::Arc;

use crate::jit::bytecode::{Insn, Opcode, Operand};
use crate::jit::compiler::CompileError;
use crate::jit::ir::{CmpOp, FieldSlot, Handle, Instr, JitType, Reg, StaticSlot, Symbol};
use crate::vm::descriptor::TypeDesc;
use crate::vm::exceptions::ExceptionKind;
use crate::vm::object::ElemKind;

use super::{BodyEmitter, StackState};

impl BodyEmitter<'_, '_> {
    // ===== Arrays =====

    fn element_type(op: Opcode) -> JitType {
        use Opcode::*;
        match op {
            Laload | Lastore => JitType::I64,
            Faload | Fastore => JitType::F32,
            Daload | Dastore => JitType::F64,
            Aaload | Aastore => JitType::Ref,
            _ => JitType::I32,
        }
    }

    /// Null and bounds checks shared by element reads and writes
    fn checked_element(&mut self, array: Reg, index: Reg) {
        self.null_check(array);
        let length = self.b.alloc_reg(JitType::I32);
        self.b.emit(Instr::ArrayLength { dest: length, array });
        let in_bounds = self.b.cmp(CmpOp::ULt, index, length);
        self.raise_unless(in_bounds, ExceptionKind::ArrayIndexOutOfBounds, vec![index, length], None);
    }

    pub(super) fn emit_array_load(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let ty = Self::element_type(insn.op);
        let index = stack.pop_typed(JitType::I32, insn.pc)?;
        let array = stack.pop_typed(JitType::Ref, insn.pc)?;
        self.checked_element(array, index);
        let dest = self.b.alloc_reg(ty);
        self.b.emit(Instr::ArrayLoad { dest, array, index });
        stack.push(dest, ty);
        Ok(())
    }

    pub(super) fn emit_array_store(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let ty = Self::element_type(insn.op);
        let value = stack.pop_typed(ty, insn.pc)?;
        let index = stack.pop_typed(JitType::I32, insn.pc)?;
        let array = stack.pop_typed(JitType::Ref, insn.pc)?;
        self.checked_element(array, index);
        if insn.op == Opcode::Aastore {
            let storable = self.b.alloc_reg(JitType::I32);
            self.b.emit(Instr::StoreCheck {
                dest: storable,
                array,
                value,
            });
            self.raise_unless(storable, ExceptionKind::ArrayStore, vec![value, array], None);
        }
        self.b.emit(Instr::ArrayStore { array, index, value });
        Ok(())
    }

    pub(super) fn emit_array_length(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let array = stack.pop_typed(JitType::Ref, insn.pc)?;
        self.null_check(array);
        let dest = self.b.alloc_reg(JitType::I32);
        self.b.emit(Instr::ArrayLength { dest, array });
        stack.push(dest, JitType::I32);
        Ok(())
    }

    fn length_check(&mut self, length: Reg) {
        let zero = self.b.const_i32(0);
        let negative = self.b.cmp(CmpOp::Lt, length, zero);
        self.raise_if(negative, ExceptionKind::NegativeArraySize, vec![length], None);
    }

    pub(super) fn emit_new_array(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let pc = insn.pc;
        let dest = self.b.alloc_reg(JitType::Ref);
        match insn.op {
            Opcode::Newarray => {
                let atype = Self::int_operand(insn)?;
                let elem = u8::try_from(atype)
                    .ok()
                    .and_then(ElemKind::from_atype)
                    .ok_or(CompileError::Unsupported {
                        pc,
                        op: insn.op,
                        reason: "unknown array type code",
                    })?;
                let component = TypeDesc::from_elem_kind(elem).ok_or(CompileError::Unsupported {
                    pc,
                    op: insn.op,
                    reason: "reference element in newarray",
                })?;
                let class = self.primitive_array_handle(&component);
                let length = stack.pop_typed(JitType::I32, pc)?;
                self.length_check(length);
                self.b.emit(Instr::NewArray { dest, class, length });
            }
            Opcode::Anewarray => {
                let index = Self::pool_operand(insn)?;
                let class = self.array_of_handle(index, pc)?;
                let length = stack.pop_typed(JitType::I32, pc)?;
                self.length_check(length);
                self.b.emit(Instr::NewArray { dest, class, length });
            }
            _ => {
                let Operand::MultiArray { index, dims } = insn.operand else {
                    return Err(CompileError::Unsupported {
                        pc,
                        op: insn.op,
                        reason: "missing dimension operand",
                    });
                };
                let class = self.class_handle(index, pc)?;
                let mut lengths = Vec::with_capacity(dims as usize);
                for _ in 0..dims {
                    lengths.push(stack.pop_typed(JitType::I32, pc)?);
                }
                lengths.reverse();
                for length in &lengths {
                    self.length_check(*length);
                }
                self.b.emit(Instr::NewMultiArray {
                    dest,
                    class,
                    dims: lengths,
                });
            }
        }
        self.non_null.insert(dest);
        stack.push(dest, JitType::Ref);
        Ok(())
    }

    /// Primitive array classes need no pool entry; they are bound whenever
    /// the compile mode allows it
    fn primitive_array_handle(&mut self, component: &TypeDesc) -> Handle<Arc<crate::vm::class::Class>> {
        if self.ctx.binds_directly() {
            if let Ok(class) = self.ctx.registry.array_class(component) {
                self.stats.bound_handles += 1;
                return Handle::resolved(class);
            }
        }
        let name: Arc<str> = Arc::from(format!("[{}", component));
        self.lazy(0, Symbol::Class(name))
    }

    // ===== Fields =====

    fn field_ref(&self, insn: &Insn) -> Result<(u16, crate::vm::pool::MemberRef, JitType), CompileError> {
        let pc = insn.pc;
        let index = Self::pool_operand(insn)?;
        let member = self
            .pool
            .resolve_field(index)
            .map_err(|source| CompileError::Pool { pc, source })?;
        let ty = TypeDesc::parse(&member.descriptor)?.value_type();
        Ok((index, member, ty))
    }

    pub(super) fn emit_static_access(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let (index, member, ty) = self.field_ref(insn)?;

        let resolved = if self.ctx.binds_directly() {
            self.ctx
                .registry
                .lookup(&member.class)
                .and_then(|class| class.find_static(&member.name, &member.descriptor))
        } else {
            None
        };
        let field = match resolved {
            Some((class, slot)) => {
                self.init_check(Handle::resolved(class.clone()));
                self.bound(index, StaticSlot { class, slot })
            }
            None => {
                // The owner is initialized when the lazy slot resolves
                self.lazy(index, Symbol::Static(member))
            }
        };

        if insn.op == Opcode::Getstatic {
            let dest = self.b.alloc_reg(ty);
            self.b.emit(Instr::GetStatic { dest, field });
            stack.push(dest, ty);
        } else {
            let value = stack.pop_typed(ty, insn.pc)?;
            self.b.emit(Instr::PutStatic { field, value });
        }
        Ok(())
    }

    pub(super) fn emit_field_access(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let (index, member, ty) = self.field_ref(insn)?;

        let resolved = if self.ctx.binds_directly() {
            self.ctx.registry.lookup(&member.class).and_then(|class| {
                class.find_field(&member.name, &member.descriptor).map(|info| FieldSlot {
                    owner: info.owner.clone(),
                    name: info.name.clone(),
                    slot: info.slot,
                    ty,
                })
            })
        } else {
            None
        };
        let field = match resolved {
            Some(slot) => self.bound(index, slot),
            None => self.lazy(index, Symbol::Field(member)),
        };

        if insn.op == Opcode::Getfield {
            let object = stack.pop_typed(JitType::Ref, insn.pc)?;
            self.null_check(object);
            let dest = self.b.alloc_reg(ty);
            self.b.emit(Instr::GetField { dest, object, field });
            stack.push(dest, ty);
        } else {
            let value = stack.pop_typed(ty, insn.pc)?;
            let object = stack.pop_typed(JitType::Ref, insn.pc)?;
            self.null_check(object);
            self.b.emit(Instr::PutField { object, field, value });
        }
        Ok(())
    }

    // ===== Objects =====

    pub(super) fn emit_new(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let index = Self::pool_operand(insn)?;
        let class = self.class_handle(index, insn.pc)?;
        self.init_check(class.clone());
        let dest = self.b.alloc_reg(JitType::Ref);
        self.b.emit(Instr::New { dest, class });
        self.non_null.insert(dest);
        stack.push(dest, JitType::Ref);
        Ok(())
    }

    pub(super) fn emit_type_check(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let pc = insn.pc;
        let index = Self::pool_operand(insn)?;
        let name = self
            .pool
            .class_name(index)
            .map_err(|source| CompileError::Pool { pc, source })?;
        let class = self.class_handle(index, pc)?;
        let object = stack.pop_typed(JitType::Ref, pc)?;
        let dest = self.b.alloc_reg(JitType::I32);

        if insn.op == Opcode::Checkcast {
            self.b.emit(Instr::CanCast { dest, object, class });
            self.raise_unless(dest, ExceptionKind::ClassCast, vec![object], Some(name));
            stack.push(object, JitType::Ref);
        } else {
            self.b.emit(Instr::InstanceOf { dest, object, class });
            stack.push(dest, JitType::I32);
        }
        Ok(())
    }

    pub(super) fn emit_monitor(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let object = stack.pop_typed(JitType::Ref, insn.pc)?;
        self.null_check(object);
        if insn.op == Opcode::Monitorenter {
            self.b.emit(Instr::MonitorEnter { object });
        } else {
            self.b.emit(Instr::MonitorExit { object });
        }
        Ok(())
    }
}
