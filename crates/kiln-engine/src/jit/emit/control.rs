//! Branches, switches, subroutines, returns and throws

use crate::jit::bytecode::{Insn, Opcode, Operand};
use crate::jit::compiler::CompileError;
use crate::jit::ir::{BlockCall, CmpOp, Instr, JitType, Terminator};

use super::{BodyEmitter, Exit, StackState};

impl BodyEmitter<'_, '_> {
    /// Poll the rendezvous before any branch that may loop
    fn back_edge_poll(&mut self, insn: &Insn) {
        if insn.targets().iter().any(|t| *t <= insn.pc) {
            self.b.emit(Instr::Safepoint);
        }
    }

    fn branch_target(insn: &Insn) -> Result<u32, CompileError> {
        match insn.operand {
            Operand::Branch(target) => Ok(target),
            _ => Err(CompileError::Unsupported {
                pc: insn.pc,
                op: insn.op,
                reason: "missing branch target",
            }),
        }
    }

    pub(super) fn emit_conditional(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        use Opcode::*;
        let pc = insn.pc;
        let target = Self::branch_target(insn)?;

        let (cond, inverted) = match insn.op {
            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle => {
                let value = stack.pop_typed(JitType::I32, pc)?;
                let zero = self.b.const_i32(0);
                (self.b.cmp(Self::cmp_op(insn.op), value, zero), false)
            }
            IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple => {
                let right = stack.pop_typed(JitType::I32, pc)?;
                let left = stack.pop_typed(JitType::I32, pc)?;
                (self.b.cmp(Self::cmp_op(insn.op), left, right), false)
            }
            IfAcmpeq | IfAcmpne => {
                let right = stack.pop_typed(JitType::Ref, pc)?;
                let left = stack.pop_typed(JitType::Ref, pc)?;
                let op = if insn.op == IfAcmpeq { CmpOp::Eq } else { CmpOp::Ne };
                (self.b.cmp(op, left, right), false)
            }
            _ => {
                let value = stack.pop_typed(JitType::Ref, pc)?;
                let dest = self.b.alloc_reg(JitType::I32);
                self.b.emit(Instr::IsNull { dest, src: value });
                (dest, insn.op == Ifnonnull)
            }
        };

        self.back_edge_poll(insn);
        let taken = self.edge(target, stack)?;
        let fallthrough = self.edge(insn.next_pc(), stack)?;
        let (then_call, else_call) = if inverted { (fallthrough, taken) } else { (taken, fallthrough) };
        self.b.terminate(Terminator::Branch {
            cond,
            then_call,
            else_call,
        });
        Ok(())
    }

    fn cmp_op(op: Opcode) -> CmpOp {
        use Opcode::*;
        match op {
            Ifeq | IfIcmpeq => CmpOp::Eq,
            Ifne | IfIcmpne => CmpOp::Ne,
            Iflt | IfIcmplt => CmpOp::Lt,
            Ifge | IfIcmpge => CmpOp::Ge,
            Ifgt | IfIcmpgt => CmpOp::Gt,
            _ => CmpOp::Le,
        }
    }

    pub(super) fn emit_goto(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let target = Self::branch_target(insn)?;
        self.back_edge_poll(insn);
        let call = self.edge(target, stack)?;
        self.b.terminate(Terminator::Jump(call));
        Ok(())
    }

    // ===== Subroutines =====

    /// `jsr` pushes the tag of its return site and jumps
    pub(super) fn emit_jsr(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let target = Self::branch_target(insn)?;
        let tag = self
            .ex
            .return_tag(insn.next_pc())
            .ok_or(CompileError::FallsOffEnd { pc: insn.pc })?;
        let reg = self.b.const_i32(tag);
        stack.push(reg, JitType::I32);
        self.back_edge_poll(insn);
        let call = self.edge(target, stack)?;
        self.b.terminate(Terminator::Jump(call));
        Ok(())
    }

    /// `ret` switches on the tag stored in its local over every return site
    pub(super) fn emit_ret(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let pc = insn.pc;
        if self.ex.return_sites.is_empty() {
            return Err(CompileError::UnknownReturnSite { pc });
        }
        let slot = self.local_slot(Self::local_operand(insn)?, JitType::I32, pc)?;
        let tag = self.b.load_local(slot, JitType::I32);

        let sites = self.ex.return_sites.clone();
        if sites.iter().any(|site| *site <= pc) {
            self.b.emit(Instr::Safepoint);
        }
        let mut cases = Vec::with_capacity(sites.len());
        for (index, site) in sites.iter().enumerate() {
            cases.push((index as i32, self.edge(*site, stack)?));
        }
        let handler = self.b.handler();
        let default = self.b.create_block_with_handler(handler);
        self.b.terminate(Terminator::Switch {
            value: tag,
            cases,
            default: BlockCall::bare(default),
        });
        Ok(())
    }

    // ===== Switches =====

    pub(super) fn emit_switch(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let key = stack.pop_typed(JitType::I32, insn.pc)?;
        let (default, pairs): (u32, Vec<(i32, u32)>) = match &insn.operand {
            Operand::Table { default, low, targets } => (
                *default,
                targets
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (low.wrapping_add(i as i32), *t))
                    .collect(),
            ),
            Operand::Lookup { default, pairs } => (*default, pairs.clone()),
            _ => {
                return Err(CompileError::Unsupported {
                    pc: insn.pc,
                    op: insn.op,
                    reason: "missing switch table",
                })
            }
        };

        self.back_edge_poll(insn);
        let mut cases = Vec::with_capacity(pairs.len());
        for (value, target) in pairs {
            cases.push((value, self.edge(target, stack)?));
        }
        let default = self.edge(default, stack)?;
        self.b.terminate(Terminator::Switch {
            value: key,
            cases,
            default,
        });
        Ok(())
    }

    // ===== Returns and throws =====

    pub(super) fn emit_return(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        use Opcode::*;
        let ty = match insn.op {
            Ireturn => Some(JitType::I32),
            Lreturn => Some(JitType::I64),
            Freturn => Some(JitType::F32),
            Dreturn => Some(JitType::F64),
            Areturn => Some(JitType::Ref),
            _ => None,
        };
        let declared = self.method.descriptor().ret_type();
        if ty != declared {
            return Err(CompileError::Unsupported {
                pc: insn.pc,
                op: insn.op,
                reason: "return kind does not match the descriptor",
            });
        }
        let value = match ty {
            Some(ty) => Some(stack.pop_typed(ty, insn.pc)?),
            None => None,
        };

        match self.exit {
            Exit::Return { lock } => {
                if let Some(object) = lock {
                    self.b.emit(Instr::MonitorExit { object });
                }
                self.b.terminate(Terminator::Return(value));
            }
            Exit::Inline { cont } => {
                self.b.terminate(Terminator::Jump(BlockCall {
                    block: cont,
                    args: value.into_iter().collect(),
                }));
            }
        }
        Ok(())
    }

    pub(super) fn emit_athrow(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let exception = stack.pop_typed(JitType::Ref, insn.pc)?;
        self.null_check(exception);
        self.b.terminate(Terminator::Throw(exception));
        Ok(())
    }
}
