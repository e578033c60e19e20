//! Call sites: target selection, devirtualization and inlining

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::jit::analysis::explore::explore;
use crate::jit::bytecode::{Insn, Opcode};
use crate::jit::compiler::CompileError;
use crate::jit::ir::{CallTarget, Instr, JitType, Reg, Symbol, Terminator};
use crate::vm::class::ClassFlags;
use crate::vm::descriptor::MethodDescriptor;
use crate::vm::dispatch::Enveloppe;
use crate::vm::method::Method;
use crate::vm::pool::MemberRef;

use super::{BodyEmitter, Exit, StackState};

impl BodyEmitter<'_, '_> {
    pub(super) fn emit_invoke(&mut self, insn: &Insn, stack: &mut StackState) -> Result<(), CompileError> {
        let pc = insn.pc;
        let index = Self::pool_operand(insn)?;
        let member = self
            .pool
            .resolve_method(index)
            .map_err(|source| CompileError::Pool { pc, source })?;
        let descriptor = MethodDescriptor::parse(&member.descriptor)?;

        let mut args: Vec<(Reg, JitType)> = Vec::with_capacity(descriptor.args.len() + 1);
        for ty in descriptor.arg_types().collect::<Vec<_>>().into_iter().rev() {
            args.push((stack.pop_typed(ty, pc)?, ty));
        }
        if insn.op != Opcode::Invokestatic {
            let receiver = stack.pop_typed(JitType::Ref, pc)?;
            self.null_check(receiver);
            args.push((receiver, JitType::Ref));
        }
        args.reverse();

        let (direct, target) = self.select_target(insn.op, index, member)?;

        let ret = descriptor.ret_type();
        if let Some(callee) = direct.filter(|callee| self.can_inline(callee)) {
            let result = self.inline_call(insn, &callee, &args, ret)?;
            if let (Some(reg), Some(ty)) = (result, ret) {
                stack.push(reg, ty);
            }
            return Ok(());
        }

        let dest = ret.map(|ty| self.b.alloc_reg(ty));
        self.b.emit(Instr::Call {
            dest,
            target,
            args: args.iter().map(|(reg, _)| *reg).collect(),
        });
        if let (Some(reg), Some(ty)) = (dest, ret) {
            stack.push(reg, ty);
        }
        Ok(())
    }

    /// Call target for the site, plus the exact callee when it is known at
    /// compile time
    fn select_target(
        &mut self,
        op: Opcode,
        index: u16,
        member: MemberRef,
    ) -> Result<(Option<Arc<Method>>, CallTarget), CompileError> {
        let class = if self.ctx.binds_directly() {
            self.ctx.registry.lookup(&member.class)
        } else {
            None
        };
        let resolved = class
            .as_ref()
            .and_then(|class| class.find_method(&member.name, &member.descriptor));

        match op {
            Opcode::Invokestatic | Opcode::Invokespecial => {
                if op == Opcode::Invokestatic {
                    let owner = match resolved.as_ref().and_then(|m| m.owner()) {
                        Some(owner) => self.bound(index, owner),
                        None => self.lazy(index, Symbol::Class(member.class.clone())),
                    };
                    self.init_check(owner);
                }
                Ok(match resolved {
                    Some(callee) => {
                        let handle = self.bound(index, callee.clone());
                        (Some(callee), CallTarget::Static(handle))
                    }
                    None => (None, CallTarget::Static(self.lazy(index, Symbol::Method(member)))),
                })
            }
            Opcode::Invokevirtual => Ok(match (class, resolved) {
                (Some(class), Some(callee))
                    if !callee.is_abstract()
                        && (callee.is_final()
                            || !callee.is_virtual()
                            || class.flags().contains(ClassFlags::FINAL)) =>
                {
                    let handle = self.bound(index, callee.clone());
                    (Some(callee), CallTarget::Static(handle))
                }
                (Some(_), Some(callee)) if callee.is_virtual() => {
                    (None, CallTarget::Virtual(self.bound(index, callee)))
                }
                (Some(_), _) => (None, CallTarget::Cached(Arc::new(Enveloppe::new(member, index)))),
                (None, _) => (None, CallTarget::Virtual(self.lazy(index, Symbol::Method(member)))),
            }),
            _ => Ok((None, CallTarget::Cached(Arc::new(Enveloppe::new(member, index))))),
        }
    }

    fn can_inline(&self, callee: &Arc<Method>) -> bool {
        let config = self.ctx.config;
        let Some(code) = callee.code() else { return false };
        callee.is_inlinable(config.max_inline_bytecode_len)
            && callee.id() != self.ctx.root.id()
            && !self.chain.contains(&callee.id())
            && callee.loader() == self.method.loader()
            && self.depth < config.max_inline_depth
            && (self.b.func().max_locals + code.max_locals as usize) <= u16::MAX as usize
    }

    /// Expand `callee` at the current position. Its locals are rebased past
    /// every slot in use, its returns jump to a continuation block, and its
    /// faults go to the caller's handler at the call site.
    fn inline_call(
        &mut self,
        insn: &Insn,
        callee: &Arc<Method>,
        args: &[(Reg, JitType)],
        ret: Option<JitType>,
    ) -> Result<Option<Reg>, CompileError> {
        let code = callee
            .code()
            .cloned()
            .ok_or_else(|| CompileError::NoCode(callee.to_string()))?;
        let pool = match callee.owner() {
            Some(owner) => owner.pool().clone(),
            None => return Err(CompileError::Orphan(callee.to_string())),
        };

        let base = self.b.func().max_locals as u16;
        self.b.func_mut().max_locals += code.max_locals as usize;

        let handler = self.b.handler();
        let cont = self.b.create_block_with_handler(handler);
        let result = ret.map(|ty| self.b.add_param(cont, ty));

        let mut slot = base;
        for (reg, ty) in args {
            self.b.store_local(slot, *reg);
            slot += ty.slots() as u16;
        }

        let ex = explore(&code, self.b)?;
        let mut chain = self.chain.clone();
        chain.push(callee.id());
        let mut inner = BodyEmitter {
            b: &mut *self.b,
            ctx: self.ctx,
            stats: &mut *self.stats,
            method: callee.clone(),
            code,
            pool,
            ex,
            entry: FxHashMap::default(),
            emitted: FxHashSet::default(),
            non_null: FxHashSet::default(),
            local_base: base,
            fallback: handler,
            exit: Exit::Inline { cont },
            chain,
            depth: self.depth + 1,
            call_pc: Some(self.call_pc.unwrap_or(insn.pc)),
        };
        let start = inner.edge(0, &StackState::default())?;
        inner.b.terminate(Terminator::Jump(start));
        inner.emit_body()?;

        self.stats.inlined += 1;
        debug!(caller = %self.method, callee = %callee, depth = self.depth + 1, "inlined");

        self.b.switch_to_block(cont);
        self.set_pc(insn.pc);
        Ok(result)
    }
}
