//! Emit pass
//!
//! Interprets bytecode abstractly over a symbolic operand stack and appends
//! typed IR to the blocks created by exploration. A block's entry shape is
//! fixed by the first edge that reaches it; every later edge must carry the
//! same types or compilation fails.
//!
//! Blocks are filled in rounds, in offset order, until no block with a known
//! entry shape is left. Blocks never reached keep their `Unreachable`
//! terminator.
//!
//! Runtime faults become guards: a comparison followed by a branch to a cold
//! block that raises the exception. Cold blocks inherit the handler of the
//! block they guard.

mod arith;
mod calls;
mod control;
mod objects;

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{CompileMode, EngineConfig};
use crate::jit::analysis::explore::{explore, Exploration};
use crate::jit::bytecode::{Insn, Opcode, Operand};
use crate::jit::compiler::{CompileError, CompileStats};
use crate::jit::ir::{BlockCall, BlockId, Builder, Function, Handle, Instr, JitType, Reg, Symbol, Terminator};
use crate::vm::class::{Class, ClassRegistry};
use crate::vm::descriptor::TypeDesc;
use crate::vm::exceptions::ExceptionKind;
use crate::vm::method::{Code, Method, MethodId};
use crate::vm::pool::ConstantPool;

/// Inputs shared by every body emitted for one compilation
pub struct EmitContext<'a> {
    /// Classes visible to the compiler
    pub registry: &'a Arc<ClassRegistry>,
    /// Engine configuration
    pub config: &'a EngineConfig,
    /// Method being compiled
    pub root: &'a Arc<Method>,
}

impl EmitContext<'_> {
    fn binds_directly(&self) -> bool {
        self.config.compile_mode == CompileMode::Jit
    }
}

/// Symbolic operand stack
#[derive(Debug, Clone, Default)]
pub(crate) struct StackState {
    slots: Vec<(Reg, JitType)>,
}

impl StackState {
    fn from_entries(slots: Vec<(Reg, JitType)>) -> Self {
        Self { slots }
    }

    fn push(&mut self, reg: Reg, ty: JitType) {
        self.slots.push((reg, ty));
    }

    fn pop(&mut self, pc: u32) -> Result<(Reg, JitType), CompileError> {
        self.slots.pop().ok_or(CompileError::StackUnderflow { pc })
    }

    fn pop_typed(&mut self, expected: JitType, pc: u32) -> Result<Reg, CompileError> {
        let (reg, found) = self.pop(pc)?;
        if found != expected {
            return Err(CompileError::TypeMismatch { pc, expected, found });
        }
        Ok(reg)
    }

    /// Pop values covering exactly `count` slots, returned bottom first
    fn pop_slots(&mut self, count: usize, pc: u32) -> Result<Vec<(Reg, JitType)>, CompileError> {
        let mut taken = Vec::new();
        let mut slots = 0;
        while slots < count {
            let entry = self.pop(pc)?;
            slots += entry.1.slots();
            taken.push(entry);
        }
        if slots != count {
            return Err(CompileError::SplitsWideValue { pc });
        }
        taken.reverse();
        Ok(taken)
    }

    fn extend(&mut self, entries: &[(Reg, JitType)]) {
        self.slots.extend_from_slice(entries);
    }

    fn regs(&self) -> Vec<Reg> {
        self.slots.iter().map(|(r, _)| *r).collect()
    }

    fn shape(&self) -> Vec<JitType> {
        self.slots.iter().map(|(_, t)| *t).collect()
    }
}

/// Whether emission continues with the next instruction
pub(crate) enum Flow {
    Next,
    End,
}

/// Where a body's returns go
#[derive(Clone, Copy)]
enum Exit {
    /// Return to the caller, releasing the method's monitor first
    Return { lock: Option<Reg> },
    /// Jump to the continuation of an inlined call site
    Inline { cont: BlockId },
}

/// Emits one method body (the root method or an inlined callee) into a
/// shared function
pub(crate) struct BodyEmitter<'a, 'f> {
    b: &'a mut Builder<'f>,
    ctx: &'a EmitContext<'a>,
    stats: &'a mut CompileStats,
    method: Arc<Method>,
    code: Code,
    pool: Arc<dyn ConstantPool>,
    ex: Exploration,
    entry: FxHashMap<BlockId, Vec<(Reg, JitType)>>,
    emitted: FxHashSet<BlockId>,
    non_null: FxHashSet<Reg>,
    local_base: u16,
    fallback: Option<BlockId>,
    exit: Exit,
    chain: Vec<MethodId>,
    depth: usize,
    call_pc: Option<u32>,
}

/// Emit the root method `ctx.root`, declared by `owner`, into `func`
pub fn emit_method(
    ctx: &EmitContext<'_>,
    stats: &mut CompileStats,
    owner: &Arc<Class>,
    func: &mut Function,
) -> Result<(), CompileError> {
    let method = ctx.root.clone();
    let code = method
        .code()
        .cloned()
        .ok_or_else(|| CompileError::NoCode(method.to_string()))?;
    let param_types = func.params.clone();

    let mut b = Builder::new(func);
    let entry = b.create_block();
    b.func_mut().entry = entry;
    b.switch_to_block(entry);

    // Arguments land in the first local slots
    let mut slot = 0u16;
    let mut params = Vec::with_capacity(param_types.len());
    for ty in &param_types {
        let reg = b.add_param(entry, *ty);
        b.store_local(slot, reg);
        params.push(reg);
        slot += ty.slots() as u16;
    }

    let lock = if method.is_synchronized() {
        let object = if method.is_static() {
            let dest = b.alloc_reg(JitType::Ref);
            b.emit(Instr::ClassMonitor {
                dest,
                class: Handle::resolved(owner.clone()),
            });
            dest
        } else {
            params[0]
        };
        b.emit(Instr::MonitorEnter { object });
        Some(object)
    } else {
        None
    };

    // Faults past the monitor entry release it exactly once on the way out
    let unwind = lock.map(|object| {
        let unwind = b.create_block();
        let exception = b.add_param(unwind, JitType::Ref);
        b.switch_to_block(unwind);
        b.emit(Instr::MonitorExit { object });
        b.terminate(Terminator::Resume(exception));
        unwind
    });

    let body = b.create_block_with_handler(unwind);
    b.switch_to_block(entry);
    b.terminate(Terminator::Jump(BlockCall::bare(body)));
    b.switch_to_block(body);

    let pool = owner.pool().clone();
    let ex = explore(&code, &mut b)?;
    let mut emitter = BodyEmitter {
        b: &mut b,
        ctx,
        stats,
        method: method.clone(),
        code,
        pool,
        ex,
        entry: FxHashMap::default(),
        emitted: FxHashSet::default(),
        non_null: FxHashSet::default(),
        local_base: 0,
        fallback: unwind,
        exit: Exit::Return { lock },
        chain: vec![method.id()],
        depth: 0,
        call_pc: None,
    };

    let ok = emitter.b.alloc_reg(JitType::I32);
    emitter.b.emit(Instr::StackCheck { dest: ok });
    emitter.raise_unless(ok, ExceptionKind::StackOverflow, Vec::new(), None);
    emitter.b.emit(Instr::Safepoint);
    let start = emitter.edge(0, &StackState::default())?;
    emitter.b.terminate(Terminator::Jump(start));

    emitter.emit_body()
}

impl<'a, 'f> BodyEmitter<'a, 'f> {
    // ========================================================================
    // Driver
    // ========================================================================

    fn emit_body(&mut self) -> Result<(), CompileError> {
        self.fill_dispatch_blocks()?;
        let starts: Vec<u32> = self.ex.block_starts().collect();
        loop {
            let mut progress = false;
            for pc in &starts {
                let Some(block) = self.ex.block_at(*pc) else { continue };
                if self.emitted.contains(&block) {
                    continue;
                }
                let Some(params) = self.entry.get(&block).cloned() else { continue };
                self.emit_block(*pc, block, params)?;
                progress = true;
            }
            if !progress {
                return Ok(());
            }
        }
    }

    fn emit_block(&mut self, start: u32, block: BlockId, params: Vec<(Reg, JitType)>) -> Result<(), CompileError> {
        self.emitted.insert(block);
        let handler = self.handler_for(start);
        self.b.set_handler(block, handler);
        self.b.switch_to_block(block);

        let mut stack = StackState::from_entries(params);
        let mut index = self.ex.index_of(start).ok_or(CompileError::FallsOffEnd { pc: start })?;
        loop {
            let insn = self.ex.insns[index].clone();
            self.set_pc(insn.pc);
            if let Flow::End = self.emit_insn(&insn, &mut stack)? {
                return Ok(());
            }
            index += 1;
            let Some(next) = self.ex.insns.get(index) else {
                return Err(CompileError::FallsOffEnd { pc: insn.pc });
            };
            if self.ex.opinfo[index].block.is_some() {
                let next_pc = next.pc;
                let call = self.edge(next_pc, &stack)?;
                self.b.terminate(Terminator::Jump(call));
                return Ok(());
            }
        }
    }

    fn emit_insn(&mut self, insn: &Insn, stack: &mut StackState) -> Result<Flow, CompileError> {
        use Opcode::*;
        match insn.op {
            Nop => {}

            // ===== Constants =====
            AconstNull | IconstM1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 | Lconst0
            | Lconst1 | Fconst0 | Fconst1 | Fconst2 | Dconst0 | Dconst1 | Bipush | Sipush | Ldc | LdcW
            | Ldc2W => self.emit_constant(insn, stack)?,

            // ===== Locals =====
            Iload | Lload | Fload | Dload | Aload => self.emit_load(insn, stack)?,
            Istore | Lstore | Fstore | Dstore | Astore => self.emit_store(insn, stack)?,
            Iinc => self.emit_iinc(insn)?,

            // ===== Arrays =====
            Iaload | Laload | Faload | Daload | Aaload | Baload | Caload | Saload => {
                self.emit_array_load(insn, stack)?
            }
            Iastore | Lastore | Fastore | Dastore | Aastore | Bastore | Castore | Sastore => {
                self.emit_array_store(insn, stack)?
            }
            Arraylength => self.emit_array_length(insn, stack)?,
            Newarray | Anewarray | Multianewarray => self.emit_new_array(insn, stack)?,

            // ===== Stack =====
            Pop | Pop2 | Dup | DupX1 | DupX2 | Dup2 | Dup2X1 | Dup2X2 | Swap => self.emit_stack_op(insn, stack)?,

            // ===== Arithmetic =====
            Iadd | Ladd | Fadd | Dadd | Isub | Lsub | Fsub | Dsub | Imul | Lmul | Fmul | Dmul | Idiv | Ldiv
            | Fdiv | Ddiv | Irem | Lrem | Frem | Drem | Ishl | Lshl | Ishr | Lshr | Iushr | Lushr | Iand
            | Land | Ior | Lor | Ixor | Lxor => self.emit_binary(insn, stack)?,
            Ineg | Lneg | Fneg | Dneg => self.emit_neg(insn, stack)?,
            I2l | I2f | I2d | L2i | L2f | L2d | F2i | F2l | F2d | D2i | D2l | D2f | I2b | I2c | I2s => {
                self.emit_convert(insn, stack)?
            }
            Lcmp | Fcmpl | Fcmpg | Dcmpl | Dcmpg => self.emit_compare3(insn, stack)?,

            // ===== Control flow =====
            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle | IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt
            | IfIcmple | IfAcmpeq | IfAcmpne | Ifnull | Ifnonnull => {
                self.emit_conditional(insn, stack)?;
                return Ok(Flow::End);
            }
            Goto => {
                self.emit_goto(insn, stack)?;
                return Ok(Flow::End);
            }
            Jsr => {
                self.emit_jsr(insn, stack)?;
                return Ok(Flow::End);
            }
            Ret => {
                self.emit_ret(insn, stack)?;
                return Ok(Flow::End);
            }
            Tableswitch | Lookupswitch => {
                self.emit_switch(insn, stack)?;
                return Ok(Flow::End);
            }
            Ireturn | Lreturn | Freturn | Dreturn | Areturn | Return => {
                self.emit_return(insn, stack)?;
                return Ok(Flow::End);
            }
            Athrow => {
                self.emit_athrow(insn, stack)?;
                return Ok(Flow::End);
            }

            // ===== Fields =====
            Getstatic | Putstatic => self.emit_static_access(insn, stack)?,
            Getfield | Putfield => self.emit_field_access(insn, stack)?,

            // ===== Calls =====
            Invokevirtual | Invokespecial | Invokestatic | Invokeinterface => self.emit_invoke(insn, stack)?,

            // ===== Objects =====
            New => self.emit_new(insn, stack)?,
            Checkcast | Instanceof => self.emit_type_check(insn, stack)?,
            Monitorenter | Monitorexit => self.emit_monitor(insn, stack)?,

            _ => {
                return Err(CompileError::Unsupported {
                    pc: insn.pc,
                    op: insn.op,
                    reason: "not produced by the decoder",
                })
            }
        }
        Ok(Flow::Next)
    }

    // ========================================================================
    // Blocks, edges and handlers
    // ========================================================================

    fn set_pc(&mut self, pc: u32) {
        self.b.set_pc(self.call_pc.unwrap_or(pc));
    }

    /// Block call carrying `stack` to the block at `target`, fixing the
    /// block's entry shape on first use
    fn edge(&mut self, target: u32, stack: &StackState) -> Result<BlockCall, CompileError> {
        let block = self
            .ex
            .block_at(target)
            .ok_or(CompileError::FallsOffEnd { pc: target })?;
        let shape = stack.shape();
        match self.entry.get(&block) {
            Some(params) => {
                let expected: Vec<JitType> = params.iter().map(|(_, t)| *t).collect();
                if expected != shape {
                    return Err(CompileError::StackShapeMismatch {
                        pc: target,
                        expected,
                        found: shape,
                    });
                }
            }
            None => {
                let params = shape.iter().map(|ty| (self.b.add_param(block, *ty), *ty)).collect();
                self.entry.insert(block, params);
            }
        }
        Ok(BlockCall {
            block,
            args: stack.regs(),
        })
    }

    /// Block receiving faults raised at `pc`
    fn handler_for(&self, pc: u32) -> Option<BlockId> {
        self.ex.region_at(pc).map(|r| r.dispatch).or(self.fallback)
    }

    /// Each dispatch block tests the covering handlers in table order and
    /// hands unmatched exceptions to the enclosing handler or the caller
    fn fill_dispatch_blocks(&mut self) -> Result<(), CompileError> {
        for region in self.ex.regions.clone() {
            self.b.switch_to_block(region.dispatch);
            self.b.set_handler(region.dispatch, self.fallback);
            let exception = region.exception;
            let mut caught_all = false;

            for row in &region.handlers {
                let handler = self.code.handlers[*row].clone();
                self.set_pc(handler.handler_pc);
                let entry = StackState::from_entries(vec![(exception, JitType::Ref)]);
                let target = self.edge(handler.handler_pc, &entry)?;
                match handler.catch_type {
                    None => {
                        self.b.terminate(Terminator::Jump(target));
                        caught_all = true;
                        break;
                    }
                    Some(index) => {
                        let class = self.class_handle(index, handler.handler_pc)?;
                        let dest = self.b.alloc_reg(JitType::I32);
                        self.b.emit(Instr::InstanceOf {
                            dest,
                            object: exception,
                            class,
                        });
                        let next = self.b.create_block_with_handler(self.fallback);
                        self.b.terminate(Terminator::Branch {
                            cond: dest,
                            then_call: target,
                            else_call: BlockCall::bare(next),
                        });
                        self.b.switch_to_block(next);
                    }
                }
            }

            if !caught_all {
                let term = match self.fallback {
                    Some(outer) => Terminator::Jump(BlockCall {
                        block: outer,
                        args: vec![exception],
                    }),
                    None => Terminator::Resume(exception),
                };
                self.b.terminate(term);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Guards
    // ========================================================================

    fn guard(&mut self, cond: Reg, raise_when: bool, kind: ExceptionKind, args: Vec<Reg>, detail: Option<Arc<str>>) {
        let handler = self.b.handler();
        let fail = self.b.create_block_with_handler(handler);
        let ok = self.b.create_block_with_handler(handler);
        let (then_call, else_call) = if raise_when {
            (BlockCall::bare(fail), BlockCall::bare(ok))
        } else {
            (BlockCall::bare(ok), BlockCall::bare(fail))
        };
        self.b.terminate(Terminator::Branch {
            cond,
            then_call,
            else_call,
        });
        self.b.switch_to_block(fail);
        self.b.terminate(Terminator::Raise { kind, args, detail });
        self.b.switch_to_block(ok);
    }

    /// Raise `kind` when `cond` is nonzero
    fn raise_if(&mut self, cond: Reg, kind: ExceptionKind, args: Vec<Reg>, detail: Option<Arc<str>>) {
        self.guard(cond, true, kind, args, detail);
    }

    /// Raise `kind` when `cond` is zero
    fn raise_unless(&mut self, cond: Reg, kind: ExceptionKind, args: Vec<Reg>, detail: Option<Arc<str>>) {
        self.guard(cond, false, kind, args, detail);
    }

    fn null_check(&mut self, object: Reg) {
        if self.non_null.contains(&object) {
            return;
        }
        let dest = self.b.alloc_reg(JitType::I32);
        self.b.emit(Instr::IsNull { dest, src: object });
        self.raise_if(dest, ExceptionKind::NullPointer, Vec::new(), None);
        self.non_null.insert(object);
    }

    // ========================================================================
    // Locals
    // ========================================================================

    fn local_slot(&self, index: u16, ty: JitType, pc: u32) -> Result<u16, CompileError> {
        if index as usize + ty.slots() > self.code.max_locals as usize {
            return Err(CompileError::BadLocal { pc, slot: index });
        }
        Ok(self.local_base + index)
    }

    fn local_operand(insn: &Insn) -> Result<u16, CompileError> {
        insn.local().ok_or(CompileError::Unsupported {
            pc: insn.pc,
            op: insn.op,
            reason: "missing local operand",
        })
    }

    fn pool_operand(insn: &Insn) -> Result<u16, CompileError> {
        insn.pool_index().ok_or(CompileError::Unsupported {
            pc: insn.pc,
            op: insn.op,
            reason: "missing constant pool operand",
        })
    }

    fn int_operand(insn: &Insn) -> Result<i32, CompileError> {
        match insn.operand {
            Operand::Int(value) => Ok(value),
            _ => Err(CompileError::Unsupported {
                pc: insn.pc,
                op: insn.op,
                reason: "missing immediate operand",
            }),
        }
    }

    // ========================================================================
    // Handles
    // ========================================================================

    fn bound<T>(&mut self, index: u16, value: T) -> Handle<T> {
        self.pool.mark_statically_bound(index);
        self.stats.bound_handles += 1;
        Handle::resolved(value)
    }

    fn lazy<T>(&mut self, index: u16, symbol: Symbol) -> Handle<T> {
        self.stats.lazy_handles += 1;
        Handle::lazy(index, symbol)
    }

    /// Class named by pool entry `index`
    fn class_handle(&mut self, index: u16, pc: u32) -> Result<Handle<Arc<Class>>, CompileError> {
        let name = self
            .pool
            .class_name(index)
            .map_err(|source| CompileError::Pool { pc, source })?;
        if self.ctx.binds_directly() {
            if let Some(class) = self.pool.resolve_class(index) {
                return Ok(self.bound(index, class));
            }
        }
        Ok(self.lazy(index, Symbol::Class(name)))
    }

    /// Array class whose component is the class named by pool entry `index`
    fn array_of_handle(&mut self, index: u16, pc: u32) -> Result<Handle<Arc<Class>>, CompileError> {
        let name = self
            .pool
            .class_name(index)
            .map_err(|source| CompileError::Pool { pc, source })?;
        if self.ctx.binds_directly() {
            let component = TypeDesc::from_class_name(&name)?;
            if self.pool.resolve_class(index).is_some() {
                if let Ok(class) = self.ctx.registry.array_class(&component) {
                    return Ok(self.bound(index, class));
                }
            }
        }
        Ok(self.lazy(index, Symbol::ArrayOf(name)))
    }

    /// Class-initialization check, omitted when the class is bound and
    /// already initialized
    fn init_check(&mut self, class: Handle<Arc<Class>>) {
        if let Handle::Resolved(resolved) = &class {
            if resolved.is_initialized() {
                return;
            }
        }
        self.b.emit(Instr::InitCheck { class });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_slots_respects_wide_values() {
        let mut stack = StackState::default();
        stack.push(Reg(0), JitType::I32);
        stack.push(Reg(1), JitType::I64);
        assert!(matches!(stack.pop_slots(1, 4), Err(CompileError::SplitsWideValue { pc: 4 })));

        let mut stack = StackState::default();
        stack.push(Reg(0), JitType::I32);
        stack.push(Reg(1), JitType::I32);
        let taken = stack.pop_slots(2, 0).unwrap();
        assert_eq!(taken, vec![(Reg(0), JitType::I32), (Reg(1), JitType::I32)]);
        assert!(matches!(stack.pop(0), Err(CompileError::StackUnderflow { pc: 0 })));
    }

    #[test]
    fn test_pop_typed_reports_mismatch() {
        let mut stack = StackState::default();
        stack.push(Reg(3), JitType::F32);
        match stack.pop_typed(JitType::I32, 9) {
            Err(CompileError::TypeMismatch { pc, expected, found }) => {
                assert_eq!((pc, expected, found), (9, JitType::I32, JitType::F32));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
