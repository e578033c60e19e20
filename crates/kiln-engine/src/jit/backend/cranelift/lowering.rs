//! IR → Cranelift IR lowering
//!
//! Registers and local slots become Cranelift variables, so the SSA form is
//! rebuilt by the frontend. Block arguments are copied into the target's
//! parameter variables on a dedicated edge block, reading every argument
//! before writing any parameter.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{self, types, AbiParam, InstBuilder, MemFlags};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, Switch, Variable};
use rustc_hash::FxHashMap;

use crate::jit::backend::traits::{CodegenError, RaiseSite};
use crate::jit::ir::{BinOp, BlockCall, BlockId, CmpOp, Function, Instr, JitType, Reg, Terminator};
use crate::vm::object::ElemKind;
use crate::vm::thread::VmThread;

/// Signature of the compiled entry point
pub fn entry_signature(call_conv: CallConv, pointer: ir::Type) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    sig.params.push(AbiParam::new(pointer));
    sig.params.push(AbiParam::new(pointer));
    sig.params.push(AbiParam::new(pointer));
    sig.returns.push(AbiParam::new(types::I32));
    sig
}

extern "C" fn poll_safepoint(thread: *const u8) {
    // SAFETY: the executor passes the running thread, which outlives the call
    if let Some(thread) = unsafe { thread.cast::<VmThread>().as_ref() } {
        if thread.should_yield() {
            thread.safepoint();
        }
    }
}

extern "C" fn stack_ok(thread: *const u8) -> u32 {
    // SAFETY: as for `poll_safepoint`
    match unsafe { thread.cast::<VmThread>().as_ref() } {
        Some(thread) => u32::from(!thread.stack_exhausted()),
        None => 1,
    }
}

fn clif_type(ty: JitType) -> Result<ir::Type, CodegenError> {
    match ty {
        JitType::I32 => Ok(types::I32),
        JitType::I64 => Ok(types::I64),
        JitType::F32 => Ok(types::F32),
        JitType::F64 => Ok(types::F64),
        JitType::Ref => Err(CodegenError::UnsupportedInstruction("reference value".to_string())),
    }
}

fn unsupported(what: &str) -> CodegenError {
    CodegenError::UnsupportedInstruction(what.to_string())
}

/// State maintained while lowering one function
pub struct LoweringContext<'a> {
    func: &'a Function,
    call_conv: CallConv,
    pointer: ir::Type,
    regs: FxHashMap<Reg, Variable>,
    locals: FxHashMap<(u16, JitType), Variable>,
    blocks: FxHashMap<BlockId, ir::Block>,
    thread: Variable,
    ret_ptr: Variable,
    raise_sites: Vec<RaiseSite>,
}

impl<'a> LoweringContext<'a> {
    /// Lower `func` into `builder`'s function, returning the raise sites in
    /// status order
    pub fn lower(
        func: &'a Function,
        mut builder: FunctionBuilder<'_>,
        call_conv: CallConv,
        pointer: ir::Type,
    ) -> Result<Vec<RaiseSite>, CodegenError> {
        let preamble = builder.create_block();
        builder.append_block_params_for_function_params(preamble);
        builder.switch_to_block(preamble);
        let params = builder.block_params(preamble).to_vec();
        let (thread_ptr, args_ptr, ret_ptr) = (params[0], params[1], params[2]);

        let thread = builder.declare_var(pointer);
        builder.def_var(thread, thread_ptr);
        let ret_var = builder.declare_var(pointer);
        builder.def_var(ret_var, ret_ptr);

        let mut blocks = FxHashMap::default();
        for block in &func.blocks {
            blocks.insert(block.id, builder.create_block());
        }

        let mut ctx = LoweringContext {
            func,
            call_conv,
            pointer,
            regs: FxHashMap::default(),
            locals: FxHashMap::default(),
            blocks,
            thread,
            ret_ptr: ret_var,
            raise_sites: Vec::new(),
        };

        // Arguments arrive as 64-bit cells
        let entry = func.block(func.entry);
        for (index, param) in entry.params.iter().enumerate() {
            let ty = ctx.reg_type(*param)?;
            let value = builder
                .ins()
                .load(ty, MemFlags::trusted(), args_ptr, (index * 8) as i32);
            ctx.def_reg(&mut builder, *param, value)?;
        }
        let target = ctx.block(func.entry)?;
        builder.ins().jump(target, &[]);

        for block in &func.blocks {
            let cl_block = ctx.block(block.id)?;
            builder.switch_to_block(cl_block);
            for instr in &block.instrs {
                ctx.lower_instr(instr, &mut builder)?;
            }
            ctx.lower_terminator(&block.terminator, &mut builder)?;
        }

        builder.seal_all_blocks();
        builder.finalize();
        Ok(ctx.raise_sites)
    }

    fn block(&self, id: BlockId) -> Result<ir::Block, CodegenError> {
        self.blocks
            .get(&id)
            .copied()
            .ok_or_else(|| CodegenError::BackendError(format!("unknown block {}", id)))
    }

    fn reg_type(&self, reg: Reg) -> Result<ir::Type, CodegenError> {
        let ty = self
            .func
            .reg_type(reg)
            .ok_or_else(|| CodegenError::BackendError(format!("untyped register {}", reg)))?;
        clif_type(ty)
    }

    fn var_for(&mut self, builder: &mut FunctionBuilder<'_>, reg: Reg) -> Result<Variable, CodegenError> {
        if let Some(var) = self.regs.get(&reg) {
            return Ok(*var);
        }
        let ty = self.reg_type(reg)?;
        let var = builder.declare_var(ty);
        self.regs.insert(reg, var);
        Ok(var)
    }

    fn local_var(&mut self, builder: &mut FunctionBuilder<'_>, slot: u16, ty: JitType) -> Result<Variable, CodegenError> {
        if let Some(var) = self.locals.get(&(slot, ty)) {
            return Ok(*var);
        }
        let var = builder.declare_var(clif_type(ty)?);
        self.locals.insert((slot, ty), var);
        Ok(var)
    }

    fn use_reg(&mut self, builder: &mut FunctionBuilder<'_>, reg: Reg) -> Result<ir::Value, CodegenError> {
        let var = self.var_for(builder, reg)?;
        Ok(builder.use_var(var))
    }

    fn def_reg(&mut self, builder: &mut FunctionBuilder<'_>, reg: Reg, value: ir::Value) -> Result<(), CodegenError> {
        let var = self.var_for(builder, reg)?;
        builder.def_var(var, value);
        Ok(())
    }

    fn jit_type(&self, reg: Reg) -> Result<JitType, CodegenError> {
        self.func
            .reg_type(reg)
            .ok_or_else(|| CodegenError::BackendError(format!("untyped register {}", reg)))
    }

    fn call_helper(&mut self, builder: &mut FunctionBuilder<'_>, address: usize, returns: bool) -> Option<ir::Value> {
        let mut sig = ir::Signature::new(self.call_conv);
        sig.params.push(AbiParam::new(self.pointer));
        if returns {
            sig.returns.push(AbiParam::new(types::I32));
        }
        let sig_ref = builder.import_signature(sig);
        let callee = builder.ins().iconst(self.pointer, address as i64);
        let thread = builder.use_var(self.thread);
        let call = builder.ins().call_indirect(sig_ref, callee, &[thread]);
        builder.inst_results(call).first().copied()
    }

    fn lower_instr(&mut self, instr: &Instr, builder: &mut FunctionBuilder<'_>) -> Result<(), CodegenError> {
        match instr {
            Instr::ConstI32 { dest, value } => {
                let v = builder.ins().iconst(types::I32, i64::from(*value));
                self.def_reg(builder, *dest, v)?;
            }
            Instr::ConstI64 { dest, value } => {
                let v = builder.ins().iconst(types::I64, *value);
                self.def_reg(builder, *dest, v)?;
            }
            Instr::ConstF32 { dest, value } => {
                let v = builder.ins().f32const(*value);
                self.def_reg(builder, *dest, v)?;
            }
            Instr::ConstF64 { dest, value } => {
                let v = builder.ins().f64const(*value);
                self.def_reg(builder, *dest, v)?;
            }
            Instr::Move { dest, src } => {
                let v = self.use_reg(builder, *src)?;
                self.def_reg(builder, *dest, v)?;
            }
            Instr::LoadLocal { dest, slot } => {
                let ty = self.jit_type(*dest)?;
                let var = self.local_var(builder, *slot, ty)?;
                let v = builder.use_var(var);
                self.def_reg(builder, *dest, v)?;
            }
            Instr::StoreLocal { slot, src } => {
                let ty = self.jit_type(*src)?;
                let var = self.local_var(builder, *slot, ty)?;
                let v = self.use_reg(builder, *src)?;
                builder.def_var(var, v);
            }
            Instr::Binary { op, dest, left, right } => {
                let ty = self.jit_type(*dest)?;
                let l = self.use_reg(builder, *left)?;
                let r = self.use_reg(builder, *right)?;
                let v = if ty.is_float() {
                    Self::float_binary(builder, *op, l, r)?
                } else {
                    Self::int_binary(builder, *op, clif_type(ty)?, l, r)
                };
                self.def_reg(builder, *dest, v)?;
            }
            Instr::Neg { dest, src } => {
                let ty = self.jit_type(*dest)?;
                let s = self.use_reg(builder, *src)?;
                let v = if ty.is_float() {
                    builder.ins().fneg(s)
                } else {
                    builder.ins().ineg(s)
                };
                self.def_reg(builder, *dest, v)?;
            }
            Instr::Convert { dest, src } => {
                let from = self.jit_type(*src)?;
                let to = self.jit_type(*dest)?;
                let s = self.use_reg(builder, *src)?;
                let to_ty = clif_type(to)?;
                let v = match (from, to) {
                    (JitType::I32, JitType::I64) => builder.ins().sextend(to_ty, s),
                    (JitType::I64, JitType::I32) => builder.ins().ireduce(to_ty, s),
                    (JitType::F32, JitType::F64) => builder.ins().fpromote(to_ty, s),
                    (JitType::F64, JitType::F32) => builder.ins().fdemote(to_ty, s),
                    (f, t) if f.is_integer() && t.is_float() => builder.ins().fcvt_from_sint(to_ty, s),
                    (f, t) if f.is_float() && t.is_integer() => builder.ins().fcvt_to_sint_sat(to_ty, s),
                    _ => s,
                };
                self.def_reg(builder, *dest, v)?;
            }
            Instr::Narrow { dest, src, kind } => {
                let s = self.use_reg(builder, *src)?;
                let v = match kind {
                    ElemKind::Byte => {
                        let low = builder.ins().ireduce(types::I8, s);
                        builder.ins().sextend(types::I32, low)
                    }
                    ElemKind::Short => {
                        let low = builder.ins().ireduce(types::I16, s);
                        builder.ins().sextend(types::I32, low)
                    }
                    ElemKind::Char => {
                        let low = builder.ins().ireduce(types::I16, s);
                        builder.ins().uextend(types::I32, low)
                    }
                    ElemKind::Boolean => builder.ins().band_imm(s, 1),
                    _ => s,
                };
                self.def_reg(builder, *dest, v)?;
            }
            Instr::Cmp { op, dest, left, right } => {
                let ty = self.jit_type(*left)?;
                let l = self.use_reg(builder, *left)?;
                let r = self.use_reg(builder, *right)?;
                let flag = if ty.is_float() {
                    let cc = match op {
                        CmpOp::Eq => FloatCC::Equal,
                        CmpOp::Ne => FloatCC::NotEqual,
                        CmpOp::Lt | CmpOp::ULt => FloatCC::LessThan,
                        CmpOp::Le => FloatCC::LessThanOrEqual,
                        CmpOp::Gt => FloatCC::GreaterThan,
                        CmpOp::Ge => FloatCC::GreaterThanOrEqual,
                    };
                    builder.ins().fcmp(cc, l, r)
                } else {
                    let cc = match op {
                        CmpOp::Eq => IntCC::Equal,
                        CmpOp::Ne => IntCC::NotEqual,
                        CmpOp::Lt => IntCC::SignedLessThan,
                        CmpOp::Le => IntCC::SignedLessThanOrEqual,
                        CmpOp::Gt => IntCC::SignedGreaterThan,
                        CmpOp::Ge => IntCC::SignedGreaterThanOrEqual,
                        CmpOp::ULt => IntCC::UnsignedLessThan,
                    };
                    builder.ins().icmp(cc, l, r)
                };
                let v = builder.ins().uextend(types::I32, flag);
                self.def_reg(builder, *dest, v)?;
            }
            Instr::Compare3 { dest, left, right, nan } => {
                let ty = self.jit_type(*left)?;
                let l = self.use_reg(builder, *left)?;
                let r = self.use_reg(builder, *right)?;
                let one = builder.ins().iconst(types::I32, 1);
                let minus_one = builder.ins().iconst(types::I32, -1);
                let zero = builder.ins().iconst(types::I32, 0);
                let v = if ty.is_float() {
                    let unordered = builder.ins().iconst(types::I32, i64::from(*nan));
                    let gt = builder.ins().fcmp(FloatCC::GreaterThan, l, r);
                    let lt = builder.ins().fcmp(FloatCC::LessThan, l, r);
                    let eq = builder.ins().fcmp(FloatCC::Equal, l, r);
                    let eq_or_nan = builder.ins().select(eq, zero, unordered);
                    let below = builder.ins().select(lt, minus_one, eq_or_nan);
                    builder.ins().select(gt, one, below)
                } else {
                    let gt = builder.ins().icmp(IntCC::SignedGreaterThan, l, r);
                    let lt = builder.ins().icmp(IntCC::SignedLessThan, l, r);
                    let below = builder.ins().select(lt, minus_one, zero);
                    builder.ins().select(gt, one, below)
                };
                self.def_reg(builder, *dest, v)?;
            }
            Instr::Safepoint => {
                self.call_helper(builder, poll_safepoint as usize, false);
            }
            Instr::StackCheck { dest } => {
                let ok = self
                    .call_helper(builder, stack_ok as usize, true)
                    .ok_or_else(|| CodegenError::BackendError("stack check helper returned nothing".to_string()))?;
                self.def_reg(builder, *dest, ok)?;
            }
            _ => return Err(unsupported("instruction outside the numeric subset")),
        }
        Ok(())
    }

    fn int_binary(builder: &mut FunctionBuilder<'_>, op: BinOp, ty: ir::Type, l: ir::Value, r: ir::Value) -> ir::Value {
        match op {
            BinOp::Add => builder.ins().iadd(l, r),
            BinOp::Sub => builder.ins().isub(l, r),
            BinOp::Mul => builder.ins().imul(l, r),
            BinOp::Div | BinOp::Rem => {
                // MIN / -1 overflows to MIN with remainder 0 instead of trapping
                let minus_one = builder.ins().iconst(ty, -1);
                let one = builder.ins().iconst(ty, 1);
                let is_minus_one = builder.ins().icmp(IntCC::Equal, r, minus_one);
                let divisor = builder.ins().select(is_minus_one, one, r);
                if op == BinOp::Div {
                    let q = builder.ins().sdiv(l, divisor);
                    let negated = builder.ins().ineg(l);
                    builder.ins().select(is_minus_one, negated, q)
                } else {
                    let rem = builder.ins().srem(l, divisor);
                    let zero = builder.ins().iconst(ty, 0);
                    builder.ins().select(is_minus_one, zero, rem)
                }
            }
            BinOp::And => builder.ins().band(l, r),
            BinOp::Or => builder.ins().bor(l, r),
            BinOp::Xor => builder.ins().bxor(l, r),
            BinOp::Shl => builder.ins().ishl(l, r),
            BinOp::Shr => builder.ins().sshr(l, r),
            BinOp::Ushr => builder.ins().ushr(l, r),
        }
    }

    fn float_binary(
        builder: &mut FunctionBuilder<'_>,
        op: BinOp,
        l: ir::Value,
        r: ir::Value,
    ) -> Result<ir::Value, CodegenError> {
        Ok(match op {
            BinOp::Add => builder.ins().fadd(l, r),
            BinOp::Sub => builder.ins().fsub(l, r),
            BinOp::Mul => builder.ins().fmul(l, r),
            BinOp::Div => builder.ins().fdiv(l, r),
            _ => return Err(unsupported("floating-point remainder or bitwise operator")),
        })
    }

    /// Target block for `call`, going through an edge block that assigns the
    /// parameters when the call carries arguments
    fn edge(&mut self, call: &BlockCall, pending: &mut Vec<(ir::Block, BlockCall)>, builder: &mut FunctionBuilder<'_>) -> Result<ir::Block, CodegenError> {
        let target = self.block(call.block)?;
        if call.args.is_empty() {
            return Ok(target);
        }
        let edge = builder.create_block();
        pending.push((edge, call.clone()));
        Ok(edge)
    }

    fn lower_terminator(&mut self, term: &Terminator, builder: &mut FunctionBuilder<'_>) -> Result<(), CodegenError> {
        let mut pending = Vec::new();
        match term {
            Terminator::Jump(call) => {
                let target = self.edge(call, &mut pending, builder)?;
                builder.ins().jump(target, &[]);
            }
            Terminator::Branch {
                cond,
                then_call,
                else_call,
            } => {
                let c = self.use_reg(builder, *cond)?;
                let then_block = self.edge(then_call, &mut pending, builder)?;
                let else_block = self.edge(else_call, &mut pending, builder)?;
                builder.ins().brif(c, then_block, &[], else_block, &[]);
            }
            Terminator::Switch { value, cases, default } => {
                let v = self.use_reg(builder, *value)?;
                let mut switch = Switch::new();
                for (key, call) in cases {
                    let target = self.edge(call, &mut pending, builder)?;
                    switch.set_entry(u128::from(*key as u32), target);
                }
                let fallback = self.edge(default, &mut pending, builder)?;
                switch.emit(builder, v, fallback);
            }
            Terminator::Return(value) => {
                if let Some(reg) = value {
                    let v = self.use_reg(builder, *reg)?;
                    let ret = builder.use_var(self.ret_ptr);
                    builder.ins().store(MemFlags::trusted(), v, ret, 0);
                }
                let status = builder.ins().iconst(types::I32, 0);
                builder.ins().return_(&[status]);
            }
            Terminator::Raise { kind, args, detail } => {
                if !args.is_empty() {
                    return Err(unsupported("raise with operands"));
                }
                self.raise_sites.push(RaiseSite {
                    kind: *kind,
                    detail: detail.clone(),
                });
                let status = builder.ins().iconst(types::I32, self.raise_sites.len() as i64);
                builder.ins().return_(&[status]);
            }
            Terminator::Unreachable => {
                let code = ir::TrapCode::user(1).ok_or_else(|| unsupported("trap code"))?;
                builder.ins().trap(code);
            }
            Terminator::Throw(_) | Terminator::Resume(_) => return Err(unsupported("exception propagation")),
        }

        for (edge, call) in pending {
            builder.switch_to_block(edge);
            let mut values = Vec::with_capacity(call.args.len());
            for arg in &call.args {
                values.push(self.use_reg(builder, *arg)?);
            }
            let params = self.func.block(call.block).params.clone();
            for (param, value) in params.iter().zip(values) {
                self.def_reg(builder, *param, value)?;
            }
            let target = self.block(call.block)?;
            builder.ins().jump(target, &[]);
        }
        Ok(())
    }
}
