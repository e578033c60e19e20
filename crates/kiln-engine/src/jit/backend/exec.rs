//! IR executor
//!
//! Runs a compiled method's IR on the calling thread. Registers and local
//! slots live in per-activation vectors; block arguments are assigned to the
//! target's parameters in parallel. A fault inside a block continues at the
//! block's handler with the exception as its single argument, or leaves the
//! activation when the block has none.
//!
//! Methods lowered by the native backend skip the interpreter and enter
//! their machine code directly.

use std::sync::Arc;

use tracing::trace;

use crate::jit::backend::traits::ExecutableCode;
use crate::jit::compiler::CompiledMethod;
use crate::jit::ir::{BinOp, Block, BlockCall, BlockId, CallTarget, CmpOp, Function, Handle, Instr, JitType, Reg, Symbol, Terminator};
use crate::jit::ir::{FieldSlot, StaticSlot};
use crate::vm::class::Class;
use crate::vm::descriptor::TypeDesc;
use crate::vm::exception::{ExceptionBuffer, ExecError, ExecResult};
use crate::vm::exceptions::{ExceptionFactory, ExceptionKind};
use crate::vm::frames::capture_stack_trace;
use crate::vm::method::Method;
use crate::vm::monitor::MonitorError;
use crate::vm::object::{HeapObject, ObjectRef};
use crate::vm::runtime::Runtime;
use crate::vm::thread::VmThread;
use crate::vm::value::Value;
use crate::vm::VmError;

/// Run `code`, the compiled body of `method`, with `args` (receiver first)
pub fn execute(
    rt: &Runtime,
    thread: &VmThread,
    method: &Arc<Method>,
    code: &CompiledMethod,
    args: &[Value],
) -> ExecResult<Option<Value>> {
    let func = code.function();
    if args.len() != func.params.len() {
        return Err(VmError::TypeMismatch(format!(
            "{} takes {} arguments, got {}",
            method,
            func.params.len(),
            args.len()
        ))
        .into());
    }

    let frame = thread.push_managed(method.clone());
    let _buffer = (func.has_handlers() || method.is_synchronized()).then(|| {
        ExceptionBuffer::push(thread.exception_chain(), Some(method.clone()), rt.isolate(), frame.index())
    });

    if let Some(native) = code.native() {
        return run_native(rt, thread, func, native, args);
    }

    let mut activation = Activation {
        rt,
        thread,
        code,
        func,
        regs: vec![Value::default(); func.next_reg as usize],
        locals: vec![Value::default(); func.max_locals],
    };
    activation.run(args)
}

// ============================================================================
// Native entry
// ============================================================================

fn to_bits(value: &Value) -> ExecResult<u64> {
    Ok(match value {
        Value::Int(v) => u64::from(*v as u32),
        Value::Long(v) => *v as u64,
        Value::Float(v) => u64::from(v.to_bits()),
        Value::Double(v) => v.to_bits(),
        Value::Ref(_) => return Err(VmError::TypeMismatch("reference passed to native code".to_string()).into()),
    })
}

fn from_bits(bits: u64, ty: JitType) -> Value {
    match ty {
        JitType::I32 => Value::Int(bits as u32 as i32),
        JitType::I64 => Value::Long(bits as i64),
        JitType::F32 => Value::Float(f32::from_bits(bits as u32)),
        JitType::F64 => Value::Double(f64::from_bits(bits)),
        JitType::Ref => Value::null(),
    }
}

fn run_native(
    rt: &Runtime,
    thread: &VmThread,
    func: &Function,
    native: &ExecutableCode,
    args: &[Value],
) -> ExecResult<Option<Value>> {
    let cells = args.iter().map(to_bits).collect::<ExecResult<Vec<u64>>>()?;
    let entry = native.entry();
    let mut ret = 0u64;
    // SAFETY: the code was compiled for the entry ABI from `func`, whose
    // parameters match `cells`; the thread outlives the call
    let status = unsafe { entry((thread as *const VmThread).cast::<u8>(), cells.as_ptr(), &mut ret) };
    if status == 0 {
        return Ok(func.ret.map(|ty| from_bits(ret, ty)));
    }
    let site = native
        .raise_site(status)
        .ok_or_else(|| VmError::Internal(format!("{} returned unknown status {}", func.name, status)))?;
    let exception = rt.exceptions().create(site.kind, site.detail.as_deref())?;
    if exception.stack_trace().is_none() {
        exception.set_stack_trace(capture_stack_trace(thread).into());
    }
    Err(ExecError::Throw(exception))
}

// ============================================================================
// Interpreter
// ============================================================================

enum Flow {
    Goto(BlockId, Vec<Value>),
    Return(Option<Value>),
    Unwind(ObjectRef),
}

struct Activation<'a> {
    rt: &'a Runtime,
    thread: &'a VmThread,
    code: &'a CompiledMethod,
    func: &'a Function,
    regs: Vec<Value>,
    locals: Vec<Value>,
}

fn mismatch(reg: Reg, expected: &str, found: &Value) -> ExecError {
    VmError::TypeMismatch(format!("{} holds {:?}, expected {}", reg, found, expected)).into()
}

impl<'a> Activation<'a> {
    fn run(&mut self, args: &[Value]) -> ExecResult<Option<Value>> {
        let func = self.func;
        let mut current = func.entry;
        self.assign(current, args.to_vec());
        loop {
            let block = func.block(current);
            let flow = match self.run_block(block) {
                Ok(flow) => flow,
                Err(ExecError::Throw(exception)) => match block.handler {
                    Some(handler) => {
                        trace!(method = %func.name, from = %block.id, to = %handler, exception = exception.class_name(), "dispatching exception");
                        Flow::Goto(handler, vec![Value::object(exception)])
                    }
                    None => return Err(ExecError::Throw(exception)),
                },
                Err(fatal) => return Err(fatal),
            };
            match flow {
                Flow::Goto(target, values) => {
                    self.assign(target, values);
                    current = target;
                }
                Flow::Return(value) => return Ok(value),
                Flow::Unwind(exception) => return Err(ExecError::Throw(exception)),
            }
        }
    }

    fn assign(&mut self, block: BlockId, values: Vec<Value>) {
        let func = self.func;
        for (param, value) in func.block(block).params.iter().zip(values) {
            self.regs[param.0 as usize] = value;
        }
    }

    fn run_block(&mut self, block: &'a Block) -> ExecResult<Flow> {
        for (index, instr) in block.instrs.iter().enumerate() {
            if !instr.is_numeric() {
                if let Some(pc) = block.pcs.get(index) {
                    self.thread.set_pc(*pc);
                }
            }
            self.step(block, index, instr)?;
        }
        self.terminate(block)
    }

    // ------------------------------------------------------------------------
    // Register access
    // ------------------------------------------------------------------------

    #[inline]
    fn reg(&self, reg: Reg) -> &Value {
        &self.regs[reg.0 as usize]
    }

    #[inline]
    fn set(&mut self, reg: Reg, value: Value) {
        self.regs[reg.0 as usize] = value;
    }

    fn int(&self, reg: Reg) -> ExecResult<i32> {
        let value = self.reg(reg);
        value.as_int().ok_or_else(|| mismatch(reg, "int", value))
    }

    fn reference(&self, reg: Reg) -> ExecResult<Option<ObjectRef>> {
        match self.reg(reg) {
            Value::Ref(obj) => Ok(obj.clone()),
            other => Err(mismatch(reg, "reference", other)),
        }
    }

    /// Non-null reference; a null raises NullPointerException
    fn object(&self, reg: Reg) -> ExecResult<ObjectRef> {
        match self.reference(reg)? {
            Some(obj) => Ok(obj),
            None => Err(self.raise(ExceptionKind::NullPointer, &[], None)),
        }
    }

    fn call_values(&self, call: &BlockCall) -> Vec<Value> {
        call.args.iter().map(|r| self.reg(*r).clone()).collect()
    }

    /// References held in `live` registers and in every local slot
    fn live_refs(&self, live: &[Reg]) -> Vec<ObjectRef> {
        live.iter()
            .filter_map(|r| self.reg(*r).as_object().cloned())
            .chain(self.locals.iter().filter_map(|v| v.as_object().cloned()))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------------

    fn throw(&self, exception: ObjectRef) -> ExecError {
        if exception.stack_trace().is_none() {
            exception.set_stack_trace(capture_stack_trace(self.thread).into());
        }
        ExecError::Throw(exception)
    }

    fn raise(&self, kind: ExceptionKind, args: &[Reg], detail: Option<&str>) -> ExecError {
        match self.build(kind, args, detail) {
            Ok(exception) => self.throw(exception),
            Err(err) => err,
        }
    }

    fn build(&self, kind: ExceptionKind, args: &[Reg], detail: Option<&str>) -> ExecResult<ObjectRef> {
        let factory = self.rt.exceptions();
        let operand = |i: usize| args.get(i).copied();
        let exception = match kind {
            ExceptionKind::NullPointer => factory.null_pointer()?,
            ExceptionKind::ArrayIndexOutOfBounds => match (operand(0), operand(1)) {
                (Some(index), Some(len)) => factory.index_out_of_bounds(self.int(index)?, self.int(len)?)?,
                _ => factory.create(kind, detail)?,
            },
            ExceptionKind::ArrayStore => match (operand(0), operand(1)) {
                (Some(value), Some(array)) => {
                    let value_class = self.reference(value)?.map(|v| v.class_name().to_string()).unwrap_or_default();
                    let array_class = self.reference(array)?.map(|a| a.class_name().to_string()).unwrap_or_default();
                    factory.array_store(&value_class, &array_class)?
                }
                _ => factory.create(kind, detail)?,
            },
            ExceptionKind::Arithmetic => factory.arithmetic(detail.unwrap_or("/ by zero"))?,
            ExceptionKind::NegativeArraySize => match operand(0) {
                Some(len) => factory.negative_array_size(self.int(len)?)?,
                None => factory.create(kind, detail)?,
            },
            ExceptionKind::ClassCast => match operand(0) {
                Some(obj) => {
                    let from = self.reference(obj)?.map(|o| o.class_name().to_string()).unwrap_or_default();
                    factory.class_cast(&from, detail.unwrap_or("?"))?
                }
                None => factory.create(kind, detail)?,
            },
            ExceptionKind::OutOfMemory => factory.out_of_memory()?,
            ExceptionKind::StackOverflow => factory.stack_overflow()?,
            _ => factory.create(kind, detail)?,
        };
        Ok(exception)
    }

    fn alloc_failed(&self) -> ExecError {
        self.raise(ExceptionKind::OutOfMemory, &[], None)
    }

    fn monitor_error(&self, err: MonitorError) -> ExecError {
        match err {
            MonitorError::NotOwner { .. } => self.raise(ExceptionKind::IllegalMonitorState, &[], None),
            other => VmError::Monitor(other).into(),
        }
    }

    // ------------------------------------------------------------------------
    // Symbol resolution
    // ------------------------------------------------------------------------

    fn resolve_class(&self, symbol: &Symbol) -> ExecResult<Arc<Class>> {
        let registry = self.rt.registry();
        let found = match symbol {
            Symbol::Class(name) if name.starts_with('[') => TypeDesc::parse(name)
                .ok()
                .and_then(|desc| match desc {
                    TypeDesc::Array(component) => registry.array_class(&component).ok(),
                    _ => None,
                }),
            Symbol::Class(name) => registry.lookup(name),
            Symbol::ArrayOf(name) => TypeDesc::from_class_name(name)
                .ok()
                .and_then(|component| registry.array_class(&component).ok()),
            other => return Err(VmError::Internal(format!("{} is not a class symbol", other)).into()),
        };
        match found {
            Some(class) => Ok(class),
            None => Err(self.throw(self.rt.exceptions().no_class_def_found(&symbol.to_string())?)),
        }
    }

    fn class(&self, handle: &Handle<Arc<Class>>) -> ExecResult<Arc<Class>> {
        handle.get_or_resolve(|symbol| self.resolve_class(symbol)).cloned()
    }

    fn field(&self, handle: &'a Handle<FieldSlot>) -> ExecResult<&'a FieldSlot> {
        handle.get_or_resolve(|symbol| {
            let Symbol::Field(member) = symbol else {
                return Err(VmError::Internal(format!("{} is not a field symbol", symbol)).into());
            };
            let class = self.resolve_class(&Symbol::Class(member.class.clone()))?;
            match class.find_field(&member.name, &member.descriptor) {
                Some(info) => Ok(FieldSlot {
                    owner: info.owner.clone(),
                    name: info.name.clone(),
                    slot: info.slot,
                    ty: info.ty.value_type(),
                }),
                None => Err(self.throw(self.rt.exceptions().no_such_field(&member.to_string())?)),
            }
        })
    }

    fn static_slot(&self, handle: &'a Handle<StaticSlot>) -> ExecResult<&'a StaticSlot> {
        let slot = handle.get_or_resolve(|symbol| {
            let Symbol::Static(member) = symbol else {
                return Err(VmError::Internal(format!("{} is not a static field symbol", symbol)).into());
            };
            let class = self.resolve_class(&Symbol::Class(member.class.clone()))?;
            match class.find_static(&member.name, &member.descriptor) {
                Some((class, slot)) => Ok(StaticSlot { class, slot }),
                None => Err(self.throw(self.rt.exceptions().no_such_field(&member.to_string())?)),
            }
        })?;
        // Initialization runs managed code, so it stays outside the resolver
        if handle.symbol().is_some() {
            self.rt.ensure_initialized(self.thread, &slot.class)?;
        }
        Ok(slot)
    }

    fn method(&self, handle: &'a Handle<Arc<Method>>) -> ExecResult<Arc<Method>> {
        handle
            .get_or_resolve(|symbol| {
                let Symbol::Method(member) = symbol else {
                    return Err(VmError::Internal(format!("{} is not a method symbol", symbol)).into());
                };
                let class = self.resolve_class(&Symbol::Class(member.class.clone()))?;
                match class.find_method(&member.name, &member.descriptor) {
                    Some(method) => Ok(method),
                    None => Err(self.throw(self.rt.exceptions().no_such_method(&member.to_string())?)),
                }
            })
            .cloned()
    }

    fn class_of(&self, obj: &HeapObject) -> ExecResult<Arc<Class>> {
        obj.vtable()
            .class()
            .ok_or_else(|| VmError::Internal(format!("{} has no class", obj.class_name())).into())
    }

    // ------------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------------

    fn step(&mut self, block: &'a Block, index: usize, instr: &'a Instr) -> ExecResult<()> {
        match instr {
            Instr::ConstI32 { dest, value } => self.set(*dest, Value::Int(*value)),
            Instr::ConstI64 { dest, value } => self.set(*dest, Value::Long(*value)),
            Instr::ConstF32 { dest, value } => self.set(*dest, Value::Float(*value)),
            Instr::ConstF64 { dest, value } => self.set(*dest, Value::Double(*value)),
            Instr::ConstNull { dest } => self.set(*dest, Value::null()),
            Instr::ConstString { dest, value } => {
                let string = self.rt.intern(value).map_err(|_| self.alloc_failed())?;
                self.set(*dest, Value::object(string));
            }
            Instr::Move { dest, src } => self.set(*dest, self.reg(*src).clone()),
            Instr::LoadLocal { dest, slot } => {
                let value = self
                    .locals
                    .get(usize::from(*slot))
                    .cloned()
                    .ok_or_else(|| VmError::Internal(format!("local {} out of range", slot)))?;
                self.set(*dest, value);
            }
            Instr::StoreLocal { slot, src } => {
                let value = self.reg(*src).clone();
                let cell = self
                    .locals
                    .get_mut(usize::from(*slot))
                    .ok_or_else(|| VmError::Internal(format!("local {} out of range", slot)))?;
                *cell = value;
            }

            Instr::Binary { op, dest, left, right } => {
                let value = self.binary(*op, *left, *right)?;
                self.set(*dest, value);
            }
            Instr::Neg { dest, src } => {
                let value = match self.reg(*src) {
                    Value::Int(v) => Value::Int(v.wrapping_neg()),
                    Value::Long(v) => Value::Long(v.wrapping_neg()),
                    Value::Float(v) => Value::Float(-v),
                    Value::Double(v) => Value::Double(-v),
                    other => return Err(mismatch(*src, "number", other)),
                };
                self.set(*dest, value);
            }
            Instr::Convert { dest, src } => {
                let to = self
                    .func
                    .reg_type(*dest)
                    .ok_or_else(|| VmError::Internal(format!("{} has no type", dest)))?;
                let value = convert(self.reg(*src), to).ok_or_else(|| mismatch(*src, "number", self.reg(*src)))?;
                self.set(*dest, value);
            }
            Instr::Narrow { dest, src, kind } => {
                let value = kind.narrow(Value::Int(self.int(*src)?));
                self.set(*dest, value);
            }
            Instr::Cmp { op, dest, left, right } => {
                let holds = compare(*op, self.reg(*left), self.reg(*right)).ok_or_else(|| mismatch(*right, "comparable operand", self.reg(*right)))?;
                self.set(*dest, Value::Int(i32::from(holds)));
            }
            Instr::Compare3 { dest, left, right, nan } => {
                let ordering = match (self.reg(*left), self.reg(*right)) {
                    (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
                    (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
                    (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
                    (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
                    (_, other) => return Err(mismatch(*right, "number", other)),
                };
                let result = match ordering {
                    Some(std::cmp::Ordering::Less) => -1,
                    Some(std::cmp::Ordering::Equal) => 0,
                    Some(std::cmp::Ordering::Greater) => 1,
                    None => *nan,
                };
                self.set(*dest, Value::Int(result));
            }
            Instr::IsNull { dest, src } => {
                let null = self.reference(*src)?.is_none();
                self.set(*dest, Value::Int(i32::from(null)));
            }

            Instr::InitCheck { class } => {
                let class = self.class(class)?;
                self.rt.ensure_initialized(self.thread, &class)?;
            }
            Instr::ClassMonitor { dest, class } => {
                let class = self.class(class)?;
                let lock = self.rt.class_lock(&class)?;
                self.set(*dest, Value::object(lock));
            }
            Instr::New { dest, class } => {
                let class = self.class(class)?;
                let obj = self
                    .rt
                    .allocator()
                    .allocate(class.instance_size(), class.vtable())
                    .map_err(|_| self.alloc_failed())?;
                self.set(*dest, Value::object(obj));
            }
            Instr::NewArray { dest, class, length } => {
                let class = self.class(class)?;
                let length = self.int(*length)?;
                let array = self.new_array(&class, &[length])?;
                self.set(*dest, Value::object(array));
            }
            Instr::NewMultiArray { dest, class, dims } => {
                let class = self.class(class)?;
                let lengths = dims.iter().map(|r| self.int(*r)).collect::<ExecResult<Vec<i32>>>()?;
                let array = self.new_array(&class, &lengths)?;
                self.set(*dest, Value::object(array));
            }
            Instr::ArrayLength { dest, array } => {
                let array = self.object(*array)?;
                let len = array
                    .array_len()
                    .ok_or_else(|| VmError::NotAnArray(array.class_name().to_string()))?;
                self.set(*dest, Value::Int(len as i32));
            }
            Instr::ArrayLoad { dest, array, index } => {
                let obj = self.object(*array)?;
                let i = self.int(*index)?;
                let i = self.checked_index(&obj, i)?;
                let value = obj.array_get(i)?;
                self.set(*dest, value);
            }
            Instr::ArrayStore { array, index, value } => {
                let obj = self.object(*array)?;
                let i = self.int(*index)?;
                let i = self.checked_index(&obj, i)?;
                obj.array_set(i, self.reg(*value).clone())?;
            }
            Instr::StoreCheck { dest, array, value } => {
                let array = self.object(*array)?;
                let storable = match self.reference(*value)? {
                    None => true,
                    Some(value) => match self.class_of(&array)?.component_class() {
                        Some(component) => self.class_of(&value)?.is_assignable_to(component),
                        None => false,
                    },
                };
                self.set(*dest, Value::Int(i32::from(storable)));
            }
            Instr::GetField { dest, object, field } => {
                let obj = self.object(*object)?;
                let slot = self.field(field)?;
                let value = obj.field(slot.slot)?;
                self.set(*dest, value);
            }
            Instr::PutField { object, field, value } => {
                let obj = self.object(*object)?;
                let slot = self.field(field)?;
                obj.set_field(slot.slot, self.reg(*value).clone())?;
            }
            Instr::GetStatic { dest, field } => {
                let slot = self.static_slot(field)?;
                let value = slot.class.static_value(slot.slot).ok_or_else(|| VmError::FieldSlot {
                    class: slot.class.name().to_string(),
                    slot: slot.slot,
                })?;
                self.set(*dest, value);
            }
            Instr::PutStatic { field, value } => {
                let slot = self.static_slot(field)?;
                if !slot.class.set_static_value(slot.slot, self.reg(*value).clone()) {
                    return Err(VmError::FieldSlot {
                        class: slot.class.name().to_string(),
                        slot: slot.slot,
                    }
                    .into());
                }
            }
            Instr::InstanceOf { dest, object, class } => {
                let result = match self.reference(*object)? {
                    Some(obj) => {
                        let target = self.class(class)?;
                        self.class_of(&obj)?.is_assignable_to(&target)
                    }
                    None => false,
                };
                self.set(*dest, Value::Int(i32::from(result)));
            }
            Instr::CanCast { dest, object, class } => {
                let result = match self.reference(*object)? {
                    Some(obj) => {
                        let target = self.class(class)?;
                        self.class_of(&obj)?.is_assignable_to(&target)
                    }
                    None => true,
                };
                self.set(*dest, Value::Int(i32::from(result)));
            }
            Instr::MonitorEnter { object } => {
                let obj = self.object(*object)?;
                self.rt
                    .monitors()
                    .enter(&obj, self.thread)
                    .map_err(|err| self.monitor_error(err))?;
            }
            Instr::MonitorExit { object } => {
                let obj = self.object(*object)?;
                self.rt
                    .monitors()
                    .exit(&obj, self.thread)
                    .map_err(|err| self.monitor_error(err))?;
            }

            Instr::Call { dest, target, args } => {
                let values: Vec<Value> = args.iter().map(|r| self.reg(*r).clone()).collect();
                let callee = self.select(target, args.first().copied())?;
                let result = {
                    let live = self.code.stack_maps().at(block.id, index);
                    let _pin = self.thread.pin_roots(self.live_refs(live));
                    self.rt.call_method(self.thread, &callee, &values)?
                };
                if let Some(dest) = dest {
                    let ty = self.func.reg_type(*dest).unwrap_or(JitType::Ref);
                    self.set(*dest, result.unwrap_or_else(|| Value::zero(ty)));
                }
            }
            Instr::Safepoint => {
                if self.thread.should_yield() {
                    let live = self.code.stack_maps().at(block.id, index);
                    self.thread.publish_roots(self.live_refs(live));
                    self.thread.safepoint();
                    self.thread.publish_roots(Vec::new());
                }
            }
            Instr::StackCheck { dest } => {
                let ok = !self.thread.stack_exhausted();
                self.set(*dest, Value::Int(i32::from(ok)));
            }
        }
        Ok(())
    }

    fn binary(&self, op: BinOp, left: Reg, right: Reg) -> ExecResult<Value> {
        let value = match (self.reg(left), self.reg(right)) {
            (Value::Int(a), Value::Int(b)) => {
                let (a, b) = (*a, *b);
                if matches!(op, BinOp::Div | BinOp::Rem) && b == 0 {
                    return Err(self.raise(ExceptionKind::Arithmetic, &[], Some("/ by zero")));
                }
                Value::Int(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => a.wrapping_div(b),
                    BinOp::Rem => a.wrapping_rem(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl => a.wrapping_shl(b as u32),
                    BinOp::Shr => a.wrapping_shr(b as u32),
                    BinOp::Ushr => (a as u32).wrapping_shr(b as u32) as i32,
                })
            }
            (Value::Long(a), Value::Int(b)) if op.is_shift() => {
                let (a, b) = (*a, *b as u32);
                Value::Long(match op {
                    BinOp::Shl => a.wrapping_shl(b),
                    BinOp::Shr => a.wrapping_shr(b),
                    _ => (a as u64).wrapping_shr(b) as i64,
                })
            }
            (Value::Long(a), Value::Long(b)) => {
                let (a, b) = (*a, *b);
                if matches!(op, BinOp::Div | BinOp::Rem) && b == 0 {
                    return Err(self.raise(ExceptionKind::Arithmetic, &[], Some("/ by zero")));
                }
                Value::Long(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => a.wrapping_div(b),
                    BinOp::Rem => a.wrapping_rem(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    _ => return Err(mismatch(right, "int shift count", self.reg(right))),
                })
            }
            (Value::Float(a), Value::Float(b)) => Value::Float(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                _ => return Err(mismatch(left, "integer", self.reg(left))),
            }),
            (Value::Double(a), Value::Double(b)) => Value::Double(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                _ => return Err(mismatch(left, "integer", self.reg(left))),
            }),
            (_, other) => return Err(mismatch(right, "matching number", other)),
        };
        Ok(value)
    }

    fn checked_index(&self, array: &HeapObject, index: i32) -> ExecResult<usize> {
        let len = array
            .array_len()
            .ok_or_else(|| VmError::NotAnArray(array.class_name().to_string()))?;
        match usize::try_from(index) {
            Ok(i) if i < len => Ok(i),
            _ => match self.rt.exceptions().index_out_of_bounds(index, len as i32) {
                Ok(exception) => Err(self.throw(exception)),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Allocate an array of `class`, nesting one level per entry of `lengths`
    fn new_array(&self, class: &Arc<Class>, lengths: &[i32]) -> ExecResult<ObjectRef> {
        let (&length, rest) = lengths
            .split_first()
            .ok_or_else(|| VmError::Internal("array allocation without a length".to_string()))?;
        if length < 0 {
            let factory = self.rt.exceptions();
            return Err(self.throw(factory.negative_array_size(length)?));
        }
        let elem = class
            .array_elem()
            .ok_or_else(|| VmError::NotAnArray(class.name().to_string()))?;
        let array = self
            .rt
            .allocator()
            .allocate_array(class.vtable(), elem, length as usize)
            .map_err(|_| self.alloc_failed())?;
        if !rest.is_empty() {
            let component = class
                .component_class()
                .ok_or_else(|| VmError::NotAnArray(class.name().to_string()))?;
            for i in 0..length as usize {
                let inner = self.new_array(component, rest)?;
                array.array_set(i, Value::object(inner))?;
            }
        }
        Ok(array)
    }

    /// Method a call instruction invokes for these arguments
    fn select(&self, target: &'a CallTarget, receiver: Option<Reg>) -> ExecResult<Arc<Method>> {
        match target {
            CallTarget::Static(handle) => self.method(handle),
            CallTarget::Virtual(handle) => {
                let declared = self.method(handle)?;
                let receiver = receiver.ok_or_else(|| VmError::Internal(format!("virtual call to {} without receiver", declared)))?;
                let obj = self.object(receiver)?;
                let vtable = obj.vtable();
                let selected = declared
                    .vtable_offset()
                    .and_then(|offset| vtable.method(offset))
                    .filter(|m| m.name() == declared.name() && m.descriptor_text() == declared.descriptor_text())
                    .or_else(|| {
                        vtable
                            .class()
                            .and_then(|class| class.find_virtual(declared.name(), declared.descriptor_text()))
                    });
                match selected {
                    Some(method) => Ok(method),
                    None => Err(self.throw(self.rt.exceptions().no_such_method(&declared.to_string())?)),
                }
            }
            CallTarget::Cached(enveloppe) => {
                let receiver = receiver.ok_or_else(|| VmError::Internal(format!("interface call to {} without receiver", enveloppe.member())))?;
                let obj = self.object(receiver)?;
                let member = enveloppe.member();
                let found = enveloppe.lookup(obj.vtable(), |vtable| {
                    vtable
                        .class()
                        .and_then(|class| class.find_virtual(&member.name, &member.descriptor))
                        .filter(|m| !m.is_abstract())
                });
                match found {
                    Some(method) => Ok(method),
                    None => Err(self.throw(self.rt.exceptions().no_such_method(&member.to_string())?)),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Terminators
    // ------------------------------------------------------------------------

    fn terminate(&self, block: &'a Block) -> ExecResult<Flow> {
        match &block.terminator {
            Terminator::Jump(call) => Ok(Flow::Goto(call.block, self.call_values(call))),
            Terminator::Branch { cond, then_call, else_call } => {
                let call = if self.int(*cond)? != 0 { then_call } else { else_call };
                Ok(Flow::Goto(call.block, self.call_values(call)))
            }
            Terminator::Switch { value, cases, default } => {
                let key = self.int(*value)?;
                let call = cases
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, call)| call)
                    .unwrap_or(default);
                Ok(Flow::Goto(call.block, self.call_values(call)))
            }
            Terminator::Return(value) => Ok(Flow::Return(value.map(|r| self.reg(r).clone()))),
            Terminator::Throw(reg) => {
                self.thread.set_pc(block.term_pc);
                let exception = self.object(*reg)?;
                Err(self.throw(exception))
            }
            Terminator::Raise { kind, args, detail } => {
                self.thread.set_pc(block.term_pc);
                Err(self.raise(*kind, args, detail.as_deref()))
            }
            Terminator::Resume(reg) => Ok(Flow::Unwind(self.object(*reg)?)),
            Terminator::Unreachable => {
                Err(VmError::Internal(format!("{} reached the end of {}", self.func.name, block.id)).into())
            }
        }
    }
}

fn convert(value: &Value, to: JitType) -> Option<Value> {
    Some(match (value, to) {
        (Value::Int(v), JitType::I32) => Value::Int(*v),
        (Value::Int(v), JitType::I64) => Value::Long(i64::from(*v)),
        (Value::Int(v), JitType::F32) => Value::Float(*v as f32),
        (Value::Int(v), JitType::F64) => Value::Double(f64::from(*v)),
        (Value::Long(v), JitType::I32) => Value::Int(*v as i32),
        (Value::Long(v), JitType::I64) => Value::Long(*v),
        (Value::Long(v), JitType::F32) => Value::Float(*v as f32),
        (Value::Long(v), JitType::F64) => Value::Double(*v as f64),
        (Value::Float(v), JitType::I32) => Value::Int(*v as i32),
        (Value::Float(v), JitType::I64) => Value::Long(*v as i64),
        (Value::Float(v), JitType::F32) => Value::Float(*v),
        (Value::Float(v), JitType::F64) => Value::Double(f64::from(*v)),
        (Value::Double(v), JitType::I32) => Value::Int(*v as i32),
        (Value::Double(v), JitType::I64) => Value::Long(*v as i64),
        (Value::Double(v), JitType::F32) => Value::Float(*v as f32),
        (Value::Double(v), JitType::F64) => Value::Double(*v),
        _ => return None,
    })
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Option<bool> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) if op == CmpOp::ULt => Some((*a as u32).cmp(&(*b as u32))),
        (Value::Long(a), Value::Long(b)) if op == CmpOp::ULt => Some((*a as u64).cmp(&(*b as u64))),
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
        (Value::Ref(_), Value::Ref(_)) => {
            return match op {
                CmpOp::Eq => Some(left == right),
                CmpOp::Ne => Some(left != right),
                _ => None,
            };
        }
        _ => return None,
    };
    Some(match (op, ordering) {
        (CmpOp::Ne, None) => true,
        (_, None) => false,
        (CmpOp::Eq, Some(o)) => o == Ordering::Equal,
        (CmpOp::Ne, Some(o)) => o != Ordering::Equal,
        (CmpOp::Lt | CmpOp::ULt, Some(o)) => o == Ordering::Less,
        (CmpOp::Le, Some(o)) => o != Ordering::Greater,
        (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
        (CmpOp::Ge, Some(o)) => o != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_saturates_like_java() {
        assert_eq!(convert(&Value::Double(f64::NAN), JitType::I32), Some(Value::Int(0)));
        assert_eq!(convert(&Value::Float(1e20), JitType::I32), Some(Value::Int(i32::MAX)));
        assert_eq!(convert(&Value::Long(0x1_0000_0001), JitType::I32), Some(Value::Int(1)));
        assert_eq!(convert(&Value::null(), JitType::I32), None);
    }

    #[test]
    fn test_compare_unordered_floats() {
        let nan = Value::Float(f32::NAN);
        let one = Value::Float(1.0);
        assert_eq!(compare(CmpOp::Lt, &nan, &one), Some(false));
        assert_eq!(compare(CmpOp::Ge, &nan, &one), Some(false));
        assert_eq!(compare(CmpOp::Ne, &nan, &one), Some(true));
    }

    #[test]
    fn test_unsigned_compare_for_bounds() {
        assert_eq!(compare(CmpOp::ULt, &Value::Int(-1), &Value::Int(4)), Some(false));
        assert_eq!(compare(CmpOp::ULt, &Value::Int(3), &Value::Int(4)), Some(true));
        assert_eq!(compare(CmpOp::Lt, &Value::Int(-1), &Value::Int(4)), Some(true));
    }

    #[test]
    fn test_native_bits() {
        let bits = to_bits(&Value::Int(-3)).unwrap();
        assert_eq!(from_bits(bits, JitType::I32), Value::Int(-3));
        let bits = to_bits(&Value::Double(2.5)).unwrap();
        assert_eq!(from_bits(bits, JitType::F64), Value::Double(2.5));
        assert!(to_bits(&Value::null()).is_err());
    }
}
