//! Pretty-printing for IR
//!
//! The dump is deterministic: it never prints addresses, only register and
//! block numbers, constants and symbolic names.

use std::fmt;

use super::instr::{Block, BlockCall, CallTarget, Function, Instr, Reg, Terminator};

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function @{} (", self.name)?;
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", ty)?;
        }
        match self.ret {
            Some(ty) => write!(f, ") -> {}", ty)?,
            None => write!(f, ") -> void")?,
        }
        writeln!(f, " locals {} entry {} {{", self.max_locals, self.entry)?;

        for block in &self.blocks {
            write!(f, "{}", block)?;
        }

        writeln!(f, "}}")
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  {}", self.id)?;
        if !self.params.is_empty() {
            write!(f, "(")?;
            format_args_list(f, &self.params)?;
            write!(f, ")")?;
        }
        write!(f, ":")?;
        if let Some(handler) = self.handler {
            write!(f, " ; handler {}", handler)?;
        }
        writeln!(f)?;

        for (instr, pc) in self.instrs.iter().zip(&self.pcs) {
            writeln!(f, "    {:<48} ; @{}", instr.to_string(), pc)?;
        }

        writeln!(f, "    {}", self.terminator)
    }
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Static(method) => write!(f, "static {}", method),
            CallTarget::Virtual(method) => write!(f, "virtual {}", method),
            CallTarget::Cached(site) => write!(f, "cached #{} {}", site.pool_index(), site.member()),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Constants
            Instr::ConstI32 { dest, value } => write!(f, "{} = const.i32 {}", dest, value),
            Instr::ConstI64 { dest, value } => write!(f, "{} = const.i64 {}", dest, value),
            Instr::ConstF32 { dest, value } => write!(f, "{} = const.f32 {:?}", dest, value),
            Instr::ConstF64 { dest, value } => write!(f, "{} = const.f64 {:?}", dest, value),
            Instr::ConstNull { dest } => write!(f, "{} = const.null", dest),
            Instr::ConstString { dest, value } => write!(f, "{} = const.string {:?}", dest, value),
            Instr::Move { dest, src } => write!(f, "{} = move {}", dest, src),

            // Locals
            Instr::LoadLocal { dest, slot } => write!(f, "{} = load.local {}", dest, slot),
            Instr::StoreLocal { slot, src } => write!(f, "store.local {}, {}", slot, src),

            // Arithmetic
            Instr::Binary { op, dest, left, right } => {
                write!(f, "{} = {} {}, {}", dest, op.mnemonic(), left, right)
            }
            Instr::Neg { dest, src } => write!(f, "{} = neg {}", dest, src),
            Instr::Convert { dest, src } => write!(f, "{} = convert {}", dest, src),
            Instr::Narrow { dest, src, kind } => write!(f, "{} = narrow.{:?} {}", dest, kind, src),
            Instr::Cmp { op, dest, left, right } => {
                write!(f, "{} = cmp.{} {}, {}", dest, op.mnemonic(), left, right)
            }
            Instr::Compare3 { dest, left, right, nan } => {
                write!(f, "{} = cmp3 {}, {} nan={}", dest, left, right, nan)
            }
            Instr::IsNull { dest, src } => write!(f, "{} = is.null {}", dest, src),

            // Objects
            Instr::InitCheck { class } => write!(f, "init.check {}", class),
            Instr::ClassMonitor { dest, class } => write!(f, "{} = class.monitor {}", dest, class),
            Instr::New { dest, class } => write!(f, "{} = new {}", dest, class),
            Instr::NewArray { dest, class, length } => write!(f, "{} = new.array {} [{}]", dest, class, length),
            Instr::NewMultiArray { dest, class, dims } => {
                write!(f, "{} = new.multi {} [", dest, class)?;
                format_args_list(f, dims)?;
                write!(f, "]")
            }
            Instr::ArrayLength { dest, array } => write!(f, "{} = array.length {}", dest, array),
            Instr::ArrayLoad { dest, array, index } => write!(f, "{} = array.load {}[{}]", dest, array, index),
            Instr::ArrayStore { array, index, value } => write!(f, "array.store {}[{}], {}", array, index, value),
            Instr::StoreCheck { dest, array, value } => write!(f, "{} = store.check {}, {}", dest, array, value),
            Instr::GetField { dest, object, field } => write!(f, "{} = get.field {}, {}", dest, object, field),
            Instr::PutField { object, field, value } => write!(f, "put.field {}, {}, {}", object, field, value),
            Instr::GetStatic { dest, field } => write!(f, "{} = get.static {}", dest, field),
            Instr::PutStatic { field, value } => write!(f, "put.static {}, {}", field, value),
            Instr::InstanceOf { dest, object, class } => write!(f, "{} = instance.of {}, {}", dest, object, class),
            Instr::CanCast { dest, object, class } => write!(f, "{} = can.cast {}, {}", dest, object, class),
            Instr::MonitorEnter { object } => write!(f, "monitor.enter {}", object),
            Instr::MonitorExit { object } => write!(f, "monitor.exit {}", object),

            // Calls and runtime
            Instr::Call { dest, target, args } => {
                if let Some(dest) = dest {
                    write!(f, "{} = ", dest)?;
                }
                write!(f, "call {}(", target)?;
                format_args_list(f, args)?;
                write!(f, ")")
            }
            Instr::Safepoint => write!(f, "safepoint"),
            Instr::StackCheck { dest } => write!(f, "{} = stack.check", dest),
        }
    }
}

impl fmt::Display for BlockCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.block)?;
        if !self.args.is_empty() {
            write!(f, "(")?;
            format_args_list(f, &self.args)?;
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jmp {}", target),
            Terminator::Branch { cond, then_call, else_call } => {
                write!(f, "br {}, {}, {}", cond, then_call, else_call)
            }
            Terminator::Switch { value, cases, default } => {
                write!(f, "switch {} [", value)?;
                for (i, (key, target)) in cases.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} => {}", key, target)?;
                }
                write!(f, "] default {}", default)
            }
            Terminator::Return(Some(reg)) => write!(f, "ret {}", reg),
            Terminator::Return(None) => write!(f, "ret void"),
            Terminator::Throw(reg) => write!(f, "throw {}", reg),
            Terminator::Raise { kind, args, detail } => {
                write!(f, "raise {:?}(", kind)?;
                format_args_list(f, args)?;
                write!(f, ")")?;
                if let Some(detail) = detail {
                    write!(f, " {:?}", detail)?;
                }
                Ok(())
            }
            Terminator::Resume(reg) => write!(f, "resume {}", reg),
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }
}

fn format_args_list(f: &mut fmt::Formatter<'_>, args: &[Reg]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::jit::ir::instr::{BinOp, BlockCall, Function, Instr, Terminator};
    use crate::jit::ir::types::JitType;
    use crate::vm::exceptions::ExceptionKind;

    #[test]
    fn test_function_dump() {
        let mut func = Function::new("T.div(II)I".to_string(), vec![JitType::I32, JitType::I32], Some(JitType::I32), 2);
        let entry = func.add_block();
        let fail = func.add_block();
        let a = func.alloc_reg(JitType::I32);
        let b = func.alloc_reg(JitType::I32);
        let q = func.alloc_reg(JitType::I32);
        func.block_mut(entry).params = vec![a, b];
        func.block_mut(entry).instrs.push(Instr::Binary { op: BinOp::Div, dest: q, left: a, right: b });
        func.block_mut(entry).pcs.push(2);
        func.block_mut(entry).terminator = Terminator::Return(Some(q));
        func.block_mut(fail).terminator = Terminator::Raise {
            kind: ExceptionKind::Arithmetic,
            args: vec![],
            detail: Some("/ by zero".into()),
        };

        let text = func.to_string();
        assert!(text.starts_with("function @T.div(II)I (i32, i32) -> i32 locals 2 entry bb0 {"));
        assert!(text.contains("  bb0(r0, r1):\n"));
        assert!(text.contains("r2 = div r0, r1"));
        assert!(text.contains("; @2"));
        assert!(text.contains("raise Arithmetic() \"/ by zero\""));
        assert_eq!(
            Terminator::Jump(BlockCall { block: fail, args: vec![q] }).to_string(),
            "jmp bb1(r2)"
        );
    }
}
