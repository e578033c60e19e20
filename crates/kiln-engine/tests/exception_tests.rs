//! Managed exceptions: runtime faults, handlers, the exception chain and
//! monitor release on unwind

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kiln_engine::jit::bytecode::{Assembler, Opcode};
use kiln_engine::vm::exceptions::ExceptionKind;
use kiln_engine::vm::native::native_fn;
use kiln_engine::vm::{Class, ClassDef, Method, MethodDef, MethodFlags, PoolEntry};
use kiln_engine::{EngineConfig, InvokeError, Runtime, Value};

const STATIC: u16 = MethodFlags::PUBLIC | MethodFlags::STATIC;

// ============================================================================
// Helpers
// ============================================================================

fn runtime() -> Runtime {
    Runtime::new(EngineConfig::default()).unwrap()
}

fn method(class: &Class, name: &str, descriptor: &str) -> Arc<Method> {
    class.declared_method(name, descriptor).unwrap().clone()
}

/// `iload0 iload1 idiv ireturn`
fn divide_body() -> Assembler {
    let mut a = Assembler::new();
    a.line(10)
        .load(Opcode::Iload, 0)
        .load(Opcode::Iload, 1)
        .line(11)
        .op(Opcode::Idiv)
        .op(Opcode::Ireturn);
    a
}

/// Divide guarded by a handler for `catch_type` (pool index 0) that
/// returns -1
fn guarded_divide(catch_type: &str) -> (Vec<PoolEntry>, MethodDef) {
    let mut a = Assembler::new();
    let start = a.label();
    let end = a.label();
    let handler = a.label();
    a.bind(start)
        .load(Opcode::Iload, 0)
        .load(Opcode::Iload, 1)
        .op(Opcode::Idiv)
        .op(Opcode::Ireturn)
        .bind(end)
        .bind(handler)
        .op(Opcode::Pop)
        .push_int(-1)
        .op(Opcode::Ireturn)
        .handler(start, end, handler, Some(0));
    let def = MethodDef::bytecode("safeDiv", "(II)I", STATIC, a.finish_code(2, 2).unwrap());
    (vec![PoolEntry::class(catch_type)], def)
}

fn expect_uncaught(result: Result<Option<Value>, InvokeError>, class: &str) -> kiln_engine::vm::UncaughtException {
    match result {
        Err(InvokeError::Uncaught(e)) => {
            assert_eq!(e.class, class);
            e
        }
        other => panic!("expected {}, got {:?}", class, other),
    }
}

// ============================================================================
// Runtime faults
// ============================================================================

#[test]
fn test_division_by_zero_is_uncaught() {
    let rt = runtime();
    let class = rt
        .define_class(ClassDef::new("Calc").method(MethodDef::bytecode(
            "div",
            "(II)I",
            STATIC,
            divide_body().finish_code(2, 2).unwrap(),
        )))
        .unwrap();
    let div = method(&class, "div", "(II)I");
    let thread = rt.attach_thread("main").unwrap();

    assert_eq!(rt.invoke(&thread, &div, &[Value::Int(7), Value::Int(2)]).unwrap(), Some(Value::Int(3)));
    let e = expect_uncaught(
        rt.invoke(&thread, &div, &[Value::Int(7), Value::Int(0)]),
        "java/lang/ArithmeticException",
    );
    assert_eq!(e.message.as_deref(), Some("/ by zero"));
    let top = &e.trace[0];
    assert_eq!(&*top.method, "div");
    assert_eq!(top.line, Some(11));
    assert!(e.to_string().starts_with("java.lang.ArithmeticException: / by zero"));
}

#[test]
fn test_min_value_division_wraps() {
    let rt = runtime();
    let class = rt
        .define_class(ClassDef::new("Calc").method(MethodDef::bytecode(
            "div",
            "(II)I",
            STATIC,
            divide_body().finish_code(2, 2).unwrap(),
        )))
        .unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let result = rt
        .invoke(&thread, &method(&class, "div", "(II)I"), &[Value::Int(i32::MIN), Value::Int(-1)])
        .unwrap();
    assert_eq!(result, Some(Value::Int(i32::MIN)));
}

// ============================================================================
// Handlers
// ============================================================================

#[test]
fn test_matching_handler_catches() {
    let rt = runtime();
    let (constants, def) = guarded_divide("java/lang/ArithmeticException");
    let class = rt.define_class(ClassDef::new("Safe").constants(constants).method(def)).unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let safe = method(&class, "safeDiv", "(II)I");

    assert_eq!(rt.invoke(&thread, &safe, &[Value::Int(9), Value::Int(3)]).unwrap(), Some(Value::Int(3)));
    assert_eq!(rt.invoke(&thread, &safe, &[Value::Int(9), Value::Int(0)]).unwrap(), Some(Value::Int(-1)));
    assert_eq!(thread.exception_chain().depth(), 0);
}

#[test]
fn test_superclass_handler_catches() {
    let rt = runtime();
    let (constants, def) = guarded_divide("java/lang/RuntimeException");
    let class = rt.define_class(ClassDef::new("Safe").constants(constants).method(def)).unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let safe = method(&class, "safeDiv", "(II)I");
    assert_eq!(rt.invoke(&thread, &safe, &[Value::Int(1), Value::Int(0)]).unwrap(), Some(Value::Int(-1)));
}

#[test]
fn test_unrelated_handler_does_not_catch() {
    let rt = runtime();
    let (constants, def) = guarded_divide("java/lang/NullPointerException");
    let class = rt.define_class(ClassDef::new("Safe").constants(constants).method(def)).unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let safe = method(&class, "safeDiv", "(II)I");
    expect_uncaught(
        rt.invoke(&thread, &safe, &[Value::Int(1), Value::Int(0)]),
        "java/lang/ArithmeticException",
    );
    assert_eq!(thread.exception_chain().depth(), 0);
}

#[test]
fn test_native_exception_caught_by_managed_handler() {
    let rt = runtime();
    let mut a = Assembler::new();
    let start = a.label();
    let end = a.label();
    let handler = a.label();
    a.bind(start)
        .op_u16(Opcode::Invokestatic, 1)
        .push_int(0)
        .op(Opcode::Ireturn)
        .bind(end)
        .bind(handler)
        .op(Opcode::Pop)
        .push_int(1)
        .op(Opcode::Ireturn)
        .handler(start, end, handler, Some(0));
    let class = rt
        .define_class(
            ClassDef::new("Guard")
                .constants(vec![
                    PoolEntry::class("java/lang/IllegalMonitorStateException"),
                    PoolEntry::method("Guard", "fail", "()V"),
                ])
                .method(MethodDef::native(
                    "fail",
                    "()V",
                    STATIC,
                    native_fn(|ctx, _| {
                        let exception = ctx.runtime().exceptions().create(ExceptionKind::IllegalMonitorState, None)?;
                        ctx.raise(exception)?;
                        Ok(None)
                    }),
                ))
                .method(MethodDef::bytecode("guard", "()I", STATIC, a.finish_code(0, 1).unwrap())),
        )
        .unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let guard = method(&class, "guard", "()I");
    assert_eq!(rt.invoke(&thread, &guard, &[]).unwrap(), Some(Value::Int(1)));
    assert!(!thread.has_pending_exception());
}

// ============================================================================
// Exception chain
// ============================================================================

#[test]
fn test_chain_depth_follows_protected_frames() {
    let rt = runtime();
    let observed = Arc::new(AtomicUsize::new(0));
    let head_isolate = Arc::new(AtomicUsize::new(0));

    // outer and inner both guard a call with a catch-all handler
    let guarded_call = |target: u16| {
        let mut a = Assembler::new();
        let start = a.label();
        let end = a.label();
        let handler = a.label();
        a.bind(start)
            .op_u16(Opcode::Invokestatic, target)
            .op(Opcode::Ireturn)
            .bind(end)
            .bind(handler)
            .op(Opcode::Pop)
            .push_int(-1)
            .op(Opcode::Ireturn)
            .handler(start, end, handler, None);
        a.finish_code(0, 1).unwrap()
    };

    let seen = observed.clone();
    let isolate = head_isolate.clone();
    let class = rt
        .define_class(
            ClassDef::new("Chain")
                .constants(vec![
                    PoolEntry::method("Chain", "inner", "()I"),
                    PoolEntry::method("Chain", "observer", "()I"),
                ])
                .method(MethodDef::bytecode("outer", "()I", STATIC, guarded_call(0)))
                .method(MethodDef::bytecode("inner", "()I", STATIC, guarded_call(1)))
                .method(MethodDef::native(
                    "observer",
                    "()I",
                    STATIC,
                    native_fn(move |ctx, _| {
                        let chain = ctx.thread().exception_chain();
                        seen.store(chain.depth(), Ordering::SeqCst);
                        if let Some(head) = chain.head() {
                            isolate.store(head.isolate.0 as usize, Ordering::SeqCst);
                        }
                        Ok(Some(Value::Int(7)))
                    }),
                )),
        )
        .unwrap();
    let thread = rt.attach_thread("main").unwrap();

    let outer = method(&class, "outer", "()I");
    assert_eq!(rt.invoke(&thread, &outer, &[]).unwrap(), Some(Value::Int(7)));
    // outer, inner and the native bridge each link one record
    assert_eq!(observed.load(Ordering::SeqCst), 3);
    assert_eq!(head_isolate.load(Ordering::SeqCst), rt.isolate().0 as usize);
    assert_eq!(thread.exception_chain().depth(), 0);
}

// ============================================================================
// Monitors
// ============================================================================

#[test]
fn test_synchronized_throw_releases_monitor_once() {
    let rt = runtime();
    let mut a = Assembler::new();
    a.push_int(1).load(Opcode::Iload, 1).op(Opcode::Idiv).op(Opcode::Ireturn);
    let class = rt
        .define_class(ClassDef::new("Locked").method(MethodDef::bytecode(
            "boom",
            "(I)I",
            MethodFlags::PUBLIC | MethodFlags::SYNCHRONIZED,
            a.finish_code(2, 2).unwrap(),
        )))
        .unwrap();
    let boom = method(&class, "boom", "(I)I");
    let thread = rt.attach_thread("main").unwrap();
    let obj = rt.allocator().allocate(class.instance_size(), class.vtable()).unwrap();

    // Hold the lock once already; the failing call must give back only its own entry
    rt.monitors().enter(&obj, &thread).unwrap();
    expect_uncaught(
        rt.invoke(&thread, &boom, &[Value::object(obj.clone()), Value::Int(0)]),
        "java/lang/ArithmeticException",
    );
    assert_eq!(rt.monitors().owner(&obj), Some(thread.id()));
    assert_eq!(rt.monitors().hold_count(&obj), 1);

    rt.monitors().exit(&obj, &thread).unwrap();
    assert_eq!(rt.monitors().owner(&obj), None);

    let result = rt.invoke(&thread, &boom, &[Value::object(obj.clone()), Value::Int(1)]).unwrap();
    assert_eq!(result, Some(Value::Int(1)));
    assert_eq!(rt.monitors().hold_count(&obj), 0);
}

#[test]
fn test_static_synchronized_uses_class_lock() {
    let rt = runtime();
    let mut a = Assembler::new();
    a.push_int(5).op(Opcode::Ireturn);
    let class = rt
        .define_class(ClassDef::new("Counter").method(MethodDef::bytecode(
            "next",
            "()I",
            STATIC | MethodFlags::SYNCHRONIZED,
            a.finish_code(0, 1).unwrap(),
        )))
        .unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let next = method(&class, "next", "()I");
    assert_eq!(rt.invoke(&thread, &next, &[]).unwrap(), Some(Value::Int(5)));

    let lock = class.monitor_object(|| unreachable!("class lock is created on first use"));
    assert_eq!(rt.monitors().hold_count(&lock), 0);
}

#[test]
fn test_monitorexit_without_enter_raises() {
    let rt = runtime();
    let mut a = Assembler::new();
    a.load(Opcode::Aload, 0).op(Opcode::Monitorexit).op(Opcode::Return);
    let class = rt
        .define_class(ClassDef::new("Bad").method(MethodDef::bytecode(
            "release",
            "()V",
            MethodFlags::PUBLIC,
            a.finish_code(1, 1).unwrap(),
        )))
        .unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let obj = rt.allocator().allocate(class.instance_size(), class.vtable()).unwrap();
    expect_uncaught(
        rt.invoke(&thread, &method(&class, "release", "()V"), &[Value::object(obj)]),
        "java/lang/IllegalMonitorStateException",
    );
}
