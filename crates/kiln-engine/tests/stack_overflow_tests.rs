//! Unbounded recursion raises StackOverflowError at the guard region
#![cfg(target_os = "linux")]

use std::sync::Arc;

use kiln_engine::jit::bytecode::{Assembler, Opcode};
use kiln_engine::vm::{ClassDef, MethodDef, MethodFlags, PoolEntry};
use kiln_engine::{EngineConfig, InvokeError, Runtime, Value};

const STATIC: u16 = MethodFlags::PUBLIC | MethodFlags::STATIC;

fn runtime() -> Arc<Runtime> {
    Arc::new(
        Runtime::new(EngineConfig {
            thread_stack_size: 8 * 1024 * 1024,
            stack_guard_size: 1024 * 1024,
            trace_uncaught: false,
            ..EngineConfig::default()
        })
        .unwrap(),
    )
}

#[test]
fn test_infinite_recursion_overflows() {
    let rt = runtime();
    let mut a = Assembler::new();
    a.load(Opcode::Iload, 0)
        .push_int(1)
        .op(Opcode::Iadd)
        .op_u16(Opcode::Invokestatic, 0)
        .op(Opcode::Ireturn);
    let class = rt
        .define_class(
            ClassDef::new("Deep")
                .constants(vec![PoolEntry::method("Deep", "down", "(I)I")])
                .method(MethodDef::bytecode("down", "(I)I", STATIC, a.finish_code(1, 2).unwrap())),
        )
        .unwrap();
    let down = class.declared_method("down", "(I)I").unwrap().clone();

    let worker = rt
        .spawn("deep", move |rt, thread| {
            let result = rt.invoke(thread, &down, &[Value::Int(0)]);
            (result, thread.frame_count())
        })
        .unwrap();
    let (result, frames) = worker.join().unwrap().unwrap();

    match result {
        Err(InvokeError::Uncaught(e)) => {
            assert_eq!(e.class, "java/lang/StackOverflowError");
            assert!(!e.trace.is_empty());
            assert!(e.trace.iter().all(|el| el.method.as_ref() == "down"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(frames, 0);
}

#[test]
fn test_overflow_is_catchable() {
    let rt = runtime();
    // int guard() { try { return down(0); } catch (StackOverflowError e) { return -1; } }
    let mut down = Assembler::new();
    down.load(Opcode::Iload, 0).op_u16(Opcode::Invokestatic, 0).op(Opcode::Ireturn);
    let mut guard = Assembler::new();
    let (start, end, handler) = (guard.label(), guard.label(), guard.label());
    guard
        .bind(start)
        .push_int(0)
        .op_u16(Opcode::Invokestatic, 0)
        .op(Opcode::Ireturn)
        .bind(end)
        .bind(handler)
        .op(Opcode::Pop)
        .push_int(-1)
        .op(Opcode::Ireturn)
        .handler(start, end, handler, Some(1));
    let class = rt
        .define_class(
            ClassDef::new("Catcher")
                .constants(vec![
                    PoolEntry::method("Catcher", "down", "(I)I"),
                    PoolEntry::class("java/lang/StackOverflowError"),
                ])
                .method(MethodDef::bytecode("down", "(I)I", STATIC, down.finish_code(1, 1).unwrap()))
                .method(MethodDef::bytecode("guard", "()I", STATIC, guard.finish_code(0, 1).unwrap())),
        )
        .unwrap();
    let guard = class.declared_method("guard", "()I").unwrap().clone();

    let worker = rt
        .spawn("catcher", move |rt, thread| rt.invoke(thread, &guard, &[]).ok().flatten())
        .unwrap();
    assert_eq!(worker.join().unwrap().unwrap(), Some(Value::Int(-1)));
}
