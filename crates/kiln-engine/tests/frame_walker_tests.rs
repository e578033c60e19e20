//! Stack walking across managed, native and runtime frames

use std::sync::Arc;

use parking_lot::Mutex;

use kiln_engine::jit::bytecode::{Assembler, Opcode};
use kiln_engine::vm::native::native_fn;
use kiln_engine::vm::{ClassDef, FrameClass, FrameInfo, FrameWalker, MethodDef, MethodFlags, PoolEntry, WalkerState};
use kiln_engine::{EngineConfig, Runtime, Value};

const STATIC: u16 = MethodFlags::PUBLIC | MethodFlags::STATIC;

/// Frames seen by the observer, innermost first
type Seen = Arc<Mutex<Vec<FrameInfo>>>;

fn observer(seen: &Seen) -> MethodDef {
    let seen = seen.clone();
    MethodDef::native(
        "observer",
        "()I",
        STATIC,
        native_fn(move |ctx, _| {
            let frames: Vec<FrameInfo> = ctx.runtime().walk_stack(ctx.thread()).collect();
            let count = frames.len() as i32;
            *seen.lock() = frames;
            Ok(Some(Value::Int(count)))
        }),
    )
}

/// `rec(n)` recurses down to zero and then calls the observer
fn recursive(rt: &Runtime, seen: &Seen) -> Arc<kiln_engine::vm::Method> {
    let mut a = Assembler::new();
    let recurse = a.label();
    a.line(1)
        .load(Opcode::Iload, 0)
        .branch(Opcode::Ifne, recurse)
        .line(2)
        .op_u16(Opcode::Invokestatic, 1)
        .op(Opcode::Ireturn)
        .bind(recurse)
        .line(3)
        .load(Opcode::Iload, 0)
        .push_int(1)
        .op(Opcode::Isub)
        .op_u16(Opcode::Invokestatic, 0)
        .op(Opcode::Ireturn);
    let class = rt
        .define_class(
            ClassDef::new("Walk")
                .constants(vec![
                    PoolEntry::method("Walk", "rec", "(I)I"),
                    PoolEntry::method("Walk", "observer", "()I"),
                ])
                .method(MethodDef::bytecode("rec", "(I)I", STATIC, a.finish_code(1, 2).unwrap()))
                .method(observer(seen)),
        )
        .unwrap();
    class.declared_method("rec", "(I)I").unwrap().clone()
}

#[test]
fn test_walk_counts_managed_and_native_frames() {
    let rt = Runtime::new(EngineConfig::default()).unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let rec = recursive(&rt, &seen);
    let thread = rt.attach_thread("main").unwrap();

    for depth in [0, 4, 9] {
        let result = rt.invoke(&thread, &rec, &[Value::Int(depth)]).unwrap();
        // depth + 1 managed frames plus the native observer
        assert_eq!(result, Some(Value::Int(depth + 2)));

        let frames = seen.lock().clone();
        assert_eq!(frames[0].class, FrameClass::Known);
        assert_eq!(frames[0].method.as_ref().unwrap().name().as_ref(), "observer");
        let managed: Vec<_> = frames.iter().filter(|f| f.class == FrameClass::Metadata).collect();
        assert_eq!(managed.len() as i32, depth + 1);
        assert!(managed.iter().all(|f| f.method.as_ref().unwrap().name().as_ref() == "rec"));
        // The innermost managed frame is at the observer call, the rest at the recursive call
        assert_eq!(managed[0].line, Some(2));
        assert!(managed[1..].iter().all(|f| f.line == Some(3)));
        // Indices count down to the base
        let indices: Vec<usize> = frames.iter().map(|f| f.index).collect();
        let expected: Vec<usize> = (0..frames.len()).rev().collect();
        assert_eq!(indices, expected);
    }
    assert_eq!(thread.frame_count(), 0);
}

#[test]
fn test_cursor_moves_both_ways() {
    let rt = Runtime::new(EngineConfig::default()).unwrap();
    let cursor_ok = Arc::new(Mutex::new(false));
    let ok = cursor_ok.clone();

    let mut a = Assembler::new();
    a.op_u16(Opcode::Invokestatic, 0).op(Opcode::Ireturn);
    let class = rt
        .define_class(
            ClassDef::new("Cursor")
                .constants(vec![PoolEntry::method("Cursor", "check", "()I")])
                .method(MethodDef::bytecode("run", "()I", STATIC, a.finish_code(0, 1).unwrap()))
                .method(MethodDef::native(
                    "check",
                    "()I",
                    STATIC,
                    native_fn(move |ctx, _| {
                        let thread = ctx.thread();
                        let mut walker = FrameWalker::begin(thread, false);
                        assert_eq!(walker.state(), WalkerState::Valid);
                        let top = walker.current().unwrap().index;

                        walker.advance();
                        assert_eq!(walker.state(), WalkerState::ValidWithMetadata);
                        walker.advance();
                        assert_eq!(walker.state(), WalkerState::Invalid);
                        walker.advance();
                        assert_eq!(walker.state(), WalkerState::Invalid);

                        // Retreating from past the base re-enters at the oldest frame
                        walker.retreat();
                        assert_eq!(walker.state(), WalkerState::ValidWithMetadata);
                        walker.retreat();
                        assert_eq!(walker.current().unwrap().index, top);
                        assert!(walker == FrameWalker::begin(thread, false));

                        let managed_only = FrameWalker::begin(thread, true);
                        assert_eq!(managed_only.state(), WalkerState::ValidWithMetadata);
                        assert_eq!(managed_only.count(), 1);
                        *ok.lock() = true;
                        Ok(Some(Value::Int(1)))
                    }),
                )),
        )
        .unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let run = class.declared_method("run", "()I").unwrap().clone();
    assert_eq!(rt.invoke(&thread, &run, &[]).unwrap(), Some(Value::Int(1)));
    assert!(*cursor_ok.lock());
}

#[test]
fn test_class_initializer_runs_under_opaque_frame() {
    let rt = Runtime::new(EngineConfig::default()).unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));

    let mut clinit = Assembler::new();
    clinit.op_u16(Opcode::Invokestatic, 0).op(Opcode::Pop).op(Opcode::Return);
    let mut get = Assembler::new();
    get.push_int(3).op(Opcode::Ireturn);
    let class = rt
        .define_class(
            ClassDef::new("Lazy")
                .constants(vec![PoolEntry::method("Lazy", "observer", "()I")])
                .method(MethodDef::bytecode("<clinit>", "()V", STATIC, clinit.finish_code(0, 1).unwrap()))
                .method(MethodDef::bytecode("get", "()I", STATIC, get.finish_code(0, 1).unwrap()))
                .method(observer(&seen)),
        )
        .unwrap();
    let thread = rt.attach_thread("main").unwrap();
    let get = class.declared_method("get", "()I").unwrap().clone();
    assert_eq!(rt.invoke(&thread, &get, &[]).unwrap(), Some(Value::Int(3)));

    let classes: Vec<FrameClass> = seen.lock().iter().map(|f| f.class).collect();
    assert_eq!(classes, vec![FrameClass::Known, FrameClass::Metadata, FrameClass::Opaque]);
    assert_eq!(seen.lock()[2].label, Some("class initializer"));
}
