//! Safepoint rendezvous with threads running managed code

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_engine::jit::bytecode::{Assembler, Opcode};
use kiln_engine::vm::native::native_fn;
use kiln_engine::vm::{Class, ClassDef, Method, MethodDef, MethodFlags, PoolEntry, ThreadStatus};
use kiln_engine::{EngineConfig, Runtime, Value};

const STATIC: u16 = MethodFlags::PUBLIC | MethodFlags::STATIC;
const SPIN: &str = "(Ljava/lang/Object;)Ljava/lang/Object;";

// ============================================================================
// Helpers
// ============================================================================

fn wait_for(cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(10), "condition never became true");
        std::thread::yield_now();
    }
}

fn runtime() -> Arc<Runtime> {
    let config = EngineConfig {
        rendezvous_timeout_ms: Some(10_000),
        ..EngineConfig::default()
    };
    Arc::new(Runtime::new(config).unwrap())
}

/// `Spin.spin(obj)` loops until the static `stop` is set, then returns `obj`
fn define_spinner(rt: &Runtime) -> (Arc<Class>, Arc<Method>) {
    let mut a = Assembler::new();
    let top = a.label();
    a.bind(top)
        .op_u16(Opcode::Getstatic, 0)
        .branch(Opcode::Ifeq, top)
        .load(Opcode::Aload, 0)
        .op(Opcode::Areturn);
    let class = rt
        .define_class(
            ClassDef::new("Spin")
                .static_field("stop", "I")
                .constants(vec![PoolEntry::field("Spin", "stop", "I")])
                .method(MethodDef::bytecode("spin", SPIN, STATIC, a.finish_code(1, 1).unwrap())),
        )
        .unwrap();
    let spin = class.declared_method("spin", SPIN).unwrap().clone();
    (class, spin)
}

fn stop(class: &Arc<Class>) {
    let (owner, slot) = class.find_static("stop", "I").unwrap();
    assert!(owner.set_static_value(slot, Value::Int(1)));
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_rendezvous_stops_spinning_threads() {
    const THREADS: usize = 4;
    let rt = runtime();
    let (class, spin) = define_spinner(&rt);
    let started = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let spin = spin.clone();
            let started = started.clone();
            rt.spawn(&format!("spinner-{}", i), move |rt, thread| {
                let token = rt.intern(&format!("token-{}", i)).unwrap();
                started.fetch_add(1, Ordering::SeqCst);
                let result = rt.invoke(thread, &spin, &[Value::object(token.clone())]).unwrap();
                result.and_then(|v| v.as_object().cloned()).is_some_and(|r| Arc::ptr_eq(&r, &token))
            })
            .unwrap()
        })
        .collect();

    let main = rt.attach_thread("main").unwrap();
    wait_for(|| started.load(Ordering::SeqCst) == THREADS);

    for _ in 0..3 {
        let stopped = rt.rendezvous(Some(&*main)).unwrap();
        assert_eq!(stopped.statuses().len(), THREADS + 1);
        assert_eq!(
            stopped.statuses().iter().filter(|(_, s)| *s == ThreadStatus::Initiator).count(),
            1
        );
        let roots = stopped.collect_roots();
        for (id, status) in stopped.statuses() {
            match status {
                ThreadStatus::Initiator => assert_eq!(*id, main.id()),
                ThreadStatus::Safepoint => {
                    let thread = rt.threads().get(*id).unwrap();
                    assert!(thread.in_rendezvous() || thread.should_yield());
                    // A thread parked inside spin publishes its argument
                    let published = roots.iter().find(|(t, _)| t == id).map(|(_, r)| r.len()).unwrap_or(0);
                    assert!(published <= 1);
                }
                ThreadStatus::Uncooperative { sp } => assert_ne!(*sp, 0),
            }
        }
        stopped.finish();
    }

    stop(&class);
    for handle in handles {
        assert!(handle.join().unwrap().unwrap());
    }
    assert_eq!(rt.threads().len(), 1);
}

#[test]
fn test_uncooperative_native_does_not_block_rendezvous() {
    let rt = runtime();
    let release = Arc::new(AtomicUsize::new(0));
    let inside = Arc::new(AtomicUsize::new(0));

    let (gate, entered) = (release.clone(), inside.clone());
    let class = rt
        .define_class(ClassDef::new("Blocking").method(MethodDef::native(
            "block",
            "()I",
            STATIC,
            native_fn(move |_, _| {
                entered.store(1, Ordering::SeqCst);
                while gate.load(Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(Some(Value::Int(9)))
            }),
        )))
        .unwrap();
    let block = class.declared_method("block", "()I").unwrap().clone();

    let worker = rt
        .spawn("blocked", move |rt, thread| rt.invoke(thread, &block, &[]).ok().flatten())
        .unwrap();
    wait_for(|| inside.load(Ordering::SeqCst) == 1);

    let stopped = rt.rendezvous(None).unwrap();
    assert_eq!(stopped.statuses().len(), 1);
    assert!(matches!(stopped.statuses()[0].1, ThreadStatus::Uncooperative { .. }));

    // The native returns while the world is stopped and must wait for the end
    release.store(1, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    assert!(!worker.is_finished());
    stopped.finish();

    assert_eq!(worker.join().unwrap().unwrap(), Some(Value::Int(9)));
}

#[test]
fn test_reachable_objects_cover_parked_threads() {
    let rt = runtime();
    let (class, spin) = define_spinner(&rt);
    let held = rt.allocator().allocate(class.instance_size(), class.vtable()).unwrap();

    let arg = held.clone();
    let worker = rt
        .spawn("holder", move |rt, thread| rt.invoke(thread, &spin, &[Value::object(arg)]).is_ok())
        .unwrap();
    // Roots are published when the spinner parks at its loop safepoint
    wait_for(|| {
        rt.reachable_objects(None)
            .unwrap()
            .iter()
            .any(|o| Arc::ptr_eq(o, &held))
    });

    let interned = rt.intern("held").unwrap();
    assert!(rt.reachable_objects(None).unwrap().iter().any(|o| Arc::ptr_eq(o, &interned)));

    stop(&class);
    assert!(worker.join().unwrap().unwrap());
}
