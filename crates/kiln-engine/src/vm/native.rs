//! NativeBridge
//!
//! Calls from managed code into host functions. The bridge brackets every
//! call:
//!
//! 1. a known frame is pushed so the FrameWalker can classify the stretch
//! 2. reference arguments are pinned as roots for the duration of the call
//! 3. the thread enters uncooperative mode, so a rendezvous proceeds without
//!    waiting for it
//!
//! and undoes each step on the way out, in reverse, on every exit path.
//! Natives receive their runtime, thread and method explicitly through a
//! `NativeCallContext`; nothing is looked up from thread-local state.

use std::fmt;
use std::sync::Arc;

use crate::vm::exception::{ExceptionBuffer, ExecError, ExecResult};
use crate::vm::frames::capture_stack_trace;
use crate::vm::method::Method;
use crate::vm::object::ObjectRef;
use crate::vm::pool::ConstantPool;
use crate::vm::runtime::Runtime;
use crate::vm::thread::VmThread;
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};

/// Host implementation of a native method. `None` means void, or null for
/// reference-returning methods.
pub type NativeFn = Arc<dyn Fn(&NativeCallContext<'_>, &[Value]) -> ExecResult<Option<Value>> + Send + Sync>;

/// Wrap a closure as a `NativeFn`
pub fn native_fn<F>(f: F) -> NativeFn
where
    F: Fn(&NativeCallContext<'_>, &[Value]) -> ExecResult<Option<Value>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Receiver of an instance native
pub fn receiver(args: &[Value]) -> VmResult<&ObjectRef> {
    match args.first() {
        Some(Value::Ref(Some(obj))) => Ok(obj),
        Some(Value::Ref(None)) => Err(VmError::TypeMismatch("null receiver".to_string())),
        _ => Err(VmError::TypeMismatch("native method called without a receiver".to_string())),
    }
}

/// Everything a native may use, passed explicitly
pub struct NativeCallContext<'a> {
    runtime: &'a Runtime,
    thread: &'a VmThread,
    method: &'a Arc<Method>,
}

impl<'a> NativeCallContext<'a> {
    /// Runtime the call runs in
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    /// Calling thread
    pub fn thread(&self) -> &'a VmThread {
        self.thread
    }

    /// Native method being run
    pub fn method(&self) -> &'a Arc<Method> {
        self.method
    }

    /// Constant pool of the method's class
    pub fn pool(&self) -> Option<Arc<dyn ConstantPool>> {
        self.method.owner().map(|class| class.pool().clone())
    }

    /// Raise `exception` in the caller once the native returns
    pub fn raise(&self, exception: ObjectRef) -> VmResult<()> {
        self.runtime.raise_from_native(self.thread, exception)
    }

    /// String object for `value`
    pub fn intern(&self, value: &str) -> VmResult<ObjectRef> {
        self.runtime.intern(value)
    }

    /// Call back into managed code. The thread is cooperative for the
    /// duration of the callee.
    pub fn call(&self, method: &Arc<Method>, args: &[Value]) -> ExecResult<Option<Value>> {
        let _cooperative = CooperativeRegion::enter(self.thread);
        self.runtime.call_method(self.thread, method, args)
    }
}

impl fmt::Debug for NativeCallContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCallContext")
            .field("thread", &self.thread.id())
            .field("method", &self.method.to_string())
            .finish()
    }
}

/// Leaves uncooperative mode on drop
struct UncooperativeRegion<'a> {
    thread: &'a VmThread,
}

impl<'a> UncooperativeRegion<'a> {
    fn enter(thread: &'a VmThread) -> Self {
        thread.enter_uncooperative();
        Self { thread }
    }
}

impl Drop for UncooperativeRegion<'_> {
    fn drop(&mut self) {
        self.thread.leave_uncooperative();
    }
}

/// Temporarily cooperative stretch inside an uncooperative region
struct CooperativeRegion<'a> {
    thread: &'a VmThread,
}

impl<'a> CooperativeRegion<'a> {
    fn enter(thread: &'a VmThread) -> Self {
        thread.leave_uncooperative();
        Self { thread }
    }
}

impl Drop for CooperativeRegion<'_> {
    fn drop(&mut self) {
        self.thread.enter_uncooperative();
    }
}

/// Managed-to-native transition
pub struct NativeBridge;

impl NativeBridge {
    /// Run `native`, the implementation of `method`, on `thread`
    ///
    /// An exception raised through the context (or returned as
    /// `ExecError::Throw`) propagates to the caller; a returned throw wins
    /// over a pending one.
    pub fn call(
        rt: &Runtime,
        thread: &VmThread,
        method: &Arc<Method>,
        native: &NativeFn,
        args: &[Value],
    ) -> ExecResult<Option<Value>> {
        let frame = thread.push_known(Some(method.clone()));
        let _roots = thread.pin_roots(args.iter().filter_map(|v| v.as_object().cloned()));
        let _buffer = ExceptionBuffer::push(thread.exception_chain(), Some(method.clone()), rt.isolate(), frame.index());

        let ctx = NativeCallContext {
            runtime: rt,
            thread,
            method,
        };
        let result = {
            let _region = UncooperativeRegion::enter(thread);
            native(&ctx, args)
        };

        let pending = thread.take_pending_exception();
        let value = match (result, pending) {
            (Err(err), _) => return Err(err),
            (Ok(_), Some(exception)) => {
                if exception.stack_trace().is_none() {
                    exception.set_stack_trace(capture_stack_trace(thread).into());
                }
                return Err(ExecError::Throw(exception));
            }
            (Ok(value), None) => value,
        };
        Ok(match method.descriptor().ret_type() {
            Some(ty) => Some(value.unwrap_or_else(|| Value::zero(ty))),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::vm::class::ClassDef;
    use crate::vm::exceptions::ExceptionKind;
    use crate::vm::frames::{FrameClass, FrameWalker};
    use crate::vm::method::{MethodDef, MethodFlags};
    use crate::vm::runtime::InvokeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_null_sentinel_becomes_null_reference() {
        let rt = runtime();
        let class = rt
            .define_class(ClassDef::new("N").method(MethodDef::native(
                "make",
                "()Ljava/lang/Object;",
                MethodFlags::STATIC,
                native_fn(|_, _| Ok(None)),
            )))
            .unwrap();
        let thread = rt.attach_thread("native").unwrap();
        let method = class.declared_method("make", "()Ljava/lang/Object;").unwrap().clone();
        let result = rt.invoke(&thread, &method, &[]).unwrap();
        assert_eq!(result, Some(Value::null()));
    }

    #[test]
    fn test_bracketing_during_call() {
        let rt = runtime();
        let seen = Arc::new(AtomicUsize::new(0));
        let observer = seen.clone();
        let class = rt
            .define_class(ClassDef::new("N").method(MethodDef::native(
                "observer",
                "(Ljava/lang/Object;)I",
                MethodFlags::STATIC,
                native_fn(move |ctx, args| {
                    let thread = ctx.thread();
                    assert!(thread.is_uncooperative());
                    assert_ne!(thread.last_sp(), 0);
                    let arg = args[0].as_object().unwrap();
                    assert!(thread.roots().iter().any(|r| Arc::ptr_eq(r, arg)));
                    let top = FrameWalker::begin(thread, false).current().unwrap();
                    assert_eq!(top.class, FrameClass::Known);
                    observer.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(Value::Int(thread.exception_chain().depth() as i32)))
                }),
            )))
            .unwrap();
        let thread = rt.attach_thread("native").unwrap();
        let method = class.declared_method("observer", "(Ljava/lang/Object;)I").unwrap().clone();
        let arg = rt.intern("arg").unwrap();
        let result = rt.invoke(&thread, &method, &[Value::object(arg)]).unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(result, Some(Value::Int(1)));
        assert!(!thread.is_uncooperative());
        assert!(thread.roots().is_empty());
        assert_eq!(thread.exception_chain().depth(), 0);
        assert_eq!(thread.frame_count(), 0);
    }

    #[test]
    fn test_pending_exception_is_raised() {
        let rt = runtime();
        let class = rt
            .define_class(ClassDef::new("N").method(MethodDef::native(
                "fail",
                "()V",
                MethodFlags::STATIC,
                native_fn(|ctx, _| {
                    let exception = ctx
                        .runtime()
                        .exceptions()
                        .create(ExceptionKind::IllegalMonitorState, Some("from native"))?;
                    ctx.raise(exception)?;
                    Ok(None)
                }),
            )))
            .unwrap();
        let thread = rt.attach_thread("native").unwrap();
        let method = class.declared_method("fail", "()V").unwrap().clone();
        match rt.invoke(&thread, &method, &[]) {
            Err(InvokeError::Uncaught(uncaught)) => {
                assert_eq!(&*uncaught.class, ExceptionKind::IllegalMonitorState.class_name());
                assert_eq!(uncaught.message.as_deref(), Some("from native"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!thread.has_pending_exception());
    }

    #[test]
    fn test_native_calls_back_into_managed_code() {
        let rt = runtime();
        let class = rt
            .define_class(
                ClassDef::new("N")
                    .method(MethodDef::native(
                        "twice",
                        "(I)I",
                        MethodFlags::STATIC,
                        native_fn(|ctx, args| {
                            let owner = ctx.method().owner().unwrap();
                            let inc = owner.declared_method("inc", "(I)I").unwrap().clone();
                            let once = ctx.call(&inc, args)?.unwrap();
                            assert!(ctx.thread().is_uncooperative());
                            ctx.call(&inc, &[once])
                        }),
                    ))
                    .method(MethodDef::native(
                        "inc",
                        "(I)I",
                        MethodFlags::STATIC,
                        native_fn(|_, args| Ok(Some(Value::Int(args[0].as_int().unwrap_or(0) + 1)))),
                    )),
            )
            .unwrap();
        let thread = rt.attach_thread("native").unwrap();
        let method = class.declared_method("twice", "(I)I").unwrap().clone();
        assert_eq!(rt.invoke(&thread, &method, &[Value::Int(5)]).unwrap(), Some(Value::Int(7)));
    }

    #[test]
    fn test_raise_requires_running_native() {
        let rt = runtime();
        let thread = rt.attach_thread("main").unwrap();
        let exception = rt.exceptions().create(ExceptionKind::IllegalMonitorState, None).unwrap();
        assert!(matches!(
            rt.raise_from_native(&thread, exception),
            Err(VmError::NotInNative(id)) if id == thread.id().0
        ));
        assert!(!thread.has_pending_exception());
    }

    #[test]
    fn test_outer_native_raises_after_inner_throw() {
        let rt = runtime();
        let outer_frame = Arc::new(AtomicUsize::new(usize::MAX));
        let seen = outer_frame.clone();
        let class = rt
            .define_class(
                ClassDef::new("N")
                    .method(MethodDef::native(
                        "outer",
                        "()V",
                        MethodFlags::STATIC,
                        native_fn(move |ctx, _| {
                            let frame = ctx.thread().last_known_frame().unwrap();
                            seen.store(frame, Ordering::SeqCst);
                            let owner = ctx.method().owner().unwrap();
                            let inner = owner.declared_method("inner", "()V").unwrap().clone();
                            assert!(matches!(ctx.call(&inner, &[]), Err(ExecError::Throw(_))));
                            // The inner frame is unlinked; raising lands in this one
                            assert_eq!(ctx.thread().last_known_frame(), Some(frame));
                            let exception = ctx.runtime().exceptions().create(ExceptionKind::Arithmetic, Some("outer"))?;
                            ctx.raise(exception)?;
                            Ok(None)
                        }),
                    ))
                    .method(MethodDef::native(
                        "inner",
                        "()V",
                        MethodFlags::STATIC,
                        native_fn(|ctx, _| {
                            let thread = ctx.thread();
                            let frame = thread.last_known_frame().unwrap();
                            let buffer = thread.exception_chain().nearest(frame).unwrap();
                            assert_eq!(buffer.frame_index, frame);
                            assert_eq!(buffer.handler.as_ref().map(|m| m.name().to_string()).as_deref(), Some("inner"));
                            let exception = ctx.runtime().exceptions().create(ExceptionKind::IllegalMonitorState, None)?;
                            ctx.raise(exception)?;
                            Ok(None)
                        }),
                    )),
            )
            .unwrap();
        let thread = rt.attach_thread("native").unwrap();
        let outer = class.declared_method("outer", "()V").unwrap().clone();
        match rt.invoke(&thread, &outer, &[]) {
            Err(InvokeError::Uncaught(uncaught)) => {
                assert_eq!(&*uncaught.class, ExceptionKind::Arithmetic.class_name());
                assert_eq!(uncaught.message.as_deref(), Some("outer"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_ne!(outer_frame.load(Ordering::SeqCst), usize::MAX);
        assert_eq!(thread.last_known_frame(), None);
        assert_eq!(thread.frame_count(), 0);
    }

    #[test]
    fn test_receiver() {
        assert!(receiver(&[]).is_err());
        assert!(receiver(&[Value::null()]).is_err());
        assert!(receiver(&[Value::Int(1)]).is_err());
    }
}
