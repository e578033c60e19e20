//! Runtime facade
//!
//! Owns every collaborator of the execution core: the class registry,
//! thread registry and rendezvous, the monitor table, the allocator, the
//! exception factory, the method compiler and the code cache. Managed code
//! is entered through [`Runtime::invoke`] on an attached thread.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::jit::backend::exec;
use crate::jit::code_cache::CodeCache;
use crate::jit::compiler::{CompiledMethod, MethodCompiler};
use crate::vm::class::{Class, ClassDef, ClassRegistry, InitPhase, OBJECT_CLASS, STRING_CLASS};
use crate::vm::exception::{ExecError, ExecResult};
use crate::vm::exceptions::{exception_message, ExceptionFactory, StandardExceptions};
use crate::vm::frames::{capture_stack_trace, FrameWalker, StackTraceElement};
use crate::vm::gc::trace_reachable;
use crate::vm::heap::{Allocator, HeapAllocator};
use crate::vm::method::{Method, MethodEntry};
use crate::vm::monitor::MonitorTable;
use crate::vm::native::NativeBridge;
use crate::vm::object::{HeapObject, ObjectRef};
use crate::vm::safepoint::{Rendezvous, RendezvousError, RendezvousGuard};
use crate::vm::thread::{current_sp, native_stack_bounds, ThreadRegistry, VmThread};
use crate::vm::value::Value;
use crate::vm::vtable::VirtualTable;
use crate::vm::{VmError, VmResult};

static NEXT_ISOLATE: AtomicU32 = AtomicU32::new(1);

/// Isolate identifier; one per runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(pub u32);

impl fmt::Display for IsolateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "isolate-{}", self.0)
    }
}

/// Managed exception that escaped an invocation
pub struct UncaughtException {
    /// Class of the exception
    pub class: String,
    /// Detail message
    pub message: Option<String>,
    /// Stack trace captured at the throw
    pub trace: Vec<StackTraceElement>,
    /// The exception object
    pub exception: ObjectRef,
}

impl UncaughtException {
    fn new(exception: ObjectRef) -> Self {
        Self {
            class: exception.class_name().to_string(),
            message: exception_message(&exception),
            trace: exception.stack_trace().map(|t| t.to_vec()).unwrap_or_default(),
            exception,
        }
    }
}

impl fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class.replace('/', "."))?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        for element in &self.trace {
            write!(f, "\n\tat {}", element)?;
        }
        Ok(())
    }
}

impl fmt::Debug for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UncaughtException")
            .field("class", &self.class)
            .field("message", &self.message)
            .field("frames", &self.trace.len())
            .finish()
    }
}

/// Why an invocation did not return a value
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// A managed exception reached the outermost frame
    #[error("uncaught exception {0}")]
    Uncaught(UncaughtException),

    /// The runtime failed
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Attached thread; detaches on drop
pub struct ThreadHandle<'r> {
    runtime: &'r Runtime,
    thread: Arc<VmThread>,
}

impl ThreadHandle<'_> {
    /// Shared handle to the thread state
    pub fn thread(&self) -> &Arc<VmThread> {
        &self.thread
    }
}

impl Deref for ThreadHandle<'_> {
    type Target = VmThread;

    fn deref(&self) -> &VmThread {
        &self.thread
    }
}

impl Drop for ThreadHandle<'_> {
    fn drop(&mut self) {
        self.runtime.threads.unregister(&self.thread);
        debug!(thread = %self.thread.id(), "detached");
    }
}

enum InitClaim {
    Ready,
    Claimed,
    Failed,
}

/// Execution core runtime
pub struct Runtime {
    config: EngineConfig,
    isolate: IsolateId,
    registry: Arc<ClassRegistry>,
    threads: ThreadRegistry,
    rendezvous: Arc<Rendezvous>,
    monitors: MonitorTable,
    allocator: Arc<dyn Allocator>,
    exceptions: StandardExceptions,
    compiler: MethodCompiler,
    code_cache: CodeCache,
    strings: DashMap<String, ObjectRef>,
    object_class: Arc<Class>,
    string_class: Arc<Class>,
}

impl Runtime {
    /// Build a runtime with the core classes defined
    pub fn new(config: EngineConfig) -> VmResult<Self> {
        config.validate()?;
        let registry = ClassRegistry::new();
        let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::new(config.max_heap_bytes));
        let exceptions = StandardExceptions::new(&registry, allocator.clone())?;
        let object_class = registry
            .lookup(OBJECT_CLASS)
            .ok_or_else(|| VmError::ClassNotFound(OBJECT_CLASS.to_string()))?;
        let string_class = registry
            .lookup(STRING_CLASS)
            .ok_or_else(|| VmError::ClassNotFound(STRING_CLASS.to_string()))?;
        let isolate = IsolateId(NEXT_ISOLATE.fetch_add(1, Ordering::Relaxed));
        info!(%isolate, mode = ?config.compile_mode, "runtime started");

        Ok(Self {
            isolate,
            rendezvous: Arc::new(Rendezvous::new(config.rendezvous_timeout_ms.map(Duration::from_millis))),
            monitors: MonitorTable::new(config.thin_lock_max_recursion),
            compiler: MethodCompiler::new(registry.clone(), config.clone()),
            code_cache: CodeCache::new(config.code_cache_max_methods),
            threads: ThreadRegistry::new(),
            strings: DashMap::new(),
            registry,
            allocator,
            exceptions,
            object_class,
            string_class,
            config,
        })
    }

    // ========================================================================
    // Classes
    // ========================================================================

    /// Link a class
    pub fn define_class(&self, def: ClassDef) -> VmResult<Arc<Class>> {
        Ok(self.registry.define(def)?)
    }

    /// Loaded class by internal name
    pub fn lookup_class(&self, name: &str) -> Option<Arc<Class>> {
        self.registry.lookup(name)
    }

    /// VirtualTable of a loaded class
    pub fn virtual_table(&self, class: &str) -> VmResult<Arc<VirtualTable>> {
        self.registry
            .lookup(class)
            .map(|c| c.vtable().clone())
            .ok_or_else(|| VmError::ClassNotFound(class.to_string()))
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Attach the calling OS thread
    pub fn attach_thread(&self, name: &str) -> VmResult<ThreadHandle<'_>> {
        let guard = self.config.stack_guard_size;
        let (base_sp, stack_limit) = match native_stack_bounds() {
            Some((low, high)) => (high, low.saturating_add(guard)),
            None => {
                let sp = current_sp();
                (sp, sp.saturating_sub(self.config.thread_stack_size.saturating_sub(guard)))
            }
        };
        if stack_limit >= current_sp() {
            return Err(VmError::Internal(format!("thread {} has no room above the stack guard", name)));
        }

        let thread = Arc::new(VmThread::new(
            self.threads.next_id(),
            name.to_string(),
            self.isolate,
            base_sp,
            stack_limit,
            self.rendezvous.clone(),
        ));
        self.threads.register(thread.clone());
        debug!(thread = %thread.id(), name, "attached");
        Ok(ThreadHandle { runtime: self, thread })
    }

    /// Run `f` on a new OS thread attached to this runtime. The thread gets
    /// the configured native stack size.
    pub fn spawn<T, F>(self: &Arc<Self>, name: &str, f: F) -> std::io::Result<JoinHandle<VmResult<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&Runtime, &VmThread) -> T + Send + 'static,
    {
        let runtime = self.clone();
        let thread_name = name.to_string();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .stack_size(self.config.thread_stack_size)
            .spawn(move || {
                let handle = runtime.attach_thread(&thread_name)?;
                Ok(f(&runtime, &handle))
            })
    }

    /// Walk the frames of `thread`, innermost first
    pub fn walk_stack<'t>(&self, thread: &'t VmThread) -> FrameWalker<'t> {
        FrameWalker::begin(thread, false)
    }

    /// Stop every attached thread at a safe state
    pub fn rendezvous<'r>(&'r self, initiator: Option<&'r VmThread>) -> Result<RendezvousGuard<'r>, RendezvousError> {
        self.rendezvous.synchronize(&self.threads, initiator)
    }

    /// Objects reachable from thread roots, static fields and interned
    /// strings, computed while the world is stopped
    pub fn reachable_objects(&self, initiator: Option<&VmThread>) -> VmResult<Vec<ObjectRef>> {
        let stopped = self.rendezvous(initiator)?;
        let mut roots: Vec<ObjectRef> = stopped.collect_roots().into_iter().flat_map(|(_, r)| r).collect();
        for class in self.registry.classes() {
            for field in class.static_fields() {
                if let Some(Value::Ref(Some(obj))) = class.static_value(field.slot) {
                    roots.push(obj);
                }
            }
        }
        roots.extend(self.strings.iter().map(|entry| entry.value().clone()));
        let reachable = trace_reachable(roots);
        stopped.finish();
        Ok(reachable)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Call `method` from outside managed code
    ///
    /// Static methods initialize their class first. An exception that no
    /// handler catches is returned as `InvokeError::Uncaught`.
    pub fn invoke(&self, thread: &VmThread, method: &Arc<Method>, args: &[Value]) -> Result<Option<Value>, InvokeError> {
        if !Arc::ptr_eq(thread.rendezvous(), &self.rendezvous) {
            return Err(VmError::NotAttached(thread.id().0).into());
        }
        let result = match method.owner().filter(|_| method.is_static()) {
            Some(owner) => self
                .ensure_initialized(thread, &owner)
                .and_then(|()| self.call_method(thread, method, args)),
            None => self.call_method(thread, method, args),
        };
        match result {
            Ok(value) => Ok(value),
            Err(ExecError::Throw(exception)) => {
                let uncaught = UncaughtException::new(exception);
                if self.config.trace_uncaught {
                    warn!(thread = %thread.id(), "{}", uncaught);
                }
                Err(InvokeError::Uncaught(uncaught))
            }
            Err(ExecError::Fatal(err)) => Err(InvokeError::Vm(err)),
        }
    }

    /// Look up and invoke a static method
    pub fn call_static(
        &self,
        thread: &VmThread,
        class: &str,
        name: &str,
        descriptor: &str,
        args: &[Value],
    ) -> Result<Option<Value>, InvokeError> {
        let owner = self
            .registry
            .lookup(class)
            .ok_or_else(|| VmError::ClassNotFound(class.to_string()))?;
        let method = owner
            .find_method(name, descriptor)
            .filter(|m| m.is_static())
            .ok_or_else(|| VmError::MethodNotFound(format!("{}.{}{}", class, name, descriptor)))?;
        self.invoke(thread, &method, args)
    }

    /// Compile `method` and publish the code through its entry cell
    ///
    /// The code cache is consulted first; when two threads race, the code
    /// that reaches the entry cell first is the one every caller runs.
    pub fn compile(&self, method: &Arc<Method>) -> VmResult<Arc<CompiledMethod>> {
        let current = method.entry().load();
        if let MethodEntry::Compiled(code) = &*current {
            return Ok(code.clone());
        }

        let code = match self.code_cache.get(method.id()) {
            Some(code) => code,
            None => {
                let compiled = Arc::new(self.compiler.compile(method)?);
                self.code_cache.insert(method.id(), compiled.clone()).unwrap_or(compiled)
            }
        };

        let winner = method.entry().replace(&current, Arc::new(MethodEntry::Compiled(code.clone())));
        match &*winner {
            MethodEntry::Compiled(published) => Ok(published.clone()),
            _ => Ok(code),
        }
    }

    /// Record `exception` as pending on `thread`; the native bridge raises it
    /// when the native returns
    ///
    /// The exception lands in the buffer the bridge installed for the
    /// innermost native frame, so a native must be running on `thread` in
    /// this isolate.
    pub fn raise_from_native(&self, thread: &VmThread, exception: ObjectRef) -> VmResult<()> {
        let not_in_native = || VmError::NotInNative(thread.id().0);
        let frame = thread.last_known_frame().ok_or_else(not_in_native)?;
        let buffer = thread
            .exception_chain()
            .nearest(frame)
            .filter(|buffer| buffer.frame_index == frame && buffer.isolate == self.isolate)
            .ok_or_else(not_in_native)?;
        trace!(
            thread = %thread.id(),
            class = %exception.class_name(),
            native = ?buffer.handler.as_ref().map(|m| m.to_string()),
            "exception raised from native"
        );
        thread.set_pending_exception(exception);
        Ok(())
    }

    /// Interned string object for `value`
    pub fn intern(&self, value: &str) -> VmResult<ObjectRef> {
        if let Some(existing) = self.strings.get(value) {
            return Ok(existing.value().clone());
        }
        let string = self.allocator.allocate_string(self.string_class.vtable(), value)?;
        Ok(self.strings.entry(value.to_string()).or_insert(string).value().clone())
    }

    pub(crate) fn call_method(&self, thread: &VmThread, method: &Arc<Method>, args: &[Value]) -> ExecResult<Option<Value>> {
        let entry = method.entry().load();
        match &*entry {
            MethodEntry::Compiled(code) => exec::execute(self, thread, method, code, args),
            MethodEntry::Native(native) => NativeBridge::call(self, thread, method, native, args),
            MethodEntry::Stub => {
                thread.enter_uncooperative();
                let compiled = self.compile(method);
                thread.leave_uncooperative();
                let compiled = compiled?;
                exec::execute(self, thread, method, &compiled, args)
            }
            MethodEntry::Abstract => Err(VmError::AbstractMethod(method.to_string()).into()),
        }
    }

    /// Run static initialization of `class` (superclass first) unless it is
    /// done or in progress on this thread
    pub(crate) fn ensure_initialized(&self, thread: &VmThread, class: &Arc<Class>) -> ExecResult<()> {
        let state = class.init_state();
        // Waiting for another initializer must not hold up a rendezvous
        thread.enter_uncooperative();
        let claim = {
            let mut phase = state.lock();
            loop {
                match *phase {
                    InitPhase::Initialized => break InitClaim::Ready,
                    InitPhase::Running(owner) if owner == thread.id() => break InitClaim::Ready,
                    InitPhase::Running(_) => state.wait(&mut phase),
                    InitPhase::Failed => break InitClaim::Failed,
                    InitPhase::Uninitialized => {
                        *phase = InitPhase::Running(thread.id());
                        break InitClaim::Claimed;
                    }
                }
            }
        };
        thread.leave_uncooperative();

        match claim {
            InitClaim::Ready => return Ok(()),
            InitClaim::Failed => {
                let exception = self.exceptions.no_class_def_found(class.name())?;
                return Err(self.throw(thread, exception));
            }
            InitClaim::Claimed => {}
        }

        let result = self.run_initializer(thread, class);
        match &result {
            Ok(()) => {
                state.finish(InitPhase::Initialized);
                info!(class = %class.name(), "initialized");
            }
            Err(err) => {
                state.finish(InitPhase::Failed);
                warn!(class = %class.name(), "initialization failed: {:?}", err);
            }
        }
        result
    }

    fn run_initializer(&self, thread: &VmThread, class: &Arc<Class>) -> ExecResult<()> {
        if let Some(superclass) = class.superclass() {
            self.ensure_initialized(thread, superclass)?;
        }
        if let Some(clinit) = class.declared_method("<clinit>", "()V") {
            let _frame = thread.push_opaque("class initializer");
            self.call_method(thread, clinit, &[])?;
        }
        Ok(())
    }

    /// Lock object for the static synchronized methods of `class`
    pub(crate) fn class_lock(&self, class: &Arc<Class>) -> VmResult<ObjectRef> {
        let vtable = self.object_class.vtable().clone();
        Ok(class.monitor_object(|| Arc::new(HeapObject::new_instance(vtable, &[]))))
    }

    fn throw(&self, thread: &VmThread, exception: ObjectRef) -> ExecError {
        if exception.stack_trace().is_none() {
            exception.set_stack_trace(capture_stack_trace(thread).into());
        }
        ExecError::Throw(exception)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Isolate of this runtime
    pub fn isolate(&self) -> IsolateId {
        self.isolate
    }

    /// Class registry
    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    /// Attached threads
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Monitor table
    pub fn monitors(&self) -> &MonitorTable {
        &self.monitors
    }

    /// Object allocator
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Exception factory
    pub fn exceptions(&self) -> &StandardExceptions {
        &self.exceptions
    }

    /// Method compiler
    pub fn compiler(&self) -> &MethodCompiler {
        &self.compiler
    }

    /// Compiled code cache
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("isolate", &self.isolate)
            .field("classes", &self.registry.len())
            .field("threads", &self.threads.len())
            .finish()
    }
}
