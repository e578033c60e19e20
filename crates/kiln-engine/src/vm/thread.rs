//! Mutator threads
//!
//! A `VmThread` is the per-thread record the rest of the core works with:
//! its native stack bounds, the rendezvous flags, the shadow frame stack the
//! FrameWalker reads, its ExceptionChain, its pending exception and its
//! published GC roots. Threads are passed explicitly; nothing here relies on
//! thread-local storage.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::vm::exception::ExceptionChain;
use crate::vm::gc::RootSet;
use crate::vm::method::Method;
use crate::vm::object::ObjectRef;
use crate::vm::runtime::IsolateId;
use crate::vm::safepoint::Rendezvous;

/// Thread identifier; fits in the 31 owner bits of a lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Approximate native stack pointer of the caller
#[inline(never)]
pub fn current_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Native stack of the calling thread as `(low, high)` addresses
#[cfg(target_os = "linux")]
pub fn native_stack_bounds() -> Option<(usize, usize)> {
    // SAFETY: `attr` is initialized by pthread_getattr_np before use and
    // destroyed exactly once.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        Some((addr as usize, addr as usize + size))
    }
}

/// Native stack of the calling thread as `(low, high)` addresses
#[cfg(not(target_os = "linux"))]
pub fn native_stack_bounds() -> Option<(usize, usize)> {
    None
}

/// One entry of the shadow frame stack
#[derive(Debug, Clone)]
pub enum FrameRecord {
    /// Compiled managed code; carries a stack map
    Managed {
        /// Running method
        method: Arc<Method>,
        /// Bytecode offset of the current call or safepoint
        pc: u32,
        /// Native stack pointer at entry
        sp: usize,
    },
    /// Native code entered through the bridge
    Known {
        /// Native method, if the frame belongs to one
        method: Option<Arc<Method>>,
        /// Index of the previous known frame
        previous: Option<usize>,
        /// Native stack pointer at entry
        sp: usize,
    },
    /// Runtime code with no metadata
    Opaque {
        /// What the runtime was doing
        label: &'static str,
        /// Native stack pointer at entry
        sp: usize,
    },
}

impl FrameRecord {
    /// Native stack pointer recorded at entry
    pub fn sp(&self) -> usize {
        match self {
            FrameRecord::Managed { sp, .. } | FrameRecord::Known { sp, .. } | FrameRecord::Opaque { sp, .. } => *sp,
        }
    }
}

#[derive(Default)]
struct FrameStack {
    records: Vec<FrameRecord>,
    last_known: Option<usize>,
}

/// Per-thread execution record
pub struct VmThread {
    id: ThreadId,
    name: String,
    isolate: IsolateId,
    base_sp: usize,
    stack_limit: usize,

    yield_flag: CachePadded<AtomicBool>,
    in_rv: AtomicBool,
    pub(crate) joined_rv: AtomicBool,
    uncooperative: AtomicU32,
    last_sp: AtomicUsize,

    frames: Mutex<FrameStack>,
    exceptions: ExceptionChain,
    pending: Mutex<Option<ObjectRef>>,
    roots: Mutex<RootSet>,
    rendezvous: Arc<Rendezvous>,
}

impl VmThread {
    pub(crate) fn new(
        id: ThreadId,
        name: String,
        isolate: IsolateId,
        base_sp: usize,
        stack_limit: usize,
        rendezvous: Arc<Rendezvous>,
    ) -> Self {
        Self {
            id,
            name,
            isolate,
            base_sp,
            stack_limit,
            yield_flag: CachePadded::new(AtomicBool::new(false)),
            in_rv: AtomicBool::new(false),
            joined_rv: AtomicBool::new(false),
            uncooperative: AtomicU32::new(0),
            last_sp: AtomicUsize::new(0),
            frames: Mutex::new(FrameStack::default()),
            exceptions: ExceptionChain::new(),
            pending: Mutex::new(None),
            roots: Mutex::new(RootSet::new()),
            rendezvous,
        }
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Isolate the thread runs in
    pub fn isolate(&self) -> IsolateId {
        self.isolate
    }

    /// Stack origin (highest address)
    pub fn base_sp(&self) -> usize {
        self.base_sp
    }

    /// Lowest stack address managed code may reach before overflow
    pub fn stack_limit(&self) -> usize {
        self.stack_limit
    }

    /// Whether the native stack has reached the guard region
    #[inline]
    pub fn stack_exhausted(&self) -> bool {
        current_sp() < self.stack_limit
    }

    // ========================================================================
    // Rendezvous flags
    // ========================================================================

    /// Whether a rendezvous asked this thread to yield
    #[inline]
    pub fn should_yield(&self) -> bool {
        self.yield_flag.load(Ordering::SeqCst)
    }

    pub(crate) fn set_yield(&self, value: bool) {
        self.yield_flag.store(value, Ordering::SeqCst);
    }

    /// Whether the thread is blocked in a rendezvous
    pub fn in_rendezvous(&self) -> bool {
        self.in_rv.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_rendezvous(&self, value: bool) {
        self.in_rv.store(value, Ordering::Release);
    }

    /// Whether the thread runs uncooperative code
    #[inline]
    pub fn is_uncooperative(&self) -> bool {
        self.uncooperative.load(Ordering::SeqCst) > 0
    }

    /// Stack pointer saved when entering uncooperative code (0 when cooperative)
    pub fn last_sp(&self) -> usize {
        self.last_sp.load(Ordering::Acquire)
    }

    /// Poll point inserted by the compiler. Blocks while a rendezvous is in
    /// progress.
    #[inline]
    pub fn safepoint(&self) {
        if self.should_yield() {
            self.rendezvous.join(self);
        }
    }

    /// Enter a region where the thread cannot be asked to stop. Nests.
    pub fn enter_uncooperative(&self) {
        // Only the owning thread changes the counter; the saved sp must be
        // visible before the counter is.
        if self.uncooperative.load(Ordering::Relaxed) == 0 {
            self.last_sp.store(current_sp(), Ordering::Release);
        }
        if self.uncooperative.fetch_add(1, Ordering::SeqCst) == 0 && self.should_yield() {
            self.rendezvous.join_before_uncooperative(self);
        }
    }

    /// Leave an uncooperative region; blocks if a rendezvous is running
    pub fn leave_uncooperative(&self) {
        if self.uncooperative.fetch_sub(1, Ordering::SeqCst) == 1 {
            if self.should_yield() {
                self.rendezvous.join_after_uncooperative(self);
            }
            self.last_sp.store(0, Ordering::Release);
        }
    }

    // ========================================================================
    // Shadow frame stack
    // ========================================================================

    /// Push a managed frame; popped when the guard drops
    pub fn push_managed(&self, method: Arc<Method>) -> FrameGuard<'_> {
        let mut frames = self.frames.lock();
        let index = frames.records.len();
        frames.records.push(FrameRecord::Managed {
            method,
            pc: 0,
            sp: current_sp(),
        });
        FrameGuard { thread: self, index }
    }

    /// Push a known (bridge) frame linked to the previous known frame
    pub fn push_known(&self, method: Option<Arc<Method>>) -> FrameGuard<'_> {
        let mut frames = self.frames.lock();
        let index = frames.records.len();
        let previous = frames.last_known;
        frames.records.push(FrameRecord::Known {
            method,
            previous,
            sp: current_sp(),
        });
        frames.last_known = Some(index);
        FrameGuard { thread: self, index }
    }

    /// Push a frame for runtime code with no metadata
    pub fn push_opaque(&self, label: &'static str) -> FrameGuard<'_> {
        let mut frames = self.frames.lock();
        let index = frames.records.len();
        frames.records.push(FrameRecord::Opaque { label, sp: current_sp() });
        FrameGuard { thread: self, index }
    }

    fn pop_frames(&self, index: usize) {
        let mut frames = self.frames.lock();
        // Unlink popped known frames while their records are still there
        while let Some(known) = frames.last_known {
            if known < index {
                break;
            }
            frames.last_known = match frames.records.get(known) {
                Some(FrameRecord::Known { previous, .. }) => *previous,
                _ => None,
            };
        }
        frames.records.truncate(index);
    }

    /// Record the bytecode offset of the innermost managed frame
    pub fn set_pc(&self, pc: u32) {
        let mut frames = self.frames.lock();
        if let Some(FrameRecord::Managed { pc: slot, .. }) = frames.records.last_mut() {
            *slot = pc;
        }
    }

    /// Number of frames on the shadow stack
    pub fn frame_count(&self) -> usize {
        self.frames.lock().records.len()
    }

    /// Frame at `index` (0 is the oldest)
    pub fn frame_at(&self, index: usize) -> Option<FrameRecord> {
        self.frames.lock().records.get(index).cloned()
    }

    /// Index of the innermost known frame
    pub fn last_known_frame(&self) -> Option<usize> {
        self.frames.lock().last_known
    }

    // ========================================================================
    // Exceptions
    // ========================================================================

    /// The thread's ExceptionChain
    pub fn exception_chain(&self) -> &ExceptionChain {
        &self.exceptions
    }

    /// Record an exception to raise when native code returns
    pub fn set_pending_exception(&self, exception: ObjectRef) {
        *self.pending.lock() = Some(exception);
    }

    /// Take the pending exception
    pub fn take_pending_exception(&self) -> Option<ObjectRef> {
        self.pending.lock().take()
    }

    /// Whether an exception is pending
    pub fn has_pending_exception(&self) -> bool {
        self.pending.lock().is_some()
    }

    // ========================================================================
    // Roots
    // ========================================================================

    /// Replace the published stack roots
    pub fn publish_roots(&self, roots: Vec<ObjectRef>) {
        self.roots.lock().publish_stack(roots);
    }

    /// Pin references (bridge arguments, saved stack roots) until the guard drops
    pub fn pin_roots(&self, roots: impl IntoIterator<Item = ObjectRef>) -> RootPin<'_> {
        let mark = self.roots.lock().pin(roots);
        RootPin { thread: self, mark }
    }

    /// Snapshot of every root the thread currently publishes
    pub fn roots(&self) -> Vec<ObjectRef> {
        self.roots.lock().iter().cloned().collect()
    }

    /// Published stack roots only
    pub fn stack_roots(&self) -> Vec<ObjectRef> {
        self.roots.lock().stack_roots().to_vec()
    }

    pub(crate) fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }
}

impl fmt::Debug for VmThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("frames", &self.frame_count())
            .finish()
    }
}

/// Pops a shadow frame (and anything above it) on drop
pub struct FrameGuard<'a> {
    thread: &'a VmThread,
    index: usize,
}

impl FrameGuard<'_> {
    /// Position of the frame on the shadow stack
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.thread.pop_frames(self.index);
    }
}

/// Unpins roots on drop
pub struct RootPin<'a> {
    thread: &'a VmThread,
    mark: usize,
}

impl Drop for RootPin<'_> {
    fn drop(&mut self) {
        self.thread.roots.lock().unpin_to(self.mark);
    }
}

/// Live threads, keyed by id
///
/// Membership changes take the read side of `membership`; a rendezvous
/// coordinator holds the write side so the set it enumerates stays fixed.
pub struct ThreadRegistry {
    threads: DashMap<ThreadId, Arc<VmThread>>,
    membership: RwLock<()>,
    next_id: AtomicU32,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            threads: DashMap::new(),
            membership: RwLock::new(()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate a thread id. Never 0, which an unlocked lock word uses.
    pub fn next_id(&self) -> ThreadId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff;
            if id != 0 {
                return ThreadId(id);
            }
        }
    }

    /// Add a thread
    pub fn register(&self, thread: Arc<VmThread>) {
        let _membership = self.membership.read();
        self.threads.insert(thread.id(), thread);
    }

    /// Remove a thread. The caller stays uncooperative while waiting so a
    /// running rendezvous does not wait for it.
    pub fn unregister(&self, thread: &VmThread) {
        thread.enter_uncooperative();
        let _membership = self.membership.read();
        self.threads.remove(&thread.id());
    }

    /// Thread by id
    pub fn get(&self, id: ThreadId) -> Option<Arc<VmThread>> {
        self.threads.get(&id).map(|entry| entry.value().clone())
    }

    /// Registered threads, ordered by id
    pub fn snapshot(&self) -> Vec<Arc<VmThread>> {
        let mut threads: Vec<_> = self.threads.iter().map(|entry| entry.value().clone()).collect();
        threads.sort_by_key(|t| t.id());
        threads
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether no thread is registered
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub(crate) fn lock_membership(&self) -> RwLockWriteGuard<'_, ()> {
        self.membership.write()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::LoaderId;
    use crate::vm::descriptor::MethodDescriptor;
    use crate::vm::method::{Code, MethodDef, MethodFlags};
    use std::sync::Weak;

    fn thread() -> VmThread {
        let base = current_sp();
        VmThread::new(ThreadId(1), "t".to_string(), IsolateId(0), base, 0, Arc::new(Rendezvous::new(None)))
    }

    fn method() -> Arc<Method> {
        let def = MethodDef::bytecode("run", "()V", MethodFlags::STATIC, Code::new(vec![0xb1], 0, 0));
        Arc::new(Method::new(
            def,
            MethodDescriptor::parse("()V").unwrap(),
            Weak::new(),
            Arc::from("T"),
            LoaderId(0),
            None,
        ))
    }

    #[test]
    fn test_frame_guards_nest() {
        let t = thread();
        {
            let _a = t.push_managed(method());
            t.set_pc(7);
            let _b = t.push_known(None);
            let c = t.push_known(None);
            assert_eq!(t.frame_count(), 3);
            assert_eq!(t.last_known_frame(), Some(c.index()));
            drop(c);
            assert_eq!(t.last_known_frame(), Some(1));
            assert!(matches!(t.frame_at(0), Some(FrameRecord::Managed { pc: 7, .. })));
        }
        assert_eq!(t.frame_count(), 0);
        assert_eq!(t.last_known_frame(), None);
    }

    #[test]
    fn test_uncooperative_nesting() {
        let t = thread();
        assert!(!t.is_uncooperative());
        t.enter_uncooperative();
        let sp = t.last_sp();
        assert!(sp != 0);
        t.enter_uncooperative();
        assert_eq!(t.last_sp(), sp);
        t.leave_uncooperative();
        assert!(t.is_uncooperative());
        t.leave_uncooperative();
        assert!(!t.is_uncooperative());
        assert_eq!(t.last_sp(), 0);
    }

    #[test]
    fn test_pending_exception_slot() {
        let t = thread();
        assert!(!t.has_pending_exception());
        assert!(t.take_pending_exception().is_none());
    }

    #[test]
    fn test_registry_ids_and_snapshot() {
        let registry = ThreadRegistry::new();
        let rv = Arc::new(Rendezvous::new(None));
        for _ in 0..3 {
            let id = registry.next_id();
            registry.register(Arc::new(VmThread::new(id, format!("w{}", id.0), IsolateId(0), 0, 0, rv.clone())));
        }
        let ids: Vec<u32> = registry.snapshot().iter().map(|t| t.id().0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let second = registry.get(ThreadId(2)).unwrap();
        registry.unregister(&second);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_stack_pointer_is_inside_bounds() {
        if let Some((low, high)) = native_stack_bounds() {
            let sp = current_sp();
            assert!(low < sp && sp < high);
        }
    }
}
