//! Safepoint rendezvous
//!
//! A coordinator brings every registered mutator to a pausable state before
//! doing privileged work (root scanning, patching, inspection):
//!
//! 1. The coordinator freezes thread membership and raises every thread's
//!    yield flag (Idle -> Requested -> Rendezvousing).
//! 2. Cooperative threads notice the flag at the next compiler-inserted
//!    safepoint, account for themselves and block.
//! 3. Threads inside an uncooperative region are not waited for. Their saved
//!    stack pointer is recorded instead; if they leave the region while the
//!    rendezvous is running they block on the way out.
//! 4. Once every thread is accounted for exactly once the coordinator owns
//!    the world (Complete) until its `RendezvousGuard` drops, which releases
//!    everyone (Idle).
//!
//! A coordinator that gives up (timeout) releases already-blocked threads
//! before returning.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::vm::object::ObjectRef;
use crate::vm::thread::{ThreadId, ThreadRegistry, VmThread};

/// Rendezvous phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousPhase {
    /// No rendezvous in progress
    Idle,
    /// Yield flags are being raised
    Requested,
    /// Waiting for threads to account for themselves
    Rendezvousing,
    /// Every thread is accounted for; the coordinator is working
    Complete,
}

/// How a thread was accounted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// The coordinating thread itself
    Initiator,
    /// Parked at a safepoint
    Safepoint,
    /// Running uncooperative code; `sp` is the stack pointer saved at entry
    Uncooperative {
        /// Saved stack pointer
        sp: usize,
    },
}

/// Rendezvous failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RendezvousError {
    /// Not every thread reached a safepoint in time
    #[error("rendezvous timed out with {joined} of {expected} threads accounted for")]
    Timeout {
        /// Threads accounted for
        joined: usize,
        /// Threads registered
        expected: usize,
    },
}

/// Statistics tracking for rendezvous operations
#[derive(Debug, Default)]
pub struct RendezvousStats {
    /// Completed rendezvous
    total_rendezvous: AtomicUsize,
    /// Cancelled rendezvous
    total_timeouts: AtomicUsize,
    /// Total time the world was stopped (microseconds)
    total_pause_time_us: AtomicUsize,
    /// Longest pause (microseconds)
    max_pause_time_us: AtomicUsize,
}

impl RendezvousStats {
    /// Completed rendezvous
    pub fn total_rendezvous(&self) -> usize {
        self.total_rendezvous.load(Ordering::Relaxed)
    }

    /// Cancelled rendezvous
    pub fn total_timeouts(&self) -> usize {
        self.total_timeouts.load(Ordering::Relaxed)
    }

    /// Total pause time in microseconds
    pub fn total_pause_time_us(&self) -> usize {
        self.total_pause_time_us.load(Ordering::Relaxed)
    }

    /// Longest pause in microseconds
    pub fn max_pause_time_us(&self) -> usize {
        self.max_pause_time_us.load(Ordering::Relaxed)
    }

    fn record_pause(&self, elapsed: usize) {
        self.total_rendezvous.fetch_add(1, Ordering::Relaxed);
        self.total_pause_time_us.fetch_add(elapsed, Ordering::Relaxed);

        let mut max = self.max_pause_time_us.load(Ordering::Relaxed);
        while elapsed > max {
            match self.max_pause_time_us.compare_exchange_weak(
                max,
                elapsed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }
}

struct RvState {
    phase: RendezvousPhase,
    generation: u64,
    expected: usize,
    joined: usize,
    statuses: Vec<(ThreadId, ThreadStatus)>,
}

/// Coordinates stop-the-world pauses across mutator threads
pub struct Rendezvous {
    state: Mutex<RvState>,
    /// Signalled when a thread accounts for itself
    cond_initiator: Condvar,
    /// Signalled when the rendezvous ends
    cond_end: Condvar,
    timeout: Option<Duration>,
    stats: RendezvousStats,
}

impl Rendezvous {
    /// Create an idle rendezvous. `timeout` bounds how long a coordinator
    /// waits for stragglers (`None` waits forever).
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(RvState {
                phase: RendezvousPhase::Idle,
                generation: 0,
                expected: 0,
                joined: 0,
                statuses: Vec::new(),
            }),
            cond_initiator: Condvar::new(),
            cond_end: Condvar::new(),
            timeout,
            stats: RendezvousStats::default(),
        }
    }

    /// Current phase
    pub fn phase(&self) -> RendezvousPhase {
        self.state.lock().phase
    }

    /// Number of rendezvous started so far
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Pause statistics
    pub fn stats(&self) -> &RendezvousStats {
        &self.stats
    }

    /// Bring every thread in `registry` to a safe state. `initiator` is the
    /// coordinating thread when it is itself a registered mutator.
    pub fn synchronize<'r>(
        &'r self,
        registry: &'r ThreadRegistry,
        initiator: Option<&'r VmThread>,
    ) -> Result<RendezvousGuard<'r>, RendezvousError> {
        let start = Instant::now();
        // A concurrent coordinator must be able to skip us while we wait for
        // the membership lock
        if let Some(thread) = initiator {
            thread.enter_uncooperative();
        }
        let membership = registry.lock_membership();
        let threads = registry.snapshot();

        let mut state = self.state.lock();
        state.generation += 1;
        state.phase = RendezvousPhase::Requested;
        state.expected = threads.len();
        state.joined = 0;
        state.statuses.clear();

        for thread in &threads {
            if initiator.is_some_and(|i| i.id() == thread.id()) {
                thread.joined_rv.store(true, Ordering::SeqCst);
                state.joined += 1;
                state.statuses.push((thread.id(), ThreadStatus::Initiator));
            } else {
                thread.set_yield(true);
            }
        }
        // Flags are raised before the uncooperative scan: a thread entering a
        // region concurrently either shows up here or sees its flag and joins
        let mut uncooperative = 0usize;
        for thread in &threads {
            if thread.is_uncooperative() && !thread.joined_rv.swap(true, Ordering::SeqCst) {
                state.joined += 1;
                state.statuses.push((thread.id(), ThreadStatus::Uncooperative { sp: thread.last_sp() }));
                uncooperative += 1;
            }
        }
        state.phase = RendezvousPhase::Rendezvousing;
        debug!(
            generation = state.generation,
            threads = threads.len(),
            uncooperative,
            "rendezvous started"
        );

        let deadline = self.timeout.map(|t| start + t);
        while state.joined < state.expected {
            match deadline {
                Some(deadline) => {
                    if self.cond_initiator.wait_until(&mut state, deadline).timed_out()
                        && state.joined < state.expected
                    {
                        let err = RendezvousError::Timeout {
                            joined: state.joined,
                            expected: state.expected,
                        };
                        warn!(generation = state.generation, %err, "rendezvous cancelled");
                        self.release(&mut state, &threads);
                        self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                        drop(state);
                        drop(membership);
                        if let Some(thread) = initiator {
                            thread.leave_uncooperative();
                        }
                        return Err(err);
                    }
                }
                None => self.cond_initiator.wait(&mut state),
            }
        }
        state.phase = RendezvousPhase::Complete;
        let statuses = state.statuses.clone();
        let generation = state.generation;
        drop(state);

        Ok(RendezvousGuard {
            rendezvous: self,
            threads,
            statuses,
            generation,
            initiator,
            membership: Some(membership),
            start,
        })
    }

    /// Clear every flag and wake blocked threads
    fn release(&self, state: &mut MutexGuard<'_, RvState>, threads: &[Arc<VmThread>]) {
        for thread in threads {
            thread.set_yield(false);
            thread.joined_rv.store(false, Ordering::SeqCst);
        }
        state.phase = RendezvousPhase::Idle;
        self.cond_end.notify_all();
    }

    fn finish(&self, threads: &[Arc<VmThread>], start: Instant) {
        let mut state = self.state.lock();
        self.release(&mut state, threads);
        let elapsed = start.elapsed().as_micros() as usize;
        self.stats.record_pause(elapsed);
        debug!(generation = state.generation, pause_us = elapsed, "rendezvous finished");
    }

    /// Count `thread` once for the running rendezvous
    fn account(&self, state: &mut RvState, thread: &VmThread, status: ThreadStatus) {
        if !thread.joined_rv.swap(true, Ordering::SeqCst) {
            state.joined += 1;
            state.statuses.push((thread.id(), status));
            if state.joined >= state.expected {
                self.cond_initiator.notify_one();
            }
        }
    }

    fn park(&self, mut state: MutexGuard<'_, RvState>, thread: &VmThread) {
        let generation = state.generation;
        thread.set_in_rendezvous(true);
        while state.generation == generation && state.phase != RendezvousPhase::Idle {
            self.cond_end.wait(&mut state);
        }
        thread.set_in_rendezvous(false);
    }

    /// Called from a safepoint whose yield flag is set: account for the
    /// thread and block until the rendezvous ends
    #[cold]
    #[inline(never)]
    pub fn join(&self, thread: &VmThread) {
        let mut state = self.state.lock();
        if !thread.should_yield() {
            return;
        }
        self.account(&mut state, thread, ThreadStatus::Safepoint);
        self.park(state, thread);
    }

    /// A thread entering uncooperative code while asked to yield: account for
    /// it with its saved stack pointer and let it continue
    #[cold]
    pub fn join_before_uncooperative(&self, thread: &VmThread) {
        let mut state = self.state.lock();
        if thread.should_yield() {
            let sp = thread.last_sp();
            self.account(&mut state, thread, ThreadStatus::Uncooperative { sp });
        }
    }

    /// A thread leaving uncooperative code while asked to yield: it may not
    /// run managed code until the rendezvous ends
    #[cold]
    pub fn join_after_uncooperative(&self, thread: &VmThread) {
        let mut state = self.state.lock();
        if !thread.should_yield() {
            return;
        }
        let sp = thread.last_sp();
        self.account(&mut state, thread, ThreadStatus::Uncooperative { sp });
        self.park(state, thread);
    }

    /// Bracket uncooperative work on `thread`
    pub fn enter_uncooperative(&self, thread: &VmThread) {
        thread.enter_uncooperative();
    }

    /// End a bracket opened with `enter_uncooperative`
    pub fn leave_uncooperative(&self, thread: &VmThread) {
        thread.leave_uncooperative();
    }
}

impl fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rendezvous")
            .field("phase", &self.phase())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Held by the coordinator while the world is stopped; dropping it releases
/// every thread
pub struct RendezvousGuard<'r> {
    rendezvous: &'r Rendezvous,
    threads: Vec<Arc<VmThread>>,
    statuses: Vec<(ThreadId, ThreadStatus)>,
    generation: u64,
    initiator: Option<&'r VmThread>,
    membership: Option<RwLockWriteGuard<'r, ()>>,
    start: Instant,
}

impl RendezvousGuard<'_> {
    /// How each thread was accounted for
    pub fn statuses(&self) -> &[(ThreadId, ThreadStatus)] {
        &self.statuses
    }

    /// Threads taking part
    pub fn threads(&self) -> &[Arc<VmThread>] {
        &self.threads
    }

    /// Rendezvous generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Roots published by every stopped thread
    pub fn collect_roots(&self) -> Vec<(ThreadId, Vec<ObjectRef>)> {
        self.threads.iter().map(|t| (t.id(), t.roots())).collect()
    }

    /// End the rendezvous
    pub fn finish(self) {}
}

impl Drop for RendezvousGuard<'_> {
    fn drop(&mut self) {
        self.rendezvous.finish(&self.threads, self.start);
        self.membership.take();
        if let Some(thread) = self.initiator {
            thread.leave_uncooperative();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::runtime::IsolateId;
    use crate::vm::thread::current_sp;
    use std::sync::atomic::AtomicBool;

    fn spawn_threads(rv: &Arc<Rendezvous>, registry: &ThreadRegistry, n: usize) -> Vec<Arc<VmThread>> {
        (0..n)
            .map(|_| {
                let id = registry.next_id();
                let thread = Arc::new(VmThread::new(id, format!("m{}", id.0), IsolateId(0), current_sp(), 0, rv.clone()));
                registry.register(thread.clone());
                thread
            })
            .collect()
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(10), "condition never became true");
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_empty_registry() {
        let rv = Rendezvous::new(None);
        let registry = ThreadRegistry::new();
        let guard = rv.synchronize(&registry, None).unwrap();
        assert!(guard.statuses().is_empty());
        assert_eq!(rv.phase(), RendezvousPhase::Complete);
        guard.finish();
        assert_eq!(rv.phase(), RendezvousPhase::Idle);
        assert_eq!(rv.stats().total_rendezvous(), 1);
    }

    #[test]
    fn test_initiator_counts_itself() {
        let rv = Arc::new(Rendezvous::new(None));
        let registry = ThreadRegistry::new();
        let threads = spawn_threads(&rv, &registry, 1);
        let guard = rv.synchronize(&registry, Some(&threads[0])).unwrap();
        assert_eq!(guard.statuses(), &[(threads[0].id(), ThreadStatus::Initiator)]);
        assert!(threads[0].is_uncooperative());
        drop(guard);
        assert!(!threads[0].is_uncooperative());
        assert!(!threads[0].should_yield());
    }

    #[test]
    fn test_accounts_for_every_thread() {
        let rv = Arc::new(Rendezvous::new(None));
        let registry = ThreadRegistry::new();
        let threads = spawn_threads(&rv, &registry, 5);
        let stop = AtomicBool::new(false);
        let release = AtomicBool::new(false);

        crossbeam::scope(|s| {
            for t in &threads[..3] {
                let stop = &stop;
                s.spawn(move |_| {
                    while !stop.load(Ordering::Acquire) {
                        t.safepoint();
                        std::hint::spin_loop();
                    }
                });
            }
            for t in &threads[3..] {
                let release = &release;
                s.spawn(move |_| {
                    t.enter_uncooperative();
                    while !release.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    t.leave_uncooperative();
                });
            }
            wait_for(|| threads[3..].iter().all(|t| t.is_uncooperative()));

            let guard = rv.synchronize(&registry, None).unwrap();
            let statuses = guard.statuses();
            assert_eq!(statuses.len(), 5);
            let mut ids: Vec<_> = statuses.iter().map(|(id, _)| *id).collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 5);
            let uncooperative = statuses
                .iter()
                .filter(|(_, s)| matches!(s, ThreadStatus::Uncooperative { sp } if *sp != 0))
                .count();
            assert_eq!(uncooperative, 2);
            wait_for(|| threads[..3].iter().all(|t| t.in_rendezvous()));
            drop(guard);

            stop.store(true, Ordering::Release);
            release.store(true, Ordering::Release);
        })
        .unwrap();
        assert!(threads.iter().all(|t| !t.should_yield() && !t.in_rendezvous()));
    }

    #[test]
    fn test_leaving_uncooperative_blocks_until_finish() {
        let rv = Arc::new(Rendezvous::new(None));
        let registry = ThreadRegistry::new();
        let threads = spawn_threads(&rv, &registry, 1);
        let worker = &threads[0];
        let leave = AtomicBool::new(false);
        let left = AtomicBool::new(false);

        crossbeam::scope(|s| {
            worker.enter_uncooperative();
            s.spawn(|_| {
                while !leave.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                worker.leave_uncooperative();
                left.store(true, Ordering::Release);
            });

            let guard = rv.synchronize(&registry, None).unwrap();
            leave.store(true, Ordering::Release);
            wait_for(|| worker.in_rendezvous());
            assert!(!left.load(Ordering::Acquire));
            drop(guard);
            wait_for(|| left.load(Ordering::Acquire));
        })
        .unwrap();
    }

    #[test]
    fn test_entering_uncooperative_after_yield_request() {
        let rv = Arc::new(Rendezvous::new(Some(Duration::from_secs(10))));
        let registry = ThreadRegistry::new();
        let threads = spawn_threads(&rv, &registry, 1);
        let worker = &threads[0];
        let entered = AtomicBool::new(false);
        let release = AtomicBool::new(false);

        crossbeam::scope(|s| {
            s.spawn(|_| {
                // Never polls: the only way to be counted is entering the region
                while !worker.should_yield() {
                    std::thread::yield_now();
                }
                worker.enter_uncooperative();
                entered.store(true, Ordering::Release);
                while !release.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                worker.leave_uncooperative();
            });

            let guard = rv.synchronize(&registry, None).unwrap();
            let statuses = guard.statuses();
            assert_eq!(statuses.len(), 1);
            assert_eq!(statuses[0].0, worker.id());
            assert!(matches!(statuses[0].1, ThreadStatus::Uncooperative { sp } if sp != 0));
            // Accounted without parking
            wait_for(|| entered.load(Ordering::Acquire));
            assert!(!worker.in_rendezvous());
            drop(guard);
            release.store(true, Ordering::Release);
        })
        .unwrap();
        assert!(!worker.is_uncooperative());
        assert!(!worker.should_yield());
    }

    #[test]
    fn test_timeout_releases_blocked_threads() {
        let rv = Arc::new(Rendezvous::new(Some(Duration::from_millis(50))));
        let registry = ThreadRegistry::new();
        let threads = spawn_threads(&rv, &registry, 2);
        let stop = AtomicBool::new(false);

        crossbeam::scope(|s| {
            let polling = &threads[0];
            let stop = &stop;
            s.spawn(move |_| {
                while !stop.load(Ordering::Acquire) {
                    polling.safepoint();
                    std::hint::spin_loop();
                }
            });
            // threads[1] never polls
            let err = rv.synchronize(&registry, None).err().unwrap();
            assert!(matches!(err, RendezvousError::Timeout { expected: 2, .. }));
            assert_eq!(rv.phase(), RendezvousPhase::Idle);
            assert!(!threads[1].should_yield());
            stop.store(true, Ordering::Release);
        })
        .unwrap();
        assert_eq!(rv.stats().total_timeouts(), 1);
        assert!(!threads[0].in_rendezvous());
    }
}
