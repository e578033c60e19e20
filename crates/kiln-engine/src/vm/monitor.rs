//! Object monitors
//!
//! Every object header carries a 64-bit lock word:
//!
//! ```text
//! unlocked   0
//! thin       0 | owner:31 | count:32     count = re-entries beyond the first
//! fat        1 | 0:31     | lock id:32
//! ```
//!
//! A thin lock is taken with a single compare-and-swap. It inflates to a fat
//! lock held in the `MonitorTable` when its owner re-enters past the
//! recursion limit, or when another thread contends for it. Inflation is a
//! compare-and-swap with retry, never a blocking wait. Fat locks are never
//! deflated.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::vm::object::HeapObject;
use crate::vm::thread::{ThreadId, VmThread};

const FAT_BIT: u64 = 1 << 63;
const OWNER_SHIFT: u32 = 32;
const LOW_MASK: u64 = 0xffff_ffff;

/// Monitor protocol violation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// Release by a thread that does not hold the monitor
    #[error("thread {thread} does not own the monitor")]
    NotOwner {
        /// Releasing thread
        thread: ThreadId,
    },

    /// Fat lock id in a lock word is not in the table
    #[error("unknown fat lock {0}")]
    UnknownLock(u32),

    /// Hold count does not fit in the lock
    #[error("monitor recursion overflow")]
    RecursionOverflow,
}

#[inline]
fn thin_word(owner: ThreadId, count: u64) -> u64 {
    (u64::from(owner.0) << OWNER_SHIFT) | count
}

#[inline]
fn thin_owner(word: u64) -> u32 {
    ((word & !FAT_BIT) >> OWNER_SHIFT) as u32
}

struct FatState {
    owner: Option<ThreadId>,
    count: u32,
}

/// Heavyweight monitor used after inflation
pub struct FatLock {
    state: Mutex<FatState>,
    cond: Condvar,
}

impl FatLock {
    fn owned(owner: ThreadId, count: u32) -> Self {
        Self {
            state: Mutex::new(FatState {
                owner: Some(owner),
                count,
            }),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, thread: &VmThread) -> Result<(), MonitorError> {
        let me = thread.id();
        {
            let mut state = self.state.lock();
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    state.count = state.count.checked_add(1).ok_or(MonitorError::RecursionOverflow)?;
                    return Ok(());
                }
                Some(_) => {}
            }
        }
        // Blocking: a rendezvous must not wait for us. The mutex is released
        // before the transition so a rendezvous join never happens under it.
        thread.enter_uncooperative();
        {
            let mut state = self.state.lock();
            while state.owner.is_some() {
                self.cond.wait(&mut state);
            }
            state.owner = Some(me);
            state.count = 1;
        }
        thread.leave_uncooperative();
        Ok(())
    }

    fn release(&self, thread: &VmThread) -> Result<(), MonitorError> {
        let mut state = self.state.lock();
        if state.owner != Some(thread.id()) {
            return Err(MonitorError::NotOwner { thread: thread.id() });
        }
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.cond.notify_one();
        }
        Ok(())
    }

    /// Current owner
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    /// Times the owner holds the lock
    pub fn hold_count(&self) -> u32 {
        self.state.lock().count
    }
}

/// Table of inflated monitors
pub struct MonitorTable {
    locks: DashMap<u32, Arc<FatLock>>,
    next_id: AtomicU32,
    max_recursion: u32,
}

impl MonitorTable {
    /// Create a table; a thin lock inflates once its owner re-enters more
    /// than `max_recursion` times
    pub fn new(max_recursion: u32) -> Self {
        let shards = (num_cpus::get() * 4).next_power_of_two().max(2);
        Self {
            locks: DashMap::with_shard_amount(shards),
            next_id: AtomicU32::new(1),
            max_recursion,
        }
    }

    fn fat(&self, word: u64) -> Result<Arc<FatLock>, MonitorError> {
        let id = (word & LOW_MASK) as u32;
        self.locks
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(MonitorError::UnknownLock(id))
    }

    fn register(&self, lock: FatLock) -> (u32, Arc<FatLock>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lock = Arc::new(lock);
        self.locks.insert(id, lock.clone());
        (id, lock)
    }

    /// Acquire the monitor of `obj` for `thread`
    pub fn enter(&self, obj: &HeapObject, thread: &VmThread) -> Result<(), MonitorError> {
        let word = obj.lock_word();
        let me = thread.id();
        loop {
            let current = match word.compare_exchange(0, thin_word(me, 0), Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(current) => current,
            };

            if current & FAT_BIT != 0 {
                return self.fat(current)?.acquire(thread);
            }

            if thin_owner(current) == me.0 {
                let count = current & LOW_MASK;
                if count < u64::from(self.max_recursion) {
                    // Only the owner writes an owned thin word
                    word.store(current + 1, Ordering::Relaxed);
                    return Ok(());
                }
                let hold = u32::try_from(count + 2).map_err(|_| MonitorError::RecursionOverflow)?;
                let (id, _) = self.register(FatLock::owned(me, hold));
                match word.compare_exchange(current, FAT_BIT | u64::from(id), Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => {
                        debug!(object = obj.class_name(), thread = %me, lock = id, hold, "monitor inflated on recursion");
                        return Ok(());
                    }
                    Err(_) => {
                        self.locks.remove(&id);
                        continue;
                    }
                }
            }

            return self.contend(obj, thread);
        }
    }

    fn contend(&self, obj: &HeapObject, thread: &VmThread) -> Result<(), MonitorError> {
        let word = obj.lock_word();
        let me = thread.id();
        thread.enter_uncooperative();
        let backoff = Backoff::new();
        let result = loop {
            let current = word.load(Ordering::Acquire);
            if current & FAT_BIT != 0 {
                break self.fat(current).and_then(|lock| lock.acquire(thread));
            }
            if current != 0 {
                backoff.snooze();
                continue;
            }
            let (id, _) = self.register(FatLock::owned(me, 1));
            match word.compare_exchange(0, FAT_BIT | u64::from(id), Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    debug!(object = obj.class_name(), thread = %me, lock = id, "monitor inflated on contention");
                    break Ok(());
                }
                Err(_) => {
                    // Lost the race: drop the candidate and look again
                    self.locks.remove(&id);
                }
            }
        };
        thread.leave_uncooperative();
        result
    }

    /// Release the monitor of `obj` held by `thread`
    pub fn exit(&self, obj: &HeapObject, thread: &VmThread) -> Result<(), MonitorError> {
        let word = obj.lock_word();
        let current = word.load(Ordering::Acquire);
        if current & FAT_BIT != 0 {
            return self.fat(current)?.release(thread);
        }
        if current == 0 || thin_owner(current) != thread.id().0 {
            return Err(MonitorError::NotOwner { thread: thread.id() });
        }
        let next = if current & LOW_MASK == 0 { 0 } else { current - 1 };
        word.store(next, Ordering::Release);
        Ok(())
    }

    /// Thread holding the monitor of `obj`
    pub fn owner(&self, obj: &HeapObject) -> Option<ThreadId> {
        let current = obj.lock_word().load(Ordering::Acquire);
        if current & FAT_BIT != 0 {
            self.fat(current).ok()?.owner()
        } else if current == 0 {
            None
        } else {
            Some(ThreadId(thin_owner(current)))
        }
    }

    /// Times the owner holds the monitor of `obj` (0 when unlocked)
    pub fn hold_count(&self, obj: &HeapObject) -> u32 {
        let current = obj.lock_word().load(Ordering::Acquire);
        if current & FAT_BIT != 0 {
            self.fat(current).map(|lock| lock.hold_count()).unwrap_or(0)
        } else if current == 0 {
            0
        } else {
            (current & LOW_MASK) as u32 + 1
        }
    }

    /// Whether the monitor of `obj` has been inflated
    pub fn is_inflated(&self, obj: &HeapObject) -> bool {
        obj.lock_word().load(Ordering::Acquire) & FAT_BIT != 0
    }

    /// Number of fat locks created so far
    pub fn fat_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bootstrap::define_core_classes;
    use crate::vm::class::{ClassRegistry, OBJECT_CLASS};
    use crate::vm::runtime::IsolateId;
    use crate::vm::safepoint::Rendezvous;
    use crate::vm::thread::current_sp;
    use std::sync::atomic::AtomicUsize;

    fn object() -> HeapObject {
        let registry = ClassRegistry::new();
        define_core_classes(&registry).unwrap();
        let class = registry.lookup(OBJECT_CLASS).unwrap();
        HeapObject::new_instance(class.vtable().clone(), &[])
    }

    fn thread(id: u32, rv: &Arc<Rendezvous>) -> VmThread {
        VmThread::new(ThreadId(id), format!("t{}", id), IsolateId(0), current_sp(), 0, rv.clone())
    }

    #[test]
    fn test_thin_enter_exit() {
        let rv = Arc::new(Rendezvous::new(None));
        let t = thread(3, &rv);
        let table = MonitorTable::new(8);
        let obj = object();

        table.enter(&obj, &t).unwrap();
        assert_eq!(table.owner(&obj), Some(ThreadId(3)));
        table.enter(&obj, &t).unwrap();
        assert_eq!(table.hold_count(&obj), 2);
        assert!(!table.is_inflated(&obj));
        table.exit(&obj, &t).unwrap();
        table.exit(&obj, &t).unwrap();
        assert_eq!(table.owner(&obj), None);
        assert_eq!(table.hold_count(&obj), 0);
    }

    #[test]
    fn test_recursion_overflow_inflates() {
        let rv = Arc::new(Rendezvous::new(None));
        let t = thread(1, &rv);
        let table = MonitorTable::new(2);
        let obj = object();

        for _ in 0..3 {
            table.enter(&obj, &t).unwrap();
        }
        assert!(!table.is_inflated(&obj));
        table.enter(&obj, &t).unwrap();
        assert!(table.is_inflated(&obj));
        assert_eq!(table.hold_count(&obj), 4);
        assert_eq!(table.fat_count(), 1);

        for _ in 0..4 {
            table.exit(&obj, &t).unwrap();
        }
        assert_eq!(table.owner(&obj), None);
        // Never deflated
        assert!(table.is_inflated(&obj));
    }

    #[test]
    fn test_exit_without_owning() {
        let rv = Arc::new(Rendezvous::new(None));
        let a = thread(1, &rv);
        let b = thread(2, &rv);
        let table = MonitorTable::new(8);
        let obj = object();

        assert_eq!(table.exit(&obj, &a), Err(MonitorError::NotOwner { thread: ThreadId(1) }));
        table.enter(&obj, &a).unwrap();
        assert_eq!(table.exit(&obj, &b), Err(MonitorError::NotOwner { thread: ThreadId(2) }));
        table.exit(&obj, &a).unwrap();
    }

    #[test]
    fn test_contention_is_mutually_exclusive() {
        let rv = Arc::new(Rendezvous::new(None));
        let threads: Vec<VmThread> = (1..=4).map(|i| thread(i, &rv)).collect();
        let table = MonitorTable::new(8);
        let obj = object();
        let counter = AtomicUsize::new(0);

        crossbeam::scope(|s| {
            for t in &threads {
                let (table, obj, counter) = (&table, &obj, &counter);
                s.spawn(move |_| {
                    for _ in 0..500 {
                        table.enter(obj, t).unwrap();
                        // Non-atomic increment: only correct under the monitor
                        let v = counter.load(Ordering::Relaxed);
                        std::hint::spin_loop();
                        counter.store(v + 1, Ordering::Relaxed);
                        table.exit(obj, t).unwrap();
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 2000);
        assert_eq!(table.owner(&obj), None);
        assert!(threads.iter().all(|t| !t.is_uncooperative()));
    }
}
