//! Polymorphic inline caches
//!
//! Every interface call site (and every virtual call site whose offset could
//! not be fixed at compile time) owns an `Enveloppe`: the pool reference it
//! resolves plus a chain of `CacheNode`s ordered most recently used first.
//!
//! The head node is read without taking the lock. Nodes are only ever
//! appended or relinked under the lock and are owned by their Enveloppe
//! until it is dropped, so a racing reader always sees either the old or the
//! new head, fully built.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::vm::class::ClassId;
use crate::vm::method::Method;
use crate::vm::pool::MemberRef;
use crate::vm::vtable::VirtualTable;

/// One (receiver class, target) pair of a call-site cache
pub struct CacheNode {
    /// Written once, before the node becomes reachable from the head
    entry: OnceCell<(Arc<VirtualTable>, Arc<Method>)>,
    next: AtomicPtr<CacheNode>,
}

impl CacheNode {
    fn empty() -> Box<Self> {
        Box::new(Self {
            entry: OnceCell::new(),
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Receiver class recorded in this node
    pub fn class(&self) -> Option<ClassId> {
        self.entry.get().map(|(vt, _)| vt.class_id())
    }

    /// Cached call target
    pub fn method(&self) -> Option<&Arc<Method>> {
        self.entry.get().map(|(_, m)| m)
    }

    #[inline]
    fn matches(&self, vtable: &Arc<VirtualTable>) -> Option<&Arc<Method>> {
        match self.entry.get() {
            Some((vt, method)) if Arc::ptr_eq(vt, vtable) => Some(method),
            _ => None,
        }
    }
}

/// Call-site cache for dynamically resolved calls
pub struct Enveloppe {
    member: MemberRef,
    pool_index: u16,
    head: AtomicPtr<CacheNode>,
    /// Owns every node; the lock serializes chain mutation
    nodes: Mutex<Vec<Box<CacheNode>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Enveloppe {
    /// Create the cache for the call site resolving `member` at `pool_index`.
    /// The first node is allocated empty.
    pub fn new(member: MemberRef, pool_index: u16) -> Self {
        let first = CacheNode::empty();
        let head = &*first as *const CacheNode as *mut CacheNode;
        Self {
            member,
            pool_index,
            head: AtomicPtr::new(head),
            nodes: Mutex::new(vec![first]),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Method reference this site resolves
    pub fn member(&self) -> &MemberRef {
        &self.member
    }

    /// Constant pool index of the reference
    pub fn pool_index(&self) -> u16 {
        self.pool_index
    }

    #[inline]
    fn head_node(&self) -> &CacheNode {
        // SAFETY: `head` always points into a box owned by `self.nodes`, and
        // boxes are only dropped with `self`.
        unsafe { &*self.head.load(Ordering::Acquire) }
    }

    /// Call target for a receiver whose table is `vtable`. A hit on the head
    /// takes no lock. On a miss `resolve` runs against the receiver's table
    /// and its answer is cached; `None` means the receiver class has no such
    /// method and nothing is cached.
    #[inline]
    pub fn lookup<F>(&self, vtable: &Arc<VirtualTable>, resolve: F) -> Option<Arc<Method>>
    where
        F: FnOnce(&VirtualTable) -> Option<Arc<Method>>,
    {
        if let Some(method) = self.head_node().matches(vtable) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(method.clone());
        }
        self.lookup_slow(vtable, resolve)
    }

    #[cold]
    fn lookup_slow<F>(&self, vtable: &Arc<VirtualTable>, resolve: F) -> Option<Arc<Method>>
    where
        F: FnOnce(&VirtualTable) -> Option<Arc<Method>>,
    {
        let mut nodes = self.nodes.lock();
        let head = self.head.load(Ordering::Relaxed);

        let mut prev: *mut CacheNode = ptr::null_mut();
        let mut cursor = head;
        while !cursor.is_null() {
            // SAFETY: every pointer in the chain comes from a box in `nodes`
            let node = unsafe { &*cursor };
            if let Some(method) = node.matches(vtable) {
                let method = method.clone();
                if !prev.is_null() {
                    // SAFETY: as above; relinking happens under the lock
                    let prev_node = unsafe { &*prev };
                    prev_node.next.store(node.next.load(Ordering::Relaxed), Ordering::Relaxed);
                    node.next.store(head, Ordering::Relaxed);
                    self.head.store(cursor, Ordering::Release);
                    trace!(site = %self.member, class = vtable.class_name(), "inline cache promotion");
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(method);
            }
            prev = cursor;
            cursor = node.next.load(Ordering::Relaxed);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let method = resolve(vtable)?;

        // SAFETY: `head` is owned by `nodes`
        let head_node = unsafe { &*head };
        if head_node.entry.get().is_none() {
            // Only the initial node is ever empty, and it is still the head
            let _ = head_node.entry.set((vtable.clone(), method.clone()));
        } else {
            let node = Box::new(CacheNode {
                entry: OnceCell::with_value((vtable.clone(), method.clone())),
                next: AtomicPtr::new(head),
            });
            let ptr = &*node as *const CacheNode as *mut CacheNode;
            nodes.push(node);
            self.head.store(ptr, Ordering::Release);
        }
        debug!(
            site = %self.member,
            class = vtable.class_name(),
            target = %method,
            entries = nodes.iter().filter(|n| n.entry.get().is_some()).count(),
            "inline cache miss"
        );
        Some(method)
    }

    /// Number of filled nodes
    pub fn len(&self) -> usize {
        self.nodes.lock().iter().filter(|n| n.entry.get().is_some()).count()
    }

    /// Whether no receiver has been cached yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver class at the head of the chain
    pub fn head_class(&self) -> Option<ClassId> {
        self.head_node().class()
    }

    /// Cached receiver classes, most recently used first
    pub fn classes(&self) -> Vec<ClassId> {
        let _nodes = self.nodes.lock();
        let mut out = Vec::new();
        let mut cursor = self.head.load(Ordering::Relaxed);
        while !cursor.is_null() {
            // SAFETY: chain pointers are owned by `nodes`, which we hold
            let node = unsafe { &*cursor };
            out.extend(node.class());
            cursor = node.next.load(Ordering::Relaxed);
        }
        out
    }

    /// Lookups answered from the cache
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that had to resolve
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Enveloppe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enveloppe")
            .field("member", &self.member)
            .field("pool_index", &self.pool_index)
            .field("classes", &self.classes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bootstrap::define_core_classes;
    use crate::vm::class::{Class, ClassDef, ClassRegistry};
    use crate::vm::method::{Code, MethodDef, MethodFlags};

    fn classes() -> (Arc<ClassRegistry>, Vec<Arc<Class>>) {
        let registry = ClassRegistry::new();
        define_core_classes(&registry).unwrap();
        registry
            .define(ClassDef::interface("Shape").method(MethodDef::abstract_method("area", "()I", MethodFlags::PUBLIC)))
            .unwrap();
        let body = || Code::new(vec![0x03, 0xac], 1, 1);
        let impls = ["Square", "Circle", "Triangle"]
            .iter()
            .map(|name| {
                registry
                    .define(
                        ClassDef::new(name)
                            .implements("Shape")
                            .method(MethodDef::bytecode("area", "()I", MethodFlags::PUBLIC, body())),
                    )
                    .unwrap()
            })
            .collect();
        (registry, impls)
    }

    fn resolve(vt: &VirtualTable) -> Option<Arc<Method>> {
        vt.class()?.find_virtual("area", "()I")
    }

    fn site() -> Enveloppe {
        Enveloppe::new(MemberRef::new("Shape", "area", "()I"), 4)
    }

    #[test]
    fn test_a_b_a_leaves_two_nodes_a_first() {
        let (_registry, impls) = classes();
        let (a, b) = (&impls[0], &impls[1]);
        let cache = site();
        assert!(cache.is_empty());
        assert_eq!(cache.head_class(), None);

        let m = cache.lookup(a.vtable(), resolve).unwrap();
        assert_eq!(&**m.class_name(), "Square");
        cache.lookup(b.vtable(), resolve).unwrap();
        assert_eq!(cache.head_class(), Some(b.id()));
        let m = cache.lookup(a.vtable(), |_| panic!("must not resolve a cached class")).unwrap();
        assert_eq!(&**m.class_name(), "Square");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.head_class(), Some(a.id()));
        assert_eq!(cache.classes(), vec![a.id(), b.id()]);
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn test_head_hit_is_lock_free() {
        let (_registry, impls) = classes();
        let cache = site();
        cache.lookup(impls[0].vtable(), resolve).unwrap();
        let _held = cache.nodes.lock();
        // Would deadlock if the head hit took the lock
        assert!(cache.lookup(impls[0].vtable(), |_| None).is_some());
    }

    #[test]
    fn test_unresolvable_receiver_is_not_cached() {
        let (registry, _impls) = classes();
        let cache = site();
        let object = registry.lookup(crate::vm::class::OBJECT_CLASS).unwrap();
        assert!(cache.lookup(object.vtable(), resolve).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_concurrent_sites_keep_one_node_per_class() {
        let (_registry, impls) = classes();
        let cache = site();
        let resolutions = AtomicUsize::new(0);

        crossbeam::scope(|s| {
            for t in 0..4 {
                let (cache, impls, resolutions) = (&cache, &impls, &resolutions);
                s.spawn(move |_| {
                    for i in 0..300 {
                        let class = &impls[(i + t) % impls.len()];
                        let m = cache
                            .lookup(class.vtable(), |vt| {
                                resolutions.fetch_add(1, Ordering::Relaxed);
                                resolve(vt)
                            })
                            .unwrap();
                        assert_eq!(m.class_name(), class.name());
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(cache.len(), 3);
        let mut seen = cache.classes();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 3);
        assert_eq!(resolutions.load(Ordering::Relaxed), 3);
    }
}
