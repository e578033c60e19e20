//! GC root tracking
//!
//! The core does not implement a collector. It only guarantees that every
//! reference a parked or uncooperative thread still needs is visible through
//! its `RootSet`, and `trace_reachable` walks the object graph through each
//! VirtualTable's tracing slot.

use rustc_hash::FxHashSet;

use crate::vm::object::{HeapObject, ObjectRef};

/// Root set for one thread
///
/// Stack roots are republished wholesale at every safepoint join and native
/// transition. Pinned roots are pushed and popped in stack order by the
/// native bridge.
#[derive(Default)]
pub struct RootSet {
    /// Live references of the managed frames
    stack: Vec<ObjectRef>,
    /// References pinned across native calls
    pinned: Vec<ObjectRef>,
}

impl RootSet {
    /// Create an empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stack roots
    pub fn publish_stack(&mut self, roots: Vec<ObjectRef>) {
        self.stack = roots;
    }

    /// Current stack roots
    pub fn stack_roots(&self) -> &[ObjectRef] {
        &self.stack
    }

    /// Pin references; returns the mark to unpin back to
    pub fn pin(&mut self, roots: impl IntoIterator<Item = ObjectRef>) -> usize {
        let mark = self.pinned.len();
        self.pinned.extend(roots);
        mark
    }

    /// Drop every pin made after `mark`
    pub fn unpin_to(&mut self, mark: usize) {
        self.pinned.truncate(mark);
    }

    /// Number of pinned references
    pub fn pinned_len(&self) -> usize {
        self.pinned.len()
    }

    /// Iterate over all roots
    pub fn iter(&self) -> impl Iterator<Item = &ObjectRef> + '_ {
        self.stack.iter().chain(self.pinned.iter())
    }

    /// Get total number of roots
    pub fn len(&self) -> usize {
        self.stack.len() + self.pinned.len()
    }

    /// Whether there are no roots
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every object reachable from `roots`, each reported once, in discovery order
pub fn trace_reachable(roots: impl IntoIterator<Item = ObjectRef>) -> Vec<ObjectRef> {
    let mut seen: FxHashSet<usize> = FxHashSet::default();
    let mut order = Vec::new();
    let mut work: Vec<ObjectRef> = Vec::new();

    for root in roots {
        if seen.insert(HeapObject::address(&root)) {
            work.push(root);
        }
    }
    while let Some(obj) = work.pop() {
        let trace = obj.vtable().header().trace;
        trace(&obj, &mut |child: ObjectRef| {
            if seen.insert(HeapObject::address(&child)) {
                work.push(child);
            }
        });
        order.push(obj);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::{ClassDef, ClassRegistry, OBJECT_CLASS};
    use crate::vm::heap::{Allocator, HeapAllocator};
    use crate::vm::object::ElemKind;
    use crate::vm::value::Value;

    #[test]
    fn test_pins_unwind_in_order() {
        let mut roots = RootSet::new();
        assert!(roots.is_empty());
        let outer = roots.pin(Vec::new());
        assert_eq!(outer, 0);
        roots.unpin_to(outer);
        assert_eq!(roots.pinned_len(), 0);
    }

    #[test]
    fn test_trace_follows_fields_and_arrays() {
        let registry = ClassRegistry::new();
        let mut object = ClassDef::new(OBJECT_CLASS);
        object.superclass = None;
        registry.define(object).unwrap();
        let node = registry.define(ClassDef::new("Node").field("next", "LNode;")).unwrap();
        let heap = HeapAllocator::default();

        let a = heap.allocate(node.instance_size(), node.vtable()).unwrap();
        let b = heap.allocate(node.instance_size(), node.vtable()).unwrap();
        a.set_field(0, Value::object(b.clone())).unwrap();
        // cycle back to the head
        b.set_field(0, Value::object(a.clone())).unwrap();

        let arrays = registry.lookup("[LNode;").unwrap();
        let array = heap.allocate_array(arrays.vtable(), ElemKind::Ref, 2).unwrap();
        let c = heap.allocate(node.instance_size(), node.vtable()).unwrap();
        array.array_set(1, Value::object(c.clone())).unwrap();

        let reachable = trace_reachable(vec![a.clone(), array.clone(), a.clone()]);
        assert_eq!(reachable.len(), 4);
        let addrs: FxHashSet<usize> = reachable.iter().map(HeapObject::address).collect();
        for obj in [&a, &b, &array, &c] {
            assert!(addrs.contains(&HeapObject::address(obj)));
        }

        // Break the cycle so the objects can be freed
        b.set_field(0, Value::null()).unwrap();
    }
}
