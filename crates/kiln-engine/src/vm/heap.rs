//! Allocator collaborator
//!
//! Compiled code allocates through the `Allocator` trait with an instance
//! size and a VirtualTable. The collector policy is not part of the core;
//! `HeapAllocator` only accounts bytes and enforces an optional limit so the
//! out-of-memory path can be exercised.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::jit::ir::types::JitType;
use crate::vm::object::{ElemKind, HeapObject, ObjectRef, HEADER_SIZE, SLOT_SIZE};
use crate::vm::vtable::VirtualTable;

/// Allocation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Heap limit reached
    #[error("out of memory: requested {requested} bytes with {allocated} of {limit} in use")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes already allocated
        allocated: usize,
        /// Configured limit
        limit: usize,
    },
}

/// Object allocator used by compiled code
///
/// Implementations must be callable from any mutator thread without the
/// caller holding compiler-internal locks.
pub trait Allocator: Send + Sync {
    /// Allocate an instance of `size` bytes described by `vtable`
    fn allocate(&self, size: usize, vtable: &Arc<VirtualTable>) -> Result<ObjectRef, AllocError>;

    /// Allocate a zero-filled array
    fn allocate_array(
        &self,
        vtable: &Arc<VirtualTable>,
        elem: ElemKind,
        length: usize,
    ) -> Result<ObjectRef, AllocError>;

    /// Allocate a string object
    fn allocate_string(&self, vtable: &Arc<VirtualTable>, value: &str) -> Result<ObjectRef, AllocError>;

    /// Total bytes handed out so far
    fn allocated_bytes(&self) -> usize;
}

/// Size in bytes of one array element
pub fn elem_size(elem: ElemKind) -> usize {
    match elem {
        ElemKind::Boolean | ElemKind::Byte => 1,
        ElemKind::Char | ElemKind::Short => 2,
        ElemKind::Int | ElemKind::Float => 4,
        ElemKind::Long | ElemKind::Double | ElemKind::Ref => 8,
    }
}

/// Default allocator backed by reference-counted heap objects
#[derive(Debug, Default)]
pub struct HeapAllocator {
    /// Total bytes allocated
    allocated: AtomicUsize,
    /// Number of objects allocated
    objects: AtomicUsize,
    /// Maximum heap size (0 = unlimited)
    max_heap_bytes: usize,
}

impl HeapAllocator {
    /// Create an allocator with a byte limit (0 = unlimited)
    pub fn new(max_heap_bytes: usize) -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            objects: AtomicUsize::new(0),
            max_heap_bytes,
        }
    }

    /// Number of objects allocated so far
    pub fn object_count(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    fn reserve(&self, size: usize) -> Result<(), AllocError> {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(size);
            if self.max_heap_bytes > 0 && next > self.max_heap_bytes {
                return Err(AllocError::OutOfMemory {
                    requested: size,
                    allocated: current,
                    limit: self.max_heap_bytes,
                });
            }
            match self
                .allocated
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.objects.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Allocator for HeapAllocator {
    fn allocate(&self, size: usize, vtable: &Arc<VirtualTable>) -> Result<ObjectRef, AllocError> {
        self.reserve(size)?;
        let field_types: Vec<JitType> = match vtable.class() {
            Some(class) => class.field_types().to_vec(),
            None => vec![JitType::I64; size.saturating_sub(HEADER_SIZE) / SLOT_SIZE],
        };
        Ok(Arc::new(HeapObject::new_instance(vtable.clone(), &field_types)))
    }

    fn allocate_array(
        &self,
        vtable: &Arc<VirtualTable>,
        elem: ElemKind,
        length: usize,
    ) -> Result<ObjectRef, AllocError> {
        let size = HEADER_SIZE + SLOT_SIZE + length.saturating_mul(elem_size(elem));
        self.reserve(size)?;
        Ok(Arc::new(HeapObject::new_array(vtable.clone(), elem, length)))
    }

    fn allocate_string(&self, vtable: &Arc<VirtualTable>, value: &str) -> Result<ObjectRef, AllocError> {
        self.reserve(HEADER_SIZE + value.len())?;
        Ok(Arc::new(HeapObject::new_string(vtable.clone(), value)))
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::{ClassDef, ClassRegistry, OBJECT_CLASS};

    fn point_vtable() -> (Arc<ClassRegistry>, Arc<crate::vm::class::Class>) {
        let registry = ClassRegistry::new();
        let mut object = ClassDef::new(OBJECT_CLASS);
        object.superclass = None;
        registry.define(object).unwrap();
        let point = registry.define(ClassDef::new("Point").field("x", "I").field("y", "D")).unwrap();
        (registry, point)
    }

    #[test]
    fn test_instance_fields_are_zeroed() {
        let (_registry, point) = point_vtable();
        let heap = HeapAllocator::default();
        let obj = heap.allocate(point.instance_size(), point.vtable()).unwrap();
        assert_eq!(obj.field(0).unwrap(), crate::vm::value::Value::Int(0));
        assert_eq!(obj.field(1).unwrap(), crate::vm::value::Value::Double(0.0));
        assert_eq!(heap.allocated_bytes(), point.instance_size());
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_limit_reports_out_of_memory() {
        let (registry, point) = point_vtable();
        let heap = HeapAllocator::new(64);
        heap.allocate(point.instance_size(), point.vtable()).unwrap();
        let ints = registry.lookup("[I").unwrap();
        let err = heap.allocate_array(ints.vtable(), ElemKind::Int, 100).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { limit: 64, .. }));
        // A failed request does not consume budget
        assert_eq!(heap.allocated_bytes(), point.instance_size());
    }

    #[test]
    fn test_array_sizes() {
        assert_eq!(elem_size(ElemKind::Byte), 1);
        assert_eq!(elem_size(ElemKind::Char), 2);
        assert_eq!(elem_size(ElemKind::Ref), 8);
    }
}
