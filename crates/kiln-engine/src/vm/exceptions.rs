//! Exception-kind constructors
//!
//! Compiled code raises runtime faults through `ExceptionFactory`, one entry
//! point per kind, each taking only the operands that describe the fault.
//! `StandardExceptions` builds instances of the bootstrap hierarchy and keeps
//! a preallocated `OutOfMemoryError` so that raising OOM never allocates.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::vm::bootstrap::define_core_classes;
use crate::vm::class::{Class, ClassRegistry, STRING_CLASS};
use crate::vm::heap::Allocator;
use crate::vm::object::ObjectRef;
use crate::vm::value::Value;
use crate::vm::{VmError, VmResult};

/// Runtime fault kinds raised by compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    /// Null dereference
    NullPointer,
    /// Array index outside `0..length`
    ArrayIndexOutOfBounds,
    /// Reference stored into an incompatible array
    ArrayStore,
    /// Integer division by zero
    Arithmetic,
    /// Array created with a negative length
    NegativeArraySize,
    /// Allocation failed
    OutOfMemory,
    /// `checkcast` failed
    ClassCast,
    /// Native stack exhausted
    StackOverflow,
    /// Call target missing on the receiver class
    NoSuchMethod,
    /// Field missing on the resolved class
    NoSuchField,
    /// Monitor released by a thread that does not own it
    IllegalMonitorState,
    /// Referenced class is not loaded
    NoClassDefFound,
}

impl ExceptionKind {
    /// Every kind, in declaration order
    pub const ALL: [ExceptionKind; 12] = [
        ExceptionKind::NullPointer,
        ExceptionKind::ArrayIndexOutOfBounds,
        ExceptionKind::ArrayStore,
        ExceptionKind::Arithmetic,
        ExceptionKind::NegativeArraySize,
        ExceptionKind::OutOfMemory,
        ExceptionKind::ClassCast,
        ExceptionKind::StackOverflow,
        ExceptionKind::NoSuchMethod,
        ExceptionKind::NoSuchField,
        ExceptionKind::IllegalMonitorState,
        ExceptionKind::NoClassDefFound,
    ];

    /// Internal name of the exception class
    pub fn class_name(&self) -> &'static str {
        match self {
            ExceptionKind::NullPointer => "java/lang/NullPointerException",
            ExceptionKind::ArrayIndexOutOfBounds => "java/lang/ArrayIndexOutOfBoundsException",
            ExceptionKind::ArrayStore => "java/lang/ArrayStoreException",
            ExceptionKind::Arithmetic => "java/lang/ArithmeticException",
            ExceptionKind::NegativeArraySize => "java/lang/NegativeArraySizeException",
            ExceptionKind::OutOfMemory => "java/lang/OutOfMemoryError",
            ExceptionKind::ClassCast => "java/lang/ClassCastException",
            ExceptionKind::StackOverflow => "java/lang/StackOverflowError",
            ExceptionKind::NoSuchMethod => "java/lang/NoSuchMethodError",
            ExceptionKind::NoSuchField => "java/lang/NoSuchFieldError",
            ExceptionKind::IllegalMonitorState => "java/lang/IllegalMonitorStateException",
            ExceptionKind::NoClassDefFound => "java/lang/NoClassDefFoundError",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// One constructor per runtime fault kind
pub trait ExceptionFactory: Send + Sync {
    /// Null dereference
    fn null_pointer(&self) -> VmResult<ObjectRef>;
    /// Index outside the array bounds
    fn index_out_of_bounds(&self, index: i32, length: i32) -> VmResult<ObjectRef>;
    /// Incompatible array store
    fn array_store(&self, value_class: &str, array_class: &str) -> VmResult<ObjectRef>;
    /// Integer division by zero
    fn arithmetic(&self, message: &str) -> VmResult<ObjectRef>;
    /// Negative array length
    fn negative_array_size(&self, size: i32) -> VmResult<ObjectRef>;
    /// Allocation failure; must not allocate
    fn out_of_memory(&self) -> VmResult<ObjectRef>;
    /// Failed cast
    fn class_cast(&self, from: &str, to: &str) -> VmResult<ObjectRef>;
    /// Stack exhausted
    fn stack_overflow(&self) -> VmResult<ObjectRef>;
    /// Missing method
    fn no_such_method(&self, method: &str) -> VmResult<ObjectRef>;
    /// Missing field
    fn no_such_field(&self, field: &str) -> VmResult<ObjectRef>;
    /// Monitor misuse
    fn illegal_monitor_state(&self) -> VmResult<ObjectRef>;
    /// Missing class
    fn no_class_def_found(&self, class: &str) -> VmResult<ObjectRef>;
}

/// Factory over the bootstrap exception hierarchy
pub struct StandardExceptions {
    classes: FxHashMap<ExceptionKind, Arc<Class>>,
    string_class: Arc<Class>,
    message_slot: usize,
    allocator: Arc<dyn Allocator>,
    out_of_memory: ObjectRef,
}

impl StandardExceptions {
    /// Define the core classes if needed and preallocate the OOM instance
    pub fn new(registry: &Arc<ClassRegistry>, allocator: Arc<dyn Allocator>) -> VmResult<Self> {
        define_core_classes(registry)?;
        let mut classes = FxHashMap::default();
        for kind in ExceptionKind::ALL {
            let class = registry
                .lookup(kind.class_name())
                .ok_or_else(|| VmError::ClassNotFound(kind.class_name().to_string()))?;
            classes.insert(kind, class);
        }
        let string_class = registry
            .lookup(STRING_CLASS)
            .ok_or_else(|| VmError::ClassNotFound(STRING_CLASS.to_string()))?;
        let oom_class = &classes[&ExceptionKind::OutOfMemory];
        let message_slot = oom_class
            .find_field("message", "Ljava/lang/String;")
            .map(|f| f.slot)
            .ok_or_else(|| VmError::FieldNotFound("java/lang/Throwable.message".to_string()))?;
        let out_of_memory = allocator.allocate(oom_class.instance_size(), oom_class.vtable())?;
        Ok(Self {
            classes,
            string_class,
            message_slot,
            allocator,
            out_of_memory,
        })
    }

    /// Class used for a kind
    pub fn class_of(&self, kind: ExceptionKind) -> Option<&Arc<Class>> {
        self.classes.get(&kind)
    }

    /// Build an exception of `kind` with an optional message. Falls back to
    /// the preallocated OOM instance when the heap is exhausted.
    pub fn create(&self, kind: ExceptionKind, message: Option<&str>) -> VmResult<ObjectRef> {
        if kind == ExceptionKind::OutOfMemory {
            return Ok(self.out_of_memory.clone());
        }
        let class = self
            .classes
            .get(&kind)
            .ok_or_else(|| VmError::ClassNotFound(kind.class_name().to_string()))?;
        let exception = match self.allocator.allocate(class.instance_size(), class.vtable()) {
            Ok(obj) => obj,
            Err(_) => return Ok(self.out_of_memory.clone()),
        };
        if let Some(text) = message {
            if let Ok(string) = self.allocator.allocate_string(self.string_class.vtable(), text) {
                exception.set_field(self.message_slot, Value::object(string))?;
            }
        }
        Ok(exception)
    }
}

impl ExceptionFactory for StandardExceptions {
    fn null_pointer(&self) -> VmResult<ObjectRef> {
        self.create(ExceptionKind::NullPointer, None)
    }

    fn index_out_of_bounds(&self, index: i32, length: i32) -> VmResult<ObjectRef> {
        self.create(
            ExceptionKind::ArrayIndexOutOfBounds,
            Some(&format!("Index {} out of bounds for length {}", index, length)),
        )
    }

    fn array_store(&self, value_class: &str, array_class: &str) -> VmResult<ObjectRef> {
        self.create(
            ExceptionKind::ArrayStore,
            Some(&format!("{} cannot be stored in {}", value_class, array_class)),
        )
    }

    fn arithmetic(&self, message: &str) -> VmResult<ObjectRef> {
        self.create(ExceptionKind::Arithmetic, Some(message))
    }

    fn negative_array_size(&self, size: i32) -> VmResult<ObjectRef> {
        self.create(ExceptionKind::NegativeArraySize, Some(&size.to_string()))
    }

    fn out_of_memory(&self) -> VmResult<ObjectRef> {
        Ok(self.out_of_memory.clone())
    }

    fn class_cast(&self, from: &str, to: &str) -> VmResult<ObjectRef> {
        self.create(
            ExceptionKind::ClassCast,
            Some(&format!("class {} cannot be cast to class {}", from, to)),
        )
    }

    fn stack_overflow(&self) -> VmResult<ObjectRef> {
        self.create(ExceptionKind::StackOverflow, None)
    }

    fn no_such_method(&self, method: &str) -> VmResult<ObjectRef> {
        self.create(ExceptionKind::NoSuchMethod, Some(method))
    }

    fn no_such_field(&self, field: &str) -> VmResult<ObjectRef> {
        self.create(ExceptionKind::NoSuchField, Some(field))
    }

    fn illegal_monitor_state(&self) -> VmResult<ObjectRef> {
        self.create(ExceptionKind::IllegalMonitorState, Some("current thread is not owner"))
    }

    fn no_class_def_found(&self, class: &str) -> VmResult<ObjectRef> {
        self.create(ExceptionKind::NoClassDefFound, Some(class))
    }
}

/// Message of a throwable, if it has a string one
pub fn exception_message(exception: &ObjectRef) -> Option<String> {
    let class = exception.vtable().class()?;
    let slot = class.find_field("message", "Ljava/lang/String;")?.slot;
    let message = exception.field(slot).ok()?;
    message.as_object().and_then(|s| s.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::heap::HeapAllocator;

    fn factory(limit: usize) -> (Arc<ClassRegistry>, StandardExceptions) {
        let registry = ClassRegistry::new();
        let exceptions = StandardExceptions::new(&registry, Arc::new(HeapAllocator::new(limit))).unwrap();
        (registry, exceptions)
    }

    #[test]
    fn test_messages() {
        let (_registry, exceptions) = factory(0);
        let e = exceptions.index_out_of_bounds(5, 3).unwrap();
        assert_eq!(e.class_name(), "java/lang/ArrayIndexOutOfBoundsException");
        assert_eq!(exception_message(&e).as_deref(), Some("Index 5 out of bounds for length 3"));

        let e = exceptions.arithmetic("/ by zero").unwrap();
        assert_eq!(exception_message(&e).as_deref(), Some("/ by zero"));
        assert_eq!(exception_message(&exceptions.null_pointer().unwrap()), None);
    }

    #[test]
    fn test_out_of_memory_is_preallocated() {
        let (_registry, exceptions) = factory(0);
        let a = exceptions.out_of_memory().unwrap();
        let b = exceptions.create(ExceptionKind::OutOfMemory, Some("ignored")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_exhausted_heap_falls_back_to_oom() {
        // Only room for the preallocated OOM instance
        let oom_size = crate::vm::object::instance_size(1);
        let (_registry, exceptions) = factory(oom_size);
        let e = exceptions.null_pointer().unwrap();
        assert_eq!(e.class_name(), "java/lang/OutOfMemoryError");
    }

    #[test]
    fn test_every_kind_has_a_class() {
        let (_registry, exceptions) = factory(0);
        for kind in ExceptionKind::ALL {
            assert_eq!(&**exceptions.class_of(kind).unwrap().name(), kind.class_name());
        }
    }
}
