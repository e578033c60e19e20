//! Heap objects
//!
//! Every object starts with a header: its VirtualTable and a lock word. The
//! body is either an instance (field slots), an array, or an immutable string.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::jit::ir::types::JitType;
use crate::vm::frames::StackTraceElement;
use crate::vm::value::Value;
use crate::vm::vtable::VirtualTable;
use crate::vm::{VmError, VmResult};

/// Shared handle to a heap object
pub type ObjectRef = Arc<HeapObject>;

/// Bytes taken by the object header (table pointer + lock word)
pub const HEADER_SIZE: usize = 16;

/// Bytes per field slot
pub const SLOT_SIZE: usize = 8;

/// Element kind of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    /// `Z`
    Boolean,
    /// `B`
    Byte,
    /// `C`
    Char,
    /// `S`
    Short,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `F`
    Float,
    /// `D`
    Double,
    /// Any reference type
    Ref,
}

impl ElemKind {
    /// Decode a `newarray` type code
    pub fn from_atype(atype: u8) -> Option<Self> {
        Some(match atype {
            4 => ElemKind::Boolean,
            5 => ElemKind::Char,
            6 => ElemKind::Float,
            7 => ElemKind::Double,
            8 => ElemKind::Byte,
            9 => ElemKind::Short,
            10 => ElemKind::Int,
            11 => ElemKind::Long,
            _ => return None,
        })
    }

    /// Type of a loaded element
    pub fn value_type(&self) -> JitType {
        match self {
            ElemKind::Boolean | ElemKind::Byte | ElemKind::Char | ElemKind::Short | ElemKind::Int => {
                JitType::I32
            }
            ElemKind::Long => JitType::I64,
            ElemKind::Float => JitType::F32,
            ElemKind::Double => JitType::F64,
            ElemKind::Ref => JitType::Ref,
        }
    }

    /// Descriptor character for primitive kinds
    pub fn descriptor(&self) -> Option<char> {
        Some(match self {
            ElemKind::Boolean => 'Z',
            ElemKind::Byte => 'B',
            ElemKind::Char => 'C',
            ElemKind::Short => 'S',
            ElemKind::Int => 'I',
            ElemKind::Long => 'J',
            ElemKind::Float => 'F',
            ElemKind::Double => 'D',
            ElemKind::Ref => return None,
        })
    }

    /// Narrow a value to what the element can hold
    pub fn narrow(&self, value: Value) -> Value {
        match (self, value) {
            (ElemKind::Boolean, Value::Int(v)) => Value::Int(v & 1),
            (ElemKind::Byte, Value::Int(v)) => Value::Int(v as i8 as i32),
            (ElemKind::Char, Value::Int(v)) => Value::Int(v as u16 as i32),
            (ElemKind::Short, Value::Int(v)) => Value::Int(v as i16 as i32),
            (_, v) => v,
        }
    }
}

/// Object body
pub enum ObjectBody {
    /// Instance field slots, superclass fields first
    Instance(Mutex<Vec<Value>>),
    /// Array elements
    Array {
        /// Element kind
        elem: ElemKind,
        /// Element storage
        data: Mutex<Vec<Value>>,
    },
    /// Immutable string payload
    Str(Arc<str>),
}

/// A heap object
pub struct HeapObject {
    vtable: Arc<VirtualTable>,
    lock: AtomicU64,
    body: ObjectBody,
    trace: OnceCell<Arc<[StackTraceElement]>>,
}

impl HeapObject {
    /// Create an instance with `field_types.len()` zeroed fields
    pub fn new_instance(vtable: Arc<VirtualTable>, field_types: &[JitType]) -> Self {
        let fields = field_types.iter().map(|ty| Value::zero(*ty)).collect();
        Self::with_body(vtable, ObjectBody::Instance(Mutex::new(fields)))
    }

    /// Create a zero-filled array
    pub fn new_array(vtable: Arc<VirtualTable>, elem: ElemKind, length: usize) -> Self {
        let data = vec![Value::zero(elem.value_type()); length];
        Self::with_body(
            vtable,
            ObjectBody::Array {
                elem,
                data: Mutex::new(data),
            },
        )
    }

    /// Create a string object
    pub fn new_string(vtable: Arc<VirtualTable>, value: &str) -> Self {
        Self::with_body(vtable, ObjectBody::Str(Arc::from(value)))
    }

    fn with_body(vtable: Arc<VirtualTable>, body: ObjectBody) -> Self {
        Self {
            vtable,
            lock: AtomicU64::new(0),
            body,
            trace: OnceCell::new(),
        }
    }

    /// The object's VirtualTable
    #[inline]
    pub fn vtable(&self) -> &Arc<VirtualTable> {
        &self.vtable
    }

    /// Packed monitor word
    #[inline]
    pub fn lock_word(&self) -> &AtomicU64 {
        &self.lock
    }

    /// Object body
    pub fn body(&self) -> &ObjectBody {
        &self.body
    }

    /// Name of the object's class
    pub fn class_name(&self) -> &str {
        self.vtable.class_name()
    }

    /// Stable address used for identity hashing and debug output
    pub fn address(this: &ObjectRef) -> usize {
        Arc::as_ptr(this) as usize
    }

    /// Identity hash through the table's hash slot
    pub fn identity_hash(&self) -> i32 {
        (self.vtable.header().hash)(self)
    }

    /// Read an instance field
    pub fn field(&self, slot: usize) -> VmResult<Value> {
        match &self.body {
            ObjectBody::Instance(fields) => fields
                .lock()
                .get(slot)
                .cloned()
                .ok_or_else(|| VmError::FieldSlot { class: self.class_name().to_string(), slot }),
            _ => Err(VmError::NotAnInstance(self.class_name().to_string())),
        }
    }

    /// Write an instance field
    pub fn set_field(&self, slot: usize, value: Value) -> VmResult<()> {
        match &self.body {
            ObjectBody::Instance(fields) => {
                let mut fields = fields.lock();
                let cell = fields
                    .get_mut(slot)
                    .ok_or_else(|| VmError::FieldSlot { class: self.class_name().to_string(), slot })?;
                *cell = value;
                Ok(())
            }
            _ => Err(VmError::NotAnInstance(self.class_name().to_string())),
        }
    }

    /// Array length, `None` for non-arrays
    pub fn array_len(&self) -> Option<usize> {
        match &self.body {
            ObjectBody::Array { data, .. } => Some(data.lock().len()),
            _ => None,
        }
    }

    /// Array element kind, `None` for non-arrays
    pub fn array_elem(&self) -> Option<ElemKind> {
        match &self.body {
            ObjectBody::Array { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    /// Read an array element. Bounds are checked by compiled code; an
    /// out-of-range index here is an internal error.
    pub fn array_get(&self, index: usize) -> VmResult<Value> {
        match &self.body {
            ObjectBody::Array { data, .. } => data
                .lock()
                .get(index)
                .cloned()
                .ok_or(VmError::ArrayIndex(index)),
            _ => Err(VmError::NotAnArray(self.class_name().to_string())),
        }
    }

    /// Write an array element, narrowing sub-word integers
    pub fn array_set(&self, index: usize, value: Value) -> VmResult<()> {
        match &self.body {
            ObjectBody::Array { elem, data } => {
                let mut data = data.lock();
                let cell = data.get_mut(index).ok_or(VmError::ArrayIndex(index))?;
                *cell = elem.narrow(value);
                Ok(())
            }
            _ => Err(VmError::NotAnArray(self.class_name().to_string())),
        }
    }

    /// String payload, `None` for non-strings
    pub fn as_str(&self) -> Option<&str> {
        match &self.body {
            ObjectBody::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Every reference held directly by this object
    pub fn references(&self) -> Vec<ObjectRef> {
        let collect = |values: &[Value]| -> Vec<ObjectRef> {
            values.iter().filter_map(|v| v.as_object().cloned()).collect()
        };
        match &self.body {
            ObjectBody::Instance(fields) => collect(&fields.lock()),
            ObjectBody::Array { elem: ElemKind::Ref, data } => collect(&data.lock()),
            _ => Vec::new(),
        }
    }

    /// Attach a stack trace; the first one wins
    pub fn set_stack_trace(&self, trace: Arc<[StackTraceElement]>) {
        let _ = self.trace.set(trace);
    }

    /// Stack trace captured when this object was first thrown
    pub fn stack_trace(&self) -> Option<&Arc<[StackTraceElement]>> {
        self.trace.get()
    }
}

impl Drop for HeapObject {
    fn drop(&mut self) {
        (self.vtable.header().deallocate)(self);
    }
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        (self.vtable.header().print)(self, &mut out)?;
        f.write_str(&out)
    }
}

/// Instance size in bytes for `fields` slots
pub fn instance_size(fields: usize) -> usize {
    HEADER_SIZE + fields * SLOT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atype_decoding() {
        assert_eq!(ElemKind::from_atype(10), Some(ElemKind::Int));
        assert_eq!(ElemKind::from_atype(4), Some(ElemKind::Boolean));
        assert_eq!(ElemKind::from_atype(3), None);
    }

    #[test]
    fn test_narrowing() {
        assert_eq!(ElemKind::Byte.narrow(Value::Int(0x1ff)), Value::Int(-1));
        assert_eq!(ElemKind::Char.narrow(Value::Int(-1)), Value::Int(0xffff));
        assert_eq!(ElemKind::Short.narrow(Value::Int(0x18000)), Value::Int(-32768));
        assert_eq!(ElemKind::Boolean.narrow(Value::Int(2)), Value::Int(0));
        assert_eq!(ElemKind::Int.narrow(Value::Int(-5)), Value::Int(-5));
    }

    #[test]
    fn test_instance_size() {
        assert_eq!(instance_size(0), HEADER_SIZE);
        assert_eq!(instance_size(3), HEADER_SIZE + 24);
    }
}
