//! Managed values
//!
//! A `Value` is what lives in a register, a local slot, a field or an array
//! element. References are shared handles to heap objects; `Ref(None)` is the
//! managed null.

use std::fmt;
use std::sync::Arc;

use crate::jit::ir::types::JitType;
use crate::vm::object::{HeapObject, ObjectRef};

/// A managed value
#[derive(Clone)]
pub enum Value {
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// Object reference, `None` is null
    Ref(Option<ObjectRef>),
}

impl Value {
    /// The null reference
    #[inline]
    pub const fn null() -> Self {
        Value::Ref(None)
    }

    /// Wrap an object reference
    #[inline]
    pub fn object(obj: ObjectRef) -> Self {
        Value::Ref(Some(obj))
    }

    /// Zero value for a type (the initial content of fields and array elements)
    pub fn zero(ty: JitType) -> Self {
        match ty {
            JitType::I32 => Value::Int(0),
            JitType::I64 => Value::Long(0),
            JitType::F32 => Value::Float(0.0),
            JitType::F64 => Value::Double(0.0),
            JitType::Ref => Value::Ref(None),
        }
    }

    /// The value's type
    pub fn ty(&self) -> JitType {
        match self {
            Value::Int(_) => JitType::I32,
            Value::Long(_) => JitType::I64,
            Value::Float(_) => JitType::F32,
            Value::Double(_) => JitType::F64,
            Value::Ref(_) => JitType::Ref,
        }
    }

    /// Integer payload
    #[inline]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Long payload
    #[inline]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload
    #[inline]
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Double payload
    #[inline]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Non-null object payload
    #[inline]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Ref(Some(obj)) => Some(obj),
            _ => None,
        }
    }

    /// Whether this is the null reference
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Ref(None))
    }

    /// Whether this is a reference (null or not)
    #[inline]
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref(_))
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Ref(None), Value::Ref(None)) => true,
            (Value::Ref(Some(a)), Value::Ref(Some(b))) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Ref(Some(obj))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}i", v),
            Value::Long(v) => write!(f, "{}L", v),
            Value::Float(v) => write!(f, "{}f", v),
            Value::Double(v) => write!(f, "{}d", v),
            Value::Ref(None) => write!(f, "null"),
            Value::Ref(Some(obj)) => write!(f, "{}@{:x}", obj.class_name(), HeapObject::address(obj)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_values() {
        assert_eq!(Value::zero(JitType::I32), Value::Int(0));
        assert_eq!(Value::zero(JitType::F64), Value::Double(0.0));
        assert!(Value::zero(JitType::Ref).is_null());
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::Int(7).as_long(), None);
        assert_eq!(Value::Long(-1).as_long(), Some(-1));
        assert_eq!(Value::Double(0.5).ty(), JitType::F64);
        assert!(Value::null().is_ref());
        assert!(Value::null().as_object().is_none());
    }

    #[test]
    fn test_mixed_types_never_equal() {
        assert_ne!(Value::Int(0), Value::Long(0));
        assert_ne!(Value::Float(1.0), Value::Double(1.0));
    }
}
