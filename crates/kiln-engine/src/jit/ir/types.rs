//! JIT type system
//!
//! Every register and every symbolic stack slot carries one of five value
//! types. Sub-word integers (boolean, byte, char, short) are widened to `I32`
//! the moment they are loaded.

/// JIT IR type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JitType {
    /// 32-bit integer (also booleans, bytes, chars, shorts and return addresses)
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
    /// Object reference (possibly null)
    Ref,
}

impl JitType {
    /// Whether a value of this type occupies two operand-stack slots
    pub fn is_wide(&self) -> bool {
        matches!(self, JitType::I64 | JitType::F64)
    }

    /// Number of operand-stack / local slots a value of this type occupies
    pub fn slots(&self) -> usize {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    /// Whether this is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(self, JitType::I32 | JitType::I64)
    }

    /// Whether this is a floating-point type
    pub fn is_float(&self) -> bool {
        matches!(self, JitType::F32 | JitType::F64)
    }
}

impl std::fmt::Display for JitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitType::I32 => write!(f, "i32"),
            JitType::I64 => write!(f, "i64"),
            JitType::F32 => write!(f, "f32"),
            JitType::F64 => write!(f, "f64"),
            JitType::Ref => write!(f, "ref"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_types() {
        assert!(JitType::I64.is_wide());
        assert!(JitType::F64.is_wide());
        assert!(!JitType::Ref.is_wide());
        assert_eq!(JitType::I32.slots(), 1);
        assert_eq!(JitType::F64.slots(), 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(JitType::Ref.to_string(), "ref");
        assert_eq!(JitType::F32.to_string(), "f32");
    }
}
