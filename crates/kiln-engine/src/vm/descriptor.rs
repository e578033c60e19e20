//! Field and method descriptors
//!
//! Descriptors use the classic encoding: `I`, `J`, `F`, `D`, `Z`, `B`, `C`,
//! `S`, `V`, `Lpkg/Name;` and `[` prefixes. A method descriptor is
//! `(args)ret`, for example `(I[JLjava/lang/String;)V`.

use std::fmt;
use std::sync::Arc;

use crate::jit::ir::types::JitType;
use crate::vm::object::ElemKind;

/// Descriptor parse error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// Input ended early
    #[error("descriptor `{0}` is truncated")]
    Truncated(String),

    /// Unknown type character
    #[error("descriptor `{descriptor}` has invalid character `{ch}`")]
    InvalidChar {
        /// Full descriptor
        descriptor: String,
        /// Offending character
        ch: char,
    },

    /// Trailing input after a complete descriptor
    #[error("descriptor `{0}` has trailing characters")]
    Trailing(String),

    /// `V` used where a value type is required
    #[error("descriptor `{0}` uses void as a value type")]
    VoidValue(String),
}

/// A field type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
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
    /// `Lname;`
    Object(Arc<str>),
    /// `[component`
    Array(Box<TypeDesc>),
}

impl TypeDesc {
    /// Parse a single field descriptor
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut parser = Parser::new(descriptor);
        let ty = parser.value_type()?;
        parser.finish()?;
        Ok(ty)
    }

    /// Parse a class name as it appears in a class constant: either a plain
    /// internal name or an array descriptor
    pub fn from_class_name(name: &str) -> Result<Self, DescriptorError> {
        if name.starts_with('[') {
            Self::parse(name)
        } else {
            Ok(TypeDesc::Object(Arc::from(name)))
        }
    }

    /// Type of a value of this kind once loaded on the operand stack
    pub fn value_type(&self) -> JitType {
        match self {
            TypeDesc::Boolean | TypeDesc::Byte | TypeDesc::Char | TypeDesc::Short | TypeDesc::Int => {
                JitType::I32
            }
            TypeDesc::Long => JitType::I64,
            TypeDesc::Float => JitType::F32,
            TypeDesc::Double => JitType::F64,
            TypeDesc::Object(_) | TypeDesc::Array(_) => JitType::Ref,
        }
    }

    /// Element kind when this type is an array component
    pub fn elem_kind(&self) -> ElemKind {
        match self {
            TypeDesc::Boolean => ElemKind::Boolean,
            TypeDesc::Byte => ElemKind::Byte,
            TypeDesc::Char => ElemKind::Char,
            TypeDesc::Short => ElemKind::Short,
            TypeDesc::Int => ElemKind::Int,
            TypeDesc::Long => ElemKind::Long,
            TypeDesc::Float => ElemKind::Float,
            TypeDesc::Double => ElemKind::Double,
            TypeDesc::Object(_) | TypeDesc::Array(_) => ElemKind::Ref,
        }
    }

    /// Primitive descriptor type for an element kind
    pub fn from_elem_kind(kind: ElemKind) -> Option<Self> {
        Some(match kind {
            ElemKind::Boolean => TypeDesc::Boolean,
            ElemKind::Byte => TypeDesc::Byte,
            ElemKind::Char => TypeDesc::Char,
            ElemKind::Short => TypeDesc::Short,
            ElemKind::Int => TypeDesc::Int,
            ElemKind::Long => TypeDesc::Long,
            ElemKind::Float => TypeDesc::Float,
            ElemKind::Double => TypeDesc::Double,
            ElemKind::Ref => return None,
        })
    }

    /// Whether this is a reference type
    pub fn is_reference(&self) -> bool {
        matches!(self, TypeDesc::Object(_) | TypeDesc::Array(_))
    }

    /// Name of the class describing values of this type, for reference types.
    /// Arrays use their descriptor (`[I`), objects their internal name.
    pub fn class_name(&self) -> Option<String> {
        match self {
            TypeDesc::Object(name) => Some(name.to_string()),
            TypeDesc::Array(_) => Some(self.to_string()),
            _ => None,
        }
    }

    /// The array type whose component is `self`
    pub fn array_of(self) -> TypeDesc {
        TypeDesc::Array(Box::new(self))
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Boolean => write!(f, "Z"),
            TypeDesc::Byte => write!(f, "B"),
            TypeDesc::Char => write!(f, "C"),
            TypeDesc::Short => write!(f, "S"),
            TypeDesc::Int => write!(f, "I"),
            TypeDesc::Long => write!(f, "J"),
            TypeDesc::Float => write!(f, "F"),
            TypeDesc::Double => write!(f, "D"),
            TypeDesc::Object(name) => write!(f, "L{};", name),
            TypeDesc::Array(component) => write!(f, "[{}", component),
        }
    }
}

/// A parsed method descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Declared argument types (not including the receiver)
    pub args: Vec<TypeDesc>,
    /// Return type, `None` for void
    pub ret: Option<TypeDesc>,
}

impl MethodDescriptor {
    /// Parse `(args)ret`
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut parser = Parser::new(descriptor);
        parser.expect('(')?;
        let mut args = Vec::new();
        while parser.peek()? != ')' {
            args.push(parser.value_type()?);
        }
        parser.expect(')')?;
        let ret = if parser.peek()? == 'V' {
            parser.bump();
            None
        } else {
            Some(parser.value_type()?)
        };
        parser.finish()?;
        Ok(Self { args, ret })
    }

    /// Operand-stack slots taken by the arguments (wide types count twice)
    pub fn arg_slots(&self) -> usize {
        self.args.iter().map(|a| a.value_type().slots()).sum()
    }

    /// Return value type, `None` for void
    pub fn ret_type(&self) -> Option<JitType> {
        self.ret.as_ref().map(TypeDesc::value_type)
    }

    /// Argument value types
    pub fn arg_types(&self) -> impl Iterator<Item = JitType> + '_ {
        self.args.iter().map(TypeDesc::value_type)
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for arg in &self.args {
            write!(f, "{}", arg)?;
        }
        write!(f, ")")?;
        match &self.ret {
            Some(ret) => write!(f, "{}", ret),
            None => write!(f, "V"),
        }
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn truncated(&self) -> DescriptorError {
        DescriptorError::Truncated(self.source.to_string())
    }

    fn peek(&mut self) -> Result<char, DescriptorError> {
        match self.chars.peek() {
            Some((_, c)) => Ok(*c),
            None => Err(self.truncated()),
        }
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn expect(&mut self, want: char) -> Result<(), DescriptorError> {
        match self.bump() {
            Some((_, c)) if c == want => Ok(()),
            Some((_, ch)) => Err(DescriptorError::InvalidChar {
                descriptor: self.source.to_string(),
                ch,
            }),
            None => Err(self.truncated()),
        }
    }

    fn value_type(&mut self) -> Result<TypeDesc, DescriptorError> {
        let (start, ch) = self.bump().ok_or_else(|| self.truncated())?;
        Ok(match ch {
            'Z' => TypeDesc::Boolean,
            'B' => TypeDesc::Byte,
            'C' => TypeDesc::Char,
            'S' => TypeDesc::Short,
            'I' => TypeDesc::Int,
            'J' => TypeDesc::Long,
            'F' => TypeDesc::Float,
            'D' => TypeDesc::Double,
            'V' => return Err(DescriptorError::VoidValue(self.source.to_string())),
            '[' => TypeDesc::Array(Box::new(self.value_type()?)),
            'L' => {
                let name_start = start + 1;
                loop {
                    match self.bump() {
                        Some((end, ';')) => {
                            if end == name_start {
                                return Err(DescriptorError::InvalidChar {
                                    descriptor: self.source.to_string(),
                                    ch: ';',
                                });
                            }
                            break TypeDesc::Object(Arc::from(&self.source[name_start..end]));
                        }
                        Some(_) => {}
                        None => return Err(self.truncated()),
                    }
                }
            }
            ch => {
                return Err(DescriptorError::InvalidChar {
                    descriptor: self.source.to_string(),
                    ch,
                })
            }
        })
    }

    fn finish(&mut self) -> Result<(), DescriptorError> {
        if self.chars.peek().is_some() {
            Err(DescriptorError::Trailing(self.source.to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        let desc = MethodDescriptor::parse("(I[JLjava/lang/String;)V").unwrap();
        assert_eq!(desc.args.len(), 3);
        assert_eq!(desc.args[0], TypeDesc::Int);
        assert_eq!(desc.args[1], TypeDesc::Array(Box::new(TypeDesc::Long)));
        assert_eq!(desc.args[2], TypeDesc::Object(Arc::from("java/lang/String")));
        assert_eq!(desc.ret, None);
        assert_eq!(desc.arg_slots(), 3);
    }

    #[test]
    fn test_wide_arg_slots() {
        let desc = MethodDescriptor::parse("(JDI)J").unwrap();
        assert_eq!(desc.arg_slots(), 5);
        assert_eq!(desc.ret_type(), Some(JitType::I64));
    }

    #[test]
    fn test_display_round_trip() {
        let text = "([[Ljava/lang/Object;Z)[C";
        assert_eq!(MethodDescriptor::parse(text).unwrap().to_string(), text);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(MethodDescriptor::parse("(I"), Err(DescriptorError::Truncated(_))));
        assert!(matches!(
            MethodDescriptor::parse("(Q)V"),
            Err(DescriptorError::InvalidChar { ch: 'Q', .. })
        ));
        assert!(matches!(MethodDescriptor::parse("()VV"), Err(DescriptorError::Trailing(_))));
        assert!(matches!(TypeDesc::parse("V"), Err(DescriptorError::VoidValue(_))));
        assert!(matches!(TypeDesc::parse("Ljava/lang/Object"), Err(DescriptorError::Truncated(_))));
        assert!(TypeDesc::parse("L;").is_err());
    }

    #[test]
    fn test_class_names() {
        let array = TypeDesc::from_class_name("[I").unwrap();
        assert_eq!(array.class_name().as_deref(), Some("[I"));
        let obj = TypeDesc::from_class_name("pkg/Foo").unwrap();
        assert_eq!(obj.class_name().as_deref(), Some("pkg/Foo"));
        assert_eq!(TypeDesc::Int.class_name(), None);
    }
}
