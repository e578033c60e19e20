//! Constant pools
//!
//! The compiler only ever talks to the `ConstantPool` trait. The bundled
//! `ConstantPoolTable` keeps symbolic entries and answers `resolve_class`
//! against the class registry that defined it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::vm::class::{Class, ClassRegistry};

/// A symbolic field or method reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Internal name of the declaring (or referenced) class
    pub class: Arc<str>,
    /// Member name
    pub name: Arc<str>,
    /// Field or method descriptor
    pub descriptor: Arc<str>,
}

impl MemberRef {
    /// Build a reference
    pub fn new(class: &str, name: &str, descriptor: &str) -> Self {
        Self {
            class: Arc::from(class),
            name: Arc::from(name),
            descriptor: Arc::from(descriptor),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class, self.name, self.descriptor)
    }
}

/// A raw pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    /// Integer constant
    Int(i32),
    /// Long constant
    Long(i64),
    /// Float constant
    Float(f32),
    /// Double constant
    Double(f64),
    /// String literal
    String(Arc<str>),
    /// Class reference by internal name
    Class(Arc<str>),
    /// Field reference
    Field(MemberRef),
    /// Class method reference
    Method(MemberRef),
    /// Interface method reference
    InterfaceMethod(MemberRef),
}

impl PoolEntry {
    /// Class reference entry
    pub fn class(name: &str) -> Self {
        PoolEntry::Class(Arc::from(name))
    }

    /// String literal entry
    pub fn string(value: &str) -> Self {
        PoolEntry::String(Arc::from(value))
    }

    /// Field reference entry
    pub fn field(class: &str, name: &str, descriptor: &str) -> Self {
        PoolEntry::Field(MemberRef::new(class, name, descriptor))
    }

    /// Method reference entry
    pub fn method(class: &str, name: &str, descriptor: &str) -> Self {
        PoolEntry::Method(MemberRef::new(class, name, descriptor))
    }

    /// Interface method reference entry
    pub fn interface_method(class: &str, name: &str, descriptor: &str) -> Self {
        PoolEntry::InterfaceMethod(MemberRef::new(class, name, descriptor))
    }
}

/// Loadable constant (what `ldc` pushes)
#[derive(Debug, Clone, PartialEq)]
pub enum PoolConstant {
    /// Integer
    Int(i32),
    /// Long
    Long(i64),
    /// Float
    Float(f32),
    /// Double
    Double(f64),
    /// String literal
    String(Arc<str>),
    /// Class literal
    Class(Arc<str>),
}

/// Constant pool lookup failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Index past the end of the pool
    #[error("constant pool index {0} out of range")]
    BadIndex(u16),

    /// Entry has a different kind
    #[error("constant pool entry {index} is not a {expected}")]
    WrongKind {
        /// Index looked up
        index: u16,
        /// Kind the caller needed
        expected: &'static str,
    },
}

/// Class/constant-pool resolver consumed by the method compiler
pub trait ConstantPool: Send + Sync {
    /// Method reference at `index` (class or interface method)
    fn resolve_method(&self, index: u16) -> Result<MemberRef, PoolError>;

    /// Field reference at `index`
    fn resolve_field(&self, index: u16) -> Result<MemberRef, PoolError>;

    /// Class name at `index`
    fn class_name(&self, index: u16) -> Result<Arc<str>, PoolError>;

    /// Class at `index`, or `None` if it is not loaded yet
    fn resolve_class(&self, index: u16) -> Option<Arc<Class>>;

    /// Loadable constant at `index`
    fn constant(&self, index: u16) -> Result<PoolConstant, PoolError>;

    /// Record that the call site using `index` was bound statically
    fn mark_statically_bound(&self, index: u16);

    /// Whether `mark_statically_bound` was called for `index`
    fn is_statically_bound(&self, index: u16) -> bool;
}

/// In-memory pool backed by the class registry
pub struct ConstantPoolTable {
    entries: Vec<PoolEntry>,
    bound: Box<[AtomicBool]>,
    registry: Weak<ClassRegistry>,
}

impl ConstantPoolTable {
    /// Build a pool resolving classes through `registry`
    pub fn new(registry: Weak<ClassRegistry>, entries: Vec<PoolEntry>) -> Self {
        let bound = (0..entries.len()).map(|_| AtomicBool::new(false)).collect();
        Self {
            entries,
            bound,
            registry,
        }
    }

    fn entry(&self, index: u16) -> Result<&PoolEntry, PoolError> {
        self.entries
            .get(usize::from(index))
            .ok_or(PoolError::BadIndex(index))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ConstantPool for ConstantPoolTable {
    fn resolve_method(&self, index: u16) -> Result<MemberRef, PoolError> {
        match self.entry(index)? {
            PoolEntry::Method(m) | PoolEntry::InterfaceMethod(m) => Ok(m.clone()),
            _ => Err(PoolError::WrongKind { index, expected: "method reference" }),
        }
    }

    fn resolve_field(&self, index: u16) -> Result<MemberRef, PoolError> {
        match self.entry(index)? {
            PoolEntry::Field(f) => Ok(f.clone()),
            _ => Err(PoolError::WrongKind { index, expected: "field reference" }),
        }
    }

    fn class_name(&self, index: u16) -> Result<Arc<str>, PoolError> {
        match self.entry(index)? {
            PoolEntry::Class(name) => Ok(name.clone()),
            _ => Err(PoolError::WrongKind { index, expected: "class reference" }),
        }
    }

    fn resolve_class(&self, index: u16) -> Option<Arc<Class>> {
        let name = self.class_name(index).ok()?;
        self.registry.upgrade()?.lookup(&name)
    }

    fn constant(&self, index: u16) -> Result<PoolConstant, PoolError> {
        Ok(match self.entry(index)? {
            PoolEntry::Int(v) => PoolConstant::Int(*v),
            PoolEntry::Long(v) => PoolConstant::Long(*v),
            PoolEntry::Float(v) => PoolConstant::Float(*v),
            PoolEntry::Double(v) => PoolConstant::Double(*v),
            PoolEntry::String(s) => PoolConstant::String(s.clone()),
            PoolEntry::Class(name) => PoolConstant::Class(name.clone()),
            _ => return Err(PoolError::WrongKind { index, expected: "loadable constant" }),
        })
    }

    fn mark_statically_bound(&self, index: u16) {
        if let Some(flag) = self.bound.get(usize::from(index)) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn is_statically_bound(&self, index: u16) -> bool {
        self.bound
            .get(usize::from(index))
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}
