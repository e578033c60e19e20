//! Compile-time references to runtime entities
//!
//! A `Handle` is either bound when the method is compiled (the class was
//! loaded and the compile mode allows direct binding) or carries the symbolic
//! reference and resolves on first execution. A lazy handle resolves at most
//! once; every later execution reads the cached answer.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::jit::ir::types::JitType;
use crate::vm::class::Class;
use crate::vm::method::Method;
use crate::vm::pool::MemberRef;

/// Symbolic reference kept by a lazy handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    /// Class by internal name (array descriptors included)
    Class(Arc<str>),
    /// Array class whose component has the given internal name
    ArrayOf(Arc<str>),
    /// Instance field
    Field(MemberRef),
    /// Static field
    Static(MemberRef),
    /// Method
    Method(MemberRef),
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Class(name) => write!(f, "{}", name),
            Symbol::ArrayOf(name) => write!(f, "[{}", name),
            Symbol::Field(m) | Symbol::Static(m) | Symbol::Method(m) => write!(f, "{}", m),
        }
    }
}

/// Resolved instance field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSlot {
    /// Declaring class
    pub owner: Arc<str>,
    /// Field name
    pub name: Arc<str>,
    /// Instance slot
    pub slot: usize,
    /// Value type
    pub ty: JitType,
}

/// Resolved static field
#[derive(Debug, Clone)]
pub struct StaticSlot {
    /// Declaring class
    pub class: Arc<Class>,
    /// Static slot of `class`
    pub slot: usize,
}

/// Textual form used by the IR printer
pub trait Describe {
    /// Write a short, deterministic description
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl Describe for Arc<Class> {
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Describe for Arc<Method> {
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Describe for FieldSlot {
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.owner, self.name, self.slot)
    }
}

impl Describe for StaticSlot {
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class.name(), self.slot)
    }
}

/// Lazily resolved reference
pub struct LazyRef<T> {
    index: u16,
    symbol: Symbol,
    cell: OnceCell<T>,
}

/// Reference to a class, field or method used by compiled code
pub enum Handle<T> {
    /// Bound at compile time
    Resolved(T),
    /// Resolved on first execution
    Lazy(Arc<LazyRef<T>>),
}

impl<T> Handle<T> {
    /// A handle bound now
    pub fn resolved(value: T) -> Self {
        Handle::Resolved(value)
    }

    /// A handle that resolves `symbol` (constant pool entry `index`) when
    /// first executed
    pub fn lazy(index: u16, symbol: Symbol) -> Self {
        Handle::Lazy(Arc::new(LazyRef {
            index,
            symbol,
            cell: OnceCell::new(),
        }))
    }

    /// Value if already bound or resolved
    pub fn get(&self) -> Option<&T> {
        match self {
            Handle::Resolved(value) => Some(value),
            Handle::Lazy(lazy) => lazy.cell.get(),
        }
    }

    /// Whether the handle was bound at compile time
    pub fn is_resolved(&self) -> bool {
        matches!(self, Handle::Resolved(_))
    }

    /// Symbolic reference of a lazy handle
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            Handle::Resolved(_) => None,
            Handle::Lazy(lazy) => Some(&lazy.symbol),
        }
    }

    /// Value, resolving it with `resolve` on first use. A failed resolution
    /// is not cached, so the next execution retries.
    pub fn get_or_resolve<E>(&self, resolve: impl FnOnce(&Symbol) -> Result<T, E>) -> Result<&T, E> {
        match self {
            Handle::Resolved(value) => Ok(value),
            Handle::Lazy(lazy) => lazy.cell.get_or_try_init(|| resolve(&lazy.symbol)),
        }
    }
}

impl<T> Clone for Handle<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Handle::Resolved(value) => Handle::Resolved(value.clone()),
            Handle::Lazy(lazy) => Handle::Lazy(lazy.clone()),
        }
    }
}

impl<T: Describe> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Resolved(value) => value.describe(f),
            Handle::Lazy(lazy) => write!(f, "lazy(#{} {})", lazy.index, lazy.symbol),
        }
    }
}

impl<T: Describe> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
