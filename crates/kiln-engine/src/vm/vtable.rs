//! Virtual tables
//!
//! One table per concrete class. The header holds the fixed-position runtime
//! slots (finalizer, deallocation, GC tracing, debug print, identity hash).
//! The method slots follow, indexed by the offsets assigned during class
//! layout. A subclass table starts as a copy of its superclass table and then
//! overwrites the slots its overrides own.
//!
//! The table also carries the class display (ancestor ids from the root down
//! to the class itself) so subclass tests are a single indexed compare.

use std::fmt;
use std::sync::{Arc, Weak};

use rustc_hash::FxHashSet;

use crate::vm::callable::CallableCell;
use crate::vm::class::{Class, ClassId};
use crate::vm::method::Method;
use crate::vm::object::{HeapObject, ObjectBody, ObjectRef};

/// Called when an object is released
pub type DeallocateFn = fn(&HeapObject);

/// Reports every reference held by an object
pub type TraceFn = fn(&HeapObject, &mut dyn FnMut(ObjectRef));

/// Writes a debug rendering of an object
pub type PrintFn = fn(&HeapObject, &mut dyn fmt::Write) -> fmt::Result;

/// Computes an identity hash
pub type HashFn = fn(&HeapObject) -> i32;

/// Fixed-position header slots
#[derive(Clone)]
pub struct VtHeader {
    /// Finalizer method, if the class declares or inherits a non-trivial one
    pub finalizer: Option<Arc<Method>>,
    /// Deallocation hook
    pub deallocate: DeallocateFn,
    /// GC tracing hook
    pub trace: TraceFn,
    /// Debug printing hook
    pub print: PrintFn,
    /// Identity hash hook
    pub hash: HashFn,
}

impl Default for VtHeader {
    fn default() -> Self {
        Self {
            finalizer: None,
            deallocate: default_deallocate,
            trace: default_trace,
            print: default_print,
            hash: default_hash,
        }
    }
}

fn default_deallocate(_obj: &HeapObject) {}

fn default_trace(obj: &HeapObject, visit: &mut dyn FnMut(ObjectRef)) {
    for child in obj.references() {
        visit(child);
    }
}

fn default_print(obj: &HeapObject, out: &mut dyn fmt::Write) -> fmt::Result {
    match obj.body() {
        ObjectBody::Str(s) => write!(out, "{:?}", s),
        ObjectBody::Array { .. } => {
            write!(out, "{}[{}]", obj.class_name(), obj.array_len().unwrap_or(0))
        }
        ObjectBody::Instance(_) => {
            write!(out, "{}@{:x}", obj.class_name(), obj as *const HeapObject as usize)
        }
    }
}

fn default_hash(obj: &HeapObject) -> i32 {
    let addr = obj as *const HeapObject as usize as u64;
    ((addr >> 4) ^ (addr >> 32)) as i32
}

/// A class's virtual table
pub struct VirtualTable {
    class: Weak<Class>,
    class_id: ClassId,
    class_name: Arc<str>,
    display: Box<[ClassId]>,
    interfaces: FxHashSet<ClassId>,
    header: VtHeader,
    slots: Box<[CallableCell<Method>]>,
}

impl VirtualTable {
    pub(crate) fn new(
        class: Weak<Class>,
        class_id: ClassId,
        class_name: Arc<str>,
        display: Vec<ClassId>,
        interfaces: FxHashSet<ClassId>,
        header: VtHeader,
        methods: Vec<Arc<Method>>,
    ) -> Self {
        let slots = methods.into_iter().map(CallableCell::new).collect();
        Self {
            class,
            class_id,
            class_name,
            display: display.into_boxed_slice(),
            interfaces,
            header,
            slots,
        }
    }

    /// Owning class, if still alive
    pub fn class(&self) -> Option<Arc<Class>> {
        self.class.upgrade()
    }

    /// Owning class id
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// Owning class name
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Depth in the class hierarchy (the root class has depth 0)
    pub fn depth(&self) -> usize {
        self.display.len() - 1
    }

    /// Ancestor ids from the root down to this class
    pub fn display(&self) -> &[ClassId] {
        &self.display
    }

    /// Whether this class is `ancestor` or inherits from it
    #[inline]
    pub fn is_subclass_of(&self, ancestor: &VirtualTable) -> bool {
        let depth = ancestor.depth();
        depth < self.display.len() && self.display[depth] == ancestor.class_id
    }

    /// Whether this class implements the interface `id`, directly or not
    #[inline]
    pub fn implements(&self, id: ClassId) -> bool {
        self.interfaces.contains(&id)
    }

    /// All interfaces implemented
    pub fn interfaces(&self) -> &FxHashSet<ClassId> {
        &self.interfaces
    }

    /// Header slots
    pub fn header(&self) -> &VtHeader {
        &self.header
    }

    /// Number of method slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no method slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Method slot at `offset`
    #[inline]
    pub fn slot(&self, offset: usize) -> Option<&CallableCell<Method>> {
        self.slots.get(offset)
    }

    /// Current method at `offset`
    pub fn method(&self, offset: usize) -> Option<Arc<Method>> {
        self.slots.get(offset).map(CallableCell::load)
    }

    /// Every method currently installed, in slot order
    pub fn methods(&self) -> Vec<Arc<Method>> {
        self.slots.iter().map(CallableCell::load).collect()
    }

    /// Replace the method at `offset`; readers see the old or the new one
    pub fn patch(&self, offset: usize, method: Arc<Method>) -> bool {
        match self.slots.get(offset) {
            Some(slot) => {
                slot.store(method);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for VirtualTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTable")
            .field("class", &self.class_name)
            .field("depth", &self.depth())
            .field("slots", &self.slots.len())
            .finish()
    }
}
