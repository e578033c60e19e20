//! Classes, class layout and the class registry
//!
//! Linking a `ClassDef` assigns field slots (superclass fields first) and
//! VirtualTable offsets: an inherited virtual method keeps its offset, an
//! override reuses the offset of the method it overrides, and a new virtual
//! method is appended. Offsets never change once assigned.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::jit::ir::types::JitType;
use crate::vm::descriptor::{DescriptorError, MethodDescriptor, TypeDesc};
use crate::vm::method::{Method, MethodDef};
use crate::vm::object::{instance_size, ElemKind, ObjectRef};
use crate::vm::pool::{ConstantPool, ConstantPoolTable, PoolEntry};
use crate::vm::thread::ThreadId;
use crate::vm::value::Value;
use crate::vm::vtable::{VirtualTable, VtHeader};

/// Name of the root class
pub const OBJECT_CLASS: &str = "java/lang/Object";

/// Name of the string class
pub const STRING_CLASS: &str = "java/lang/String";

/// Registry-unique class identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Loading scope a class belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LoaderId(pub u32);

/// Class flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassFlags(pub u16);

impl ClassFlags {
    /// `public`
    pub const PUBLIC: u16 = 0x0001;
    /// `final`
    pub const FINAL: u16 = 0x0010;
    /// `interface`
    pub const INTERFACE: u16 = 0x0200;
    /// `abstract`
    pub const ABSTRACT: u16 = 0x0400;

    /// Whether every bit of `mask` is set
    #[inline]
    pub fn contains(&self, mask: u16) -> bool {
        self.0 & mask == mask
    }
}

/// Class linking error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// A class with this name already exists
    #[error("class {0} is already defined")]
    Duplicate(String),

    /// Superclass is not loaded
    #[error("superclass {superclass} of {class} is not loaded")]
    UnknownSuperclass {
        /// Class being defined
        class: String,
        /// Missing superclass
        superclass: String,
    },

    /// Only the root class may omit a superclass
    #[error("class {0} has no superclass")]
    MissingSuperclass(String),

    /// A referenced class is not loaded
    #[error("class {0} is not loaded")]
    UnknownClass(String),

    /// Declared interface is a class
    #[error("{0} is not an interface")]
    NotAnInterface(String),

    /// Superclass is an interface
    #[error("{0} is an interface and cannot be extended")]
    NotAClass(String),

    /// Superclass is final
    #[error("cannot extend final class {0}")]
    FinalSuperclass(String),

    /// Override of a final method
    #[error("{class} overrides final method {method}")]
    FinalOverride {
        /// Overriding class
        class: String,
        /// Method name and descriptor
        method: String,
    },

    /// Malformed descriptor
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Field declaration
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field descriptor
    pub descriptor: String,
    /// Static field
    pub is_static: bool,
}

/// Class declaration handed over by the class loader
pub struct ClassDef {
    /// Internal name
    pub name: String,
    /// Superclass name (`None` only for the root class)
    pub superclass: Option<String>,
    /// Directly implemented interfaces
    pub interfaces: Vec<String>,
    /// Class flags
    pub flags: ClassFlags,
    /// Declared fields
    pub fields: Vec<FieldDef>,
    /// Declared methods
    pub methods: Vec<MethodDef>,
    /// Constant pool entries
    pub constants: Vec<PoolEntry>,
    /// Loading scope
    pub loader: LoaderId,
}

impl ClassDef {
    /// A class extending the root class
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: Some(OBJECT_CLASS.to_string()),
            interfaces: Vec::new(),
            flags: ClassFlags(ClassFlags::PUBLIC),
            fields: Vec::new(),
            methods: Vec::new(),
            constants: Vec::new(),
            loader: LoaderId::default(),
        }
    }

    /// An interface
    pub fn interface(name: &str) -> Self {
        let mut def = Self::new(name);
        def.flags = ClassFlags(ClassFlags::PUBLIC | ClassFlags::INTERFACE | ClassFlags::ABSTRACT);
        def
    }

    /// Set the superclass
    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.to_string());
        self
    }

    /// Add an implemented interface
    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    /// Replace the flags
    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = ClassFlags(flags);
        self
    }

    /// Add an instance field
    pub fn field(mut self, name: &str, descriptor: &str) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static: false,
        });
        self
    }

    /// Add a static field
    pub fn static_field(mut self, name: &str, descriptor: &str) -> Self {
        self.fields.push(FieldDef {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static: true,
        });
        self
    }

    /// Add a method
    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Set the constant pool
    pub fn constants(mut self, constants: Vec<PoolEntry>) -> Self {
        self.constants = constants;
        self
    }

    /// Set the loading scope
    pub fn loader(mut self, loader: LoaderId) -> Self {
        self.loader = loader;
        self
    }
}

/// A laid-out field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Declaring class
    pub owner: Arc<str>,
    /// Field name
    pub name: Arc<str>,
    /// Field type
    pub ty: TypeDesc,
    /// Slot index (instance slot or static slot of the owner)
    pub slot: usize,
}

/// What kind of class this is
#[derive(Debug, Clone)]
pub enum ClassKind {
    /// Ordinary class
    Instance,
    /// Interface
    Interface,
    /// Array class
    Array {
        /// Component type
        component: TypeDesc,
        /// Storage kind of elements
        elem: ElemKind,
        /// Component class for reference arrays
        component_class: Option<Arc<Class>>,
    },
}

/// Static initialization progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    /// `<clinit>` has not run
    Uninitialized,
    /// `<clinit>` is running on a thread
    Running(ThreadId),
    /// Ready for use
    Initialized,
    /// `<clinit>` threw
    Failed,
}

/// Initialization state machine shared by all threads
pub struct InitState {
    phase: Mutex<InitPhase>,
    done: Condvar,
}

impl InitState {
    fn new(phase: InitPhase) -> Self {
        Self {
            phase: Mutex::new(phase),
            done: Condvar::new(),
        }
    }

    /// Current phase
    pub fn phase(&self) -> InitPhase {
        *self.phase.lock()
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, InitPhase> {
        self.phase.lock()
    }

    pub(crate) fn wait(&self, guard: &mut parking_lot::MutexGuard<'_, InitPhase>) {
        self.done.wait(guard);
    }

    pub(crate) fn finish(&self, phase: InitPhase) {
        *self.phase.lock() = phase;
        self.done.notify_all();
    }
}

/// A linked class
pub struct Class {
    id: ClassId,
    name: Arc<str>,
    flags: ClassFlags,
    kind: ClassKind,
    loader: LoaderId,
    superclass: Option<Arc<Class>>,
    interfaces: Vec<Arc<Class>>,
    fields: Vec<FieldInfo>,
    field_types: Vec<JitType>,
    statics: Vec<FieldInfo>,
    static_values: Mutex<Vec<Value>>,
    methods: Vec<Arc<Method>>,
    vtable: Arc<VirtualTable>,
    pool: Arc<dyn ConstantPool>,
    init: InitState,
    monitor: OnceCell<ObjectRef>,
}

impl Class {
    /// Class id
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Internal name
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Flags
    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    /// Kind
    pub fn kind(&self) -> &ClassKind {
        &self.kind
    }

    /// Loading scope
    pub fn loader(&self) -> LoaderId {
        self.loader
    }

    /// Superclass
    pub fn superclass(&self) -> Option<&Arc<Class>> {
        self.superclass.as_ref()
    }

    /// Directly implemented interfaces
    pub fn interfaces(&self) -> &[Arc<Class>] {
        &self.interfaces
    }

    /// VirtualTable
    pub fn vtable(&self) -> &Arc<VirtualTable> {
        &self.vtable
    }

    /// Constant pool
    pub fn pool(&self) -> &Arc<dyn ConstantPool> {
        &self.pool
    }

    /// Declared methods
    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    /// All instance fields, inherited first
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// Value types of the instance fields in slot order
    pub fn field_types(&self) -> &[JitType] {
        &self.field_types
    }

    /// Declared static fields
    pub fn static_fields(&self) -> &[FieldInfo] {
        &self.statics
    }

    /// Size of an instance in bytes
    pub fn instance_size(&self) -> usize {
        instance_size(self.fields.len())
    }

    /// Interface class
    pub fn is_interface(&self) -> bool {
        matches!(self.kind, ClassKind::Interface)
    }

    /// Abstract class or interface
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(ClassFlags::ABSTRACT)
    }

    /// Array class
    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::Array { .. })
    }

    /// Element kind of an array class
    pub fn array_elem(&self) -> Option<ElemKind> {
        match &self.kind {
            ClassKind::Array { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    /// Component class of a reference array class
    pub fn component_class(&self) -> Option<&Arc<Class>> {
        match &self.kind {
            ClassKind::Array { component_class, .. } => component_class.as_ref(),
            _ => None,
        }
    }

    /// Initialization state
    pub fn init_state(&self) -> &InitState {
        &self.init
    }

    /// Whether static initialization has completed
    pub fn is_initialized(&self) -> bool {
        self.init.phase() == InitPhase::Initialized
    }

    /// Lock object used by static synchronized methods
    pub fn monitor_object(&self, create: impl FnOnce() -> ObjectRef) -> ObjectRef {
        self.monitor.get_or_init(create).clone()
    }

    /// Read a static field of this class
    pub fn static_value(&self, slot: usize) -> Option<Value> {
        self.static_values.lock().get(slot).cloned()
    }

    /// Write a static field of this class
    pub fn set_static_value(&self, slot: usize, value: Value) -> bool {
        match self.static_values.lock().get_mut(slot) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Method declared by this class
    pub fn declared_method(&self, name: &str, descriptor: &str) -> Option<&Arc<Method>> {
        self.methods
            .iter()
            .find(|m| &**m.name() == name && &**m.descriptor_text() == descriptor)
    }

    /// Method declared by this class or the nearest superclass declaring it
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        if let Some(m) = self.declared_method(name, descriptor) {
            return Some(m.clone());
        }
        if let Some(m) = self.superclass.as_ref().and_then(|s| s.find_method(name, descriptor)) {
            return Some(m);
        }
        self.interfaces
            .iter()
            .find_map(|i| i.find_method(name, descriptor))
    }

    /// Virtual method selected for receivers of exactly this class
    pub fn find_virtual(&self, name: &str, descriptor: &str) -> Option<Arc<Method>> {
        self.vtable
            .methods()
            .into_iter()
            .find(|m| &**m.name() == name && &**m.descriptor_text() == descriptor)
    }

    /// Instance field by name and descriptor
    pub fn find_field(&self, name: &str, descriptor: &str) -> Option<&FieldInfo> {
        self.fields
            .iter()
            .rev()
            .find(|f| &*f.name == name && f.ty.to_string() == descriptor)
    }

    /// Static field by name and descriptor, searching superclasses and
    /// interfaces; returns the declaring class and its slot
    pub fn find_static(self: &Arc<Self>, name: &str, descriptor: &str) -> Option<(Arc<Class>, usize)> {
        if let Some(f) = self
            .statics
            .iter()
            .find(|f| &*f.name == name && f.ty.to_string() == descriptor)
        {
            return Some((self.clone(), f.slot));
        }
        for interface in &self.interfaces {
            if let Some(found) = interface.find_static(name, descriptor) {
                return Some(found);
            }
        }
        self.superclass.as_ref().and_then(|s| s.find_static(name, descriptor))
    }

    /// Whether a value of class `self` may be stored where `target` is expected
    pub fn is_assignable_to(&self, target: &Class) -> bool {
        if self.id == target.id {
            return true;
        }
        match (&self.kind, &target.kind) {
            (_, ClassKind::Interface) => self.vtable.implements(target.id),
            (
                ClassKind::Array { elem: from, component_class: from_class, .. },
                ClassKind::Array { elem: to, component_class: to_class, .. },
            ) => match (from_class, to_class) {
                (Some(from), Some(to)) => from.is_assignable_to(to),
                (None, None) => from == to,
                _ => false,
            },
            (_, ClassKind::Array { .. }) => false,
            _ => self.vtable.is_subclass_of(&target.vtable),
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fields", &self.fields.len())
            .field("vtable", &self.vtable.len())
            .finish()
    }
}

/// All linked classes, keyed by internal name
pub struct ClassRegistry {
    classes: DashMap<Arc<str>, Arc<Class>>,
    next_id: AtomicU32,
}

impl ClassRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classes: DashMap::new(),
            next_id: AtomicU32::new(1),
        })
    }

    /// Number of classes (array classes included)
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class is defined
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Look up a class; array classes are created on demand
    pub fn lookup(&self, name: &str) -> Option<Arc<Class>> {
        if let Some(class) = self.classes.get(name) {
            return Some(class.value().clone());
        }
        if name.starts_with('[') {
            if let Ok(TypeDesc::Array(component)) = TypeDesc::parse(name) {
                return self.array_class(&component).ok();
            }
        }
        None
    }

    /// Link and register a class
    pub fn define(self: &Arc<Self>, def: ClassDef) -> Result<Arc<Class>, LinkError> {
        if self.classes.contains_key(def.name.as_str()) {
            return Err(LinkError::Duplicate(def.name));
        }
        let name: Arc<str> = Arc::from(def.name.as_str());
        let is_interface = def.flags.contains(ClassFlags::INTERFACE);

        let superclass = match &def.superclass {
            Some(super_name) => {
                let superclass = self.lookup(super_name).ok_or_else(|| LinkError::UnknownSuperclass {
                    class: def.name.clone(),
                    superclass: super_name.clone(),
                })?;
                if superclass.is_interface() {
                    return Err(LinkError::NotAClass(super_name.clone()));
                }
                if superclass.flags.contains(ClassFlags::FINAL) {
                    return Err(LinkError::FinalSuperclass(super_name.clone()));
                }
                Some(superclass)
            }
            None if def.name == OBJECT_CLASS => None,
            None => return Err(LinkError::MissingSuperclass(def.name)),
        };

        let mut interfaces = Vec::with_capacity(def.interfaces.len());
        for iname in &def.interfaces {
            let interface = self
                .lookup(iname)
                .ok_or_else(|| LinkError::UnknownClass(iname.clone()))?;
            if !interface.is_interface() {
                return Err(LinkError::NotAnInterface(iname.clone()));
            }
            interfaces.push(interface);
        }

        // Field layout: inherited slots first
        let mut fields = superclass.as_ref().map(|s| s.fields.clone()).unwrap_or_default();
        let mut statics = Vec::new();
        for field in &def.fields {
            let ty = TypeDesc::parse(&field.descriptor)?;
            let target = if field.is_static { &mut statics } else { &mut fields };
            let slot = target.len();
            target.push(FieldInfo {
                owner: name.clone(),
                name: Arc::from(field.name.as_str()),
                ty,
                slot,
            });
        }
        let field_types: Vec<JitType> = fields.iter().map(|f| f.ty.value_type()).collect();
        let static_values = statics.iter().map(|f| Value::zero(f.ty.value_type())).collect();

        // Method layout: overrides reuse the inherited offset
        let mut slots = superclass.as_ref().map(|s| s.vtable.methods()).unwrap_or_default();
        let mut next_offset = slots.len();
        let mut parsed = Vec::with_capacity(def.methods.len());
        for method in def.methods {
            let descriptor = MethodDescriptor::parse(&method.descriptor)?;
            let flags = method.flags;
            let is_virtual = !is_interface
                && !flags.contains(crate::vm::method::MethodFlags::STATIC)
                && !flags.contains(crate::vm::method::MethodFlags::PRIVATE)
                && !method.name.starts_with('<');
            let offset = if is_virtual {
                let inherited = slots.iter().position(|m| {
                    &**m.name() == method.name.as_str() && &**m.descriptor_text() == method.descriptor.as_str()
                });
                match inherited {
                    Some(idx) if slots[idx].flags().contains(crate::vm::method::MethodFlags::FINAL) => {
                        return Err(LinkError::FinalOverride {
                            class: def.name.clone(),
                            method: format!("{}{}", method.name, method.descriptor),
                        });
                    }
                    Some(idx) => Some(idx),
                    None => {
                        next_offset += 1;
                        Some(next_offset - 1)
                    }
                }
            } else {
                None
            };
            parsed.push((method, descriptor, offset));
        }

        let id = ClassId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut display = superclass
            .as_ref()
            .map(|s| s.vtable.display().to_vec())
            .unwrap_or_default();
        display.push(id);

        let mut implemented: FxHashSet<ClassId> = superclass
            .as_ref()
            .map(|s| s.vtable.interfaces().clone())
            .unwrap_or_default();
        for interface in &interfaces {
            implemented.extend(interface.vtable.interfaces().iter().copied());
        }
        if is_interface {
            implemented.insert(id);
        }

        let pool: Arc<dyn ConstantPool> = Arc::new(ConstantPoolTable::new(Arc::downgrade(self), def.constants));
        let loader = def.loader;
        let kind = if is_interface { ClassKind::Interface } else { ClassKind::Instance };

        let class = Arc::new_cyclic(|weak: &Weak<Class>| {
            let methods: Vec<Arc<Method>> = parsed
                .into_iter()
                .map(|(def, descriptor, offset)| {
                    Arc::new(Method::new(def, descriptor, weak.clone(), name.clone(), loader, offset))
                })
                .collect();
            for method in &methods {
                if let Some(offset) = method.vtable_offset() {
                    if offset < slots.len() {
                        slots[offset] = method.clone();
                    } else {
                        slots.push(method.clone());
                    }
                }
            }
            let finalizer = slots
                .iter()
                .find(|m| &**m.name() == "finalize" && &**m.descriptor_text() == "()V")
                .filter(|m| &**m.class_name() != OBJECT_CLASS)
                .cloned();
            let header = VtHeader {
                finalizer,
                ..VtHeader::default()
            };
            let vtable = Arc::new(VirtualTable::new(
                weak.clone(),
                id,
                name.clone(),
                display,
                implemented,
                header,
                slots,
            ));
            Class {
                id,
                name: name.clone(),
                flags: def.flags,
                kind,
                loader,
                superclass,
                interfaces,
                fields,
                field_types,
                statics,
                static_values: Mutex::new(static_values),
                methods,
                vtable,
                pool,
                init: InitState::new(InitPhase::Uninitialized),
                monitor: OnceCell::new(),
            }
        });

        debug!(class = %class.name, id = id.0, vtable = class.vtable.len(), "linked class");
        self.classes.insert(name, class.clone());
        Ok(class)
    }

    /// Array class with the given component type
    pub fn array_class(&self, component: &TypeDesc) -> Result<Arc<Class>, LinkError> {
        let name: Arc<str> = Arc::from(format!("[{}", component));
        if let Some(class) = self.classes.get(&*name) {
            return Ok(class.value().clone());
        }
        let object = self
            .lookup(OBJECT_CLASS)
            .ok_or_else(|| LinkError::UnknownClass(OBJECT_CLASS.to_string()))?;
        let component_class = match component {
            TypeDesc::Object(cname) => Some(
                self.lookup(cname)
                    .ok_or_else(|| LinkError::UnknownClass(cname.to_string()))?,
            ),
            TypeDesc::Array(inner) => Some(self.array_class(inner)?),
            _ => None,
        };

        let id = ClassId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let display = vec![object.id, id];
        let slots = object.vtable.methods();
        let kind = ClassKind::Array {
            component: component.clone(),
            elem: component.elem_kind(),
            component_class,
        };
        let class = Arc::new_cyclic(|weak: &Weak<Class>| Class {
            id,
            name: name.clone(),
            flags: ClassFlags(ClassFlags::PUBLIC | ClassFlags::FINAL),
            kind,
            loader: object.loader,
            vtable: Arc::new(VirtualTable::new(
                weak.clone(),
                id,
                name.clone(),
                display,
                FxHashSet::default(),
                VtHeader::default(),
                slots,
            )),
            superclass: Some(object.clone()),
            interfaces: Vec::new(),
            fields: Vec::new(),
            field_types: Vec::new(),
            statics: Vec::new(),
            static_values: Mutex::new(Vec::new()),
            methods: Vec::new(),
            pool: Arc::new(ConstantPoolTable::new(Weak::new(), Vec::new())),
            init: InitState::new(InitPhase::Initialized),
            monitor: OnceCell::new(),
        });
        let entry = self.classes.entry(name).or_insert(class);
        Ok(entry.value().clone())
    }

    /// Snapshot of every registered class
    pub fn classes(&self) -> Vec<Arc<Class>> {
        self.classes.iter().map(|entry| entry.value().clone()).collect()
    }
}
