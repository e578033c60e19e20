//! Methods, their bytecode bodies and their patchable entry points

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::jit::compiler::CompiledMethod;
use crate::vm::callable::CallableCell;
use crate::vm::class::{Class, LoaderId};
use crate::vm::descriptor::MethodDescriptor;
use crate::vm::native::NativeFn;

static NEXT_METHOD_ID: AtomicU32 = AtomicU32::new(1);

/// Process-wide unique method identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl MethodId {
    fn next() -> Self {
        MethodId(NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Method access and property flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodFlags(pub u16);

impl MethodFlags {
    /// `public`
    pub const PUBLIC: u16 = 0x0001;
    /// `private`
    pub const PRIVATE: u16 = 0x0002;
    /// `static`
    pub const STATIC: u16 = 0x0008;
    /// `final`
    pub const FINAL: u16 = 0x0010;
    /// `synchronized`
    pub const SYNCHRONIZED: u16 = 0x0020;
    /// `native`
    pub const NATIVE: u16 = 0x0100;
    /// `abstract`
    pub const ABSTRACT: u16 = 0x0400;
    /// Callers may expand this method inline
    pub const INLINE: u16 = 0x8000;

    /// Whether every bit of `mask` is set
    #[inline]
    pub fn contains(&self, mask: u16) -> bool {
        self.0 & mask == mask
    }
}

/// One row of a method's exception table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First protected bytecode offset
    pub start_pc: u32,
    /// One past the last protected offset
    pub end_pc: u32,
    /// Handler entry offset
    pub handler_pc: u32,
    /// Constant-pool class index of the caught type; `None` catches everything
    pub catch_type: Option<u16>,
}

impl ExceptionHandler {
    /// Whether `pc` is inside the protected range
    #[inline]
    pub fn covers(&self, pc: u32) -> bool {
        self.start_pc <= pc && pc < self.end_pc
    }
}

/// A method body
#[derive(Debug, Clone)]
pub struct Code {
    /// Raw bytecode
    pub bytecode: Arc<[u8]>,
    /// Local variable slots (arguments included)
    pub max_locals: u16,
    /// Operand stack depth
    pub max_stack: u16,
    /// Exception table in priority order
    pub handlers: Vec<ExceptionHandler>,
    /// `(start_pc, line)` pairs sorted by `start_pc`
    pub lines: Vec<(u32, u32)>,
}

impl Code {
    /// Body with no handlers and no line table
    pub fn new(bytecode: Vec<u8>, max_locals: u16, max_stack: u16) -> Self {
        Self {
            bytecode: Arc::from(bytecode),
            max_locals,
            max_stack,
            handlers: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Add an exception table row
    pub fn with_handler(mut self, handler: ExceptionHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Attach a line table
    pub fn with_lines(mut self, mut lines: Vec<(u32, u32)>) -> Self {
        lines.sort_unstable();
        self.lines = lines;
        self
    }

    /// Source line of the instruction at `pc`
    pub fn line_for(&self, pc: u32) -> Option<u32> {
        let idx = self.lines.partition_point(|(start, _)| *start <= pc);
        idx.checked_sub(1).map(|i| self.lines[i].1)
    }
}

/// What a call to a method currently runs
pub enum MethodEntry {
    /// Not compiled yet; the first call compiles and patches the entry
    Stub,
    /// Compiled code
    Compiled(Arc<CompiledMethod>),
    /// Native implementation reached through the native bridge
    Native(NativeFn),
    /// No implementation
    Abstract,
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodEntry::Stub => write!(f, "Stub"),
            MethodEntry::Compiled(code) => write!(f, "Compiled({} blocks)", code.function().blocks.len()),
            MethodEntry::Native(_) => write!(f, "Native"),
            MethodEntry::Abstract => write!(f, "Abstract"),
        }
    }
}

/// Method declaration handed to the class registry
pub struct MethodDef {
    /// Simple name
    pub name: String,
    /// Method descriptor text
    pub descriptor: String,
    /// Access flags
    pub flags: MethodFlags,
    /// Bytecode body
    pub code: Option<Code>,
    /// Native implementation
    pub native: Option<NativeFn>,
}

impl MethodDef {
    /// A bytecode method
    pub fn bytecode(name: &str, descriptor: &str, flags: u16, code: Code) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags: MethodFlags(flags),
            code: Some(code),
            native: None,
        }
    }

    /// A native method
    pub fn native(name: &str, descriptor: &str, flags: u16, native: NativeFn) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags: MethodFlags(flags | MethodFlags::NATIVE),
            code: None,
            native: Some(native),
        }
    }

    /// An abstract method
    pub fn abstract_method(name: &str, descriptor: &str, flags: u16) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            flags: MethodFlags(flags | MethodFlags::ABSTRACT),
            code: None,
            native: None,
        }
    }
}

/// A linked method
pub struct Method {
    id: MethodId,
    owner: Weak<Class>,
    class_name: Arc<str>,
    name: Arc<str>,
    descriptor_text: Arc<str>,
    descriptor: MethodDescriptor,
    flags: MethodFlags,
    code: Option<Code>,
    loader: LoaderId,
    vtable_offset: Option<usize>,
    entry: CallableCell<MethodEntry>,
}

impl Method {
    pub(crate) fn new(
        def: MethodDef,
        descriptor: MethodDescriptor,
        owner: Weak<Class>,
        class_name: Arc<str>,
        loader: LoaderId,
        vtable_offset: Option<usize>,
    ) -> Self {
        let entry = match (&def.native, &def.code) {
            (Some(native), _) => MethodEntry::Native(native.clone()),
            (None, Some(_)) => MethodEntry::Stub,
            (None, None) => MethodEntry::Abstract,
        };
        Self {
            id: MethodId::next(),
            owner,
            class_name,
            name: Arc::from(def.name),
            descriptor_text: Arc::from(def.descriptor),
            descriptor,
            flags: def.flags,
            code: def.code,
            loader,
            vtable_offset,
            entry: CallableCell::new(Arc::new(entry)),
        }
    }

    /// Unique id
    pub fn id(&self) -> MethodId {
        self.id
    }

    /// Declaring class, if still alive
    pub fn owner(&self) -> Option<Arc<Class>> {
        self.owner.upgrade()
    }

    /// Declaring class name
    pub fn class_name(&self) -> &Arc<str> {
        &self.class_name
    }

    /// Simple name
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Descriptor text
    pub fn descriptor_text(&self) -> &Arc<str> {
        &self.descriptor_text
    }

    /// Parsed descriptor
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    /// Flags
    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    /// Bytecode body
    pub fn code(&self) -> Option<&Code> {
        self.code.as_ref()
    }

    /// Loading scope of the declaring class
    pub fn loader(&self) -> LoaderId {
        self.loader
    }

    /// VirtualTable offset of a virtual method
    pub fn vtable_offset(&self) -> Option<usize> {
        self.vtable_offset
    }

    /// Patchable entry point
    pub fn entry(&self) -> &CallableCell<MethodEntry> {
        &self.entry
    }

    /// `static`
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// `synchronized`
    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    /// `native`
    pub fn is_native(&self) -> bool {
        self.flags.contains(MethodFlags::NATIVE)
    }

    /// `abstract`
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodFlags::ABSTRACT)
    }

    /// `final` or `private`: no override can exist
    pub fn is_final(&self) -> bool {
        self.flags.contains(MethodFlags::FINAL) || self.flags.contains(MethodFlags::PRIVATE)
    }

    /// Dispatched through the VirtualTable
    pub fn is_virtual(&self) -> bool {
        self.vtable_offset.is_some()
    }

    /// Whether callers may expand this method inline: it is marked for
    /// inlining, has a plain bytecode body with no exception table, and is not
    /// synchronized
    pub fn is_inlinable(&self, max_len: usize) -> bool {
        if !self.flags.contains(MethodFlags::INLINE) || self.is_synchronized() || self.is_native() {
            return false;
        }
        match &self.code {
            Some(code) => code.handlers.is_empty() && code.bytecode.len() <= max_len,
            None => false,
        }
    }

    /// Argument slots including the receiver
    pub fn arg_slots(&self) -> usize {
        self.descriptor.arg_slots() + usize::from(!self.is_static())
    }

    /// Source line of `pc`
    pub fn line_for(&self, pc: u32) -> Option<u32> {
        self.code.as_ref().and_then(|code| code.line_for(pc))
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.name, self.descriptor_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(flags: u16, code: Option<Code>) -> Method {
        let def = MethodDef {
            name: "m".to_string(),
            descriptor: "(IJ)I".to_string(),
            flags: MethodFlags(flags),
            code,
            native: None,
        };
        let desc = MethodDescriptor::parse("(IJ)I").unwrap();
        Method::new(def, desc, Weak::new(), Arc::from("T"), LoaderId(0), None)
    }

    #[test]
    fn test_line_lookup() {
        let code = Code::new(vec![0; 10], 0, 0).with_lines(vec![(4, 20), (0, 10)]);
        assert_eq!(code.line_for(0), Some(10));
        assert_eq!(code.line_for(3), Some(10));
        assert_eq!(code.line_for(4), Some(20));
        assert_eq!(code.line_for(9), Some(20));
        assert_eq!(Code::new(vec![0], 0, 0).line_for(0), None);
    }

    #[test]
    fn test_handler_range() {
        let h = ExceptionHandler { start_pc: 2, end_pc: 5, handler_pc: 9, catch_type: None };
        assert!(!h.covers(1));
        assert!(h.covers(2));
        assert!(h.covers(4));
        assert!(!h.covers(5));
    }

    #[test]
    fn test_inlinable_rules() {
        let small = Code::new(vec![0; 4], 1, 1);
        assert!(method(MethodFlags::INLINE | MethodFlags::STATIC, Some(small.clone())).is_inlinable(35));
        assert!(!method(MethodFlags::STATIC, Some(small.clone())).is_inlinable(35));
        assert!(!method(MethodFlags::INLINE | MethodFlags::SYNCHRONIZED, Some(small.clone())).is_inlinable(35));
        assert!(!method(MethodFlags::INLINE, Some(small.clone())).is_inlinable(2));
        let guarded = small.with_handler(ExceptionHandler { start_pc: 0, end_pc: 1, handler_pc: 2, catch_type: None });
        assert!(!method(MethodFlags::INLINE, Some(guarded)).is_inlinable(35));
    }

    #[test]
    fn test_arg_slots_and_entry() {
        let m = method(0, Some(Code::new(vec![0], 0, 0)));
        assert_eq!(m.arg_slots(), 4);
        assert!(matches!(*m.entry().load(), MethodEntry::Stub));
        let s = method(MethodFlags::STATIC | MethodFlags::ABSTRACT, None);
        assert_eq!(s.arg_slots(), 3);
        assert!(matches!(*s.entry().load(), MethodEntry::Abstract));
    }
}
