//! FrameWalker
//!
//! A lazy cursor over a thread's frames, from the innermost frame toward the
//! thread's stack base. The cursor reads the thread's shadow frame stack one
//! step at a time, so frames pushed or popped between steps are seen as they
//! are. Walking past the oldest frame (the base) leaves the cursor Invalid;
//! it never fails.

use std::fmt;
use std::sync::Arc;

use crate::jit::compiler::CompiledMethod;
use crate::vm::method::{Method, MethodEntry};
use crate::vm::thread::{FrameRecord, VmThread};

/// How much is known about a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Runtime or library code without metadata
    Opaque,
    /// Native code bracketed by the bridge
    Known,
    /// Compiled managed code with a stack map
    Metadata,
}

/// Cursor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkerState {
    /// Past either end of the stack
    Invalid,
    /// On a frame without compiler metadata
    Valid,
    /// On a managed frame
    ValidWithMetadata,
}

/// One frame as seen by the walker
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// Classification
    pub class: FrameClass,
    /// Method running in the frame, if any
    pub method: Option<Arc<Method>>,
    /// Bytecode offset (managed frames)
    pub pc: u32,
    /// Source line of `pc`
    pub line: Option<u32>,
    /// Native stack pointer at frame entry
    pub address: usize,
    /// Position on the shadow stack (0 is the oldest frame)
    pub index: usize,
    /// Label of an opaque frame
    pub label: Option<&'static str>,
}

impl FrameInfo {
    /// Compiled code of a managed frame, which holds its stack maps
    pub fn compiled(&self) -> Option<Arc<CompiledMethod>> {
        let method = self.method.as_ref()?;
        match &*method.entry().load() {
            MethodEntry::Compiled(code) => Some(code.clone()),
            _ => None,
        }
    }

    /// Trace element for this frame, `None` for opaque frames
    pub fn trace_element(&self) -> Option<StackTraceElement> {
        let method = self.method.as_ref()?;
        Some(StackTraceElement {
            class: method.class_name().clone(),
            method: method.name().clone(),
            pc: (self.class == FrameClass::Metadata).then_some(self.pc),
            line: self.line,
            native: self.class == FrameClass::Known,
        })
    }
}

/// One line of a stack trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceElement {
    /// Declaring class
    pub class: Arc<str>,
    /// Method name
    pub method: Arc<str>,
    /// Bytecode offset, for managed frames
    pub pc: Option<u32>,
    /// Source line
    pub line: Option<u32>,
    /// Native method frame
    pub native: bool,
}

impl fmt::Display for StackTraceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}.{}", self.class.replace('/', "."), self.method)?;
        match (self.native, self.line, self.pc) {
            (true, _, _) => write!(f, "(Native Method)"),
            (false, Some(line), _) => write!(f, "(line {})", line),
            (false, None, Some(pc)) => write!(f, "(pc {})", pc),
            (false, None, None) => write!(f, "(Unknown Source)"),
        }
    }
}

/// Cursor over a thread's frames
pub struct FrameWalker<'t> {
    thread: &'t VmThread,
    /// Shadow-stack index; `None` past the base
    index: Option<usize>,
    only_metadata: bool,
}

impl<'t> FrameWalker<'t> {
    /// Cursor positioned at the thread's innermost frame
    pub fn begin(thread: &'t VmThread, only_metadata: bool) -> Self {
        let mut walker = Self {
            thread,
            index: None,
            only_metadata,
        };
        walker.reset();
        walker
    }

    /// Reposition at the innermost frame. Kept out of line so the frame
    /// performing the reset is a real call boundary.
    #[inline(never)]
    pub fn reset(&mut self) {
        let top = self.thread.frame_count().checked_sub(1);
        self.index = top;
        self.settle_down();
    }

    fn accepts(&self, record: &FrameRecord) -> bool {
        !self.only_metadata || matches!(record, FrameRecord::Managed { .. })
    }

    fn settle_down(&mut self) {
        while let Some(index) = self.index {
            match self.thread.frame_at(index) {
                Some(record) if self.accepts(&record) => return,
                Some(_) => self.index = index.checked_sub(1),
                // The stack shrank under us: resume from the new top
                None => self.index = self.thread.frame_count().checked_sub(1),
            }
        }
    }

    /// Move one frame toward the stack base
    pub fn advance(&mut self) {
        if let Some(index) = self.index {
            self.index = index.checked_sub(1);
            self.settle_down();
        }
    }

    /// Move one frame toward the innermost frame. From the Invalid state past
    /// the base this re-enters at the oldest frame.
    pub fn retreat(&mut self) {
        let len = self.thread.frame_count();
        let mut next = match self.index {
            Some(index) => index + 1,
            None => 0,
        };
        while next < len {
            match self.thread.frame_at(next) {
                Some(record) if self.accepts(&record) => {
                    self.index = Some(next);
                    return;
                }
                Some(_) => next += 1,
                None => break,
            }
        }
        // Past the top: stay on the innermost accepted frame
    }

    /// Frame under the cursor
    pub fn current(&self) -> Option<FrameInfo> {
        let index = self.index?;
        let record = self.thread.frame_at(index)?;
        Some(match record {
            FrameRecord::Managed { method, pc, sp } => FrameInfo {
                class: FrameClass::Metadata,
                line: method.line_for(pc),
                method: Some(method),
                pc,
                address: sp,
                index,
                label: None,
            },
            FrameRecord::Known { method, sp, .. } => FrameInfo {
                class: FrameClass::Known,
                method,
                pc: 0,
                line: None,
                address: sp,
                index,
                label: None,
            },
            FrameRecord::Opaque { label, sp } => FrameInfo {
                class: FrameClass::Opaque,
                method: None,
                pc: 0,
                line: None,
                address: sp,
                index,
                label: Some(label),
            },
        })
    }

    /// Cursor state
    pub fn state(&self) -> WalkerState {
        match self.current() {
            None => WalkerState::Invalid,
            Some(info) if info.class == FrameClass::Metadata => WalkerState::ValidWithMetadata,
            Some(_) => WalkerState::Valid,
        }
    }

    /// Thread being walked
    pub fn thread(&self) -> &'t VmThread {
        self.thread
    }

    fn address(&self) -> Option<usize> {
        self.current().map(|info| info.address)
    }
}

impl PartialEq for FrameWalker<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.thread, other.thread) && self.index == other.index && self.address() == other.address()
    }
}

impl Iterator for FrameWalker<'_> {
    type Item = FrameInfo;

    fn next(&mut self) -> Option<FrameInfo> {
        let info = self.current()?;
        self.advance();
        Some(info)
    }
}

/// Trace of the thread's current stack, innermost first
pub fn capture_stack_trace(thread: &VmThread) -> Vec<StackTraceElement> {
    FrameWalker::begin(thread, false)
        .filter_map(|info| info.trace_element())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::LoaderId;
    use crate::vm::descriptor::MethodDescriptor;
    use crate::vm::method::{Code, MethodDef, MethodFlags};
    use crate::vm::runtime::IsolateId;
    use crate::vm::safepoint::Rendezvous;
    use crate::vm::thread::{current_sp, ThreadId};
    use std::sync::Weak;

    fn thread() -> VmThread {
        VmThread::new(ThreadId(1), "walker".to_string(), IsolateId(0), current_sp(), 0, Arc::new(Rendezvous::new(None)))
    }

    fn method(name: &str) -> Arc<Method> {
        let code = Code::new(vec![0; 8], 0, 0).with_lines(vec![(0, 10), (4, 11)]);
        Arc::new(Method::new(
            MethodDef::bytecode(name, "()V", MethodFlags::STATIC, code),
            MethodDescriptor::parse("()V").unwrap(),
            Weak::new(),
            Arc::from("pkg/Main"),
            LoaderId(0),
            None,
        ))
    }

    #[test]
    fn test_walk_classifies_frames() {
        let t = thread();
        let _a = t.push_managed(method("a"));
        t.set_pc(5);
        let _n = t.push_known(None);
        let _o = t.push_opaque("class initializer");
        let _b = t.push_managed(method("b"));

        let classes: Vec<FrameClass> = FrameWalker::begin(&t, false).map(|f| f.class).collect();
        assert_eq!(
            classes,
            vec![FrameClass::Metadata, FrameClass::Opaque, FrameClass::Known, FrameClass::Metadata]
        );

        let managed: Vec<FrameInfo> = FrameWalker::begin(&t, true).collect();
        assert_eq!(managed.len(), 2);
        assert_eq!(&**managed[1].method.as_ref().unwrap().name(), "a");
        assert_eq!(managed[1].line, Some(11));
    }

    #[test]
    fn test_empty_stack_is_invalid() {
        let t = thread();
        let mut walker = FrameWalker::begin(&t, false);
        assert_eq!(walker.state(), WalkerState::Invalid);
        assert!(walker.current().is_none());
        walker.advance();
        assert_eq!(walker.state(), WalkerState::Invalid);
    }

    #[test]
    fn test_advance_retreat_and_equality() {
        let t = thread();
        let _a = t.push_managed(method("a"));
        let _n = t.push_known(None);
        let top = FrameWalker::begin(&t, false);
        let mut walker = FrameWalker::begin(&t, false);
        assert!(walker == top);
        assert_eq!(walker.state(), WalkerState::Valid);

        walker.advance();
        assert_eq!(walker.state(), WalkerState::ValidWithMetadata);
        assert!(walker != top);
        walker.advance();
        assert_eq!(walker.state(), WalkerState::Invalid);

        walker.retreat();
        assert_eq!(walker.state(), WalkerState::ValidWithMetadata);
        walker.retreat();
        assert!(walker == top);
        // Already innermost
        walker.retreat();
        assert!(walker == top);
    }

    #[test]
    fn test_trace_skips_opaque_frames() {
        let t = thread();
        let _a = t.push_managed(method("main"));
        t.set_pc(0);
        let _o = t.push_opaque("helper");
        let _n = t.push_known(Some(method("print")));
        let trace = capture_stack_trace(&t);
        assert_eq!(trace.len(), 2);
        assert!(trace[0].native);
        assert_eq!(trace[0].to_string(), "at pkg.Main.print(Native Method)");
        assert_eq!(trace[1].to_string(), "at pkg.Main.main(line 10)");
    }
}
