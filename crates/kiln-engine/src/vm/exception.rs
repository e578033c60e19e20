//! Exception chain
//!
//! Each thread owns one `ExceptionChain`: a stack of records describing the
//! protected regions currently active on its call stack. An
//! `ExceptionBuffer` is the scoped handle for one record. Creating it links
//! the record in; dropping it (normal return, exception propagation or an
//! early `?`) unlinks it, so the chain always mirrors the dynamic nesting of
//! protected regions.
//!
//! Managed exceptions themselves travel as `ExecError::Throw` results; the
//! chain is what lets tooling see where they will land.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::vm::method::Method;
use crate::vm::object::ObjectRef;
use crate::vm::runtime::IsolateId;
use crate::vm::VmError;

/// Outcome of running managed code that did not return normally
pub enum ExecError {
    /// A managed exception is propagating
    Throw(ObjectRef),
    /// The runtime failed
    Fatal(VmError),
}

impl From<VmError> for ExecError {
    fn from(err: VmError) -> Self {
        ExecError::Fatal(err)
    }
}

impl fmt::Debug for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Throw(exception) => write!(f, "Throw({})", exception.class_name()),
            ExecError::Fatal(err) => write!(f, "Fatal({})", err),
        }
    }
}

/// Managed execution result
pub type ExecResult<T> = Result<T, ExecError>;

/// One active protected region
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    /// Method owning the handler
    pub handler: Option<Arc<Method>>,
    /// Isolate that owns the handler
    pub isolate: IsolateId,
    /// Record that was active before this one
    pub previous: Option<usize>,
    /// Shadow-stack index of the frame that installed the region
    pub frame_index: usize,
}

#[derive(Default)]
struct ChainState {
    records: Vec<ExceptionRecord>,
    head: Option<usize>,
}

/// Per-thread chain of exception buffers
#[derive(Default)]
pub struct ExceptionChain {
    state: Mutex<ChainState>,
}

impl ExceptionChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self, handler: Option<Arc<Method>>, isolate: IsolateId, frame_index: usize) -> usize {
        let mut state = self.state.lock();
        let index = state.records.len();
        let previous = state.head;
        state.records.push(ExceptionRecord {
            handler,
            isolate,
            previous,
            frame_index,
        });
        state.head = Some(index);
        index
    }

    fn unlink(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get(index) {
            state.head = record.previous;
        }
        state.records.truncate(index);
    }

    /// Number of regions reachable from the head
    pub fn depth(&self) -> usize {
        self.records().len()
    }

    /// Innermost active record
    pub fn head(&self) -> Option<ExceptionRecord> {
        let state = self.state.lock();
        state.head.and_then(|i| state.records.get(i).cloned())
    }

    /// Active records, innermost first
    pub fn records(&self) -> Vec<ExceptionRecord> {
        let state = self.state.lock();
        let mut out = Vec::new();
        let mut cursor = state.head;
        while let Some(index) = cursor {
            match state.records.get(index) {
                Some(record) => {
                    out.push(record.clone());
                    cursor = record.previous;
                }
                None => break,
            }
        }
        out
    }

    /// Innermost record installed by the frame at `frame_index` or below it
    pub fn nearest(&self, frame_index: usize) -> Option<ExceptionRecord> {
        self.records().into_iter().find(|r| r.frame_index <= frame_index)
    }
}

/// Scoped exception buffer; unlinks its record on drop
pub struct ExceptionBuffer<'a> {
    chain: &'a ExceptionChain,
    index: usize,
}

impl<'a> ExceptionBuffer<'a> {
    /// Link a new record at the head of `chain`
    pub fn push(
        chain: &'a ExceptionChain,
        handler: Option<Arc<Method>>,
        isolate: IsolateId,
        frame_index: usize,
    ) -> Self {
        let index = chain.link(handler, isolate, frame_index);
        Self { chain, index }
    }

    fn record(&self) -> Option<ExceptionRecord> {
        self.chain.state.lock().records.get(self.index).cloned()
    }

    /// Method whose handlers this buffer guards
    pub fn handler(&self) -> Option<Arc<Method>> {
        self.record().and_then(|r| r.handler)
    }

    /// Isolate that owns the handler
    pub fn isolate(&self) -> Option<IsolateId> {
        self.record().map(|r| r.isolate)
    }

    /// Buffer that was active before this one
    pub fn previous(&self) -> Option<ExceptionRecord> {
        let state = self.chain.state.lock();
        let previous = state.records.get(self.index)?.previous?;
        state.records.get(previous).cloned()
    }

    /// Relink this buffer so that dropping it restores `previous` instead.
    /// `previous` must be an older record or `None`.
    pub fn set_previous(&self, previous: Option<usize>) {
        let mut state = self.chain.state.lock();
        let valid = previous.is_none_or(|p| p < self.index);
        if let (true, Some(record)) = (valid, state.records.get_mut(self.index)) {
            record.previous = previous;
        }
    }

    /// Position of this buffer in the chain storage
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for ExceptionBuffer<'_> {
    fn drop(&mut self) {
        self.chain.unlink(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_symmetry() {
        let chain = ExceptionChain::new();
        assert_eq!(chain.depth(), 0);
        {
            let outer = ExceptionBuffer::push(&chain, None, IsolateId(0), 0);
            assert_eq!(chain.depth(), 1);
            {
                let inner = ExceptionBuffer::push(&chain, None, IsolateId(1), 3);
                assert_eq!(chain.depth(), 2);
                assert_eq!(inner.previous().unwrap().frame_index, 0);
                assert_eq!(inner.isolate(), Some(IsolateId(1)));
                assert_eq!(chain.head().unwrap().frame_index, 3);
            }
            assert_eq!(chain.depth(), 1);
            assert!(outer.previous().is_none());
        }
        assert_eq!(chain.depth(), 0);
        assert!(chain.head().is_none());
    }

    #[test]
    fn test_pop_on_early_return() {
        fn guarded(chain: &ExceptionChain, fail: bool) -> Result<(), ()> {
            let _buffer = ExceptionBuffer::push(chain, None, IsolateId(0), 1);
            if fail {
                return Err(());
            }
            Ok(())
        }
        let chain = ExceptionChain::new();
        assert!(guarded(&chain, true).is_err());
        assert_eq!(chain.depth(), 0);
        assert!(guarded(&chain, false).is_ok());
        assert_eq!(chain.depth(), 0);
    }

    #[test]
    fn test_set_previous_skips_buffers() {
        let chain = ExceptionChain::new();
        let a = ExceptionBuffer::push(&chain, None, IsolateId(0), 0);
        let _b = ExceptionBuffer::push(&chain, None, IsolateId(0), 1);
        let c = ExceptionBuffer::push(&chain, None, IsolateId(0), 2);
        c.set_previous(Some(a.index()));
        assert_eq!(chain.depth(), 2);
        assert_eq!(c.previous().unwrap().frame_index, 0);
        // A newer record is never accepted as previous
        c.set_previous(Some(c.index() + 1));
        assert_eq!(c.previous().unwrap().frame_index, 0);
    }

    #[test]
    fn test_nearest_by_frame() {
        let chain = ExceptionChain::new();
        let _a = ExceptionBuffer::push(&chain, None, IsolateId(0), 2);
        let _b = ExceptionBuffer::push(&chain, None, IsolateId(0), 5);
        assert_eq!(chain.nearest(9).unwrap().frame_index, 5);
        assert_eq!(chain.nearest(4).unwrap().frame_index, 2);
        assert!(chain.nearest(1).is_none());
    }
}
