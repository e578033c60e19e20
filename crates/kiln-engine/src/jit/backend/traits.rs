//! Backend-agnostic code generation traits
//!
//! A backend turns a `Function` in the numeric subset into machine code
//! placed in memory it manages:
//!
//!   Function → compile_function() → ExecutableCode
//!
//! Compiled code follows one entry ABI:
//!
//! ```text
//! extern "C" fn(thread: *const VmThread, args: *const u64, ret: *mut u64) -> u32
//! ```
//!
//! Arguments and the return value travel as raw bits in 64-bit cells. A
//! status of 0 means the method returned; `n > 0` means it raised at
//! `raise_sites[n - 1]`.

use std::any::Any;
use std::sync::Arc;

use crate::jit::ir::Function;
use crate::vm::exceptions::ExceptionKind;

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    /// x86-64
    X86_64,
    /// 64-bit ARM
    AArch64,
    /// Anything else the host reports
    Other,
}

/// Target information
#[derive(Debug, Clone)]
pub struct TargetInfo {
    /// Architecture
    pub arch: TargetArch,
    /// Pointer width in bytes
    pub pointer_size: usize,
}

/// Error during code generation
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The backend failed
    #[error("backend error: {0}")]
    BackendError(String),
    /// The function uses something the backend cannot lower
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),
    /// Declaring, defining or finalizing the function in the code module failed
    #[error("code module: {0}")]
    Module(String),
}

/// A fault the compiled code reports through its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaiseSite {
    /// Exception kind
    pub kind: ExceptionKind,
    /// Static detail message
    pub detail: Option<Arc<str>>,
}

/// Entry point signature of compiled code
pub type EntryFn = unsafe extern "C" fn(thread: *const u8, args: *const u64, ret: *mut u64) -> u32;

/// Machine code ready to run
///
/// The code lives in memory owned by the backend's module; `owner` keeps
/// that memory mapped for as long as this value exists.
pub struct ExecutableCode {
    ptr: *const u8,
    size: usize,
    raise_sites: Vec<RaiseSite>,
    _owner: Arc<dyn Any + Send + Sync>,
}

// SAFETY: the code is immutable once finalized and `owner` is Send + Sync
unsafe impl Send for ExecutableCode {}
unsafe impl Sync for ExecutableCode {}

impl ExecutableCode {
    /// Wrap finalized code at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must point at `size` bytes of finalized code compiled for the
    /// entry ABI, and must stay valid while `owner` is alive.
    #[cfg_attr(not(feature = "jit"), allow(dead_code))]
    pub(crate) unsafe fn new(
        ptr: *const u8,
        size: usize,
        raise_sites: Vec<RaiseSite>,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            size,
            raise_sites,
            _owner: owner,
        }
    }

    /// Start of the code
    pub fn code_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Size of the code region in bytes
    pub fn code_size(&self) -> usize {
        self.size
    }

    /// Fault reported by `status`
    pub fn raise_site(&self, status: u32) -> Option<&RaiseSite> {
        (status as usize).checked_sub(1).and_then(|i| self.raise_sites.get(i))
    }

    /// Entry point
    pub fn entry(&self) -> EntryFn {
        // SAFETY: `new` requires finalized entry-ABI code kept alive by `owner`
        unsafe { std::mem::transmute::<*const u8, EntryFn>(self.ptr) }
    }
}

impl std::fmt::Debug for ExecutableCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableCode")
            .field("code_ptr", &self.code_ptr())
            .field("code_size", &self.code_size())
            .field("raise_sites", &self.raise_sites.len())
            .finish()
    }
}

/// The backend-agnostic code generation trait
pub trait CodegenBackend: Send + Sync {
    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Compile a numeric-subset function and place it in executable memory
    fn compile_function(&self, func: &Function) -> Result<ExecutableCode, CodegenError>;

    /// Target architecture information
    fn target_info(&self) -> TargetInfo;
}
