//! Kiln VM runtime
//!
//! This module provides the runtime half of the execution core:
//! - Object model, class layout and VirtualTables
//! - Threads, the shadow frame stack and the FrameWalker
//! - ExceptionChain and the standard exception hierarchy
//! - Safepoint rendezvous and thin/fat monitors
//! - Inline caches for interface dispatch
//! - The native bridge and the `Runtime` facade

pub mod bootstrap;
pub mod callable;
pub mod class;
pub mod descriptor;
pub mod dispatch;
pub mod exception;
pub mod exceptions;
pub mod frames;
pub mod gc;
pub mod heap;
pub mod method;
pub mod monitor;
pub mod native;
pub mod object;
pub mod pool;
pub mod runtime;
pub mod safepoint;
pub mod thread;
pub mod value;
pub mod vtable;

pub use callable::CallableCell;
pub use class::{Class, ClassDef, ClassFlags, ClassId, ClassKind, ClassRegistry, FieldInfo, LinkError, LoaderId};
pub use descriptor::{DescriptorError, MethodDescriptor, TypeDesc};
pub use dispatch::{CacheNode, Enveloppe};
pub use exception::{ExceptionBuffer, ExceptionChain, ExceptionRecord, ExecError, ExecResult};
pub use exceptions::{ExceptionFactory, ExceptionKind, StandardExceptions};
pub use frames::{capture_stack_trace, FrameClass, FrameInfo, FrameWalker, StackTraceElement, WalkerState};
pub use gc::{trace_reachable, RootSet};
pub use heap::{AllocError, Allocator, HeapAllocator};
pub use method::{Code, ExceptionHandler, Method, MethodDef, MethodEntry, MethodFlags, MethodId};
pub use monitor::{MonitorError, MonitorTable};
pub use native::{NativeBridge, NativeCallContext, NativeFn};
pub use object::{ElemKind, HeapObject, ObjectBody, ObjectRef};
pub use pool::{ConstantPool, ConstantPoolTable, MemberRef, PoolConstant, PoolEntry, PoolError};
pub use runtime::{InvokeError, IsolateId, Runtime, ThreadHandle, UncaughtException};
pub use safepoint::{Rendezvous, RendezvousError, RendezvousGuard, RendezvousPhase, ThreadStatus};
pub use thread::{ThreadId, ThreadRegistry, VmThread};
pub use value::Value;
pub use vtable::{VirtualTable, VtHeader};

use crate::config::ConfigError;
use crate::jit::compiler::CompileError;

/// Fatal VM errors
///
/// Managed exceptions never travel as `VmError`; these are failures of the
/// runtime itself or of its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Class is not loaded
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// Method is not declared
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Field is not declared
    #[error("field not found: {0}")]
    FieldNotFound(String),

    /// Field slot past the end of an instance
    #[error("field slot {slot} out of range for {class}")]
    FieldSlot {
        /// Class name
        class: String,
        /// Slot index
        slot: usize,
    },

    /// Field access on a non-instance
    #[error("{0} is not an instance object")]
    NotAnInstance(String),

    /// Array access on a non-array
    #[error("{0} is not an array")]
    NotAnArray(String),

    /// Unchecked array index out of range
    #[error("array index {0} out of range")]
    ArrayIndex(usize),

    /// Value of the wrong type in a register or argument
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Call to a method with no implementation
    #[error("abstract method called: {0}")]
    AbstractMethod(String),

    /// Operation requires an attached thread
    #[error("thread {0} is not attached")]
    NotAttached(u32),

    /// Exception raised from native code while no native method is running
    #[error("thread {0} is not running a native method")]
    NotInNative(u32),

    /// Class linking failed
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Constant pool lookup failed
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Compilation failed
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Monitor protocol violation
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Rendezvous failed
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    /// Allocation failed while building a runtime object
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// Configuration rejected at startup
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Broken runtime invariant
    #[error("internal error: {0}")]
    Internal(String),
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
