//! Kiln execution core
//!
//! The runtime half of a managed-language virtual machine:
//! - **MethodCompiler**: bytecode to typed IR with stack maps (`jit` module)
//! - **FrameWalker** and **ExceptionChain**: stack introspection and
//!   protected regions (`vm::frames`, `vm::exception`)
//! - **Rendezvous**: stop-the-world safepoints (`vm::safepoint`)
//! - **Enveloppe**: inline caches for interface dispatch (`vm::dispatch`)
//! - **NativeBridge**: calls into and out of host code (`vm::native`)
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_engine::{EngineConfig, Runtime};
//!
//! let rt = Runtime::new(EngineConfig::default())?;
//! let class = rt.define_class(def)?;
//! let thread = rt.attach_thread("main")?;
//! let method = class.declared_method("main", "()I").unwrap().clone();
//! let result = rt.invoke(&thread, &method, &[])?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

// ============================================================================
// Core Modules
// ============================================================================

/// Engine configuration
pub mod config;

/// Bytecode, IR, compiler and code generation backends
pub mod jit;

/// Object model, threads, exceptions, safepoints, dispatch and the runtime
pub mod vm;

pub use config::{CompileMode, ConfigError, EngineConfig};
pub use vm::{InvokeError, Runtime, Value, VmError, VmResult};
