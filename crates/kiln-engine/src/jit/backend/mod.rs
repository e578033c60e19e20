//! Code generation backends and the IR executor
//!
//! Every compiled method runs on the executor. Methods in the numeric subset
//! can additionally be lowered to machine code when the `jit` feature is
//! enabled.

pub mod exec;
pub mod traits;

#[cfg(feature = "jit")]
pub mod cranelift;

pub use traits::{CodegenBackend, CodegenError, EntryFn, ExecutableCode, RaiseSite, TargetArch, TargetInfo};

/// Native backend for the host, when one was built in
pub fn host_backend() -> Option<Box<dyn CodegenBackend>> {
    #[cfg(feature = "jit")]
    {
        match cranelift::CraneliftBackend::host() {
            Ok(backend) => Some(Box::new(backend)),
            Err(err) => {
                tracing::warn!("native backend unavailable: {}", err);
                None
            }
        }
    }
    #[cfg(not(feature = "jit"))]
    {
        None
    }
}
