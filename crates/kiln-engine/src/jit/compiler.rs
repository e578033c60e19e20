//! MethodCompiler
//!
//! Turns one method's bytecode into a `CompiledMethod`:
//!
//! 1. exploration finds blocks, handler regions and subroutine return sites
//! 2. the emit pass interprets the bytecode over a symbolic stack and fills
//!    the blocks with typed IR, guards, handler dispatch and inlined callees
//! 3. liveness records the reference registers live at every GC point
//! 4. methods in the numeric subset are optionally lowered to machine code
//!
//! The same method compiled twice against the same loaded classes and
//! configuration yields an identical IR dump.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::{CompileMode, EngineConfig};
use crate::jit::analysis::liveness::{compute_stack_maps, StackMaps};
use crate::jit::backend::{CodegenBackend, CodegenError, ExecutableCode};
use crate::jit::bytecode::{DecodeError, Opcode};
use crate::jit::emit::{emit_method, EmitContext};
use crate::jit::ir::{Function, JitType};
use crate::vm::class::ClassRegistry;
use crate::vm::descriptor::DescriptorError;
use crate::vm::method::Method;
use crate::vm::pool::PoolError;

/// Error during method compilation
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// Bytecode could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A member descriptor is malformed
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Method has no bytecode body
    #[error("method {0} has no code")]
    NoCode(String),

    /// Method's declaring class is gone
    #[error("method {0} has no declaring class")]
    Orphan(String),

    /// Exception table row with an invalid range or target
    #[error("exception table row {row} is malformed")]
    BadHandler {
        /// Row index
        row: usize,
    },

    /// Pop from an empty symbolic stack
    #[error("stack underflow at offset {pc}")]
    StackUnderflow {
        /// Instruction offset
        pc: u32,
    },

    /// Operand of the wrong type
    #[error("type mismatch at offset {pc}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Instruction offset
        pc: u32,
        /// Type the instruction needs
        expected: JitType,
        /// Type on the stack
        found: JitType,
    },

    /// Stack manipulation that would split a two-slot value
    #[error("stack operation at offset {pc} splits a two-slot value")]
    SplitsWideValue {
        /// Instruction offset
        pc: u32,
    },

    /// Two paths reach a block with different stack shapes
    #[error("stack shape mismatch at offset {pc}: expected {}, found {}", shape_text(.expected), shape_text(.found))]
    StackShapeMismatch {
        /// Offset of the join point
        pc: u32,
        /// Shape recorded by the first path
        expected: Vec<JitType>,
        /// Shape of the later path
        found: Vec<JitType>,
    },

    /// Local index outside `max_locals`
    #[error("local {slot} out of range at offset {pc}")]
    BadLocal {
        /// Instruction offset
        pc: u32,
        /// Local index
        slot: u16,
    },

    /// Constant pool lookup failed
    #[error("constant pool error at offset {pc}: {source}")]
    Pool {
        /// Instruction offset
        pc: u32,
        /// Lookup failure
        source: PoolError,
    },

    /// `ldc` of a constant with the wrong width
    #[error("constant #{index} cannot be loaded by the instruction at offset {pc}")]
    BadConstant {
        /// Instruction offset
        pc: u32,
        /// Pool index
        index: u16,
    },

    /// Execution would run past the last instruction
    #[error("control falls off the end of the code after offset {pc}")]
    FallsOffEnd {
        /// Offset of the last instruction
        pc: u32,
    },

    /// `ret` in a method without `jsr`
    #[error("ret at offset {pc} has no return sites")]
    UnknownReturnSite {
        /// Instruction offset
        pc: u32,
    },

    /// Instruction the compiler does not handle
    #[error("unsupported {op} at offset {pc}: {reason}")]
    Unsupported {
        /// Instruction offset
        pc: u32,
        /// Opcode
        op: Opcode,
        /// Why
        reason: &'static str,
    },

    /// Native code generation failed
    #[error("codegen error: {0}")]
    Codegen(#[from] CodegenError),
}

fn shape_text(shape: &[JitType]) -> String {
    let items: Vec<String> = shape.iter().map(|t| t.to_string()).collect();
    format!("[{}]", items.join(", "))
}

/// Counters collected while compiling one method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// IR blocks
    pub blocks: usize,
    /// IR instructions
    pub instrs: usize,
    /// Callees expanded inline
    pub inlined: usize,
    /// Handles left for resolution at first execution
    pub lazy_handles: usize,
    /// Handles bound at compile time
    pub bound_handles: usize,
    /// Instructions with a stack map
    pub gc_points: usize,
}

/// Result of compiling a method
pub struct CompiledMethod {
    function: Function,
    stack_maps: StackMaps,
    native: Option<ExecutableCode>,
    stats: CompileStats,
    mode: CompileMode,
}

impl CompiledMethod {
    /// IR of the method
    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Live reference registers at each GC point
    pub fn stack_maps(&self) -> &StackMaps {
        &self.stack_maps
    }

    /// Machine code, when the method was lowered natively
    pub fn native(&self) -> Option<&ExecutableCode> {
        self.native.as_ref()
    }

    /// Compilation counters
    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    /// Code-path variant the method was compiled for
    pub fn mode(&self) -> CompileMode {
        self.mode
    }
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("name", &self.function.name)
            .field("stats", &self.stats)
            .field("native", &self.native.is_some())
            .finish()
    }
}

/// Compiles methods against a class registry
pub struct MethodCompiler {
    registry: Arc<ClassRegistry>,
    config: EngineConfig,
    backend: Option<Box<dyn CodegenBackend>>,
}

impl MethodCompiler {
    /// Create a compiler. A native backend is set up when the configuration
    /// asks for one and the crate was built with it.
    pub fn new(registry: Arc<ClassRegistry>, config: EngineConfig) -> Self {
        let backend = if config.native_backend {
            crate::jit::backend::host_backend()
        } else {
            None
        };
        Self {
            registry,
            config,
            backend,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Name of the native backend, if any
    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_deref().map(|b| b.name())
    }

    /// Compile `method`
    pub fn compile(&self, method: &Arc<Method>) -> Result<CompiledMethod, CompileError> {
        let code = method.code().ok_or_else(|| CompileError::NoCode(method.to_string()))?;
        let owner = method.owner().ok_or_else(|| CompileError::Orphan(method.to_string()))?;

        let mut params = Vec::with_capacity(method.descriptor().args.len() + 1);
        if !method.is_static() {
            params.push(JitType::Ref);
        }
        params.extend(method.descriptor().arg_types());
        let mut function = Function::new(
            method.to_string(),
            params,
            method.descriptor().ret_type(),
            code.max_locals as usize,
        );

        let ctx = EmitContext {
            registry: &self.registry,
            config: &self.config,
            root: method,
        };
        let mut stats = CompileStats::default();
        emit_method(&ctx, &mut stats, &owner, &mut function)?;

        let stack_maps = compute_stack_maps(&function);
        stats.blocks = function.blocks.len();
        stats.instrs = function.instr_count();
        stats.gc_points = stack_maps.len();

        let native = match &self.backend {
            Some(backend) if function.is_numeric() => match backend.compile_function(&function) {
                Ok(code) => Some(code),
                Err(err) => {
                    debug!(method = %method, backend = backend.name(), "native lowering skipped: {}", err);
                    None
                }
            },
            _ => None,
        };

        debug!(
            method = %method,
            blocks = stats.blocks,
            instrs = stats.instrs,
            inlined = stats.inlined,
            lazy = stats.lazy_handles,
            native = native.is_some(),
            "compiled"
        );

        Ok(CompiledMethod {
            function,
            stack_maps,
            native,
            stats,
            mode: self.config.compile_mode,
        })
    }
}

impl fmt::Debug for MethodCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodCompiler")
            .field("mode", &self.config.compile_mode)
            .field("backend", &self.backend_name())
            .finish()
    }
}
