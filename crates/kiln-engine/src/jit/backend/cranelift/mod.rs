//! Cranelift code generation backend
//!
//! Lowers methods in the numeric subset (no references, no handlers, no
//! calls) to host machine code. Everything else stays on the executor.

pub mod lowering;

use std::mem::ManuallyDrop;
use std::sync::Arc;

use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, Module};
use parking_lot::Mutex;
use target_lexicon::Architecture;

use self::lowering::{entry_signature, LoweringContext};
use crate::jit::backend::traits::{CodegenBackend, CodegenError, ExecutableCode, TargetArch, TargetInfo};
use crate::jit::ir::Function;

/// The JIT module holding every function this backend has finalized
struct CodeModule {
    module: Mutex<ManuallyDrop<JITModule>>,
}

// SAFETY: the module is only touched under its mutex, and finalized code is
// never written again
unsafe impl Send for CodeModule {}
unsafe impl Sync for CodeModule {}

impl Drop for CodeModule {
    fn drop(&mut self) {
        // SAFETY: the last `ExecutableCode` holding this module is gone, so
        // nothing can still run code from its memory
        unsafe {
            let module = ManuallyDrop::take(self.module.get_mut());
            module.free_memory();
        }
    }
}

/// Cranelift-based code generation backend
pub struct CraneliftBackend {
    isa: OwnedTargetIsa,
    code: Arc<CodeModule>,
    builder_ctx: Mutex<FunctionBuilderContext>,
}

impl CraneliftBackend {
    /// Create a backend targeting the host machine
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::BackendError(format!("failed to set opt_level: {}", e)))?;
        // JITModule places code at fixed addresses
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| CodegenError::BackendError(format!("failed to set is_pic: {}", e)))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::BackendError(format!("failed to create native ISA builder: {}", e)))?
            .finish(flags)
            .map_err(|e| CodegenError::BackendError(format!("failed to finish ISA: {}", e)))?;

        let module = JITModule::new(JITBuilder::with_isa(isa.clone(), default_libcall_names()));

        Ok(CraneliftBackend {
            isa,
            code: Arc::new(CodeModule {
                module: Mutex::new(ManuallyDrop::new(module)),
            }),
            builder_ctx: Mutex::new(FunctionBuilderContext::new()),
        })
    }
}

impl CodegenBackend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn compile_function(&self, func: &Function) -> Result<ExecutableCode, CodegenError> {
        let mut module = self.code.module.lock();
        let mut codegen_ctx = module.make_context();

        let call_conv = self.isa.default_call_conv();
        let pointer = self.isa.pointer_type();
        codegen_ctx.func.signature = entry_signature(call_conv, pointer);

        let raise_sites = {
            let mut builder_ctx = self.builder_ctx.lock();
            let builder = FunctionBuilder::new(&mut codegen_ctx.func, &mut builder_ctx);
            LoweringContext::lower(func, builder, call_conv, pointer)?
        };

        let id = module
            .declare_anonymous_function(&codegen_ctx.func.signature)
            .map_err(|e| CodegenError::Module(format!("failed to declare {}: {}", func.name, e)))?;
        module
            .define_function(id, &mut codegen_ctx)
            .map_err(|e| CodegenError::Module(format!("failed to define {}: {:?}", func.name, e)))?;
        let size = code_size(&codegen_ctx);
        module.clear_context(&mut codegen_ctx);

        module
            .finalize_definitions()
            .map_err(|e| CodegenError::Module(format!("failed to finalize {}: {}", func.name, e)))?;
        let ptr = module.get_finalized_function(id);

        // SAFETY: `ptr` is a finalized function built with the entry signature
        // and lives in `self.code`, which the returned value keeps alive
        Ok(unsafe { ExecutableCode::new(ptr, size, raise_sites, self.code.clone()) })
    }

    fn target_info(&self) -> TargetInfo {
        let arch = match self.isa.triple().architecture {
            Architecture::X86_64 => TargetArch::X86_64,
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::Other,
        };
        TargetInfo {
            arch,
            pointer_size: self.isa.pointer_bytes() as usize,
        }
    }
}

fn code_size(ctx: &Context) -> usize {
    ctx.compiled_code().map(|code| code.code_buffer().len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{BinOp, BlockCall, Builder, CmpOp, JitType, Terminator};
    use crate::vm::exceptions::ExceptionKind;

    /// `(a, b) -> a / b`, raising on a zero divisor
    fn divide() -> Function {
        let mut func = Function::new("T.div(II)I".to_string(), vec![JitType::I32, JitType::I32], Some(JitType::I32), 2);
        let entry = func.add_block();
        let mut b = Builder::new(&mut func);
        let a = b.add_param(entry, JitType::I32);
        let d = b.add_param(entry, JitType::I32);
        let zero = b.const_i32(0);
        let is_zero = b.cmp(CmpOp::Eq, d, zero);
        let fail = b.create_block();
        let ok = b.create_block();
        b.terminate(Terminator::Branch {
            cond: is_zero,
            then_call: BlockCall::bare(fail),
            else_call: BlockCall::bare(ok),
        });
        b.switch_to_block(fail);
        b.terminate(Terminator::Raise {
            kind: ExceptionKind::Arithmetic,
            args: vec![],
            detail: Some("/ by zero".into()),
        });
        b.switch_to_block(ok);
        let q = b.binary(BinOp::Div, JitType::I32, a, d);
        b.terminate(Terminator::Return(Some(q)));
        func
    }

    #[test]
    fn test_backend_creation() {
        let backend = CraneliftBackend::host().unwrap();
        assert_eq!(backend.name(), "cranelift");
        assert_eq!(backend.target_info().pointer_size, 8);
    }

    #[test]
    fn test_compiles_and_runs_division() {
        let backend = CraneliftBackend::host().unwrap();
        let exec = backend.compile_function(&divide()).unwrap();
        assert!(exec.code_size() > 0);
        assert_eq!(exec.raise_site(1).map(|s| s.detail.as_deref()), Some(Some("/ by zero")));
        assert!(exec.raise_site(2).is_none());

        let entry = exec.entry();
        let mut ret = 0u64;
        let args = [(-7i32) as u32 as u64, 2u64];
        // SAFETY: the function neither polls nor checks the stack, so the
        // thread pointer is never read
        let status = unsafe { entry(std::ptr::null(), args.as_ptr(), &mut ret) };
        assert_eq!(status, 0);
        assert_eq!(ret as u32 as i32, -3);

        let args = [i32::MIN as u32 as u64, (-1i32) as u32 as u64];
        let status = unsafe { entry(std::ptr::null(), args.as_ptr(), &mut ret) };
        assert_eq!(status, 0);
        assert_eq!(ret as u32 as i32, i32::MIN);

        let args = [1u64, 0u64];
        let status = unsafe { entry(std::ptr::null(), args.as_ptr(), &mut ret) };
        assert_eq!(exec.raise_site(status).map(|s| s.kind), Some(ExceptionKind::Arithmetic));
    }

    #[test]
    fn test_code_outlives_backend() {
        // `(x) -> x * 1.5`; the constant is loaded from the function's pool
        let mut func = Function::new("T.scale(D)D".to_string(), vec![JitType::F64], Some(JitType::F64), 2);
        let entry = func.add_block();
        let mut b = Builder::new(&mut func);
        let x = b.add_param(entry, JitType::F64);
        let k = b.const_f64(1.5);
        let r = b.binary(BinOp::Mul, JitType::F64, x, k);
        b.terminate(Terminator::Return(Some(r)));

        let backend = CraneliftBackend::host().unwrap();
        let div = backend.compile_function(&divide()).unwrap();
        let scale = backend.compile_function(&func).unwrap();
        assert_ne!(div.code_ptr(), scale.code_ptr());
        drop(backend);

        let mut ret = 0u64;
        let args = [4.0f64.to_bits()];
        // SAFETY: as above, the thread pointer is never read
        let status = unsafe { (scale.entry())(std::ptr::null(), args.as_ptr(), &mut ret) };
        assert_eq!(status, 0);
        assert_eq!(f64::from_bits(ret), 6.0);

        let args = [9u64, 3u64];
        let status = unsafe { (div.entry())(std::ptr::null(), args.as_ptr(), &mut ret) };
        assert_eq!(status, 0);
        assert_eq!(ret as u32 as i32, 3);
    }

    #[test]
    fn test_float_remainder_is_rejected() {
        let mut func = Function::new("T.rem(DD)D".to_string(), vec![JitType::F64, JitType::F64], Some(JitType::F64), 4);
        let entry = func.add_block();
        let mut b = Builder::new(&mut func);
        let x = b.add_param(entry, JitType::F64);
        let y = b.add_param(entry, JitType::F64);
        let r = b.binary(BinOp::Rem, JitType::F64, x, y);
        b.terminate(Terminator::Return(Some(r)));

        let backend = CraneliftBackend::host().unwrap();
        assert!(matches!(
            backend.compile_function(&func),
            Err(CodegenError::UnsupportedInstruction(_))
        ));
    }
}
