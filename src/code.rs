//! Host packaging: Cranelift module plumbing and finalized code handles.
//!
//! `JitHost` owns the `JITModule` and the proc ABI; `ProcCode` wraps one
//! finalized function pointer and keeps the module alive so the code is not
//! freed while the scheduler still holds it.
//!
//! The proc ABI is fixed:
//!
//! ```ignore
//! type ProcFn = unsafe extern "C" fn(
//!     ctx: *mut u8,    // runtime context (holds the operand-stack top)
//!     frame: *mut u8,  // this invocation's stack frame
//!     resume: u32,     // 0 for a fresh start, i + 1 for continuation i
//! ) -> u64;            // packed tagged value
//! ```

use std::sync::Arc;

use cranelift_codegen::ir::types::{I32, I64};
use cranelift_codegen::ir::{AbiParam, Signature, UserFuncName};
use cranelift_codegen::isa::CallConv;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::FunctionBuilderContext;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use log::debug;

use crate::compiler::{ProcArtifact, ProcCompiler};
use crate::node::NodeStream;
use crate::JitError;

/// Wrapper to make JITModule Send + Sync.
///
/// # Safety
/// Once finalized, the module's code is immutable and never modified again;
/// the raw pointers inside it point at executable memory that does not
/// change.
struct ModuleHolder(#[allow(dead_code)] JITModule);

unsafe impl Send for ModuleHolder {}
unsafe impl Sync for ModuleHolder {}

/// Owns the Cranelift module one proc is compiled into.
pub struct JitHost {
    module: JITModule,
}

impl JitHost {
    /// Configure Cranelift for the host target and create an empty module.
    pub fn new() -> Result<Self, JitError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| JitError::Builder(e.to_string()))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| JitError::Builder(e.to_string()))?;
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| JitError::Builder(e.to_string()))?;

        let isa_builder =
            cranelift_native::builder().map_err(|e| JitError::Builder(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Builder(e.to_string()))?;

        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        let module = JITModule::new(builder);
        Ok(JitHost { module })
    }

    /// The proc ABI signature: `(ctx: i64, frame: i64, resume: i32) -> i64`.
    pub fn proc_signature(&self) -> Signature {
        let mut sig = self.module.make_signature();
        sig.call_conv = CallConv::SystemV;
        sig.params.push(AbiParam::new(I64)); // context pointer
        sig.params.push(AbiParam::new(I64)); // frame pointer
        sig.params.push(AbiParam::new(I32)); // resume index
        sig.returns.push(AbiParam::new(I64)); // packed tagged value
        sig
    }

    /// Compile one proc: run the frontend closure against a fresh
    /// `ProcCompiler`, then define and finalize the function. Returns the
    /// executable handle and the boundary-marker stream.
    pub fn compile_proc<F>(mut self, name: &str, build: F) -> Result<(ProcCode, NodeStream), JitError>
    where
        F: FnOnce(&mut ProcCompiler) -> Result<ProcArtifact, JitError>,
    {
        let sig = self.proc_signature();
        let func_id = self
            .module
            .declare_function(name, Linkage::Local, &sig)
            .map_err(|e| JitError::Builder(e.to_string()))?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        ctx.func.name = UserFuncName::user(0, func_id.as_u32());

        let mut fb_ctx = FunctionBuilderContext::new();
        let mut compiler = ProcCompiler::new(&mut ctx.func, &mut fb_ctx);
        let artifact = build(&mut compiler)?;
        let nodes = compiler.finish()?;

        self.module
            .define_function(func_id, &mut ctx)
            .map_err(|e| JitError::Builder(e.to_string()))?;
        self.module
            .finalize_definitions()
            .map_err(|e| JitError::Builder(e.to_string()))?;
        let fn_ptr = self.module.get_finalized_function(func_id);

        debug!(
            "proc '{name}' finalized: {} continuation points, {} markers",
            artifact.continuations.len(),
            nodes.len()
        );
        Ok((
            ProcCode::new(fn_ptr, self.module, artifact.continuations.len()),
            nodes,
        ))
    }
}

/// Finalized native code for one proc.
pub struct ProcCode {
    fn_ptr: *const u8,
    /// Number of registered resumption targets.
    continuations: usize,
    /// Keeps the executable memory alive.
    _module: Arc<ModuleHolder>,
}

// Safety: the function pointer targets immutable finalized code; the module
// is kept alive by the Arc.
unsafe impl Send for ProcCode {}
unsafe impl Sync for ProcCode {}

impl ProcCode {
    pub(crate) fn new(fn_ptr: *const u8, module: JITModule, continuations: usize) -> Self {
        ProcCode {
            fn_ptr,
            continuations,
            _module: Arc::new(ModuleHolder(module)),
        }
    }

    /// The native entry point.
    pub fn fn_ptr(&self) -> *const u8 {
        self.fn_ptr
    }

    /// How many continuation points the proc registered. Valid resume
    /// indices are `0..=continuations()`.
    pub fn continuations(&self) -> usize {
        self.continuations
    }

    /// Invoke the compiled proc.
    ///
    /// # Safety
    /// - `ctx` must point to a context struct laid out per [`crate::frame`],
    ///   whose stack-top pointer addresses writable operand-stack memory
    ///   deep enough for everything the proc commits.
    /// - `frame` must point to a frame with valid header, argument, and
    ///   local slots for this proc.
    /// - `resume` must be 0 or `i + 1` for a registered continuation `i`.
    #[inline]
    pub unsafe fn call(&self, ctx: *mut u8, frame: *mut u8, resume: u32) -> u64 {
        let f: unsafe extern "C" fn(*mut u8, *mut u8, u32) -> u64 =
            std::mem::transmute(self.fn_ptr);
        f(ctx, frame, resume)
    }
}

impl std::fmt::Debug for ProcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcCode")
            .field("fn_ptr", &self.fn_ptr)
            .field("continuations", &self.continuations)
            .finish()
    }
}
