//! # kiln-jit - JIT compiler backend for the Kiln scripting VM
//!
//! This crate turns one stack-based bytecode proc at a time into native code
//! via Cranelift, while tracking which logical values currently live in
//! compiler-managed registers versus the interpreter's memory-resident stack
//! frame.
//!
//! ## Architecture
//!
//! ```text
//! bytecode frontend -> ProcCompiler -> Cranelift IR -> JitHost -> ProcCode
//!                          |
//!                          +-> NodeStream (proc/block boundary markers)
//!                          +-> ProcArtifact (entry + continuation labels)
//! ```
//!
//! The frontend walks a proc's instructions and drives [`ProcCompiler`]
//! call-by-call: open the proc, open each basic block in turn, issue
//! push/pop/read/write/jump primitives, close the block, close the proc.
//! The compiler keeps two caches while doing so:
//!
//! - a per-block **operand-stack cache** of values not yet written to the
//!   runtime frame, and
//! - a per-proc **local/argument cache** with dirty tracking and deferred
//!   write-back.
//!
//! Both must be committed before any point where the runtime might suspend
//! the proc, because a suspended proc is inspected and resumed from frame
//! memory alone. The commit primitives are [`ProcCompiler::commit_stack`]
//! and [`ProcCompiler::commit_locals`]; placing them correctly is the
//! frontend's responsibility.

pub mod cache;
pub mod code;
pub mod compiler;
pub mod frame;
pub mod node;
pub mod operand;

pub use cache::{CacheState, Local};
pub use code::{JitHost, ProcCode};
pub use compiler::{ProcArtifact, ProcCompiler};
pub use frame::Implicit;
pub use node::{BlockLabel, Node, NodeStream};
pub use operand::{Operand, Variable};

use std::error::Error as StdError;
use std::fmt;

/// Fatal compilation error.
///
/// Every variant is an unrecoverable compiler-input error: either the
/// bytecode-to-primitive mapping upstream produced an invalid sequence, or
/// the builder layer failed. The driver abandons the compilation; no partial
/// result is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// `open_proc` while a proc is already open.
    ProcAlreadyOpen,
    /// An operation that needs an open proc found none.
    ProcNotOpen,
    /// `finish` before `close_proc`.
    ProcStillOpen,
    /// The compiler already sealed its proc.
    ProcFinished,
    /// `open_block` while a block is already open.
    BlockAlreadyOpen,
    /// An operation that needs an open block found none.
    BlockNotOpen,
    /// `close_proc` while a block is still open.
    BlockStillOpen,
    /// A pop asked for more values than the cache and the reachable frame
    /// region hold.
    StackUnderflow { requested: usize, available: usize },
    /// The Cranelift module layer failed.
    Builder(String),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::ProcAlreadyOpen => write!(f, "a proc is already open"),
            JitError::ProcNotOpen => write!(f, "no proc is open"),
            JitError::ProcStillOpen => write!(f, "the proc has not been sealed"),
            JitError::ProcFinished => write!(f, "this compiler already sealed its proc"),
            JitError::BlockAlreadyOpen => write!(f, "a block is already open"),
            JitError::BlockNotOpen => write!(f, "no block is open"),
            JitError::BlockStillOpen => write!(f, "a block is still open"),
            JitError::StackUnderflow {
                requested,
                available,
            } => write!(
                f,
                "stack cache underflow: needed {requested} values, only {available} reachable"
            ),
            JitError::Builder(message) => write!(f, "builder error: {message}"),
        }
    }
}

impl StdError for JitError {}
