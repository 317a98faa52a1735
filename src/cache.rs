//! Cached compilation state for the open proc and block.
//!
//! These records exist only while a proc is being compiled. A `Proc` owns the
//! local/argument caches and the continuation list for one routine; a `Block`
//! owns the operand-stack cache for the one basic block currently open inside
//! it. Both are dropped, storage included, when their scope closes.

use cranelift_codegen::ir;
use cranelift_frontend::Variable as ClifVar;
use smallvec::SmallVec;

use crate::node::BlockLabel;
use crate::operand::Variable;

/// How a cached local relates to its backing frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Not fetched from the frame yet; a read must load it first.
    Stale,
    /// The cached operands match the frame.
    Ok,
    /// The cache diverges from the frame; a write-back is owed.
    Modified,
}

/// One cached local, argument, or implicit slot.
#[derive(Debug, Clone, Copy)]
pub struct Local {
    pub state: CacheState,
    pub var: Variable,
}

impl Local {
    /// A slot defined as null whose initial value still has to reach the
    /// frame. Every declared local and argument starts this way.
    pub(crate) const fn null_modified() -> Self {
        Local {
            state: CacheState::Modified,
            var: Variable::null(),
        }
    }

    /// A slot whose value is owned by the runtime until first read.
    pub(crate) const fn stale() -> Self {
        Local {
            state: CacheState::Stale,
            var: Variable::null(),
        }
    }
}

/// Per-proc compilation state.
pub(crate) struct Proc {
    /// Runtime context handle (function parameter 0).
    pub ctx: ClifVar,
    /// Frame pointer (function parameter 1).
    pub frame: ClifVar,
    /// The single live loop-iterator handle, zeroed at proc entry.
    pub iterator: ClifVar,
    /// Resume-index parameter, consumed by the continuation dispatch.
    pub resume: ir::Value,
    /// Dispatch block filled when the proc closes.
    pub prologue: BlockLabel,
    /// First opened block; where a fresh invocation lands.
    pub body_entry: Option<BlockLabel>,
    /// Registered resumption targets, in continuation-index order.
    pub continuations: Vec<BlockLabel>,
    pub locals: Box<[Local]>,
    pub args: Box<[Local]>,
    /// Source, caller, last-result slots, in `Implicit` order.
    pub implicits: [Local; 3],
    /// The one open block, if any.
    pub block: Option<Block>,
}

impl Proc {
    pub(crate) fn new(
        ctx: ClifVar,
        frame: ClifVar,
        iterator: ClifVar,
        resume: ir::Value,
        prologue: BlockLabel,
        locals_count: u32,
        args_count: u32,
    ) -> Self {
        Proc {
            ctx,
            frame,
            iterator,
            resume,
            prologue,
            body_entry: None,
            continuations: Vec::new(),
            locals: vec![Local::null_modified(); locals_count as usize].into_boxed_slice(),
            args: vec![Local::null_modified(); args_count as usize].into_boxed_slice(),
            implicits: [Local::stale(); 3],
            block: None,
        }
    }
}

/// Per-block operand-stack cache.
pub(crate) struct Block {
    pub label: BlockLabel,
    /// Address of the first free operand slot, loaded from the context when
    /// the block opened. All slot arithmetic is relative to it; only
    /// `clear_stack` resyncs it.
    pub stack_top: ClifVar,
    /// Logical top in slots relative to the materialized top. Negative means
    /// the block has consumed values from below it.
    pub offset: i32,
    /// The offset the context's top pointer currently reflects.
    pub published: i32,
    /// Values not yet written to the frame, oldest first.
    pub cache: SmallVec<[Variable; 8]>,
}

impl Block {
    pub(crate) fn new(label: BlockLabel, stack_top: ClifVar) -> Self {
        Block {
            label,
            stack_top,
            offset: 0,
            published: 0,
            cache: SmallVec::new(),
        }
    }
}
