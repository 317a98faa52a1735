//! The proc compiler: bytecode-driven code generation with caching.
//!
//! `ProcCompiler` is the stateful driver the bytecode frontend talks to. It
//! wraps one Cranelift `FunctionBuilder` and exposes the compilation
//! primitives for a single proc: scope lifecycle, the local/argument cache,
//! the per-block operand-stack cache, control transfer, and the return path.
//!
//! The caching discipline is the whole point. Values the frontend touches
//! live in builder virtual registers until a commit writes them to the
//! runtime frame; the frontend must commit before any point where the
//! runtime could suspend the proc or otherwise read the frame directly,
//! because a suspended proc is rehydrated from frame memory alone.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::types::{I32, I64};
use cranelift_codegen::ir::{Function, InstBuilder, MemFlags, Type, Value};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable as ClifVar};
use log::{debug, error, trace};

use crate::cache::{Block, CacheState, Local, Proc};
use crate::frame::{self, Implicit};
use crate::node::{BlockLabel, Node, NodeStream};
use crate::operand::{Operand, Variable};
use crate::JitError;

/// What `close_proc` hands to the scheduler: where a fresh invocation
/// enters, where the dispatch lives, and the registered resumption targets.
#[derive(Debug, Clone)]
pub struct ProcArtifact {
    /// First opened block; `None` for a proc that never opened one.
    pub entry: Option<BlockLabel>,
    /// The continuation-dispatch block.
    pub prologue: BlockLabel,
    /// Resumption targets in continuation-index order.
    pub continuations: Vec<BlockLabel>,
}

/// Compiles one proc into one builder function.
pub struct ProcCompiler<'a> {
    builder: FunctionBuilder<'a>,
    nodes: NodeStream,
    /// Next frontend-variable index.
    vars: u32,
    proc: Option<Proc>,
    finished: bool,
}

fn fresh_var(builder: &mut FunctionBuilder, vars: &mut u32, ty: Type) -> ClifVar {
    let var = ClifVar::from_u32(*vars);
    *vars += 1;
    builder.declare_var(var, ty);
    var
}

fn operand_value(builder: &mut FunctionBuilder, op: Operand, ty: Type) -> Value {
    match op {
        Operand::Imm(imm) => builder.ins().iconst(ty, imm),
        Operand::Reg(var) => builder.use_var(var),
    }
}

fn capture_value(builder: &mut FunctionBuilder, vars: &mut u32, ty: Type, value: Value) -> Operand {
    let var = fresh_var(builder, vars, ty);
    builder.def_var(var, value);
    Operand::Reg(var)
}

/// Store a modified slot's tag and payload to its backing frame location.
fn flush_slot(builder: &mut FunctionBuilder, slot: &mut Local, base: Value, offset: i32) -> bool {
    if slot.state != CacheState::Modified {
        return false;
    }
    let tag = operand_value(builder, slot.var.tag, I32);
    let payload = operand_value(builder, slot.var.payload, I32);
    builder
        .ins()
        .store(MemFlags::trusted(), tag, base, offset + frame::VALUE_TAG_OFFSET);
    builder.ins().store(
        MemFlags::trusted(),
        payload,
        base,
        offset + frame::VALUE_PAYLOAD_OFFSET,
    );
    slot.state = CacheState::Ok;
    true
}

enum SlotRef {
    Local(u32),
    Arg(u32),
    Implicit(Implicit),
}

impl<'a> ProcCompiler<'a> {
    /// Wrap a builder function. The function's signature must be the proc
    /// ABI: `(ctx: i64, frame: i64, resume: i32) -> i64`.
    pub fn new(func: &'a mut Function, fb_ctx: &'a mut FunctionBuilderContext) -> Self {
        ProcCompiler {
            builder: FunctionBuilder::new(func, fb_ctx),
            nodes: NodeStream::new(),
            vars: 0,
            proc: None,
            finished: false,
        }
    }

    /// Direct access to the underlying builder, for the frontend's own
    /// instruction emission between cache operations.
    pub fn builder(&mut self) -> &mut FunctionBuilder<'a> {
        &mut self.builder
    }

    /// Create a label for a block the frontend will open later.
    pub fn new_label(&mut self) -> BlockLabel {
        self.builder.create_block()
    }

    /// The boundary markers emitted so far.
    pub fn nodes(&self) -> &NodeStream {
        &self.nodes
    }

    /// Capture a builder value into a fresh virtual register so it can be
    /// cached and used from any later block.
    pub fn capture(&mut self, ty: Type, value: Value) -> Operand {
        capture_value(&mut self.builder, &mut self.vars, ty, value)
    }

    /// Materialize an operand at the current insertion point.
    pub fn materialize(&mut self, op: Operand, ty: Type) -> Value {
        operand_value(&mut self.builder, op, ty)
    }

    // === Proc lifecycle ===

    /// Begin compiling a proc with the declared slot counts. Fills the native
    /// entry block (parameter binding, iterator zeroing) and inserts both
    /// proc boundary markers.
    pub fn open_proc(&mut self, locals_count: u32, args_count: u32) -> Result<(), JitError> {
        if self.finished {
            return Err(JitError::ProcFinished);
        }
        if self.proc.is_some() {
            return Err(JitError::ProcAlreadyOpen);
        }

        let entry = self.builder.create_block();
        let prologue = self.builder.create_block();
        self.builder.append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);
        self.builder.seal_block(entry);

        let params = self.builder.block_params(entry);
        let (ctx_param, frame_param, resume) = (params[0], params[1], params[2]);

        let ctx = fresh_var(&mut self.builder, &mut self.vars, I64);
        self.builder.def_var(ctx, ctx_param);
        let frame_ptr = fresh_var(&mut self.builder, &mut self.vars, I64);
        self.builder.def_var(frame_ptr, frame_param);

        let iterator = fresh_var(&mut self.builder, &mut self.vars, I64);
        let zero = self.builder.ins().iconst(I64, 0);
        self.builder.def_var(iterator, zero);

        self.builder.ins().jump(prologue, &[]);

        self.nodes.open(Node::ProcStart, Node::ProcEnd);
        self.proc = Some(Proc::new(
            ctx,
            frame_ptr,
            iterator,
            resume,
            prologue,
            locals_count,
            args_count,
        ));
        debug!("proc opened: {locals_count} locals, {args_count} args");
        Ok(())
    }

    /// Seal the proc: emit the continuation dispatch into the prologue block,
    /// seal every builder block, and release the proc state.
    pub fn close_proc(&mut self) -> Result<ProcArtifact, JitError> {
        match self.proc.as_ref() {
            None => return Err(JitError::ProcNotOpen),
            Some(p) if p.block.is_some() => return Err(JitError::BlockStillOpen),
            Some(_) => {}
        }
        let proc = self.proc.take().ok_or(JitError::ProcNotOpen)?;

        self.builder.switch_to_block(proc.prologue);
        match proc.body_entry {
            None => {
                // A proc with no body yields null.
                let null = self
                    .builder
                    .ins()
                    .iconst(I64, frame::pack_value(frame::TAG_NULL as u32, 0) as i64);
                self.builder.ins().return_(&[null]);
            }
            Some(entry) => {
                // Resume index i + 1 enters continuation i; zero and anything
                // unregistered fall through to a fresh start.
                for (i, cont) in proc.continuations.iter().enumerate() {
                    let next = self.builder.create_block();
                    let hit = self
                        .builder
                        .ins()
                        .icmp_imm(IntCC::Equal, proc.resume, (i + 1) as i64);
                    self.builder.ins().brif(hit, *cont, &[], next, &[]);
                    self.builder.switch_to_block(next);
                }
                self.builder.ins().jump(entry, &[]);
            }
        }

        self.builder.seal_all_blocks();
        self.nodes.close();
        self.finished = true;
        debug!(
            "proc sealed: {} continuation points",
            proc.continuations.len()
        );
        Ok(ProcArtifact {
            entry: proc.body_entry,
            prologue: proc.prologue,
            continuations: proc.continuations,
        })
    }

    /// Finalize the builder and yield the marker stream. Valid only after
    /// `close_proc`.
    pub fn finish(self) -> Result<NodeStream, JitError> {
        if self.proc.is_some() {
            return Err(JitError::ProcStillOpen);
        }
        let ProcCompiler { builder, nodes, .. } = self;
        builder.finalize();
        Ok(nodes)
    }

    // === Block lifecycle ===

    /// Open a basic block. Switches the builder to `label`, materializes the
    /// operand-stack top from the context, and resets the stack cache. A
    /// `continuation` index registers `label` as a resumption target;
    /// indices must be registered in ascending order.
    pub fn open_block(&mut self, label: BlockLabel, continuation: Option<u32>) -> Result<(), JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        if proc.block.is_some() {
            return Err(JitError::BlockAlreadyOpen);
        }
        if proc.body_entry.is_none() {
            proc.body_entry = Some(label);
        }
        if let Some(index) = continuation {
            debug_assert_eq!(
                index as usize,
                proc.continuations.len(),
                "continuation indices must be registered in ascending order"
            );
            proc.continuations.push(label);
        }

        self.builder.switch_to_block(label);
        let ctx = self.builder.use_var(proc.ctx);
        let top = self
            .builder
            .ins()
            .load(I64, MemFlags::trusted(), ctx, frame::CTX_STACK_TOP);
        let stack_top = fresh_var(&mut self.builder, &mut self.vars, I64);
        self.builder.def_var(stack_top, top);

        proc.block = Some(Block::new(label, stack_top));
        self.nodes.open(Node::BlockStart(label), Node::BlockEnd(label));
        trace!("block {label} opened");
        Ok(())
    }

    /// Close the open block, committing its stack cache first.
    pub fn close_block(&mut self) -> Result<(), JitError> {
        self.commit_stack()?;
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        if let Some(block) = proc.block.take() {
            trace!("block {} sealed", block.label);
        }
        self.nodes.close();
        Ok(())
    }

    // === Locals, arguments, implicit values ===

    /// Read local `index`. A stale slot is reloaded from the frame first;
    /// otherwise this is a pure cache read.
    pub fn read_local(&mut self, index: u32) -> Result<Variable, JitError> {
        self.read_slot(SlotRef::Local(index))
    }

    /// Write local `index`, marking the slot dirty.
    pub fn write_local(&mut self, index: u32, value: Variable) -> Result<(), JitError> {
        self.write_slot(SlotRef::Local(index), value)
    }

    /// Read argument `index`. Arguments are read-only to the proc body.
    pub fn read_arg(&mut self, index: u32) -> Result<Variable, JitError> {
        self.read_slot(SlotRef::Arg(index))
    }

    /// Read one of the per-proc implicit values.
    pub fn read_implicit(&mut self, which: Implicit) -> Result<Variable, JitError> {
        self.read_slot(SlotRef::Implicit(which))
    }

    /// Write one of the per-proc implicit values.
    pub fn write_implicit(&mut self, which: Implicit, value: Variable) -> Result<(), JitError> {
        self.write_slot(SlotRef::Implicit(which), value)
    }

    /// Read a value embedded at an arbitrary byte offset in the frame. The
    /// escape hatch for frame slots outside the locals/args model.
    pub fn read_frame_value(&mut self, offset: i32) -> Result<Variable, JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        if proc.block.is_none() {
            return Err(JitError::BlockNotOpen);
        }
        let frame_var = proc.frame;
        let base = self.builder.use_var(frame_var);
        Ok(self.load_value(base, offset))
    }

    /// Flush every dirty local, argument, and implicit slot to the frame.
    /// Returns the number of slots written; a second call with no
    /// intervening write flushes nothing. Call before anything that might
    /// suspend the proc.
    pub fn commit_locals(&mut self) -> Result<usize, JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        if proc.block.is_none() {
            return Err(JitError::BlockNotOpen);
        }
        let base = self.builder.use_var(proc.frame);
        let args_count = proc.args.len() as u32;

        let mut flushed = 0usize;
        for (i, slot) in proc.args.iter_mut().enumerate() {
            if flush_slot(&mut self.builder, slot, base, frame::arg_offset(i as u32)) {
                flushed += 1;
            }
        }
        for (i, slot) in proc.locals.iter_mut().enumerate() {
            if flush_slot(
                &mut self.builder,
                slot,
                base,
                frame::local_offset(args_count, i as u32),
            ) {
                flushed += 1;
            }
        }
        let implicit_offsets = [frame::FRAME_SOURCE, frame::FRAME_CALLER, frame::FRAME_RESULT];
        for (slot, offset) in proc.implicits.iter_mut().zip(implicit_offsets) {
            if flush_slot(&mut self.builder, slot, base, offset) {
                flushed += 1;
            }
        }
        trace!("locals commit: {flushed} slots flushed");
        Ok(flushed)
    }

    /// Drop every cached local, argument, and implicit value, forcing the
    /// next read of each slot to reload from the frame. Call after a
    /// registered suspension point; register state does not survive the
    /// native re-entry.
    pub fn mark_locals_stale(&mut self) -> Result<(), JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        let slots = proc
            .args
            .iter_mut()
            .chain(proc.locals.iter_mut())
            .chain(proc.implicits.iter_mut());
        for slot in slots {
            debug_assert!(
                slot.state != CacheState::Modified,
                "marking a dirty slot stale discards an owed write-back"
            );
            slot.state = CacheState::Stale;
        }
        Ok(())
    }

    fn read_slot(&mut self, which: SlotRef) -> Result<Variable, JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        let frame_var = proc.frame;
        let args_count = proc.args.len() as u32;
        let (slot, offset) = match which {
            SlotRef::Local(i) => (
                &mut proc.locals[i as usize],
                frame::local_offset(args_count, i),
            ),
            SlotRef::Arg(i) => (&mut proc.args[i as usize], frame::arg_offset(i)),
            SlotRef::Implicit(im) => {
                let index = match im {
                    Implicit::Source => 0,
                    Implicit::Caller => 1,
                    Implicit::LastResult => 2,
                };
                (&mut proc.implicits[index], im.frame_offset())
            }
        };
        if slot.state == CacheState::Stale {
            let base = self.builder.use_var(frame_var);
            let tag = self.builder.ins().load(
                I32,
                MemFlags::trusted(),
                base,
                offset + frame::VALUE_TAG_OFFSET,
            );
            let payload = self.builder.ins().load(
                I32,
                MemFlags::trusted(),
                base,
                offset + frame::VALUE_PAYLOAD_OFFSET,
            );
            slot.var = Variable {
                tag: capture_value(&mut self.builder, &mut self.vars, I32, tag),
                payload: capture_value(&mut self.builder, &mut self.vars, I32, payload),
            };
            slot.state = CacheState::Ok;
        }
        Ok(slot.var)
    }

    fn write_slot(&mut self, which: SlotRef, value: Variable) -> Result<(), JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        let slot = match which {
            SlotRef::Local(i) => &mut proc.locals[i as usize],
            SlotRef::Arg(i) => &mut proc.args[i as usize],
            SlotRef::Implicit(im) => {
                let index = match im {
                    Implicit::Source => 0,
                    Implicit::Caller => 1,
                    Implicit::LastResult => 2,
                };
                &mut proc.implicits[index]
            }
        };
        slot.var = value;
        slot.state = CacheState::Modified;
        Ok(())
    }

    // === Operand-stack cache ===

    /// Push a value onto the block's stack cache.
    pub fn push(&mut self, value: Variable) -> Result<(), JitError> {
        let block = self.block_mut()?;
        block.cache.push(value);
        block.offset += 1;
        Ok(())
    }

    /// Allocate a fresh tag/payload register pair, push it, and return it so
    /// the caller can define the registers with a value computed next. The
    /// registers must be defined before the pair is committed or consumed.
    pub fn push_new(&mut self) -> Result<Variable, JitError> {
        {
            let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
            if proc.block.is_none() {
                return Err(JitError::BlockNotOpen);
            }
        }
        let tag = fresh_var(&mut self.builder, &mut self.vars, I32);
        let payload = fresh_var(&mut self.builder, &mut self.vars, I32);
        let value = Variable {
            tag: Operand::Reg(tag),
            payload: Operand::Reg(payload),
        };
        self.push(value)?;
        Ok(value)
    }

    /// Pop the top value. Sugar for `pop_n::<1>()`.
    pub fn pop(&mut self) -> Result<Variable, JitError> {
        let [value] = self.pop_n::<1>()?;
        Ok(value)
    }

    /// Pop the top `N` values, returned in original push order. Entries the
    /// cache cannot satisfy are read from frame memory below the cached
    /// region; reads may reach at most one slot below the materialized top.
    /// A pop that would reach deeper is an invalid bytecode-to-block mapping
    /// and aborts compilation.
    pub fn pop_n<const N: usize>(&mut self) -> Result<[Variable; N], JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        let block = proc.block.as_mut().ok_or(JitError::BlockNotOpen)?;

        let mut out = [Variable::null(); N];
        let mut taken = 0usize;
        while taken < N {
            match block.cache.pop() {
                Some(value) => {
                    out[N - 1 - taken] = value;
                    block.offset -= 1;
                    taken += 1;
                }
                None => break,
            }
        }
        if taken == N {
            return Ok(out);
        }

        // The cache ran dry; the frame backs the region below it.
        let shortfall = N - taken;
        let reachable = (block.offset + 1).max(0) as usize;
        if shortfall > reachable {
            error!(
                "stack cache underflow: popping {N} with {taken} cached and {reachable} in frame"
            );
            return Err(JitError::StackUnderflow {
                requested: N,
                available: taken + reachable,
            });
        }

        trace!("stack pop fell back to frame memory ({shortfall} slots)");
        let top = self.builder.use_var(block.stack_top);
        for i in 0..shortfall {
            let slot = (block.offset - 1 - i as i32) * frame::VALUE_SIZE;
            let tag = self.builder.ins().load(
                I32,
                MemFlags::trusted(),
                top,
                slot + frame::VALUE_TAG_OFFSET,
            );
            let payload = self.builder.ins().load(
                I32,
                MemFlags::trusted(),
                top,
                slot + frame::VALUE_PAYLOAD_OFFSET,
            );
            out[N - 1 - taken - i] = Variable {
                tag: capture_value(&mut self.builder, &mut self.vars, I32, tag),
                payload: capture_value(&mut self.builder, &mut self.vars, I32, payload),
            };
        }
        block.offset -= shortfall as i32;
        Ok(out)
    }

    /// Discard the cache and resync the materialized top from the context.
    /// For use when an external event already invalidated whatever the cache
    /// assumed about the real stack.
    pub fn clear_stack(&mut self) -> Result<(), JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        let block = proc.block.as_mut().ok_or(JitError::BlockNotOpen)?;
        block.cache.clear();
        block.offset = 0;
        block.published = 0;
        let ctx = self.builder.use_var(proc.ctx);
        let top = self
            .builder
            .ins()
            .load(I64, MemFlags::trusted(), ctx, frame::CTX_STACK_TOP);
        self.builder.def_var(block.stack_top, top);
        Ok(())
    }

    /// Write every cached value to its frame slot (push order), publish the
    /// logical top to the context if it moved, and empty the cache. Returns
    /// the number of values written. Runs automatically at block close; the
    /// frontend must also call it before interpreter calls, jumps, and
    /// suspension points.
    pub fn commit_stack(&mut self) -> Result<usize, JitError> {
        let proc = self.proc.as_mut().ok_or(JitError::ProcNotOpen)?;
        let block = proc.block.as_mut().ok_or(JitError::BlockNotOpen)?;

        let mut wrote = 0usize;
        if !block.cache.is_empty() {
            let top = self.builder.use_var(block.stack_top);
            let len = block.cache.len() as i32;
            for i in 0..block.cache.len() {
                let value = block.cache[i];
                let slot = (block.offset - len + i as i32) * frame::VALUE_SIZE;
                let tag = operand_value(&mut self.builder, value.tag, I32);
                let payload = operand_value(&mut self.builder, value.payload, I32);
                self.builder.ins().store(
                    MemFlags::trusted(),
                    tag,
                    top,
                    slot + frame::VALUE_TAG_OFFSET,
                );
                self.builder.ins().store(
                    MemFlags::trusted(),
                    payload,
                    top,
                    slot + frame::VALUE_PAYLOAD_OFFSET,
                );
                wrote += 1;
            }
            block.cache.clear();
        }

        if block.offset != block.published {
            let top = self.builder.use_var(block.stack_top);
            let new_top = self
                .builder
                .ins()
                .iadd_imm(top, (block.offset * frame::VALUE_SIZE) as i64);
            let ctx = self.builder.use_var(proc.ctx);
            self.builder
                .ins()
                .store(MemFlags::trusted(), new_top, ctx, frame::CTX_STACK_TOP);
            block.published = block.offset;
        }
        trace!("stack commit: {wrote} values written");
        Ok(wrote)
    }

    // === Control transfer and return ===

    /// Emit an unconditional transfer. Cached state the destination needs
    /// must already be committed; destinations start with an empty cache.
    pub fn jump(&mut self, label: BlockLabel) -> Result<(), JitError> {
        let proc = self.proc.as_ref().ok_or(JitError::ProcNotOpen)?;
        let block = proc.block.as_ref().ok_or(JitError::BlockNotOpen)?;
        debug_assert!(
            block.cache.is_empty() && block.offset == block.published,
            "jump with uncommitted stack state"
        );
        self.builder.ins().jump(label, &[]);
        Ok(())
    }

    /// Emit a conditional transfer: to `if_zero` when `cond`'s payload is
    /// zero, to `fall_through` otherwise. The builder has no implicit
    /// fall-through, so the successor is named explicitly. Same commit
    /// contract as `jump`.
    pub fn jump_if_zero(
        &mut self,
        cond: Variable,
        if_zero: BlockLabel,
        fall_through: BlockLabel,
    ) -> Result<(), JitError> {
        {
            let proc = self.proc.as_ref().ok_or(JitError::ProcNotOpen)?;
            let block = proc.block.as_ref().ok_or(JitError::BlockNotOpen)?;
            debug_assert!(
                block.cache.is_empty() && block.offset == block.published,
                "conditional jump with uncommitted stack state"
            );
        }
        let payload = operand_value(&mut self.builder, cond.payload, I32);
        self.builder
            .ins()
            .brif(payload, fall_through, &[], if_zero, &[]);
        Ok(())
    }

    /// Pop the top of the stack cache, pack it into the return encoding, and
    /// emit the return. The frontend must have arranged exactly one value to
    /// be reachable; a returning block owes no further stack publication.
    pub fn emit_return(&mut self) -> Result<(), JitError> {
        let value = self.pop()?;
        let tag = operand_value(&mut self.builder, value.tag, I32);
        let payload = operand_value(&mut self.builder, value.payload, I32);
        let tag64 = self.builder.ins().uextend(I64, tag);
        let payload64 = self.builder.ins().uextend(I64, payload);
        let shifted = self.builder.ins().ishl_imm(payload64, 32);
        let packed = self.builder.ins().bor(tag64, shifted);
        self.builder.ins().return_(&[packed]);

        if let Some(proc) = self.proc.as_mut() {
            if let Some(block) = proc.block.as_mut() {
                block.cache.clear();
                block.offset = 0;
                block.published = 0;
            }
        }
        Ok(())
    }

    // === Accessors ===

    /// The frame pointer as a builder value.
    pub fn stack_frame(&mut self) -> Result<Value, JitError> {
        let var = self.proc.as_ref().ok_or(JitError::ProcNotOpen)?.frame;
        Ok(self.builder.use_var(var))
    }

    /// The runtime context handle as a builder value.
    pub fn context(&mut self) -> Result<Value, JitError> {
        let var = self.proc.as_ref().ok_or(JitError::ProcNotOpen)?.ctx;
        Ok(self.builder.use_var(var))
    }

    /// The live loop-iterator handle. One handle per proc; save/restore
    /// around nested loops is the frontend's responsibility.
    pub fn iterator(&mut self) -> Result<Value, JitError> {
        let var = self.proc.as_ref().ok_or(JitError::ProcNotOpen)?.iterator;
        Ok(self.builder.use_var(var))
    }

    /// Replace the live loop-iterator handle.
    pub fn set_iterator(&mut self, value: Value) -> Result<(), JitError> {
        let var = self.proc.as_ref().ok_or(JitError::ProcNotOpen)?.iterator;
        self.builder.def_var(var, value);
        Ok(())
    }

    /// Logical stack top relative to the open block's materialized top.
    pub fn stack_offset(&self) -> Result<i32, JitError> {
        Ok(self.block_ref()?.offset)
    }

    /// Number of values currently in the open block's cache.
    pub fn stack_cached(&self) -> Result<usize, JitError> {
        Ok(self.block_ref()?.cache.len())
    }

    fn block_ref(&self) -> Result<&Block, JitError> {
        self.proc
            .as_ref()
            .ok_or(JitError::ProcNotOpen)?
            .block
            .as_ref()
            .ok_or(JitError::BlockNotOpen)
    }

    fn block_mut(&mut self) -> Result<&mut Block, JitError> {
        self.proc
            .as_mut()
            .ok_or(JitError::ProcNotOpen)?
            .block
            .as_mut()
            .ok_or(JitError::BlockNotOpen)
    }

    fn load_value(&mut self, base: Value, offset: i32) -> Variable {
        let tag = self.builder.ins().load(
            I32,
            MemFlags::trusted(),
            base,
            offset + frame::VALUE_TAG_OFFSET,
        );
        let payload = self.builder.ins().load(
            I32,
            MemFlags::trusted(),
            base,
            offset + frame::VALUE_PAYLOAD_OFFSET,
        );
        Variable {
            tag: capture_value(&mut self.builder, &mut self.vars, I32, tag),
            payload: capture_value(&mut self.builder, &mut self.vars, I32, payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{TAG_NUMBER, TAG_STRING};
    use cranelift_codegen::ir::{AbiParam, Signature, UserFuncName};
    use cranelift_codegen::isa::CallConv;

    fn proc_signature() -> Signature {
        let mut sig = Signature::new(CallConv::SystemV);
        sig.params.push(AbiParam::new(I64));
        sig.params.push(AbiParam::new(I64));
        sig.params.push(AbiParam::new(I32));
        sig.returns.push(AbiParam::new(I64));
        sig
    }

    fn with_compiler<R>(f: impl FnOnce(&mut ProcCompiler) -> R) -> R {
        let mut func = Function::with_name_signature(UserFuncName::default(), proc_signature());
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut compiler = ProcCompiler::new(&mut func, &mut fb_ctx);
        f(&mut compiler)
    }

    #[test]
    fn open_proc_twice_fails() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            assert_eq!(c.open_proc(0, 0), Err(JitError::ProcAlreadyOpen));
        });
    }

    #[test]
    fn operations_require_open_scopes() {
        with_compiler(|c| {
            assert_eq!(c.push(Variable::null()), Err(JitError::ProcNotOpen));
            assert_eq!(c.read_local(0).unwrap_err(), JitError::ProcNotOpen);

            c.open_proc(1, 0).unwrap();
            assert_eq!(c.push(Variable::null()), Err(JitError::BlockNotOpen));
            assert_eq!(c.close_block(), Err(JitError::BlockNotOpen));

            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();
            let b1 = c.new_label();
            assert_eq!(c.open_block(b1, None), Err(JitError::BlockAlreadyOpen));
            assert_eq!(c.close_proc().unwrap_err(), JitError::BlockStillOpen);
        });
    }

    #[test]
    fn fresh_slots_are_null_and_dirty() {
        with_compiler(|c| {
            c.open_proc(3, 2).unwrap();
            for i in 0..3 {
                assert_eq!(c.read_local(i).unwrap(), Variable::null());
            }
            for i in 0..2 {
                assert_eq!(c.read_arg(i).unwrap(), Variable::null());
            }
            let proc = c.proc.as_ref().unwrap();
            for slot in proc.locals.iter().chain(proc.args.iter()) {
                assert_eq!(slot.state, CacheState::Modified);
            }
        });
    }

    #[test]
    fn commit_locals_flushes_once() {
        with_compiler(|c| {
            c.open_proc(2, 1).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            c.write_local(0, Variable::imm(TAG_NUMBER, 7)).unwrap();
            // Everything starts dirty, so the first commit flushes all slots.
            assert_eq!(c.commit_locals().unwrap(), 3);
            assert_eq!(c.commit_locals().unwrap(), 0);

            c.write_local(1, Variable::imm(TAG_STRING, 9)).unwrap();
            assert_eq!(c.commit_locals().unwrap(), 1);
        });
    }

    #[test]
    fn stale_slots_reload_from_frame() {
        with_compiler(|c| {
            c.open_proc(1, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();
            c.commit_locals().unwrap();
            c.mark_locals_stale().unwrap();

            let v = c.read_local(0).unwrap();
            assert!(matches!(v.tag, Operand::Reg(_)));
            assert!(matches!(v.payload, Operand::Reg(_)));
            assert_eq!(c.proc.as_ref().unwrap().locals[0].state, CacheState::Ok);

            // A second read is a pure cache hit on the same registers.
            assert_eq!(c.read_local(0).unwrap(), v);
        });
    }

    #[test]
    fn implicits_start_stale_and_cache_like_locals() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            let src = c.read_implicit(Implicit::Source).unwrap();
            assert!(matches!(src.tag, Operand::Reg(_)));
            assert_eq!(c.read_implicit(Implicit::Source).unwrap(), src);

            c.write_implicit(Implicit::LastResult, Variable::imm(TAG_NUMBER, 1))
                .unwrap();
            assert_eq!(
                c.proc.as_ref().unwrap().implicits[2].state,
                CacheState::Modified
            );
            assert_eq!(c.commit_locals().unwrap(), 1);
        });
    }

    #[test]
    fn pop_returns_last_pushes_in_push_order() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            let a = Variable::imm(TAG_NUMBER, 1);
            let b = Variable::imm(TAG_NUMBER, 2);
            let d = Variable::imm(TAG_NUMBER, 3);
            c.push(a).unwrap();
            c.push(b).unwrap();
            c.push(d).unwrap();
            assert_eq!(c.stack_offset().unwrap(), 3);

            assert_eq!(c.pop_n::<2>().unwrap(), [b, d]);
            assert_eq!(c.stack_offset().unwrap(), 1);
            assert_eq!(c.pop().unwrap(), a);
            assert_eq!(c.stack_offset().unwrap(), 0);
        });
    }

    #[test]
    fn pop_falls_back_to_frame_memory() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            c.push(Variable::imm(TAG_NUMBER, 1)).unwrap();
            assert_eq!(c.commit_stack().unwrap(), 1);
            assert_eq!(c.stack_cached().unwrap(), 0);
            assert_eq!(c.stack_offset().unwrap(), 1);

            // Committed slot plus the one-below-top allowance.
            let popped = c.pop_n::<2>().unwrap();
            assert!(matches!(popped[0].tag, Operand::Reg(_)));
            assert!(matches!(popped[1].tag, Operand::Reg(_)));
            assert_eq!(c.stack_offset().unwrap(), -1);
        });
    }

    #[test]
    fn pop_past_reachable_frame_underflows() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            // A fresh block can reach exactly one slot below its top.
            assert_eq!(
                c.pop_n::<2>().unwrap_err(),
                JitError::StackUnderflow {
                    requested: 2,
                    available: 1,
                }
            );
        });
    }

    #[test]
    fn overpopped_block_cannot_pop_again() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            c.pop().unwrap();
            assert_eq!(c.stack_offset().unwrap(), -1);
            assert_eq!(
                c.pop().unwrap_err(),
                JitError::StackUnderflow {
                    requested: 1,
                    available: 0,
                }
            );
        });
    }

    #[test]
    fn mixed_cache_and_memory_pop_decrements_offset_by_n() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            c.push(Variable::imm(TAG_NUMBER, 1)).unwrap();
            c.push(Variable::imm(TAG_NUMBER, 2)).unwrap();
            c.commit_stack().unwrap();
            let d = Variable::imm(TAG_NUMBER, 3);
            c.push(d).unwrap();
            assert_eq!(c.stack_offset().unwrap(), 3);

            let popped = c.pop_n::<3>().unwrap();
            // The cached value keeps its identity; the rest came from memory.
            assert_eq!(popped[2], d);
            assert!(matches!(popped[0].tag, Operand::Reg(_)));
            assert!(matches!(popped[1].tag, Operand::Reg(_)));
            assert_eq!(c.stack_offset().unwrap(), 0);
        });
    }

    #[test]
    fn commit_stack_twice_writes_nothing_new() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            c.push(Variable::imm(TAG_NUMBER, 1)).unwrap();
            c.push(Variable::imm(TAG_NUMBER, 2)).unwrap();
            assert_eq!(c.commit_stack().unwrap(), 2);
            assert_eq!(c.commit_stack().unwrap(), 0);
            assert_eq!(c.stack_cached().unwrap(), 0);
        });
    }

    #[test]
    fn open_block_resets_stack_state() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            let b1 = c.new_label();

            c.open_block(b0, None).unwrap();
            c.push(Variable::imm(TAG_NUMBER, 5)).unwrap();
            c.commit_stack().unwrap();
            c.jump(b1).unwrap();
            c.close_block().unwrap();

            c.open_block(b1, None).unwrap();
            assert_eq!(c.stack_offset().unwrap(), 0);
            assert_eq!(c.stack_cached().unwrap(), 0);
        });
    }

    #[test]
    fn clear_stack_discards_without_writing() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            c.push(Variable::imm(TAG_NUMBER, 1)).unwrap();
            c.push(Variable::imm(TAG_NUMBER, 2)).unwrap();
            c.clear_stack().unwrap();
            assert_eq!(c.stack_cached().unwrap(), 0);
            assert_eq!(c.stack_offset().unwrap(), 0);
            assert_eq!(c.commit_stack().unwrap(), 0);
        });
    }

    #[test]
    fn push_new_returns_register_pair() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            let v = c.push_new().unwrap();
            assert!(matches!(v.tag, Operand::Reg(_)));
            assert!(matches!(v.payload, Operand::Reg(_)));
            assert_eq!(c.stack_cached().unwrap(), 1);
            assert_eq!(c.pop().unwrap(), v);
        });
    }

    #[test]
    fn boundary_markers_exist_from_open() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            assert_eq!(c.nodes().nodes(), &[Node::ProcStart, Node::ProcEnd]);

            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();
            assert_eq!(
                c.nodes().nodes(),
                &[
                    Node::ProcStart,
                    Node::BlockStart(b0),
                    Node::BlockEnd(b0),
                    Node::ProcEnd,
                ]
            );
        });
    }

    #[test]
    fn empty_proc_seals_balanced_markers() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let artifact = c.close_proc().unwrap();
            assert_eq!(artifact.entry, None);
            assert!(artifact.continuations.is_empty());
        });
    }

    #[test]
    fn continuations_register_in_order() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            let b1 = c.new_label();
            let b2 = c.new_label();

            c.open_block(b0, None).unwrap();
            c.push(Variable::imm(TAG_NUMBER, 0)).unwrap();
            c.commit_stack().unwrap();
            c.jump(b1).unwrap();
            c.close_block().unwrap();

            c.open_block(b1, Some(0)).unwrap();
            c.push(Variable::imm(TAG_NUMBER, 0)).unwrap();
            c.commit_stack().unwrap();
            c.jump(b2).unwrap();
            c.close_block().unwrap();

            c.open_block(b2, Some(1)).unwrap();
            c.push(Variable::imm(TAG_NUMBER, 0)).unwrap();
            c.emit_return().unwrap();
            c.close_block().unwrap();

            let artifact = c.close_proc().unwrap();
            assert_eq!(artifact.entry, Some(b0));
            assert_eq!(artifact.continuations, vec![b1, b2]);
        });
    }

    #[test]
    fn sealed_compiler_rejects_reopen() {
        with_compiler(|c| {
            c.open_proc(0, 0).unwrap();
            c.close_proc().unwrap();
            assert_eq!(c.open_proc(0, 0), Err(JitError::ProcFinished));
        });
    }

    #[test]
    fn accessors_and_embedded_reads() {
        with_compiler(|c| {
            assert_eq!(c.stack_frame().unwrap_err(), JitError::ProcNotOpen);

            c.open_proc(0, 0).unwrap();
            let b0 = c.new_label();
            c.open_block(b0, None).unwrap();

            c.stack_frame().unwrap();
            c.context().unwrap();
            let iter = c.iterator().unwrap();
            c.set_iterator(iter).unwrap();

            let embedded = c.read_frame_value(64).unwrap();
            assert!(matches!(embedded.tag, Operand::Reg(_)));
            assert!(matches!(embedded.payload, Operand::Reg(_)));
        });
    }

    #[test]
    fn finish_requires_sealed_proc() {
        let mut func = Function::with_name_signature(UserFuncName::default(), proc_signature());
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut compiler = ProcCompiler::new(&mut func, &mut fb_ctx);
        compiler.open_proc(0, 0).unwrap();
        assert_eq!(compiler.finish().unwrap_err(), JitError::ProcStillOpen);
    }

    #[test]
    fn sealed_proc_finishes_with_balanced_stream() {
        let mut func = Function::with_name_signature(UserFuncName::default(), proc_signature());
        let mut fb_ctx = FunctionBuilderContext::new();
        let mut compiler = ProcCompiler::new(&mut func, &mut fb_ctx);

        compiler.open_proc(0, 0).unwrap();
        let b0 = compiler.new_label();
        compiler.open_block(b0, None).unwrap();
        compiler.push(Variable::imm(TAG_NUMBER, 42)).unwrap();
        compiler.emit_return().unwrap();
        compiler.close_block().unwrap();
        compiler.close_proc().unwrap();

        let nodes = compiler.finish().unwrap();
        assert!(nodes.is_balanced());
        assert_eq!(nodes.len(), 4);
    }
}
