//! Runtime frame and context layout.
//!
//! Everything in this module is a fixed contract with the Kiln runtime: the
//! emitted code reads and writes frame memory at these exact offsets, and the
//! scheduler decodes return values with this exact packing. None of it may
//! drift without a matching runtime change.
//!
//! A tagged value occupies one 8-byte slot: a 32-bit type tag at offset 0 and
//! a 32-bit payload at offset 4, little-endian. A whole slot read as a `u64`
//! therefore equals `tag | payload << 32`, which is also the packed encoding
//! compiled procs return in a single register.
//!
//! ```text
//! frame base
//!   +0   implicit: source object
//!   +8   implicit: calling user
//!   +16  implicit: last-expression result
//!   +24  argument slots (args_count * 8)
//!   ...  local slots   (locals_count * 8)
//! ```
//!
//! The operand stack lives outside the frame header; the context struct holds
//! a pointer to its current top (the first free slot).

/// Size of one tagged value slot in bytes.
pub const VALUE_SIZE: i32 = 8;

/// Byte offset of the type tag within a slot.
pub const VALUE_TAG_OFFSET: i32 = 0;

/// Byte offset of the payload within a slot.
pub const VALUE_PAYLOAD_OFFSET: i32 = 4;

/// Type tags the runtime defines for values this layer materializes itself.
/// The full tag space belongs to the runtime; only these are needed here.
pub const TAG_NULL: i64 = 0x00;
pub const TAG_NUMBER: i64 = 0x2a;
pub const TAG_STRING: i64 = 0x06;
pub const TAG_OBJECT: i64 = 0x0c;

/// Byte offset of the operand-stack top pointer inside the context struct.
/// The pointer addresses the first free slot, not the topmost value.
pub const CTX_STACK_TOP: i32 = 0;

/// Frame-header offsets of the implicit values.
pub const FRAME_SOURCE: i32 = 0;
pub const FRAME_CALLER: i32 = 8;
pub const FRAME_RESULT: i32 = 16;

/// Byte offset where the argument slots begin.
pub const FRAME_ARGS: i32 = 24;

/// The per-proc implicit values, each backed by a fixed frame-header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Implicit {
    /// The object the proc runs on behalf of.
    Source,
    /// The user that initiated the call chain.
    Caller,
    /// The last-expression result.
    LastResult,
}

impl Implicit {
    /// Frame byte offset of this implicit's backing slot.
    pub fn frame_offset(self) -> i32 {
        match self {
            Implicit::Source => FRAME_SOURCE,
            Implicit::Caller => FRAME_CALLER,
            Implicit::LastResult => FRAME_RESULT,
        }
    }
}

/// Frame byte offset of argument slot `index`.
pub fn arg_offset(index: u32) -> i32 {
    FRAME_ARGS + index as i32 * VALUE_SIZE
}

/// Frame byte offset of local slot `index` in a proc with `args_count`
/// arguments. Locals follow the argument slots.
pub fn local_offset(args_count: u32, index: u32) -> i32 {
    FRAME_ARGS + (args_count + index) as i32 * VALUE_SIZE
}

/// Pack a tag/payload pair into the single-register return encoding.
pub fn pack_value(tag: u32, payload: u32) -> u64 {
    tag as u64 | (payload as u64) << 32
}

/// Split a packed value back into `(tag, payload)`.
pub fn unpack_value(bits: u64) -> (u32, u32) {
    (bits as u32, (bits >> 32) as u32)
}
