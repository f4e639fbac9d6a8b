//! Per-call execution frame: registers, staging, stack arena, EH state.

use crate::error::VmError;
use crate::instruction::Instr;
use crate::module::Function;
use crate::rt_string::{rt_str_release_maybe, rt_str_retain_maybe};
use crate::slot::Slot;
use crate::types::TypeKind;

/// Bytes reserved for a frame's `alloca` arena.
///
/// The arena is allocated once per frame and never moves, so pointers handed
/// to IL code stay valid for the frame's lifetime.
pub const FRAME_STACK_BYTES: usize = 64 * 1024;

/// Error-token handle naming the frame's active error record.
pub const ERR_TOKEN_ACTIVE: u64 = 1;
/// Error-token handle naming the VM's transient trap token.
pub const ERR_TOKEN_TRAP: u64 = 2;

/// One installed exception handler.
///
/// Records the function that pushed it: a tail call may replace the frame's
/// function while the record stays live, and delivery must resolve the
/// handler block against the pushing function.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRecord<'m> {
    /// Function whose block list `handler` indexes.
    pub func: &'m Function,
    /// Index of the handler block in `func`.
    pub handler: usize,
    /// Instruction index at the time of `eh.push`.
    pub ip_snapshot: usize,
}

/// Where to continue after a handler finishes, single-use.
///
/// The token an IL program holds is the frame's sequence number; a token is
/// valid only while `valid` is set and the sequence matches, which makes
/// consumed and foreign tokens indistinguishable from stale ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeState {
    /// Faulting block index, when known.
    pub block: Option<usize>,
    /// Instruction index of the faulting instruction.
    pub fault_ip: usize,
    /// Instruction index just past the fault, clamped to the block length.
    pub next_ip: usize,
    /// Cleared on first consumption.
    pub valid: bool,
    /// Frame identity carried by handed-out tokens.
    pub seq: u64,
}

/// State for one in-flight function call.
pub struct Frame<'m> {
    /// Function being executed.
    pub func: &'m Function,
    /// Register file indexed by SSA id.
    pub regs: Vec<Slot>,
    /// Result type last written per register, for operand width selection.
    pub reg_types: Vec<TypeKind>,
    /// Staged block-parameter slots, consumed on block entry. A staged string
    /// slot owns one reference.
    pub params: Vec<Option<Slot>>,
    /// `alloca` arena.
    pub stack: Box<[u8]>,
    /// Next free arena offset.
    pub sp: usize,
    /// LIFO of installed handlers.
    pub eh_stack: Vec<HandlerRecord<'m>>,
    /// Error record populated when a trap lands in this frame's handler.
    pub active_error: VmError,
    /// Resume bookkeeping for the most recent trap.
    pub resume_state: ResumeState,
}

impl<'m> Frame<'m> {
    /// Fresh frame for `func` with the register file pre-sized to the
    /// function's SSA value count and the given token sequence.
    pub fn new(func: &'m Function, seq: u64) -> Self {
        let reg_count = func.value_names.len();
        Self {
            func,
            regs: vec![Slot::zero(); reg_count],
            reg_types: vec![TypeKind::Void; reg_count],
            params: vec![None; reg_count],
            stack: vec![0u8; FRAME_STACK_BYTES].into_boxed_slice(),
            sp: 0,
            eh_stack: Vec::new(),
            active_error: VmError::default(),
            resume_state: ResumeState {
                seq,
                ..ResumeState::default()
            },
        }
    }

    /// Write a register with string-aware ownership handling.
    ///
    /// Grows the register file on demand. For string writes the incoming
    /// handle is retained before the previous occupant is released, so
    /// self-assignment cannot drop the last reference.
    pub fn write_reg(&mut self, id: u32, ty: TypeKind, value: Slot) {
        let id = id as usize;
        if self.regs.len() <= id {
            self.regs.resize(id + 1, Slot::zero());
            self.reg_types.resize(id + 1, TypeKind::Void);
        }
        if ty == TypeKind::Str {
            rt_str_retain_maybe(value.str_handle());
            rt_str_release_maybe(self.regs[id].str_handle());
        }
        self.regs[id] = value;
        self.reg_types[id] = ty;
    }

    /// Store an instruction's result, if it declares one.
    pub fn store_result(&mut self, instr: &Instr, value: Slot) {
        if let Some(id) = instr.result {
            self.write_reg(id, instr.ty, value);
        }
    }

    /// Read a register, growing the view with zero for unwritten ids.
    pub fn read_reg(&self, id: u32) -> Slot {
        self.regs.get(id as usize).copied().unwrap_or_default()
    }

    /// Result type of the instruction that last defined `id`.
    pub fn reg_type(&self, id: u32) -> TypeKind {
        self.reg_types
            .get(id as usize)
            .copied()
            .unwrap_or(TypeKind::Void)
    }

    /// Validate that a slot carries this frame's live resume token.
    ///
    /// The token must name this frame's sequence and the resume state must
    /// still be armed; anything else is a stale or foreign token.
    pub fn expect_resume_token(&self, token: Slot) -> Option<ResumeState> {
        let seq = token.bits();
        if seq == 0 || seq != self.resume_state.seq || !self.resume_state.valid {
            return None;
        }
        Some(self.resume_state)
    }

    /// Slot handed to IL code as this frame's resume token.
    pub fn resume_token_slot(&self) -> Slot {
        Slot::from_bits(self.resume_state.seq)
    }
}

/// Resolve an error-token operand against the trap token and frame state.
///
/// Precedence follows the operand first, then the transient trap token, then
/// the frame's active error.
pub fn resolve_error_token(trap_token: Option<&VmError>, frame: &Frame<'_>, slot: Slot) -> VmError {
    match slot.bits() {
        ERR_TOKEN_TRAP => trap_token.copied().unwrap_or(frame.active_error),
        ERR_TOKEN_ACTIVE => frame.active_error,
        0 => trap_token.copied().unwrap_or(frame.active_error),
        _ => frame.active_error,
    }
}
