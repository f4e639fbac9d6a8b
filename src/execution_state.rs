//! Execution state driven by the dispatch loop.

use hashbrown::HashMap;

use crate::error::{FrameInfo, VmError};
use crate::frame::Frame;
use crate::instruction::Instr;
use crate::module::BasicBlock;
use crate::slot::Slot;
use crate::switch_cache::SwitchCache;

/// Control-flow effect of one executed instruction.
#[derive(Debug, Clone, Copy)]
pub enum ExecResult {
    /// Fall through; the loop advances the instruction pointer.
    Continue,
    /// The handler rewrote block/ip; do not advance.
    Jumped,
    /// The function finished with the given value.
    Returned(Slot),
}

/// Non-local control transfer used by the trap protocol.
///
/// Raised as the `Err` arm of handler results. `Handled` means the raising
/// frame already owns a handler and control has been rewritten to it; the
/// dispatch loop simply continues. `Trap` travels outward through the call
/// stack until a frame with an installed handler catches it, or surfaces to
/// the host as a formatted exception.
#[derive(Debug)]
pub enum Unwind {
    /// Control already transferred to a handler in the current state.
    Handled,
    /// Still searching for a handler in an outer frame.
    Trap {
        /// The error record in flight.
        error: VmError,
        /// Fault context captured where the trap was raised.
        frame: FrameInfo,
        /// Optional diagnostic payload.
        message: String,
    },
}

/// Result type of opcode handlers.
pub type OpResult = Result<ExecResult, Unwind>;

/// Everything the dispatch loop owns for one function invocation.
pub struct ExecState<'m> {
    /// The call's frame.
    pub frame: Frame<'m>,
    /// Label to block-index map for branch resolution.
    pub blocks: HashMap<&'m str, usize>,
    /// Index of the current block.
    pub block: usize,
    /// Instruction index within the current block.
    pub ip: usize,
    /// Result staged by a return or pause.
    pub pending_result: Option<Slot>,
    /// Set when the loop must stop after the current step.
    pub exit_requested: bool,
    /// Suppresses one block-breakpoint hit while stepping off a break.
    pub skip_break_once: bool,
    /// Per-invocation switch dispatch cache.
    pub switch_cache: SwitchCache,
}

impl<'m> ExecState<'m> {
    /// The current basic block, if the block index is in range.
    pub fn current_block(&self) -> Option<&'m BasicBlock> {
        self.frame.func.blocks.get(self.block)
    }

    /// The instruction at the current ip, if any.
    pub fn current_instr(&self) -> Option<&'m Instr> {
        self.current_block()?.instrs.get(self.ip)
    }

    /// Label of the current block, empty when out of range.
    pub fn block_label(&self) -> &'m str {
        self.current_block().map(|b| b.label.as_str()).unwrap_or("")
    }
}
