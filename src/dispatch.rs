//! Interchangeable dispatch strategies sharing one step contract.
//!
//! Every iteration runs the same four steps: reset per-iteration state,
//! select the next instruction (honouring debugger pauses), execute the
//! opcode, finalize (advance ip, process returns and post-step pauses). The
//! strategies differ only in how the handler is reached. All three produce
//! identical outputs on the same inputs.

use once_cell::sync::Lazy;

use crate::execution_state::{ExecState, Unwind};
use crate::ops;
use crate::vm::Vm;

/// Which dispatch loop drives execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchKind {
    /// Indexed function-pointer table; portable and branch-predictor-friendly.
    Table,
    /// One large match with inlined handler calls.
    #[default]
    Switch,
    /// Threaded dispatch. Rust has no computed goto, so this selects the
    /// switch loop; the name stays selectable for configuration parity.
    Threaded,
}

impl DispatchKind {
    /// Parse a selector string; unknown spellings fall back to `Switch`.
    pub fn parse(text: &str) -> DispatchKind {
        match text.to_ascii_lowercase().as_str() {
            "table" | "fn_table" | "fntable" => DispatchKind::Table,
            "threaded" | "goto" => DispatchKind::Threaded,
            _ => DispatchKind::Switch,
        }
    }

    /// Kind selected by `ILVM_DISPATCH`, read once at startup.
    pub fn from_env() -> DispatchKind {
        static KIND: Lazy<DispatchKind> = Lazy::new(|| {
            std::env::var("ILVM_DISPATCH")
                .map(|v| DispatchKind::parse(&v))
                .unwrap_or_default()
        });
        *KIND
    }
}

/// Run the configured strategy until the state requests an exit.
///
/// Returns `Ok` when the function returned or paused (the result is staged in
/// `pending_result`); propagates traps still searching for a handler in an
/// outer frame.
pub(crate) fn run_driver<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>) -> Result<(), Unwind> {
    match vm.dispatch_kind() {
        DispatchKind::Table => run_table(vm, st),
        DispatchKind::Switch | DispatchKind::Threaded => run_switch(vm, st),
    }
}

fn run_table<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>) -> Result<(), Unwind> {
    loop {
        vm.begin_dispatch(st);

        let Some(instr) = vm.select_instruction(st) else {
            return Ok(());
        };
        vm.trace_instruction(st, instr);

        let handler = ops::HANDLER_TABLE[instr.op as usize];
        match handler(vm, st, instr) {
            Ok(exec) => {
                if vm.finalize_dispatch(st, exec) {
                    return Ok(());
                }
            }
            Err(Unwind::Handled) => continue,
            Err(Unwind::Trap {
                error,
                frame,
                message,
            }) => match vm.catch_trap(st, error, frame, message) {
                Unwind::Handled => continue,
                trap => return Err(trap),
            },
        }
    }
}

fn run_switch<'m>(vm: &mut Vm<'m>, st: &mut ExecState<'m>) -> Result<(), Unwind> {
    loop {
        vm.begin_dispatch(st);

        let Some(instr) = vm.select_instruction(st) else {
            return Ok(());
        };
        vm.trace_instruction(st, instr);

        match ops::dispatch_switch(vm, st, instr) {
            Ok(exec) => {
                if vm.finalize_dispatch(st, exec) {
                    return Ok(());
                }
            }
            Err(Unwind::Handled) => continue,
            Err(Unwind::Trap {
                error,
                frame,
                message,
            }) => match vm.catch_trap(st, error, frame, message) {
                Unwind::Handled => continue,
                trap => return Err(trap),
            },
        }
    }
}
