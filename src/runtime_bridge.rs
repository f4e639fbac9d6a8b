//! Glue between the interpreter and the runtime helper registry.
//!
//! The bridge validates call arity, marshals slots into the C-style argument
//! array, invokes the descriptor's handler, classifies pow-style exceptional
//! results, and converts the result buffer back into a slot. Trap context is
//! recorded on the VM so asynchronous diagnostics name the right call site.

use crate::error::{
    format_error, store_thread_trap_token, FrameInfo, TrapKind, VmError, VmException,
};
use crate::execution_state::{ExecState, Unwind};
use crate::instruction::SourceLoc;
use crate::marshal::{
    assign_call_result, classify_pow_trap, marshal_arguments, result_buffer_for, PowStatus,
    ResultBuffers,
};
use crate::runtime_registry::find_runtime_descriptor;
use crate::slot::Slot;
use crate::vm::Vm;

/// Call-site metadata installed for the duration of one runtime call.
#[derive(Debug, Clone, Default)]
pub struct RuntimeCallContext {
    /// Source location of the `call` instruction.
    pub loc: SourceLoc,
    /// Function executing the call.
    pub function: String,
    /// Block label executing the call.
    pub block: String,
    /// Message recorded by the most recent bridge trap.
    pub message: String,
}

/// Invoke a runtime helper by name on behalf of the VM.
///
/// Installs the call context, resolves the descriptor, validates arity,
/// marshals, invokes, classifies pow traps, and converts the result. The
/// transient context fields are cleared on every exit path.
pub(crate) fn call<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    name: &str,
    args: &mut [Slot],
    loc: SourceLoc,
) -> Result<Slot, Unwind> {
    vm.runtime_context = RuntimeCallContext {
        loc,
        function: st.frame.func.name.clone(),
        block: st.block_label().to_string(),
        message: String::new(),
    };

    let result = call_inner(vm, st, name, args);

    vm.runtime_context = RuntimeCallContext::default();
    result
}

fn call_inner<'m>(
    vm: &mut Vm<'m>,
    st: &mut ExecState<'m>,
    name: &str,
    args: &mut [Slot],
) -> Result<Slot, Unwind> {
    let Some(desc) = find_runtime_descriptor(name) else {
        let message = format!("attempted to call unknown runtime helper '{name}'");
        vm.runtime_context.message = message.clone();
        return Err(vm.raise_message(st, TrapKind::DomainError, 0, message));
    };

    let mut pow = PowStatus {
        active: desc.pow_class,
        ok: true,
    };
    let raw_args = match marshal_arguments(&desc.signature, name, args, &mut pow) {
        Ok(raw) => raw,
        Err(err) => {
            vm.runtime_context.message = err.message.clone();
            return Err(vm.raise_message(st, err.kind, 0, err.message));
        }
    };

    let mut buffers = ResultBuffers::default();
    let result_ptr = result_buffer_for(desc.signature.ret, &mut buffers);
    unsafe { (desc.handler)(&raw_args, result_ptr) };
    drop(raw_args);

    if let Some(outcome) = classify_pow_trap(desc, &pow, args, &buffers) {
        vm.runtime_context.message = outcome.message.clone();
        return Err(vm.raise_message(st, outcome.kind, 0, outcome.message));
    }

    Ok(assign_call_result(&desc.signature, &buffers))
}

/// Record a trap raised by runtime code while no VM is active.
///
/// The analogue of the host `vm_trap` hook's fallback path: the error lands
/// in the thread-local trap token and comes back as a formatted exception for
/// the embedder to surface.
pub fn standalone_trap(
    kind: TrapKind,
    message: &str,
    loc: SourceLoc,
    function: &str,
    block: &str,
) -> VmException {
    let error = VmError {
        kind,
        code: 0,
        ip: 0,
        line: if loc.has_line() { loc.line as i32 } else { -1 },
    };
    let frame = FrameInfo {
        function: if function.is_empty() {
            "<unknown>".to_string()
        } else {
            function.to_string()
        },
        block: block.to_string(),
        ip: 0,
        line: error.line,
    };
    store_thread_trap_token(error, message.to_string());

    let mut text = format_error(&error, &frame);
    if !message.is_empty() {
        text.push_str(": ");
        text.push_str(message);
    }
    VmException::Trap {
        message: text,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{clear_thread_trap_token, thread_trap_token};

    #[test]
    fn test_standalone_trap_formats_and_arms_token() {
        clear_thread_trap_token();
        let err = standalone_trap(
            TrapKind::DomainError,
            "bad input",
            SourceLoc::default(),
            "",
            "",
        );
        assert_eq!(
            err.to_string(),
            "Trap @<unknown>#0 line -1: DomainError (code=0): bad input"
        );
        assert_eq!(thread_trap_token().unwrap().kind, TrapKind::DomainError);
        clear_thread_trap_token();
    }
}
