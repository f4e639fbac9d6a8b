//! The VM facade: module binding, execution entry points, trap delivery,
//! and debug control.
//!
//! A `Vm` borrows an already-built module for its whole lifetime, caches
//! function and global lookups, and owns the runtime strings it materialises.
//! Each instance is single-threaded; nested calls recurse through
//! `exec_function`, and traps travel outward as `Unwind` values until a frame
//! with an installed handler catches them.

use hashbrown::HashMap;

use crate::debugger::{DebugAction, DebugScript, Debugger};
use crate::dispatch::{self, DispatchKind};
use crate::error::{
    clear_thread_trap_token, thread_trap_token, FrameInfo, TrapKind, VmError, VmException,
    VmResult,
};
use crate::execution_state::{ExecResult, ExecState, Unwind};
use crate::frame::{Frame, ERR_TOKEN_ACTIVE};
use crate::instruction::Instr;
use crate::marshal::to_runtime_string;
use crate::module::{Function, Module};
use crate::rt_string::{rt_str_release_maybe, rt_str_retain_maybe, RtStr};
use crate::runtime_bridge::RuntimeCallContext;
use crate::slot::Slot;
use crate::switch_cache::{SwitchCache, SwitchMode};
use crate::types::TypeKind;
use crate::value::Value;

/// Construction-time configuration for a VM instance.
pub struct VmOptions {
    /// Dispatch strategy driving the interpreter loop.
    pub dispatch: DispatchKind,
    /// Forced or automatic switch-backend selection.
    pub switch_mode: SwitchMode,
    /// Retired-instruction limit; 0 disables the limit.
    pub max_steps: u64,
    /// Initial debugger control block.
    pub debug: Debugger,
    /// Optional scripted debugger interaction.
    pub script: Option<DebugScript>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            dispatch: DispatchKind::from_env(),
            switch_mode: SwitchMode::from_env(),
            max_steps: 0,
            debug: Debugger::new(),
            script: None,
        }
    }
}

/// Mutable storage for the trap currently in flight.
#[derive(Debug, Default)]
pub struct TrapToken {
    /// The error record.
    pub error: VmError,
    /// Diagnostic message attached to the token.
    pub message: String,
    /// True while a trap is armed.
    pub valid: bool,
}

/// An IL virtual machine bound to one module.
pub struct Vm<'m> {
    module: &'m Module,
    fn_map: HashMap<&'m str, &'m Function>,
    str_map: HashMap<&'m str, RtStr>,
    literal_cache: HashMap<String, RtStr>,
    dispatch_kind: DispatchKind,
    switch_mode: SwitchMode,
    pub(crate) debug: Debugger,
    script: Option<DebugScript>,
    max_steps: u64,
    instr_count: u64,
    step_budget: u64,
    pub(crate) trap_token: TrapToken,
    pub(crate) runtime_context: RuntimeCallContext,
    frame_seq: u64,
}

impl<'m> Vm<'m> {
    /// VM with default options.
    pub fn new(module: &'m Module) -> Self {
        Self::with_options(module, VmOptions::default())
    }

    /// VM with explicit options.
    ///
    /// Caches function pointers and materialises every global string so later
    /// lookups are constant time.
    pub fn with_options(module: &'m Module, options: VmOptions) -> Self {
        let mut fn_map = HashMap::new();
        for func in &module.functions {
            fn_map.insert(func.name.as_str(), func);
        }
        let mut str_map = HashMap::new();
        for global in &module.globals {
            str_map.insert(
                global.name.as_str(),
                to_runtime_string(Some(global.init.as_bytes())),
            );
        }
        Self {
            module,
            fn_map,
            str_map,
            literal_cache: HashMap::new(),
            dispatch_kind: options.dispatch,
            switch_mode: options.switch_mode,
            debug: options.debug,
            script: options.script,
            max_steps: options.max_steps,
            instr_count: 0,
            step_budget: 0,
            trap_token: TrapToken::default(),
            runtime_context: RuntimeCallContext::default(),
            frame_seq: 0,
        }
    }

    /// The bound module.
    pub fn module(&self) -> &'m Module {
        self.module
    }

    /// Look up a function by name.
    pub fn function(&self, name: &str) -> Option<&'m Function> {
        self.fn_map.get(name).copied()
    }

    /// Cumulative retired-instruction count.
    pub fn instr_count(&self) -> u64 {
        self.instr_count
    }

    /// Active dispatch strategy.
    pub fn dispatch_kind(&self) -> DispatchKind {
        self.dispatch_kind
    }

    /// Override the dispatch strategy.
    pub fn set_dispatch_kind(&mut self, kind: DispatchKind) {
        self.dispatch_kind = kind;
    }

    /// Active switch-backend selection.
    pub fn switch_mode(&self) -> SwitchMode {
        self.switch_mode
    }

    /// Override the switch-backend selection.
    pub fn set_switch_mode(&mut self, mode: SwitchMode) {
        self.switch_mode = mode;
    }

    /// Borrow the debug controller.
    pub fn debugger(&self) -> &Debugger {
        &self.debug
    }

    /// Mutably borrow the debug controller.
    pub fn debugger_mut(&mut self) -> &mut Debugger {
        &mut self.debug
    }

    /// Execute the module's `main` and return its i64 result.
    ///
    /// A missing `main` prints `missing main` and returns 1; an unhandled
    /// trap prints its diagnostic and returns 1.
    pub fn run(&mut self) -> i64 {
        match self.run_function("main", &[]) {
            Ok(slot) => slot.i64(),
            Err(VmException::UnknownFunction { .. }) => {
                eprintln!("missing main");
                1
            }
            Err(err) => {
                eprintln!("{err}");
                1
            }
        }
    }

    /// Execute a named function with arguments.
    pub fn run_function(&mut self, name: &str, args: &[Slot]) -> VmResult<Slot> {
        let func = self
            .function(name)
            .ok_or_else(|| VmException::unknown_function(name))?;
        self.trap_token = TrapToken::default();
        self.exec_function(func, args)
            .map_err(unwind_to_exception)
    }

    /// Build an execution state for a named function without running it.
    ///
    /// Entry point of the step API used by debuggers and tests.
    pub fn prepare(&mut self, name: &str, args: &[Slot]) -> VmResult<ExecState<'m>> {
        let func = self
            .function(name)
            .ok_or_else(|| VmException::unknown_function(name))?;
        self.build_state(func, args).map_err(unwind_to_exception)
    }

    /// Run one iteration of the shared step contract.
    ///
    /// Returns `Some(result)` when the function finished or paused; a trap
    /// caught by this frame's handler yields `Ok(None)` with control already
    /// at the handler.
    pub fn step(&mut self, st: &mut ExecState<'m>) -> VmResult<Option<Slot>> {
        self.begin_dispatch(st);

        let Some(instr) = self.select_instruction(st) else {
            return Ok(Some(st.pending_result.take().unwrap_or_default()));
        };
        self.trace_instruction(st, instr);

        let outcome = match self.dispatch_kind {
            DispatchKind::Table => {
                let handler = crate::ops::HANDLER_TABLE[instr.op as usize];
                handler(self, st, instr)
            }
            _ => crate::ops::dispatch_switch(self, st, instr),
        };

        match outcome {
            Ok(exec) => {
                if self.finalize_dispatch(st, exec) {
                    return Ok(Some(st.pending_result.take().unwrap_or_default()));
                }
                Ok(None)
            }
            Err(Unwind::Handled) => Ok(None),
            Err(Unwind::Trap {
                error,
                frame,
                message,
            }) => match self.catch_trap(st, error, frame, message) {
                Unwind::Handled => Ok(None),
                trap => Err(unwind_to_exception(trap)),
            },
        }
    }

    /// Execute a function, recursing through the current VM state.
    pub(crate) fn exec_function(
        &mut self,
        func: &'m Function,
        args: &[Slot],
    ) -> Result<Slot, Unwind> {
        let mut st = self.build_state(func, args)?;
        dispatch::run_driver(self, &mut st)?;
        Ok(st.pending_result.take().unwrap_or_default())
    }

    /// Prepare a frame, verify entry arity, and stage the arguments.
    fn build_state(&mut self, func: &'m Function, args: &[Slot]) -> Result<ExecState<'m>, Unwind> {
        self.frame_seq += 1;
        let mut frame = Frame::new(func, self.frame_seq);

        let mut blocks = HashMap::with_capacity(func.blocks.len());
        for (idx, block) in func.blocks.iter().enumerate() {
            blocks.insert(block.label.as_str(), idx);
        }

        if let Some(entry) = func.blocks.first() {
            if args.len() != entry.params.len() {
                let message = format!(
                    "argument count mismatch for function {}: expected {} argument{}, received {}",
                    func.name,
                    entry.params.len(),
                    if entry.params.len() == 1 { "" } else { "s" },
                    args.len()
                );
                return Err(Unwind::Trap {
                    error: VmError::new(TrapKind::InvalidOperation, 0),
                    frame: FrameInfo {
                        function: func.name.clone(),
                        block: entry.label.clone(),
                        ip: 0,
                        line: -1,
                    },
                    message,
                });
            }
            for (param, arg) in entry.params.iter().zip(args) {
                let id = param.id as usize;
                if id >= frame.params.len() {
                    frame.params.resize(id + 1, None);
                }
                // Staged string slots own one reference.
                if param.ty == TypeKind::Str {
                    rt_str_retain_maybe(arg.str_handle());
                }
                frame.params[id] = Some(*arg);
            }
        }

        self.debug.reset_last_hit();
        Ok(ExecState {
            frame,
            blocks,
            block: 0,
            ip: 0,
            pending_result: None,
            exit_requested: false,
            skip_break_once: false,
            switch_cache: SwitchCache::default(),
        })
    }

    /// Evaluate an operand into a slot.
    pub(crate) fn eval(&mut self, st: &mut ExecState<'m>, value: &Value) -> Result<Slot, Unwind> {
        match value {
            Value::Temp(id) => Ok(st.frame.read_reg(*id)),
            Value::ConstInt(v) => Ok(Slot::from_i64(*v)),
            Value::ConstFloat(v) => Ok(Slot::from_f64(*v)),
            Value::Null => Ok(Slot::zero()),
            Value::ConstStr(text) => {
                let handle = self.intern_literal(text);
                Ok(Slot::from_str_handle(handle))
            }
            Value::GlobalAddr(name) => match self.str_map.get(name.as_str()) {
                Some(&handle) => Ok(Slot::from_str_handle(handle)),
                None => Err(self.raise_message(st, TrapKind::DomainError, 0, "unknown global")),
            },
        }
    }

    /// Handle for an inline string literal, cached per VM.
    pub(crate) fn intern_literal(&mut self, text: &str) -> RtStr {
        if let Some(&handle) = self.literal_cache.get(text) {
            return handle;
        }
        let handle = to_runtime_string(Some(text.as_bytes()));
        self.literal_cache.insert(text.to_string(), handle);
        handle
    }

    /// Arm the VM trap token with an error and message.
    pub(crate) fn arm_trap_token(&mut self, error: VmError, message: String) {
        self.trap_token = TrapToken {
            error,
            message,
            valid: true,
        };
    }

    /// The armed trap token, falling back to the thread-local token.
    pub(crate) fn current_trap_token(&self) -> Option<VmError> {
        if self.trap_token.valid {
            return Some(self.trap_token.error);
        }
        thread_trap_token()
    }

    // --- Step contract -----------------------------------------------------

    /// Reset per-iteration state before selecting an instruction.
    pub(crate) fn begin_dispatch(&mut self, st: &mut ExecState<'m>) {
        st.exit_requested = false;
        st.pending_result = None;
    }

    /// Select the next instruction, honouring exhaustion and debug pauses.
    ///
    /// A block exhausted without a terminator indicates corrupted IR and is
    /// handled as a clean exit with a zero result.
    pub(crate) fn select_instruction(&mut self, st: &mut ExecState<'m>) -> Option<&'m Instr> {
        let func = st.frame.func;
        let in_range = func
            .blocks
            .get(st.block)
            .map(|b| st.ip < b.instrs.len())
            .unwrap_or(false);
        if !in_range {
            st.pending_result = Some(Slot::zero());
            st.exit_requested = true;
            return None;
        }

        let instr = &func.blocks[st.block].instrs[st.ip];
        if let Some(pause) = self.process_debug_control(st, Some(instr), false) {
            st.pending_result = Some(pause);
            st.exit_requested = true;
            return None;
        }
        Some(instr)
    }

    /// Count the instruction and emit the trace event.
    pub(crate) fn trace_instruction(&mut self, st: &ExecState<'m>, instr: &'m Instr) {
        self.instr_count += 1;
        log::trace!(
            "@{} {}#{} {}",
            st.frame.func.name,
            st.block_label(),
            st.ip,
            instr.op.mnemonic()
        );
    }

    /// Process returns, jumps, ip advance, and the post-step debug hook.
    ///
    /// Returns true when the enclosing function has completed.
    pub(crate) fn finalize_dispatch(&mut self, st: &mut ExecState<'m>, exec: ExecResult) -> bool {
        match exec {
            ExecResult::Returned(value) => {
                st.pending_result = Some(value);
                st.exit_requested = true;
                return true;
            }
            ExecResult::Jumped => self.debug.reset_last_hit(),
            ExecResult::Continue => st.ip += 1,
        }

        if let Some(pause) = self.process_debug_control(st, None, true) {
            st.pending_result = Some(pause);
            st.exit_requested = true;
            return true;
        }

        st.pending_result = None;
        st.exit_requested = false;
        false
    }

    // --- Debug control -----------------------------------------------------

    /// Apply pending block-parameter transfers for the current block.
    ///
    /// Staged slots move into the register file with string-aware writes, a
    /// watch event fires per parameter, and the staging entry is cleared so
    /// repeated calls are harmless.
    fn transfer_block_params(&mut self, st: &mut ExecState<'m>) {
        let Some(block) = st.current_block() else {
            return;
        };
        for param in &block.params {
            let id = param.id as usize;
            if id >= st.frame.params.len() {
                st.frame.params.resize(id + 1, None);
            }
            let Some(pending) = st.frame.params[id].take() else {
                continue;
            };
            st.frame.write_reg(param.id, param.ty, pending);
            let stored = st.frame.read_reg(param.id);
            self.debug.on_store(
                &param.name,
                param.ty,
                stored.i64(),
                stored.f64(),
                &st.frame.func.name,
                &block.label,
                0,
            );
            if param.ty == TypeKind::Str {
                rt_str_release_maybe(pending.str_handle());
            }
        }
    }

    /// Check for a block or source-line break at the current position.
    fn handle_debug_break(
        &mut self,
        st: &mut ExecState<'m>,
        instr: Option<&'m Instr>,
    ) -> Option<Slot> {
        let Some(block) = st.current_block() else {
            return None;
        };

        let Some(instr) = instr else {
            if self.debug.should_break(block) {
                eprintln!(
                    "[BREAK] fn=@{} blk={} reason=label",
                    st.frame.func.name, block.label
                );
                match self.script.as_mut().filter(|s| !s.is_empty()) {
                    None => {
                        return Some(Slot::from_i64(10));
                    }
                    Some(script) => {
                        if let Some(DebugAction::Step(count)) = script.next_action() {
                            self.step_budget = count;
                        }
                        st.skip_break_once = true;
                    }
                }
            }
            return None;
        };

        if self.debug.has_src_line_bps() && self.debug.should_break_on(instr) {
            let path = self.debug.source_basename(instr.loc.file_id);
            eprintln!(
                "[BREAK] src={path}:{} fn=@{} blk={} ip=#{}",
                instr.loc.line, st.frame.func.name, block.label, st.ip
            );
            return Some(Slot::from_i64(10));
        }
        None
    }

    /// Debug bookkeeping before or after an instruction executes.
    ///
    /// Enforces the step limit, transfers block parameters on block entry,
    /// runs breakpoint checks, and manages the single-step budget. A returned
    /// slot pauses the interpreter loop with that value.
    pub(crate) fn process_debug_control(
        &mut self,
        st: &mut ExecState<'m>,
        instr: Option<&'m Instr>,
        post_exec: bool,
    ) -> Option<Slot> {
        if !post_exec {
            if self.max_steps != 0 && self.instr_count >= self.max_steps {
                eprintln!("VM: step limit exceeded ({}); aborting.", self.max_steps);
                return Some(Slot::from_i64(1));
            }
            if st.ip == 0 {
                self.transfer_block_params(st);
            }
            if st.ip == 0 && self.step_budget == 0 && !st.skip_break_once {
                if let Some(pause) = self.handle_debug_break(st, None) {
                    return Some(pause);
                }
            }
            st.skip_break_once = false;
            if instr.is_some() {
                if let Some(pause) = self.handle_debug_break(st, instr) {
                    return Some(pause);
                }
            }
            return None;
        }

        if self.step_budget > 0 {
            self.step_budget -= 1;
            if self.step_budget == 0 {
                eprintln!(
                    "[BREAK] fn=@{} blk={} reason=step",
                    st.frame.func.name,
                    st.block_label()
                );
                match self.script.as_mut().filter(|s| !s.is_empty()) {
                    None => return Some(Slot::from_i64(10)),
                    Some(script) => {
                        if let Some(DebugAction::Step(count)) = script.next_action() {
                            self.step_budget = count;
                        }
                        st.skip_break_once = true;
                    }
                }
            }
        }
        None
    }

    // --- Trap delivery -----------------------------------------------------

    /// Raise a trap from the current instruction context.
    pub(crate) fn raise_message(
        &mut self,
        st: &mut ExecState<'m>,
        kind: TrapKind,
        code: i32,
        message: impl Into<String>,
    ) -> Unwind {
        self.raise_error(st, VmError::new(kind, code), message.into())
    }

    /// Raise a trap from a pre-built error record.
    ///
    /// Stamps defaulted ip/line fields from the current context, then either
    /// installs the frame's handler or sends the trap outward.
    pub(crate) fn raise_error(
        &mut self,
        st: &mut ExecState<'m>,
        mut error: VmError,
        message: String,
    ) -> Unwind {
        let line = current_line(st);
        if error.ip == 0 {
            error.ip = st.ip as u64;
        }
        if error.line < 0 {
            error.line = line;
        }

        if st.frame.eh_stack.is_empty() {
            return Unwind::Trap {
                error,
                frame: FrameInfo {
                    function: st.frame.func.name.clone(),
                    block: st.block_label().to_string(),
                    ip: st.ip as u64,
                    line,
                },
                message,
            };
        }
        self.install_handler(st, error);
        Unwind::Handled
    }

    /// Catch a trap arriving from a nested call.
    ///
    /// If this frame has a handler the trap is re-attributed to the call
    /// site; otherwise it keeps travelling outward with the original fault
    /// context for diagnostics.
    pub(crate) fn catch_trap(
        &mut self,
        st: &mut ExecState<'m>,
        error: VmError,
        origin: FrameInfo,
        message: String,
    ) -> Unwind {
        if st.frame.eh_stack.is_empty() {
            return Unwind::Trap {
                error,
                frame: origin,
                message,
            };
        }
        self.install_handler(st, error);
        Unwind::Handled
    }

    /// Redirect execution to the top handler of the current frame.
    ///
    /// Populates the active error and resume state, binds the handler block's
    /// (error, resume-token) parameters, rewrites control to the handler's
    /// first instruction, and clears any transient trap token. When a tail
    /// call replaced the frame's function after the handler was pushed, the
    /// frame is re-pointed at the pushing function and the fault site becomes
    /// unresumable (`resume.label` still works).
    fn install_handler(&mut self, st: &mut ExecState<'m>, error: VmError) {
        let record = *st
            .frame
            .eh_stack
            .last()
            .expect("install_handler requires a non-empty EH stack");

        let fault_block = st.block;
        let fault_ip = st.ip;
        let line = current_line(st);
        let block_len = st
            .frame
            .func
            .blocks
            .get(fault_block)
            .map(|b| b.instrs.len())
            .unwrap_or(fault_ip);
        let same_function = std::ptr::eq(record.func, st.frame.func);

        let mut installed = error;
        installed.ip = fault_ip as u64;
        installed.line = line;
        st.frame.active_error = installed;

        if !same_function {
            st.frame.func = record.func;
            st.blocks.clear();
            for (idx, block) in record.func.blocks.iter().enumerate() {
                st.blocks.insert(block.label.as_str(), idx);
            }
        }

        st.frame.resume_state.block = same_function.then_some(fault_block);
        st.frame.resume_state.fault_ip = fault_ip;
        st.frame.resume_state.next_ip = (fault_ip + 1).min(block_len);
        st.frame.resume_state.valid = true;

        let func = st.frame.func;
        if let Some(handler) = func.blocks.get(record.handler) {
            if let Some(err_param) = handler.params.first() {
                let id = err_param.id as usize;
                if id >= st.frame.params.len() {
                    st.frame.params.resize(id + 1, None);
                }
                st.frame.params[id] = Some(Slot::from_bits(ERR_TOKEN_ACTIVE));
            }
            if let Some(tok_param) = handler.params.get(1) {
                let id = tok_param.id as usize;
                if id >= st.frame.params.len() {
                    st.frame.params.resize(id + 1, None);
                }
                st.frame.params[id] = Some(st.frame.resume_token_slot());
            }
        }

        st.block = record.handler;
        st.ip = 0;
        st.skip_break_once = false;

        self.trap_token.valid = false;
        clear_thread_trap_token();
        log::debug!(
            "trap {} delivered to handler {} in @{}",
            installed.kind,
            record.handler,
            func.name
        );
    }
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        for (_, handle) in self.str_map.drain() {
            rt_str_release_maybe(handle);
        }
        for (_, handle) in self.literal_cache.drain() {
            rt_str_release_maybe(handle);
        }
    }
}

fn current_line(st: &ExecState<'_>) -> i32 {
    st.current_instr()
        .map(|i| i.loc.line)
        .filter(|line| *line > 0)
        .map(|line| line as i32)
        .unwrap_or(-1)
}

fn unwind_to_exception(unwind: Unwind) -> VmException {
    match unwind {
        Unwind::Trap {
            error,
            frame,
            message,
        } => VmException::trap(error, &frame, &message),
        // Handled never escapes a driver loop.
        Unwind::Handled => VmException::trap(VmError::default(), &FrameInfo::unknown(), ""),
    }
}
