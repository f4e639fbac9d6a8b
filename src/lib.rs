//! # IL Virtual Machine
//!
//! The execution core of a typed, SSA-style IL: a stack-based bytecode
//! interpreter with explicit basic blocks, block parameters, structured
//! exception handling, and a bridge to reference-counted host runtime
//! services.
//!
//! ## Architecture
//!
//! - **Vm**: module binding, entry points, trap delivery, debug control
//! - **Dispatch strategies**: function-table, switch, and threaded loops
//!   sharing one step contract
//! - **Opcode handlers**: per-family semantics under `ops/`
//! - **Frame**: register file, block-parameter staging, alloca arena,
//!   EH stack, resume tokens
//! - **Switch cache**: per-instruction dense/sorted/hashed/linear tables
//! - **Runtime bridge**: typed marshalling to the C-style helper registry
//! - **Debugger**: breakpoints, variable and memory watches, step budgets
//!
//! ## Example
//!
//! ```rust
//! use il_vm::{ModuleBuilder, Opcode, TypeKind, Value, Vm};
//!
//! let mut b = ModuleBuilder::new();
//! b.start_function("main", TypeKind::I64);
//! b.add_block("entry");
//! let sum = b.reserve_temp();
//! b.emit_binary(Opcode::IAddOvf, TypeKind::I64, sum, Value::int(40), Value::int(2));
//! b.emit_ret(Some(Value::temp(sum)));
//! let module = b.finish();
//!
//! let mut vm = Vm::new(&module);
//! assert_eq!(vm.run(), 42);
//! ```
//!
//! Each VM instance is single-threaded; many instances may run concurrently
//! on different threads. Strings are the only owned runtime resource and are
//! reference counted: every slot holding a string owns one reference, and
//! every overwrite retains the new value before releasing the old one.

#![warn(rustdoc::missing_crate_level_docs)]

/// Debugging support: breakpoints, watches, scripted stepping.
pub mod debugger;
/// Dispatch strategies and the shared step contract.
pub mod dispatch;
/// Trap model and host-facing error types.
pub mod error;
/// Execution state, handler results, and the unwind protocol.
pub mod execution_state;
/// Per-call frames, registers, and resume tokens.
pub mod frame;
/// IL instruction representation.
pub mod instruction;
/// VM slot / runtime ABI conversions.
pub mod marshal;
/// In-memory IL module model.
pub mod module;
/// Programmatic module assembly.
pub mod module_builder;
/// Per-opcode handler implementations.
pub(crate) mod ops;
/// Reference-counted runtime strings.
pub mod rt_string;
/// Runtime bridge: helper invocation and trap context.
pub mod runtime_bridge;
/// Runtime helper descriptors and registry.
pub mod runtime_registry;
/// The uniform operand carrier.
pub mod slot;
/// Switch dispatch tables and tunables.
pub mod switch_cache;
/// Tail-call frame reuse.
#[cfg(feature = "tco")]
pub(crate) mod tco;
/// IL type kinds.
pub mod types;
/// Instruction operand values.
pub mod value;
/// The VM facade.
pub mod vm;

pub use debugger::{DebugAction, DebugScript, Debugger, MemWatchHit};
pub use dispatch::DispatchKind;
pub use error::{format_error, map_err_code, FrameInfo, TrapKind, VmError, VmException, VmResult};
pub use execution_state::{ExecResult, ExecState};
pub use frame::{Frame, HandlerRecord, ResumeState};
pub use instruction::{Instr, Opcode, SourceLoc};
pub use module::{BasicBlock, ExternDecl, Function, Global, Module, Param, SourceMap};
pub use module_builder::ModuleBuilder;
pub use rt_string::{
    rt_const_cstr, rt_len, rt_str_release_maybe, rt_str_retain_maybe, rt_string_cstr,
    rt_string_from_bytes, rt_string_refcount, RtStr,
};
pub use runtime_registry::{find_runtime_descriptor, RuntimeDescriptor, RuntimeSignature};
pub use slot::Slot;
pub use switch_cache::{SwitchMode, SwitchTunables};
pub use types::TypeKind;
pub use value::Value;
pub use vm::{Vm, VmOptions};
