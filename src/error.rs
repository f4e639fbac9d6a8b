//! Trap model and error types for the IL VM.
//!
//! Two layers live here: the in-VM trap record (`TrapKind`/`VmError`) that IL
//! programs observe through `err.get.*`, and the host-facing `VmException`
//! returned when a trap escapes every installed handler.

use std::cell::RefCell;
use std::fmt;

use thiserror::Error;

/// Categorises runtime traps for diagnostic reporting.
///
/// Values map bidirectionally to small integers; unknown inputs degrade to
/// [`TrapKind::RuntimeError`] so callers always receive a stable token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TrapKind {
    /// Integer division or remainder by zero.
    DivideByZero = 0,
    /// Arithmetic or conversion overflow.
    Overflow = 1,
    /// Invalid cast or conversion semantics.
    InvalidCast = 2,
    /// Semantic domain violation or user trap.
    DomainError = 3,
    /// Bounds check failure.
    Bounds = 4,
    /// File system open on a path that does not exist.
    FileNotFound = 5,
    /// End-of-file reached while input still expected.
    Eof = 6,
    /// Generic I/O failure.
    IoError = 7,
    /// Operation outside the allowed state machine.
    InvalidOperation = 8,
    /// Catch-all for unexpected runtime failures.
    RuntimeError = 9,
}

impl TrapKind {
    /// Canonical diagnostic mnemonic for this trap kind.
    pub fn as_str(self) -> &'static str {
        match self {
            TrapKind::DivideByZero => "DivideByZero",
            TrapKind::Overflow => "Overflow",
            TrapKind::InvalidCast => "InvalidCast",
            TrapKind::DomainError => "DomainError",
            TrapKind::Bounds => "Bounds",
            TrapKind::FileNotFound => "FileNotFound",
            TrapKind::Eof => "EOF",
            TrapKind::IoError => "IOError",
            TrapKind::InvalidOperation => "InvalidOperation",
            TrapKind::RuntimeError => "RuntimeError",
        }
    }

    /// Translate an integer payload into a trap kind.
    ///
    /// Legacy IL payloads may encode unexpected values; those fall back to
    /// [`TrapKind::RuntimeError`].
    pub fn from_value(value: i32) -> TrapKind {
        match value {
            0 => TrapKind::DivideByZero,
            1 => TrapKind::Overflow,
            2 => TrapKind::InvalidCast,
            3 => TrapKind::DomainError,
            4 => TrapKind::Bounds,
            5 => TrapKind::FileNotFound,
            6 => TrapKind::Eof,
            7 => TrapKind::IoError,
            8 => TrapKind::InvalidOperation,
            9 => TrapKind::RuntimeError,
            _ => TrapKind::RuntimeError,
        }
    }
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a legacy err code onto a trap kind.
///
/// Codes share the trap-kind integer space; unknown codes degrade to
/// [`TrapKind::RuntimeError`].
pub fn map_err_code(code: i32) -> TrapKind {
    TrapKind::from_value(code)
}

/// Structured representation of a VM error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmError {
    /// Trap classification.
    pub kind: TrapKind,
    /// Secondary error code.
    pub code: i32,
    /// Instruction pointer within the faulting block.
    pub ip: u64,
    /// Source line, or -1 when unknown.
    pub line: i32,
}

impl Default for VmError {
    fn default() -> Self {
        Self {
            kind: TrapKind::RuntimeError,
            code: 0,
            ip: 0,
            line: -1,
        }
    }
}

impl VmError {
    /// Build an error record from a kind and secondary code.
    pub fn new(kind: TrapKind, code: i32) -> Self {
        Self {
            kind,
            code,
            ..Self::default()
        }
    }
}

/// Execution context metadata used for trap formatting.
#[derive(Debug, Clone, Default)]
pub struct FrameInfo {
    /// Function in which the trap occurred.
    pub function: String,
    /// Block label where the trap occurred.
    pub block: String,
    /// Instruction pointer of the trap.
    pub ip: u64,
    /// Source line for diagnostics (-1 = unknown).
    pub line: i32,
}

impl FrameInfo {
    /// Frame metadata for a trap raised outside any function context.
    pub fn unknown() -> Self {
        Self {
            function: String::new(),
            block: String::new(),
            ip: 0,
            line: -1,
        }
    }
}

/// Format a trap error and frame information into a printable diagnostic.
///
/// Missing data defaults to placeholder values so the resulting string stays
/// informative: an empty function renders as `<unknown>`, an unknown line as
/// `-1`.
pub fn format_error(error: &VmError, frame: &FrameInfo) -> String {
    let function = if frame.function.is_empty() {
        "<unknown>"
    } else {
        frame.function.as_str()
    };
    let ip = if error.ip != 0 { error.ip } else { frame.ip };
    let line = if error.line >= 0 { error.line } else { frame.line };
    format!(
        "Trap @{function}#{ip} line {line}: {} (code={})",
        error.kind, error.code
    )
}

thread_local! {
    static THREAD_TRAP: RefCell<Option<(VmError, String)>> = const { RefCell::new(None) };
}

/// Store a trap token in the thread-local fallback slot.
///
/// Used when no VM instance is active on the current thread, for example by
/// bridge helpers exercised directly from tests.
pub fn store_thread_trap_token(error: VmError, message: String) {
    THREAD_TRAP.with(|slot| *slot.borrow_mut() = Some((error, message)));
}

/// Read the thread-local fallback trap token, if armed.
pub fn thread_trap_token() -> Option<VmError> {
    THREAD_TRAP.with(|slot| slot.borrow().as_ref().map(|(e, _)| *e))
}

/// Read the message attached to the thread-local fallback token.
pub fn thread_trap_message() -> String {
    THREAD_TRAP.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|(_, m)| m.clone())
            .unwrap_or_default()
    })
}

/// Clear the thread-local fallback token so future lookups observe no trap.
pub fn clear_thread_trap_token() {
    THREAD_TRAP.with(|slot| *slot.borrow_mut() = None);
}

/// Host-facing VM errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmException {
    /// A trap escaped every installed handler.
    #[error("{message}")]
    Trap {
        /// Formatted diagnostic in the canonical `Trap @fn#ip …` form.
        message: String,
        /// The underlying error record.
        error: VmError,
    },

    /// The module does not define the requested function.
    #[error("unknown function: {name}")]
    UnknownFunction {
        /// Name that failed to resolve.
        name: String,
    },

    /// The retired-instruction limit was reached.
    #[error("step limit exceeded: {limit}")]
    StepLimitExceeded {
        /// Configured limit.
        limit: u64,
    },
}

impl VmException {
    /// Build the unhandled-trap variant from an error record and frame info.
    pub fn trap(error: VmError, frame: &FrameInfo, message: &str) -> Self {
        let mut text = format_error(&error, frame);
        if !message.is_empty() {
            text.push_str(": ");
            text.push_str(message);
        }
        Self::Trap {
            message: text,
            error,
        }
    }

    /// Build the unknown-function variant.
    pub fn unknown_function<S: Into<String>>(name: S) -> Self {
        Self::UnknownFunction { name: name.into() }
    }
}

/// Result type for host-facing VM operations.
pub type VmResult<T> = std::result::Result<T, VmException>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for value in 0..10 {
            let kind = TrapKind::from_value(value);
            assert_eq!(kind as i32, value);
        }
        assert_eq!(TrapKind::from_value(42), TrapKind::RuntimeError);
        assert_eq!(TrapKind::from_value(-1), TrapKind::RuntimeError);
    }

    #[test]
    fn test_kind_mnemonics() {
        assert_eq!(TrapKind::DivideByZero.to_string(), "DivideByZero");
        assert_eq!(TrapKind::Eof.to_string(), "EOF");
        assert_eq!(TrapKind::IoError.to_string(), "IOError");
    }

    #[test]
    fn test_format_error() {
        let error = VmError {
            kind: TrapKind::Overflow,
            code: 3,
            ip: 7,
            line: 12,
        };
        let frame = FrameInfo {
            function: "main".into(),
            block: "entry".into(),
            ip: 0,
            line: -1,
        };
        assert_eq!(
            format_error(&error, &frame),
            "Trap @main#7 line 12: Overflow (code=3)"
        );
    }

    #[test]
    fn test_format_error_placeholders() {
        let error = VmError::default();
        let frame = FrameInfo::unknown();
        assert_eq!(
            format_error(&error, &frame),
            "Trap @<unknown>#0 line -1: RuntimeError (code=0)"
        );
    }

    #[test]
    fn test_thread_token_fallback() {
        clear_thread_trap_token();
        assert!(thread_trap_token().is_none());
        store_thread_trap_token(VmError::new(TrapKind::Bounds, 4), "idx".into());
        assert_eq!(thread_trap_token().unwrap().kind, TrapKind::Bounds);
        assert_eq!(thread_trap_message(), "idx");
        clear_thread_trap_token();
        assert!(thread_trap_token().is_none());
    }
}
