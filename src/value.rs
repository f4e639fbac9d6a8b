//! IL operand values.

#[cfg(feature = "serde-types")]
use serde::{Deserialize, Serialize};

/// An instruction operand.
///
/// Temporaries reference the frame's register file by SSA id; the constant
/// kinds are materialised by the evaluator on demand.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub enum Value {
    /// SSA temporary, resolved through the register file.
    Temp(u32),
    /// Integer literal.
    ConstInt(i64),
    /// Floating-point literal.
    ConstFloat(f64),
    /// String literal, materialised through the VM's literal cache.
    ConstStr(String),
    /// Named global, resolved through the module's global-string table.
    GlobalAddr(String),
    /// Typed null.
    Null,
}

impl Value {
    /// Temporary operand for the given SSA id.
    pub fn temp(id: u32) -> Value {
        Value::Temp(id)
    }

    /// Integer literal operand.
    pub fn int(v: i64) -> Value {
        Value::ConstInt(v)
    }

    /// Floating-point literal operand.
    pub fn float(v: f64) -> Value {
        Value::ConstFloat(v)
    }

    /// String literal operand.
    pub fn string<S: Into<String>>(s: S) -> Value {
        Value::ConstStr(s.into())
    }

    /// Global-address operand.
    pub fn global<S: Into<String>>(name: S) -> Value {
        Value::GlobalAddr(name.into())
    }

    /// Typed null operand.
    pub fn null() -> Value {
        Value::Null
    }
}
