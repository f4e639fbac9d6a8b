//! In-memory IL module model.
//!
//! The VM consumes an already-built module; the textual IL grammar and loader
//! live outside this crate. Invariants assumed here: every block label is
//! resolvable within its function, terminated blocks end in a terminator, and
//! SSA ids index into the owning function's `value_names` table.

use hashbrown::HashMap;

#[cfg(feature = "serde-types")]
use serde::{Deserialize, Serialize};

use crate::instruction::Instr;
use crate::types::TypeKind;

/// A block or function parameter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct Param {
    /// Debug name.
    pub name: String,
    /// Parameter type.
    pub ty: TypeKind,
    /// SSA id the parameter defines on block entry.
    pub id: u32,
}

/// A basic block: parameters, straight-line instructions, terminator.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct BasicBlock {
    /// Label, unique within the owning function.
    pub label: String,
    /// Parameters supplied by predecessors' branch arguments.
    pub params: Vec<Param>,
    /// Instruction sequence.
    pub instrs: Vec<Instr>,
    /// Set once the block ends in a terminator.
    pub terminated: bool,
}

/// An IL function.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Return type.
    pub ret: TypeKind,
    /// Declared parameters; the entry block's params mirror these.
    pub params: Vec<Param>,
    /// Ordered basic blocks; `blocks[0]` is the entry.
    pub blocks: Vec<BasicBlock>,
    /// Optional debug name per SSA id; the length bounds the register file.
    pub value_names: Vec<String>,
}

/// A named global constant string.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct Global {
    /// Symbol name.
    pub name: String,
    /// Constant string payload.
    pub init: String,
}

/// An extern declaration naming a runtime helper signature.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct ExternDecl {
    /// Runtime symbol name.
    pub name: String,
    /// Return type.
    pub ret: TypeKind,
    /// Parameter types.
    pub params: Vec<TypeKind>,
}

/// A complete IL module.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct Module {
    /// Function definitions.
    pub functions: Vec<Function>,
    /// Global constant strings.
    pub globals: Vec<Global>,
    /// Extern signature table.
    pub externs: Vec<ExternDecl>,
}

impl Module {
    /// Find a function by name.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Maps file ids from instruction locations back to paths.
///
/// Owned by whoever loaded the module; the debugger borrows a copy to resolve
/// source-line breakpoints.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    paths: HashMap<u32, String>,
}

impl SourceMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path under a file id.
    pub fn insert(&mut self, file_id: u32, path: impl Into<String>) {
        self.paths.insert(file_id, path.into());
    }

    /// Resolve a file id to its path.
    pub fn path(&self, file_id: u32) -> Option<&str> {
        self.paths.get(&file_id).map(String::as_str)
    }
}
