//! IL instruction representation.

#[cfg(feature = "serde-types")]
use serde::{Deserialize, Serialize};

use crate::types::TypeKind;
use crate::value::Value;

/// Source location attached to an instruction.
///
/// A zero `file_id` or `line` means "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct SourceLoc {
    /// Identifier resolved through an external source map.
    pub file_id: u32,
    /// One-based line number.
    pub line: u32,
    /// One-based column number.
    pub column: u32,
}

impl SourceLoc {
    /// Location with all three fields set.
    pub fn new(file_id: u32, line: u32, column: u32) -> Self {
        Self {
            file_id,
            line,
            column,
        }
    }

    /// True when the location names a source file.
    pub fn has_file(self) -> bool {
        self.file_id != 0
    }

    /// True when the location carries a line number.
    pub fn has_line(self) -> bool {
        self.line != 0
    }
}

/// VM opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Opcode {
    // Integer arithmetic
    Add,
    Sub,
    Mul,
    IAddOvf,
    ISubOvf,
    IMulOvf,
    SDiv,
    UDiv,
    SRem,
    URem,
    SDivChk0,
    UDivChk0,
    SRemChk0,
    URemChk0,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    ICmpEq,
    ICmpNe,
    SCmpLt,
    SCmpLe,
    SCmpGt,
    SCmpGe,
    UCmpLt,
    UCmpLe,
    UCmpGt,
    UCmpGe,
    IdxChk,
    CastSiNarrowChk,
    CastUiNarrowChk,
    CastSiToFp,
    CastUiToFp,
    Trunc1,
    Zext1,
    // Floating point
    FAdd,
    FSub,
    FMul,
    FDiv,
    FCmpEq,
    FCmpNe,
    FCmpLt,
    FCmpLe,
    FCmpGt,
    FCmpGe,
    Sitofp,
    Fptosi,
    CastFpToSiRteChk,
    CastFpToUiRteChk,
    // Memory
    Alloca,
    Load,
    Store,
    Gep,
    ConstStr,
    ConstNull,
    AddrOf,
    GAddr,
    // Control flow
    Br,
    CBr,
    SwitchI32,
    Ret,
    Call,
    // Exception handling
    EhPush,
    EhPop,
    EhEntry,
    ResumeSame,
    ResumeNext,
    ResumeLabel,
    Trap,
    TrapErr,
    TrapFromErr,
    TrapKind,
    ErrGetKind,
    ErrGetCode,
    ErrGetIp,
    ErrGetLine,
}

impl Opcode {
    /// Number of opcodes, for handler-table sizing.
    pub const COUNT: usize = Opcode::ErrGetLine as usize + 1;

    /// Canonical mnemonic used in diagnostics.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::IAddOvf => "iadd.ovf",
            Opcode::ISubOvf => "isub.ovf",
            Opcode::IMulOvf => "imul.ovf",
            Opcode::SDiv => "sdiv",
            Opcode::UDiv => "udiv",
            Opcode::SRem => "srem",
            Opcode::URem => "urem",
            Opcode::SDivChk0 => "sdiv.chk0",
            Opcode::UDivChk0 => "udiv.chk0",
            Opcode::SRemChk0 => "srem.chk0",
            Opcode::URemChk0 => "urem.chk0",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::LShr => "lshr",
            Opcode::AShr => "ashr",
            Opcode::ICmpEq => "icmp.eq",
            Opcode::ICmpNe => "icmp.ne",
            Opcode::SCmpLt => "scmp.lt",
            Opcode::SCmpLe => "scmp.le",
            Opcode::SCmpGt => "scmp.gt",
            Opcode::SCmpGe => "scmp.ge",
            Opcode::UCmpLt => "ucmp.lt",
            Opcode::UCmpLe => "ucmp.le",
            Opcode::UCmpGt => "ucmp.gt",
            Opcode::UCmpGe => "ucmp.ge",
            Opcode::IdxChk => "idxchk",
            Opcode::CastSiNarrowChk => "cast.si_narrow.chk",
            Opcode::CastUiNarrowChk => "cast.ui_narrow.chk",
            Opcode::CastSiToFp => "cast.si_to_fp",
            Opcode::CastUiToFp => "cast.ui_to_fp",
            Opcode::Trunc1 => "trunc.1",
            Opcode::Zext1 => "zext.1",
            Opcode::FAdd => "fadd",
            Opcode::FSub => "fsub",
            Opcode::FMul => "fmul",
            Opcode::FDiv => "fdiv",
            Opcode::FCmpEq => "fcmp.eq",
            Opcode::FCmpNe => "fcmp.ne",
            Opcode::FCmpLt => "fcmp.lt",
            Opcode::FCmpLe => "fcmp.le",
            Opcode::FCmpGt => "fcmp.gt",
            Opcode::FCmpGe => "fcmp.ge",
            Opcode::Sitofp => "sitofp",
            Opcode::Fptosi => "fptosi",
            Opcode::CastFpToSiRteChk => "cast.fp_to_si.rte.chk",
            Opcode::CastFpToUiRteChk => "cast.fp_to_ui.rte.chk",
            Opcode::Alloca => "alloca",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Gep => "gep",
            Opcode::ConstStr => "const.str",
            Opcode::ConstNull => "const.null",
            Opcode::AddrOf => "addr.of",
            Opcode::GAddr => "g.addr",
            Opcode::Br => "br",
            Opcode::CBr => "cbr",
            Opcode::SwitchI32 => "switch.i32",
            Opcode::Ret => "ret",
            Opcode::Call => "call",
            Opcode::EhPush => "eh.push",
            Opcode::EhPop => "eh.pop",
            Opcode::EhEntry => "eh.entry",
            Opcode::ResumeSame => "resume.same",
            Opcode::ResumeNext => "resume.next",
            Opcode::ResumeLabel => "resume.label",
            Opcode::Trap => "trap",
            Opcode::TrapErr => "trap.err",
            Opcode::TrapFromErr => "trap.from_err",
            Opcode::TrapKind => "trap.kind",
            Opcode::ErrGetKind => "err.get.kind",
            Opcode::ErrGetCode => "err.get.code",
            Opcode::ErrGetIp => "err.get.ip",
            Opcode::ErrGetLine => "err.get.line",
        }
    }

    /// True when the opcode ends a basic block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Br
                | Opcode::CBr
                | Opcode::SwitchI32
                | Opcode::Ret
                | Opcode::Trap
                | Opcode::TrapFromErr
                | Opcode::ResumeSame
                | Opcode::ResumeNext
                | Opcode::ResumeLabel
        )
    }
}

/// A single IL instruction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct Instr {
    /// Operation to perform.
    pub op: Opcode,
    /// Destination SSA id, when the instruction produces a value.
    pub result: Option<u32>,
    /// Result type; also selects lane width for width-dispatched opcodes.
    pub ty: TypeKind,
    /// Operand list.
    pub operands: Vec<Value>,
    /// Successor labels for branches and `eh.push`; index 0 is the default
    /// target for `switch.i32`.
    pub labels: Vec<String>,
    /// Per-label branch argument lists, aligned with `labels`.
    pub br_args: Vec<Vec<Value>>,
    /// Callee symbol for `call`.
    pub callee: Option<String>,
    /// Source location for diagnostics and breakpoints.
    pub loc: SourceLoc,
}

impl Instr {
    /// Instruction skeleton with the given opcode and no operands.
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            result: None,
            ty: TypeKind::Void,
            operands: Vec::new(),
            labels: Vec::new(),
            br_args: Vec::new(),
            callee: None,
            loc: SourceLoc::default(),
        }
    }

    /// Number of explicit cases carried by a `switch.i32`.
    pub fn switch_case_count(&self) -> usize {
        self.labels.len().saturating_sub(1)
    }

    /// Case value of the i-th explicit `switch.i32` case.
    ///
    /// Well-formed IL stores the scrutinee in `operands[0]` and the case
    /// literals behind it, aligned with `labels[1..]`.
    pub fn switch_case_value(&self, index: usize) -> i32 {
        match self.operands.get(1 + index) {
            Some(Value::ConstInt(v)) => *v as i32,
            _ => 0,
        }
    }
}
