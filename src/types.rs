//! IL type kinds and their storage properties.

use std::fmt;

#[cfg(feature = "serde-types")]
use serde::{Deserialize, Serialize};

/// The closed set of IL types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub enum TypeKind {
    /// No value.
    #[default]
    Void,
    /// Canonical boolean, stored widened in an i64 slot.
    I1,
    /// 16-bit two's complement integer.
    I16,
    /// 32-bit two's complement integer.
    I32,
    /// 64-bit two's complement integer.
    I64,
    /// IEEE-754 binary32.
    F32,
    /// IEEE-754 binary64.
    F64,
    /// Raw host pointer.
    Ptr,
    /// Reference-counted runtime string handle.
    Str,
    /// Resolved trap record token.
    Error,
    /// Single-use resume capability.
    ResumeTok,
}

impl TypeKind {
    /// IL spelling of the type, used in diagnostics and watch output.
    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Void => "void",
            TypeKind::I1 => "i1",
            TypeKind::I16 => "i16",
            TypeKind::I32 => "i32",
            TypeKind::I64 => "i64",
            TypeKind::F32 => "f32",
            TypeKind::F64 => "f64",
            TypeKind::Ptr => "ptr",
            TypeKind::Str => "str",
            TypeKind::Error => "error",
            TypeKind::ResumeTok => "resume_tok",
        }
    }

    /// Byte size of the in-memory representation, 0 for void.
    pub fn size(self) -> usize {
        match self {
            TypeKind::Void => 0,
            TypeKind::I1 => 1,
            TypeKind::I16 => 2,
            TypeKind::I32 => 4,
            TypeKind::I64 => 8,
            TypeKind::F32 => 4,
            TypeKind::F64 => 8,
            TypeKind::Ptr | TypeKind::Str | TypeKind::Error | TypeKind::ResumeTok => {
                std::mem::size_of::<usize>()
            }
        }
    }

    /// Minimum alignment the VM enforces for loads and stores of this type.
    pub fn alignment(self) -> usize {
        match self {
            TypeKind::Void | TypeKind::I1 => 1,
            TypeKind::I16 => 2,
            TypeKind::I32 | TypeKind::F32 => 4,
            TypeKind::I64 | TypeKind::F64 => 8,
            TypeKind::Ptr | TypeKind::Str | TypeKind::Error | TypeKind::ResumeTok => {
                std::mem::align_of::<usize>()
            }
        }
    }

    /// True for the widened-integer family stored in an i64 slot.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            TypeKind::I1 | TypeKind::I16 | TypeKind::I32 | TypeKind::I64
        )
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_and_alignment() {
        assert_eq!(TypeKind::Void.size(), 0);
        assert_eq!(TypeKind::I1.size(), 1);
        assert_eq!(TypeKind::I16.alignment(), 2);
        assert_eq!(TypeKind::F64.size(), 8);
        assert_eq!(TypeKind::Str.size(), std::mem::size_of::<usize>());
    }

    #[test]
    fn test_names() {
        assert_eq!(TypeKind::I64.name(), "i64");
        assert_eq!(TypeKind::ResumeTok.to_string(), "resume_tok");
    }
}
