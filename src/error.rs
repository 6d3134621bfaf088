//! Stage-boundary error types: load, verify, and runtime trap records.

use std::fmt;

use sbc_asm::{InvalidInstruction, SectionId, TrapReason};
use thiserror::Error;

/// Malformed-module diagnostics. The loader stops at the first failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    /// Header magic is not `"SBC0"`.
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    /// Unsupported container version.
    #[error("unsupported version {0}")]
    BadVersion(u16),
    /// The endian byte is not 1 (little-endian).
    #[error("bad endian marker {0}")]
    BadEndian(u8),
    /// Header flags must currently be zero.
    #[error("bad header flags 0x{0:02x}")]
    BadFlags(u8),
    /// A read ran past the end of the module bytes.
    #[error("module truncated reading {what} at offset {offset}")]
    Truncated {
        /// What was being read.
        what: &'static str,
        /// Offset of the failed read.
        offset: usize,
    },
    /// An offset or size violates 4-byte alignment.
    #[error("misaligned {what} at offset {offset}")]
    Misaligned {
        /// What is misaligned.
        what: &'static str,
        /// The offending offset or size.
        offset: usize,
    },
    /// Two sections overlap.
    #[error("section overlap between {0:?} and {1:?}")]
    SectionOverlap(SectionId, SectionId),
    /// A section id occurs twice.
    #[error("duplicate section {0:?}")]
    DuplicateSection(SectionId),
    /// A section id outside the known set.
    #[error("unknown section id {0}")]
    UnknownSection(u32),
    /// A mandatory section is absent.
    #[error("missing mandatory section {0:?}")]
    MissingSection(SectionId),
    /// A `*_str` offset does not name a NUL-terminated UTF-8 string inside
    /// the pool's string region.
    #[error("bad string offset {0}")]
    BadString(u32),
    /// A constant entry is malformed.
    #[error("const {id}: {what}")]
    BadConst {
        /// Constant pool index.
        id: u32,
        /// What is wrong with it.
        what: &'static str,
    },
    /// A constant tag outside the known set.
    #[error("const {id}: unknown tag {tag}")]
    BadConstTag {
        /// Constant pool index.
        id: u32,
        /// Offending tag word.
        tag: u32,
    },
    /// A record in a typed table is invalid.
    #[error("{table} record {id}: {what}")]
    BadRecord {
        /// Table name.
        table: &'static str,
        /// Record index.
        id: u32,
        /// What is wrong with it.
        what: &'static str,
    },
    /// A record references an id outside its table.
    #[error("{table} record {id}: {field} {value} out of range")]
    BadIndex {
        /// Table of the referencing record.
        table: &'static str,
        /// Record index.
        id: u32,
        /// Name of the referencing field.
        field: &'static str,
        /// The out-of-range value.
        value: u32,
    },
    /// Two imports share a (module, symbol) pair.
    #[error("duplicate import {module}.{symbol}")]
    DuplicateImport {
        /// Import module name.
        module: String,
        /// Import symbol name.
        symbol: String,
    },
    /// Function code ranges overlap.
    #[error("function {0} code range overlaps function {1}")]
    FunctionOverlap(u32, u32),
    /// Decoding a function's code failed.
    #[error("function {func}: {source}")]
    Code {
        /// Function id whose scan failed.
        func: u32,
        /// The decode failure.
        source: InvalidInstruction,
    },
    /// The header's entry method does not exist or has no function body.
    #[error("entry method {0} has no function")]
    BadEntry(u32),
    /// `stack_max` is zero after applying the default.
    #[error("stack_max must be positive")]
    BadStackMax,
}

/// Static rejection by the verifier: first offending function and pc.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("verify error in function {func} at pc {pc}: {message}")]
pub struct VerifyError {
    /// Function id.
    pub func: u32,
    /// Offset of the offending instruction within the function.
    pub pc: u32,
    /// Human-readable cause.
    pub message: String,
}

impl VerifyError {
    pub(crate) fn new(func: u32, pc: u32, message: impl Into<String>) -> Self {
        Self { func, pc, message: message.into() }
    }
}

/// Runtime trap record. Stable enough for substring matching in tests:
/// the rendering always contains `last_op 0x<byte> <Name>` plus the
/// operand summary, and `line L:C` when a `Line` marker executed earlier
/// in the same basic block.
#[derive(Debug, Clone, PartialEq)]
pub struct TrapInfo {
    /// Why execution stopped.
    pub reason: TrapReason,
    /// Function id of the trapping frame.
    pub func: u32,
    /// Offset of the trapping instruction within the function.
    pub pc: u32,
    /// The raw opcode byte.
    pub opcode: u8,
    /// Opcode name plus rendered operands, e.g. `Jmp rel=-4`.
    pub op_display: String,
    /// Reason-specific detail, e.g. the offending index.
    pub message: String,
    /// Line/column from the last `Line` marker in the same block.
    pub line: Option<(u32, u32)>,
    /// Call chain at the trap, innermost first: (function id, pc).
    pub backtrace: Vec<(u32, u32)>,
}

impl fmt::Display for TrapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trap in function {} at pc {}: {}; last_op 0x{:02x} {}",
            self.func, self.pc, self.message, self.opcode, self.op_display
        )?;
        if let Some((line, column)) = self.line {
            write!(f, "; line {line}:{column}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TrapInfo {}

/// Error surface for embedders that drive the whole pipeline at once.
#[derive(Debug, Error)]
pub enum VmError {
    /// The module bytes did not load.
    #[error("load error: {0}")]
    Load(#[from] LoadError),
    /// The module loaded but failed verification.
    #[error("{0}")]
    Verify(#[from] VerifyError),
    /// Execution trapped.
    #[error("{0}")]
    Trap(TrapInfo),
    /// `verify: false` without the explicit unverified opt-in.
    #[error("refusing to run unverified module")]
    UnverifiedModule,
}

impl From<TrapInfo> for VmError {
    fn from(t: TrapInfo) -> Self {
        Self::Trap(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_display_is_substring_stable() {
        let trap = TrapInfo {
            reason: TrapReason::IndexOutOfBounds,
            func: 0,
            pc: 12,
            opcode: 0x5a,
            op_display: "ArrayGet elem=I32".into(),
            message: "array index 2 out of bounds for length 1".into(),
            line: Some((10, 20)),
            backtrace: vec![(0, 12)],
        };
        let rendered = trap.to_string();
        assert!(rendered.contains("last_op 0x5a ArrayGet"));
        assert!(rendered.contains("array index 2"));
        assert!(rendered.contains("line 10:20"));
    }

    #[test]
    fn section_overlap_names_itself() {
        let err = LoadError::SectionOverlap(SectionId::Types, SectionId::Code);
        assert!(err.to_string().contains("section overlap"));
    }
}
