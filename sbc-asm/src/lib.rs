#![warn(missing_docs)]

//! Atomic types shared by the SBC module loader, verifier and interpreter:
//! the opcode map, operand layouts, instruction codec, type kinds and trap
//! reasons.

mod instruction;
mod opcode;
mod trap_reason;
mod ty;

pub use instruction::{Instruction, InvalidInstruction};
pub use opcode::Opcode;
pub use trap_reason::TrapReason;
pub use ty::{ConstTag, ElemKind, ImportFlags, MethodFlags, SectionId, TypeKind};

/// A 64-bit tagged value slot as it lives on the value stack, in a local,
/// a global, or an upvalue cell. The slot's static type is known to the
/// verifier only; at runtime the consuming opcode fixes the interpretation.
pub type Slot = u64;

/// Heap handle; `0` is the null reference.
pub type Handle = u32;
