//! Runtime state representation for the VM

use crate::error::{TrapInfo, VmError};

#[derive(Debug, Clone, PartialEq)]
/// Resulting state of a single dispatch step.
pub enum ExecuteState {
    /// The VM should proceed normally with the execution.
    Proceed,
    /// A `Halt` instruction (or a bottom-frame `Ret`) executed.
    Halted(i32),
    /// A runtime check failed.
    Trapped(TrapInfo),
}

impl ExecuteState {
    /// Return true if the VM execution should continue.
    pub const fn should_continue(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Final state of a program execution. The interpreter always produces
/// one of these; it never returns without a status.
pub enum ProgramState {
    /// Normal termination.
    Halted {
        /// Top-of-stack coerced to i32 at `Halt`, or 0 for an empty stack.
        exit_code: i32,
    },
    /// A runtime precondition failed; the exit code is unspecified.
    Trapped(TrapInfo),
}

impl ProgramState {
    /// Exit code for halted programs.
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Halted { exit_code } => Some(*exit_code),
            Self::Trapped(_) => None,
        }
    }

    /// The trap record, when execution trapped.
    pub const fn trap(&self) -> Option<&TrapInfo> {
        match self {
            Self::Trapped(t) => Some(t),
            Self::Halted { .. } => None,
        }
    }
}

#[derive(Debug)]
/// Whole-pipeline status for embedders: adds the `Invalid` state for
/// modules that never reached execution.
pub enum VmStatus {
    /// Execution halted normally.
    Halted {
        /// Program exit code.
        exit_code: i32,
    },
    /// Execution trapped.
    Trapped(TrapInfo),
    /// Load or verification rejected the module; carries the diagnostic.
    Invalid(String),
}

impl From<ProgramState> for VmStatus {
    fn from(state: ProgramState) -> Self {
        match state {
            ProgramState::Halted { exit_code } => Self::Halted { exit_code },
            ProgramState::Trapped(t) => Self::Trapped(t),
        }
    }
}

impl From<VmError> for VmStatus {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Trap(t) => Self::Trapped(t),
            other => Self::Invalid(other.to_string()),
        }
    }
}
