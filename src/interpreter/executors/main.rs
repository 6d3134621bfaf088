use sbc_asm::{Instruction, TrapReason};
use tracing::{debug, trace};

use crate::interpreter::internal::{RunResult, RuntimeTrap};
use crate::interpreter::Interpreter;
use crate::state::{ExecuteState, ProgramState};

impl Interpreter {
    /// Run the entry function until Halt or Trap. Never returns without
    /// a status.
    pub fn execute(&mut self) -> ProgramState {
        if let Err(trap) = self.boot() {
            return ProgramState::Trapped(self.make_trap(trap, &Instruction::Halt, 0));
        }

        loop {
            match self.step() {
                ExecuteState::Proceed => {}
                ExecuteState::Halted(exit_code) => {
                    debug!(exit_code, "halted");
                    return ProgramState::Halted { exit_code };
                }
                ExecuteState::Trapped(info) => {
                    debug!(%info, "trapped");
                    return ProgramState::Trapped(info);
                }
            }
        }
    }

    /// Reset mutable state and push the entry frame.
    fn boot(&mut self) -> RunResult<()> {
        self.stack.clear();
        self.locals.clear();
        self.frames.clear();
        self.current_pc = 0;

        let entry = self.module.entry_function().ok_or_else(|| {
            RuntimeTrap::new(TrapReason::UnreachableExecuted, "module has no entry function")
        })?;
        self.call_function(entry, 0, 0, 0)
    }

    /// One dispatch step: decode at the current frame's pc, advance, and
    /// execute. Runtime failures become full trap records here, where
    /// the faulting instruction is known.
    fn step(&mut self) -> ExecuteState {
        let (func_id, pc) = match self.frame() {
            Ok(frame) => (frame.func_id, frame.pc),
            Err(trap) => {
                return ExecuteState::Trapped(self.make_trap(trap, &Instruction::Halt, 0))
            }
        };
        self.current_pc = pc;

        let (insn, next_pc) = match Instruction::decode(self.module.func_code(func_id), pc as usize)
        {
            Ok(decoded) => decoded,
            Err(source) => {
                // Unreachable for loaded modules; the scan decoded it all.
                let trap = RuntimeTrap::new(TrapReason::UnreachableExecuted, source.to_string());
                return ExecuteState::Trapped(self.make_trap(trap, &Instruction::Halt, pc));
            }
        };
        trace!(func_id, pc, %insn, "step");

        if let Ok(frame) = self.frame_mut() {
            frame.pc = next_pc as u32;
        }

        match self.instruction(&insn, pc, next_pc as u32) {
            Ok(state) => state,
            Err(trap) => ExecuteState::Trapped(self.make_trap(trap, &insn, pc)),
        }
    }
}
