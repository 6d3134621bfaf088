//! Frame flow: direct, indirect, tail, and imported calls, plus return.

use sbc_asm::{Handle, Slot, TrapReason, TypeKind};
use tracing::trace;

use super::internal::{RunResult, RuntimeTrap};
use super::{Frame, Interpreter};
use crate::consts::{MAX_CALL_DEPTH, VOID_TYPE};
use crate::heap::ObjectData;
use crate::host::{HostContext, HostOutcome, ImportResolver};
use crate::state::ExecuteState;

impl Interpreter {
    /// Slots the parameters of `sig` occupy on the stack.
    fn param_slots(&self, params: &[u32]) -> usize {
        params
            .iter()
            .map(|p| self.module.types[*p as usize].kind.slot_count())
            .sum()
    }

    /// Push a frame for a module function. Arguments are sitting on the
    /// stack; they move into the callee's locals window in reverse order.
    pub(crate) fn call_function(
        &mut self,
        func_id: u32,
        argc: u8,
        site_pc: u32,
        upvalues: Handle,
    ) -> RunResult<()> {
        let method = *self.module.method_of(func_id).ok_or_else(|| {
            RuntimeTrap::new(TrapReason::UnreachableExecuted, format!("no function {func_id}"))
        })?;
        let sig = &self.module.sigs[method.sig_id as usize];

        // Defense-in-depth: the verifier already proved arity.
        if sig.params.len() != argc as usize {
            return Err(RuntimeTrap::new(
                TrapReason::ArityMismatch,
                format!("call with {argc} args, signature wants {}", sig.params.len()),
            ));
        }
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(RuntimeTrap::new(TrapReason::StackOverflow, "call depth exceeded"));
        }

        let param_slots = self.param_slots(&sig.params);
        if self.stack.len() < param_slots {
            return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "arguments missing"));
        }
        let ret_type_id = sig.ret_type_id;

        // Headroom for the callee, against the verified per-function max.
        if let Some(verify) = &self.verify {
            let base = self.stack.len() - param_slots;
            let max = verify.functions[func_id as usize].stack_max as usize;
            if base + max > self.module.header.stack_max as usize {
                return Err(RuntimeTrap::new(
                    TrapReason::StackOverflow,
                    "callee would exceed stack_max",
                ));
            }
        }

        let locals_base = self.locals.len();
        let locals_count = method.locals as usize;
        self.locals.resize(locals_base + locals_count, 0);
        for slot in (0..param_slots).rev() {
            let value = self.pop()?;
            self.locals[locals_base + slot] = value;
        }

        self.frames.push(Frame {
            func_id,
            pc: 0,
            caller_site_pc: site_pc,
            locals_base,
            locals_count,
            stack_base: self.stack.len(),
            ret_type_id,
            upvalues,
            line: None,
        });
        self.profiler.on_call(func_id);
        trace!(func_id, depth = self.frames.len(), "enter frame");
        Ok(())
    }

    /// `Call` / `TailCall` entry: module function or import.
    pub(crate) fn call_or_import(
        &mut self,
        func_id: u32,
        argc: u8,
        site_pc: u32,
        tail: bool,
    ) -> RunResult<ExecuteState> {
        // A tail transfer bypasses the current frame entirely: the new
        // frame reports the original caller's call site, and an imported
        // target returns its value straight to that caller.
        let site = if tail {
            let site = self.frame()?.caller_site_pc;
            self.drop_frame_for_tail()?;
            site
        } else {
            site_pc
        };
        if let Some(import) = self.module.import_of(func_id) {
            let ret_type_id = self.module.sigs[import.sig_id as usize].ret_type_id;
            let state = self.call_import(func_id)?;
            if self.frames.is_empty() {
                // Tail transfer out of the entry frame: the import's
                // value is the program's exit code.
                let exit = match self.stack.pop() {
                    Some(value) => self.coerce_exit(ret_type_id, value),
                    None => 0,
                };
                return Ok(ExecuteState::Halted(exit));
            }
            return Ok(state);
        }
        self.call_function(func_id, argc, site, 0)?;
        Ok(ExecuteState::Proceed)
    }

    /// `CallIndirect`: closure handle on top, arguments below it.
    pub(crate) fn call_indirect(
        &mut self,
        sig_id: u32,
        argc: u8,
        site_pc: u32,
    ) -> RunResult<ExecuteState> {
        let handle = self.pop()? as Handle;
        let object = self
            .heap
            .get(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "call through null closure"))?;
        let ObjectData::Closure { func_id, .. } = object.data else {
            return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "callee is not a closure"));
        };
        let declared = self
            .module
            .method_of(func_id)
            .map(|m| m.sig_id)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::UnreachableExecuted, "closure body gone"))?;
        if declared != sig_id {
            return Err(RuntimeTrap::new(
                TrapReason::SignatureMismatch,
                format!("closure signature {declared} does not match operand {sig_id}"),
            ));
        }
        self.call_function(func_id, argc, site_pc, handle)?;
        Ok(ExecuteState::Proceed)
    }

    /// Drop the current frame before a tail transfer: the locals window
    /// goes away, the frame is popped, and the arguments (already on the
    /// stack) become the only slots above the collapsed frame's base.
    fn drop_frame_for_tail(&mut self) -> RunResult<()> {
        let frame = *self.frame()?;
        self.locals.truncate(frame.locals_base);
        self.frames.pop();
        trace!(func_id = frame.func_id, "tail frame collapsed");
        Ok(())
    }

    /// `Ret`, and the bottom-frame halt it decays into.
    pub(crate) fn ret(&mut self) -> RunResult<ExecuteState> {
        let frame = *self.frame()?;
        let ret_slots = if frame.ret_type_id == VOID_TYPE {
            0
        } else {
            let decl = &self.module.types[frame.ret_type_id as usize];
            if decl.is_object() { 1 } else { decl.kind.slot_count() }
        };

        let mut value = [0 as Slot; 2];
        for slot in (0..ret_slots).rev() {
            value[slot] = self.pop()?;
        }
        if self.stack.len() != frame.stack_base {
            return Err(RuntimeTrap::new(
                TrapReason::TypeMismatch,
                "stack height at return disagrees with the caller",
            ));
        }

        self.locals.truncate(frame.locals_base);
        self.frames.pop();

        if self.frames.is_empty() {
            // Bottom-frame return terminates like Halt.
            let exit_code = if ret_slots > 0 {
                self.coerce_exit(frame.ret_type_id, value[ret_slots - 1])
            } else {
                0
            };
            return Ok(ExecuteState::Halted(exit_code));
        }

        for slot in value.iter().take(ret_slots) {
            self.push(*slot)?;
        }
        // A return resumes the caller in a fresh basic block.
        self.frame_mut()?.line = None;
        Ok(ExecuteState::Proceed)
    }

    /// Exit-code coercion for Halt and bottom-frame returns.
    pub(crate) fn coerce_exit(&self, type_id: u32, value: Slot) -> i32 {
        if type_id == VOID_TYPE {
            return 0;
        }
        let Some(ty) = self.module.types.get(type_id as usize) else {
            return 0;
        };
        if ty.is_object() {
            return 0;
        }
        match ty.kind {
            kind if kind.is_integer() || kind == TypeKind::Bool || kind == TypeKind::Char => {
                value as u32 as i32
            }
            _ => 0,
        }
    }

    /// Call an imported function through the resolver chain.
    pub(crate) fn call_import(&mut self, func_id: u32) -> RunResult<ExecuteState> {
        let import = *self.module.import_of(func_id).ok_or_else(|| {
            RuntimeTrap::new(TrapReason::UnreachableExecuted, format!("no import {func_id}"))
        })?;
        let sig = &self.module.sigs[import.sig_id as usize];
        let param_slots = self.param_slots(&sig.params);
        let ret_type_id = sig.ret_type_id;

        let mut args = vec![0 as Slot; param_slots];
        for slot in (0..param_slots).rev() {
            args[slot] = self.pop()?;
        }

        let module_name = self.module.str_at(import.module_str).to_owned();
        let symbol_name = self.module.str_at(import.symbol_str).to_owned();

        let outcome = {
            let mut ctx = HostContext::new(&mut self.heap);
            let core = self
                .core
                .resolve(&module_name, &symbol_name, &args, &mut ctx)
                .map_err(|e| RuntimeTrap::new(TrapReason::HostError, e.0.clone()))?;
            match (core, &mut self.host) {
                (HostOutcome::Unknown, Some(host)) => host
                    .resolve(&module_name, &symbol_name, &args, &mut ctx)
                    .map_err(|e| RuntimeTrap::new(TrapReason::HostError, e.0.clone()))?,
                (outcome, _) => outcome,
            }
        };

        match outcome {
            HostOutcome::Return(value) => {
                if ret_type_id == VOID_TYPE {
                    // Tolerate chatty hosts on void signatures.
                } else {
                    self.push(value)?;
                }
            }
            HostOutcome::NoReturn => {
                if ret_type_id != VOID_TYPE {
                    return Err(RuntimeTrap::new(
                        TrapReason::HostError,
                        format!("{module_name}.{symbol_name} returned nothing"),
                    ));
                }
            }
            HostOutcome::Unknown => {
                return Err(RuntimeTrap::new(
                    TrapReason::MissingImport,
                    format!("unknown import {module_name}.{symbol_name}"),
                ));
            }
        }
        Ok(ExecuteState::Proceed)
    }
}
