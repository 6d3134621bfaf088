//! Static verifier: an abstract type-and-stack interpreter over each
//! function's control-flow graph.
//!
//! For every reachable pc it computes the entry stack signature, the
//! locals initialization set, and the ref bitmaps; rejects type
//! mismatches, underflow, uninitialized loads, branches into the middle
//! of an instruction, and unreachable code that is not explicit Trap
//! padding; and emits the per-safepoint stack maps the collector uses to
//! enumerate roots precisely.

use std::collections::{BTreeMap, HashMap};

use sbc_asm::{Instruction, Opcode};
use tracing::debug;

use crate::arena::Scratch;
use crate::error::VerifyError;
use crate::module::Module;

mod state;
mod transfer;

pub use state::{AbsTy, RefTy};

use state::AbstractState;
use transfer::{transfer, Flow, FuncCtx};

/// Per-safepoint record: stack types bottom-to-top plus the locals
/// typestate, from which both ref bitmaps derive.
#[derive(Debug, Clone, PartialEq)]
pub struct StackMap {
    /// Stack slot types, bottom first.
    pub stack: Vec<AbsTy>,
    /// Which locals are initialized at this pc.
    pub locals_init: Vec<bool>,
    /// Which locals hold a live heap handle at this pc.
    pub local_refs: Vec<bool>,
}

impl StackMap {
    fn of(state: &AbstractState) -> Self {
        Self {
            stack: state.stack.clone(),
            locals_init: state.locals.iter().map(|l| l.is_some()).collect(),
            local_refs: state
                .locals
                .iter()
                .map(|l| l.map(|ty| ty.is_ref()).unwrap_or(false))
                .collect(),
        }
    }

    /// Stack height at this safepoint.
    pub fn height(&self) -> u32 {
        self.stack.len() as u32
    }

    /// Ref bit of each stack slot, bottom first.
    pub fn stack_refs(&self) -> impl Iterator<Item = bool> + '_ {
        self.stack.iter().map(|ty| ty.is_ref())
    }
}

/// Verification output for one function.
#[derive(Debug, Clone, Default)]
pub struct FuncVerifyInfo {
    /// Canonical maximum stack height over all reachable states.
    pub stack_max: u32,
    /// Stack maps keyed by safepoint pc (block entries, allocation
    /// sites, call sites).
    pub stack_maps: BTreeMap<u32, StackMap>,
}

impl FuncVerifyInfo {
    /// Stack map at an exact safepoint pc.
    pub fn map_at(&self, pc: u32) -> Option<&StackMap> {
        self.stack_maps.get(&pc)
    }
}

/// Verification output for a whole module.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    /// Per-function records, indexed by function id.
    pub functions: Vec<FuncVerifyInfo>,
    /// Ref bit of each globals slot.
    pub globals_refs: Vec<bool>,
}

/// Verify every function of a loaded module.
pub fn verify_module(module: &Module) -> Result<VerifyResult, VerifyError> {
    let entry = module
        .entry_function()
        .ok_or_else(|| VerifyError::new(module.header.entry_method_id, 0, "entry has no body"))?;
    if let Some(sig) = module.callable_sig(entry) {
        if !sig.params.is_empty() {
            return Err(VerifyError::new(entry, 0, "entry function must take no parameters"));
        }
    }

    let mut scratch = Scratch::new();
    let functions = (0..module.functions.len() as u32)
        .map(|func_id| verify_function(module, func_id, &mut scratch))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(VerifyResult { functions, globals_refs: module.globals_layout().ref_slots })
}

fn verify_function(
    module: &Module,
    func_id: u32,
    scratch: &mut Scratch,
) -> Result<FuncVerifyInfo, VerifyError> {
    let err = |pc: u32, message: &str| VerifyError::new(func_id, pc, message);

    let method = module
        .method_of(func_id)
        .ok_or_else(|| err(0, "function has no method"))?;
    let sig = &module.sigs[method.sig_id as usize];
    let code = module.func_code(func_id);
    let starts = &module.insn_starts[func_id as usize];
    let upvals = module.upval_kinds(func_id);

    if upvals.iter().any(|k| k.slot_count() == 2) {
        return Err(err(0, "128-bit upvalues are not supported"));
    }

    // Decode once, aligned with the instruction start table.
    let insns: Vec<(Instruction, u32)> = starts
        .iter()
        .map(|pc| {
            let (insn, next) = Instruction::decode(code, *pc as usize)
                .map_err(|e| VerifyError::new(func_id, *pc, e.to_string()))?;
            Ok((insn, next as u32))
        })
        .collect::<Result<Vec<_>, VerifyError>>()?;

    // The prologue contract: Enter first, nowhere else, matching the
    // declared window.
    match insns.first() {
        Some((Instruction::Enter(count), _)) if *count as u32 == method.locals => {}
        Some((Instruction::Enter(_), _)) => {
            return Err(err(0, "Enter count differs from declared locals"))
        }
        _ => return Err(err(0, "function must begin with Enter")),
    }
    for (index, (insn, _)) in insns.iter().enumerate().skip(1) {
        if matches!(insn, Instruction::Enter(_)) {
            return Err(err(starts[index], "Enter is only valid as the prologue"));
        }
        if let Instruction::CallCheck(_) = insn {
            match insns.get(index + 1) {
                Some((Instruction::Call { .. }, _))
                | Some((Instruction::CallIndirect { .. }, _))
                | Some((Instruction::TailCall { .. }, _)) => {}
                _ => return Err(err(starts[index], "CallCheck must precede a call")),
            }
        }
    }

    let ctx = FuncCtx {
        module,
        func_id,
        locals: method.locals,
        ret_type_id: sig.ret_type_id,
        upvals,
        code_len: code.len() as u32,
        insn_starts: starts,
    };

    let mut states: HashMap<u32, AbstractState> = HashMap::new();
    states.insert(0, AbstractState::function_entry(module, &sig.params, method.locals));

    // Worklist fixpoint over per-instruction entry states. The scratch
    // scope holds the pending-pc buffer for this function.
    let mut scope = scratch.scope();
    let work = scope.alloc(starts.len().max(1));
    let mut pending = vec![0u32];
    let mut block_entries: std::collections::HashSet<u32> = std::collections::HashSet::new();
    let mut stack_max = 0u32;

    while let Some(pc) = pending.pop() {
        let entry = states[&pc].clone();
        stack_max = stack_max.max(entry.stack.len() as u32);

        let index = match starts.binary_search(&pc) {
            Ok(index) => index,
            Err(_) => return Err(err(pc, "state at a non-instruction boundary")),
        };
        let (insn, next_pc) = &insns[index];
        let mut out = entry;
        let flow = transfer(&ctx, &mut out, pc, *next_pc, insn)?;
        stack_max = stack_max.max(out.stack.len() as u32);

        let mut successors: Vec<u32> = Vec::new();
        match flow {
            Flow::FallThrough => successors.push(*next_pc),
            Flow::Jump(target) => {
                block_entries.insert(target);
                successors.push(target);
            }
            Flow::Branch(target) => {
                block_entries.insert(target);
                block_entries.insert(*next_pc);
                successors.push(*next_pc);
                successors.push(target);
            }
            Flow::Table(targets) => {
                block_entries.extend(targets.iter().copied());
                successors.extend(targets);
            }
            Flow::Stop => {}
        }

        for succ in successors {
            if succ >= ctx.code_len {
                return Err(err(pc, "execution falls off the end of the function"));
            }
            match states.get_mut(&succ) {
                None => {
                    states.insert(succ, out.clone());
                    pending.push(succ);
                }
                Some(existing) => {
                    let changed = existing
                        .merge_from(&out)
                        .map_err(|message| VerifyError::new(func_id, succ, message))?;
                    if changed {
                        pending.push(succ);
                    }
                }
            }
        }
        // Keep the visited count in the scratch buffer for the dead-code
        // scan below.
        scope.slice_mut(work.clone())[index] = 1;
    }

    // Anything never reached must be explicit Trap padding.
    for (index, (insn, _)) in insns.iter().enumerate() {
        let visited = scope.slice(work.clone())[index] == 1;
        if !visited && !matches!(insn, Instruction::Trap) {
            return Err(err(starts[index], "unreachable code"));
        }
    }

    if stack_max > module.header.stack_max {
        return Err(err(
            0,
            &format!(
                "stack height {stack_max} exceeds module stack_max {}",
                module.header.stack_max
            ),
        ));
    }

    // Safepoints: block entries (pc 0 and branch targets land in
    // `states` anyway), allocation sites, and call sites.
    let mut stack_maps = BTreeMap::new();
    for (index, (insn, _)) in insns.iter().enumerate() {
        let pc = starts[index];
        let Some(state) = states.get(&pc) else {
            continue;
        };
        if pc == 0 || is_safepoint(insn.opcode()) || block_entries.contains(&pc) {
            stack_maps.insert(pc, StackMap::of(state));
        }
    }

    debug!(func_id, stack_max, safepoints = stack_maps.len(), "function verified");

    Ok(FuncVerifyInfo { stack_max, stack_maps })
}

/// Opcodes that may allocate or suspend the frame, and therefore need a
/// precise stack map.
fn is_safepoint(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        NewObject
            | NewArray
            | NewList
            | ListPush
            | ListInsert
            | StringConcat
            | StringSlice
            | NewClosure
            | ConstString
            | Call
            | CallIndirect
            | TailCall
    )
}
