//! [`Interpreter`] implementation
//!
//! The VM owns every piece of mutable state: value stack, locals arena,
//! globals vector, frame stack, heap, profiler, and the file-descriptor
//! table inside the core resolver. A second instance is always
//! constructible independently; nothing here is process-global.

use std::collections::BTreeMap;
use std::time::Instant;

use rand::rngs::StdRng;
use sbc_asm::{Handle, Slot};

use crate::error::VmError;
use crate::heap::Heap;
use crate::host::{CoreResolver, ImportResolver};
use crate::module::{GlobalsLayout, Module};
use crate::profiler::Profiler;
use crate::state::VmStatus;
use crate::verifier::VerifyResult;

mod alu;
mod executors;
mod flow;
mod frame;
mod gc;
mod heap_ops;
mod initialization;
mod internal;
pub mod intrinsics;

pub(crate) use frame::Frame;

/// Engine configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Verify before running. On by default; turning it off requires
    /// `allow_unverified` too, and GC falls back to conservative roots.
    pub verify: bool,
    /// Explicit opt-in to execute an unverified module (test fixtures).
    pub allow_unverified: bool,
    /// Count function entries and mark hot functions.
    pub enable_jit: bool,
    /// Make `Breakpoint` trap instead of falling through.
    pub break_on_breakpoint: bool,
    /// Program arguments exposed through core.os.
    pub argv: Vec<String>,
    /// Environment exposed through core.os.
    pub envp: BTreeMap<String, String>,
    /// Seed for the rand intrinsics; `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            verify: true,
            allow_unverified: false,
            enable_jit: false,
            break_on_breakpoint: false,
            argv: Vec::new(),
            envp: BTreeMap::new(),
            rng_seed: None,
        }
    }
}

/// VM interpreter.
///
/// Construction loads nothing and runs nothing; [`Interpreter::new`]
/// takes a loaded [`Module`], verifies it per the config, and prepares
/// globals. [`Interpreter::execute`] then runs the entry function to a
/// terminal [`crate::state::ProgramState`].
pub struct Interpreter {
    module: Module,
    verify: Option<VerifyResult>,
    config: VmConfig,
    stack: Vec<Slot>,
    locals: Vec<Slot>,
    globals: Vec<Slot>,
    globals_layout: GlobalsLayout,
    frames: Vec<Frame>,
    heap: Heap,
    string_cache: Vec<Handle>,
    core: CoreResolver,
    host: Option<Box<dyn ImportResolver>>,
    profiler: Profiler,
    rng: StdRng,
    mono_start: Instant,
    /// Pc of the instruction currently executing; the current frame's
    /// safepoint when a collection triggers mid-instruction.
    current_pc: u32,
}

impl Interpreter {
    /// The loaded module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The heap; useful for embedder inspection after a run.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Profiler counters (populated when `enable_jit` is set, plus the
    /// ProfileStart/End spans).
    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Verification output, when the module was verified.
    pub fn verify_result(&self) -> Option<&VerifyResult> {
        self.verify.as_ref()
    }

    /// Install the embedder's import resolver.
    pub fn with_host(mut self, resolver: Box<dyn ImportResolver>) -> Self {
        self.host = Some(resolver);
        self
    }

    /// Current value-stack height; tests assert against the verifier's
    /// prediction.
    pub fn stack_height(&self) -> usize {
        self.stack.len()
    }
}

/// Load, verify, and execute module bytes in one call.
pub fn run_module(bytes: &[u8], config: VmConfig) -> VmStatus {
    match run_inner(bytes, config) {
        Ok(state) => state.into(),
        Err(err) => err.into(),
    }
}

fn run_inner(bytes: &[u8], config: VmConfig) -> Result<crate::state::ProgramState, VmError> {
    let module = crate::loader::load_module(bytes)?;
    let mut vm = Interpreter::new(module, config)?;
    Ok(vm.execute())
}
