//! Construction: verification policy, globals initialization, and the
//! resolver/profiler/rng plumbing.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use sbc_asm::{Slot, TypeKind};
use tracing::debug;

use super::{Interpreter, VmConfig};
use crate::consts::NO_INIT;
use crate::error::VmError;
use crate::heap::{Heap, ObjectData};
use crate::host::CoreResolver;
use crate::module::{ConstEntry, Module};
use crate::profiler::Profiler;
use crate::verifier::verify_module;

impl Interpreter {
    /// Build a VM over a loaded module. Verifies unless the config says
    /// otherwise; refuses unverified modules without the explicit opt-in.
    pub fn new(module: Module, config: VmConfig) -> Result<Self, VmError> {
        let verify = if config.verify {
            Some(verify_module(&module)?)
        } else if config.allow_unverified {
            None
        } else {
            return Err(VmError::UnverifiedModule);
        };

        let globals_layout = module.globals_layout();
        let mono_start = Instant::now();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let core = CoreResolver::new(config.argv.clone(), config.envp.clone(), mono_start);

        let mut vm = Self {
            stack: Vec::with_capacity(module.header.stack_max as usize),
            locals: Vec::new(),
            globals: vec![0; globals_layout.slot_count as usize],
            frames: Vec::new(),
            heap: Heap::new(),
            string_cache: vec![0; module.consts.len()],
            profiler: Profiler::new(config.enable_jit),
            host: None,
            core,
            rng,
            mono_start,
            current_pc: 0,
            globals_layout,
            verify,
            config,
            module,
        };
        vm.init_globals();
        debug!(
            globals = vm.globals.len(),
            verified = vm.verify.is_some(),
            "interpreter constructed"
        );
        Ok(vm)
    }

    /// Apply the init constants the loader already type-checked.
    fn init_globals(&mut self) {
        for id in 0..self.module.globals.len() {
            let global = self.module.globals[id];
            if global.init_const == NO_INIT {
                continue;
            }
            let base = self.globals_layout.offsets[id] as usize;
            let kind = self.module.types[global.type_id as usize].kind;
            match self.module.consts[global.init_const as usize].clone() {
                ConstEntry::F32(v) => self.globals[base] = v.to_bits() as Slot,
                ConstEntry::F64(v) => self.globals[base] = v.to_bits(),
                ConstEntry::I128(v) => self.init_int_global(base, kind, v as u128),
                ConstEntry::U128(v) => self.init_int_global(base, kind, v),
                ConstEntry::Str(offset) => {
                    let text = self.module.str_at(offset).to_owned();
                    let handle = self.heap.alloc(u32::MAX, ObjectData::Str(text));
                    self.string_cache[global.init_const as usize] = handle;
                    self.globals[base] = handle as Slot;
                }
                ConstEntry::UpvalDesc(_) | ConstEntry::JmpTable(_) => {}
            }
        }
    }

    fn init_int_global(&mut self, base: usize, kind: TypeKind, value: u128) {
        use TypeKind as K;
        match kind {
            K::I128 | K::U128 => {
                self.globals[base] = (value >> 64) as Slot;
                self.globals[base + 1] = value as Slot;
            }
            // Narrow kinds live widened; the loader range-checked them.
            K::I8 => self.globals[base] = (value as i8 as i32) as u32 as Slot,
            K::I16 => self.globals[base] = (value as i16 as i32) as u32 as Slot,
            K::I32 => self.globals[base] = value as u32 as Slot,
            K::I64 | K::U64 => self.globals[base] = value as u64,
            K::U8 => self.globals[base] = (value as u8) as Slot,
            K::U16 | K::Char => self.globals[base] = (value as u16) as Slot,
            K::U32 => self.globals[base] = value as u32 as Slot,
            K::Bool => self.globals[base] = (value != 0) as Slot,
            K::F32 | K::F64 | K::Ref => {}
        }
    }

    /// Loaded module plus config in one step; the common embedding path.
    pub fn from_bytes(bytes: &[u8], config: VmConfig) -> Result<Self, VmError> {
        let module: Module = crate::loader::load_module(bytes)?;
        Self::new(module, config)
    }
}
