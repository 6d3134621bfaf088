//! Host import interface: the resolver trait plus the built-in core
//! modules (core.os, core.fs, core.log, core.dl).
//!
//! Resolution order at an imported call: the engine-installed
//! [`CoreResolver`] first, then the embedder's resolver, then a
//! MissingImport trap. A resolver error surfaces as a Trap carrying the
//! host's message.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::time::Instant;

use sbc_asm::{Handle, Slot};
use tracing::info;

use crate::consts::FIRST_USER_FD;
use crate::heap::{Heap, ObjectData};

/// Error string returned by a resolver; rendered into the trap message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError(pub String);

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for HostError {}

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    /// The import ran and produced a value.
    Return(Slot),
    /// The import ran; its signature is void.
    NoReturn,
    /// This resolver does not serve the symbol; try the next one.
    Unknown,
}

/// Heap access handed to resolvers so they can read and build VM strings.
#[derive(Debug)]
pub struct HostContext<'a> {
    heap: &'a mut Heap,
}

impl<'a> HostContext<'a> {
    pub(crate) fn new(heap: &'a mut Heap) -> Self {
        Self { heap }
    }

    /// Read a VM string argument.
    pub fn read_string(&self, handle: Handle) -> Result<&str, HostError> {
        match self.heap.get(handle).map(|o| &o.data) {
            Some(ObjectData::Str(s)) => Ok(s),
            Some(_) => Err(HostError("argument is not a string".into())),
            None => Err(HostError("argument is a null string".into())),
        }
    }

    /// Allocate a VM string for a return value.
    pub fn alloc_string(&mut self, text: &str) -> Handle {
        self.heap.alloc(u32::MAX, ObjectData::Str(text.to_owned()))
    }
}

/// Named-import resolver contract. Arguments arrive as raw slots in
/// declaration order, already popped by the engine.
pub trait ImportResolver {
    /// Resolve and execute `module.symbol`, or report `Unknown`.
    fn resolve(
        &mut self,
        module: &str,
        symbol: &str,
        args: &[Slot],
        ctx: &mut HostContext<'_>,
    ) -> Result<HostOutcome, HostError>;
}

impl<F> ImportResolver for F
where
    F: FnMut(&str, &str, &[Slot], &mut HostContext<'_>) -> Result<HostOutcome, HostError>,
{
    fn resolve(
        &mut self,
        module: &str,
        symbol: &str,
        args: &[Slot],
        ctx: &mut HostContext<'_>,
    ) -> Result<HostOutcome, HostError> {
        self(module, symbol, args, ctx)
    }
}

/// The engine's built-in modules. Owns the per-VM file descriptor table;
/// descriptors are plain integers, not heap handles, and every open file
/// is closed when the VM is dropped.
#[derive(Debug)]
pub struct CoreResolver {
    argv: Vec<String>,
    envp: BTreeMap<String, String>,
    fds: Vec<Option<File>>,
    dl_error: String,
    mono_start: Instant,
}

impl CoreResolver {
    /// Core modules over the embedder-supplied process view.
    pub fn new(argv: Vec<String>, envp: BTreeMap<String, String>, mono_start: Instant) -> Self {
        Self { argv, envp, fds: Vec::new(), dl_error: String::new(), mono_start }
    }

    fn open_fd(&mut self, file: File) -> i32 {
        for (index, slot) in self.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return FIRST_USER_FD + index as i32;
            }
        }
        self.fds.push(Some(file));
        FIRST_USER_FD + (self.fds.len() - 1) as i32
    }

    fn fd_slot(&mut self, fd: i32) -> Option<&mut Option<File>> {
        let index = usize::try_from(fd - FIRST_USER_FD).ok()?;
        self.fds.get_mut(index)
    }

    fn os(
        &mut self,
        symbol: &str,
        args: &[Slot],
        ctx: &mut HostContext<'_>,
    ) -> Result<HostOutcome, HostError> {
        match symbol {
            "args_count" => Ok(HostOutcome::Return(self.argv.len() as u32 as Slot)),
            "args_get" => {
                let index = args[0] as u32 as i32;
                let arg = usize::try_from(index)
                    .ok()
                    .and_then(|i| self.argv.get(i))
                    .ok_or_else(|| HostError(format!("argv index {index} out of range")))?;
                let arg = arg.clone();
                Ok(HostOutcome::Return(ctx.alloc_string(&arg) as Slot))
            }
            "env_get" => {
                let name = ctx.read_string(args[0] as Handle)?.to_owned();
                let value = match self.envp.get(&name) {
                    Some(value) => ctx.alloc_string(value) as Slot,
                    None => 0,
                };
                Ok(HostOutcome::Return(value))
            }
            "cwd_get" => {
                let cwd = std::env::current_dir()
                    .map_err(|e| HostError(format!("cwd_get: {e}")))?
                    .to_string_lossy()
                    .into_owned();
                Ok(HostOutcome::Return(ctx.alloc_string(&cwd) as Slot))
            }
            "time_mono_ns" => {
                Ok(HostOutcome::Return(self.mono_start.elapsed().as_nanos() as Slot))
            }
            _ => Ok(HostOutcome::Unknown),
        }
    }

    fn fs(
        &mut self,
        symbol: &str,
        args: &[Slot],
        ctx: &mut HostContext<'_>,
    ) -> Result<HostOutcome, HostError> {
        match symbol {
            "open" => {
                let path = ctx.read_string(args[0] as Handle)?.to_owned();
                let flags = args[1] as u32 as i32;
                let file = match flags {
                    0 => File::open(&path),
                    1 => OpenOptions::new().write(true).create(true).truncate(true).open(&path),
                    2 => OpenOptions::new().append(true).create(true).open(&path),
                    _ => {
                        return Ok(HostOutcome::Return((-1i32) as u32 as Slot));
                    }
                };
                let fd = match file {
                    Ok(file) => self.open_fd(file),
                    Err(_) => -1,
                };
                Ok(HostOutcome::Return(fd as u32 as Slot))
            }
            "read" => {
                let fd = args[0] as u32 as i32;
                let max_len = (args[1] as u32 as i32).max(0) as usize;
                let mut buf = vec![0u8; max_len];
                let n = match self.fd_slot(fd).and_then(|s| s.as_mut()) {
                    Some(file) => file.read(&mut buf).unwrap_or(0),
                    None => 0,
                };
                buf.truncate(n);
                let text = String::from_utf8_lossy(&buf).into_owned();
                Ok(HostOutcome::Return(ctx.alloc_string(&text) as Slot))
            }
            "write" => {
                let fd = args[0] as u32 as i32;
                let text = ctx.read_string(args[1] as Handle)?.to_owned();
                let n = match self.fd_slot(fd).and_then(|s| s.as_mut()) {
                    Some(file) => file.write(text.as_bytes()).unwrap_or(0),
                    None => 0,
                };
                Ok(HostOutcome::Return(n as u32 as Slot))
            }
            "close" => {
                // Closing an unknown descriptor is a no-op returning 0.
                if let Some(slot) = self.fd_slot(args[0] as u32 as i32) {
                    *slot = None;
                }
                Ok(HostOutcome::Return(0))
            }
            _ => Ok(HostOutcome::Unknown),
        }
    }

    fn dl(
        &mut self,
        symbol: &str,
        args: &[Slot],
        ctx: &mut HostContext<'_>,
    ) -> Result<HostOutcome, HostError> {
        match symbol {
            "open" => {
                let name = ctx.read_string(args[0] as Handle)?.to_owned();
                self.dl_error = format!("dynamic loading unavailable: {name}");
                Ok(HostOutcome::Return((-1i32) as u32 as Slot))
            }
            "last_error" => {
                let message = self.dl_error.clone();
                Ok(HostOutcome::Return(ctx.alloc_string(&message) as Slot))
            }
            _ => Ok(HostOutcome::Unknown),
        }
    }
}

impl ImportResolver for CoreResolver {
    fn resolve(
        &mut self,
        module: &str,
        symbol: &str,
        args: &[Slot],
        ctx: &mut HostContext<'_>,
    ) -> Result<HostOutcome, HostError> {
        match module {
            "core.os" => self.os(symbol, args, ctx),
            "core.fs" => self.fs(symbol, args, ctx),
            "core.log" => match symbol {
                "log" => {
                    let message = ctx.read_string(args[0] as Handle)?;
                    info!(target: "sbc_module", "{message}");
                    Ok(HostOutcome::NoReturn)
                }
                _ => Ok(HostOutcome::Unknown),
            },
            "core.dl" => self.dl(symbol, args, ctx),
            _ => Ok(HostOutcome::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_heap() -> Heap {
        Heap::new()
    }

    #[test]
    fn args_round_trip() {
        let mut heap = ctx_heap();
        let mut core = CoreResolver::new(
            vec!["vm".into(), "fixture".into()],
            BTreeMap::new(),
            Instant::now(),
        );
        let mut ctx = HostContext::new(&mut heap);

        let count = core.resolve("core.os", "args_count", &[], &mut ctx).unwrap();
        assert_eq!(count, HostOutcome::Return(2));

        let HostOutcome::Return(handle) =
            core.resolve("core.os", "args_get", &[1], &mut ctx).unwrap()
        else {
            panic!("args_get returns a string");
        };
        assert_eq!(ctx.read_string(handle as Handle).unwrap(), "fixture");
    }

    #[test]
    fn env_get_missing_is_null() {
        let mut heap = ctx_heap();
        let mut core = CoreResolver::new(Vec::new(), BTreeMap::new(), Instant::now());
        let mut ctx = HostContext::new(&mut heap);
        let name = ctx.alloc_string("NOPE");
        let out = core.resolve("core.os", "env_get", &[name as Slot], &mut ctx).unwrap();
        assert_eq!(out, HostOutcome::Return(0));
    }

    #[test]
    fn close_of_unknown_fd_is_noop() {
        let mut heap = ctx_heap();
        let mut core = CoreResolver::new(Vec::new(), BTreeMap::new(), Instant::now());
        let mut ctx = HostContext::new(&mut heap);
        let out = core.resolve("core.fs", "close", &[99], &mut ctx).unwrap();
        assert_eq!(out, HostOutcome::Return(0));
    }

    #[test]
    fn dl_open_always_fails_with_message() {
        let mut heap = ctx_heap();
        let mut core = CoreResolver::new(Vec::new(), BTreeMap::new(), Instant::now());
        let mut ctx = HostContext::new(&mut heap);
        let name = ctx.alloc_string("libm.so");
        let out = core.resolve("core.dl", "open", &[name as Slot], &mut ctx).unwrap();
        assert_eq!(out, HostOutcome::Return((-1i32) as u32 as Slot));

        let HostOutcome::Return(err) =
            core.resolve("core.dl", "last_error", &[], &mut ctx).unwrap()
        else {
            panic!("last_error returns a string");
        };
        assert!(ctx.read_string(err as Handle).unwrap().contains("libm.so"));
    }

    #[test]
    fn unknown_module_falls_through() {
        let mut heap = ctx_heap();
        let mut core = CoreResolver::new(Vec::new(), BTreeMap::new(), Instant::now());
        let mut ctx = HostContext::new(&mut heap);
        let out = core.resolve("game.physics", "step", &[], &mut ctx).unwrap();
        assert_eq!(out, HostOutcome::Unknown);
    }
}
