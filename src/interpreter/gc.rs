//! Root enumeration and the allocation-site collection trigger.
//!
//! With a verified module, roots are precise: each frame's stack segment
//! and locals window are filtered through the verifier's stack map at
//! that frame's safepoint (the current instruction for the top frame,
//! the recorded call site for every caller). Without verification the
//! collector falls back to conservative scanning, where any slot that
//! resolves to a live object pins it.

use sbc_asm::Handle;

use super::Interpreter;

impl Interpreter {
    /// Collect if the live-byte threshold has been crossed. Called at
    /// the top of every potentially-allocating opcode, while operands
    /// are still rooted on the stack.
    pub(crate) fn maybe_collect(&mut self) {
        if !self.heap.wants_collect() {
            return;
        }
        let roots = self.gc_roots();
        self.heap.collect(roots, &self.module);
    }

    fn gc_roots(&self) -> Vec<Handle> {
        let mut roots: Vec<Handle> = Vec::new();

        // Interned pool strings are immortal.
        roots.extend(self.string_cache.iter().copied().filter(|h| *h != 0));

        let Some(verify) = &self.verify else {
            self.conservative_roots(&mut roots);
            return roots;
        };

        for (slot, is_ref) in self.globals.iter().zip(&verify.globals_refs) {
            if *is_ref {
                roots.push(*slot as Handle);
            }
        }

        for (index, frame) in self.frames.iter().enumerate() {
            let callee = self.frames.get(index + 1);
            let site_pc = callee.map(|c| c.caller_site_pc).unwrap_or(self.current_pc);
            let segment_end = callee.map(|c| c.stack_base).unwrap_or(self.stack.len());
            let segment = &self.stack[frame.stack_base..segment_end];

            match verify.functions[frame.func_id as usize].map_at(site_pc) {
                Some(map) => {
                    // A caller's entry-state map includes the argument
                    // slots already consumed by the callee; the live
                    // segment is a bottom-aligned prefix of it.
                    for (slot, is_ref) in segment.iter().zip(map.stack_refs()) {
                        if is_ref {
                            roots.push(*slot as Handle);
                        }
                    }
                    for (local, is_ref) in map.local_refs.iter().enumerate() {
                        if *is_ref && local < frame.locals_count {
                            roots.push(self.locals[frame.locals_base + local] as Handle);
                        }
                    }
                }
                None => {
                    for slot in segment {
                        self.push_if_live(*slot, &mut roots);
                    }
                    let window =
                        &self.locals[frame.locals_base..frame.locals_base + frame.locals_count];
                    for slot in window {
                        self.push_if_live(*slot, &mut roots);
                    }
                }
            }

            if frame.upvalues != 0 {
                roots.push(frame.upvalues);
            }
        }

        roots
    }

    fn conservative_roots(&self, roots: &mut Vec<Handle>) {
        let slots = self.stack.iter().chain(self.locals.iter()).chain(self.globals.iter());
        for slot in slots {
            self.push_if_live(*slot, roots);
        }
        for frame in &self.frames {
            if frame.upvalues != 0 {
                roots.push(frame.upvalues);
            }
        }
    }

    fn push_if_live(&self, slot: u64, roots: &mut Vec<Handle>) {
        if slot >> 32 != 0 {
            return;
        }
        let handle = slot as Handle;
        if handle != 0 && self.heap.get(handle).is_some() {
            roots.push(handle);
        }
    }
}
