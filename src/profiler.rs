//! Execution profiler backing `ProfileStart`/`ProfileEnd` and the
//! hot-function accounting the optional JIT tier is observed through.

use std::collections::{HashMap, HashSet};

use crate::consts::JIT_HOT_THRESHOLD;

/// Per-VM profiler. Span counters always run; function-entry counting
/// and hot marking only when the JIT tier is enabled, which is the one
/// observable effect `enable_jit` has.
#[derive(Debug, Default)]
pub struct Profiler {
    jit: bool,
    call_counts: HashMap<u32, u64>,
    hot: HashSet<u32>,
    span_counts: HashMap<u32, u64>,
    open_spans: Vec<u32>,
}

impl Profiler {
    /// Profiler with or without JIT accounting.
    pub fn new(jit: bool) -> Self {
        Self { jit, ..Self::default() }
    }

    /// Record a function entry.
    pub fn on_call(&mut self, func_id: u32) {
        if !self.jit {
            return;
        }
        let count = self.call_counts.entry(func_id).or_insert(0);
        *count += 1;
        if *count >= JIT_HOT_THRESHOLD {
            self.hot.insert(func_id);
        }
    }

    /// Times a function has been entered (0 without `enable_jit`).
    pub fn call_count(&self, func_id: u32) -> u64 {
        self.call_counts.get(&func_id).copied().unwrap_or(0)
    }

    /// Whether the function crossed the hot threshold.
    pub fn is_hot(&self, func_id: u32) -> bool {
        self.hot.contains(&func_id)
    }

    /// `ProfileStart` opcode.
    pub fn span_start(&mut self, id: u32) {
        *self.span_counts.entry(id).or_insert(0) += 1;
        self.open_spans.push(id);
    }

    /// `ProfileEnd` opcode. Unbalanced ends are ignored.
    pub fn span_end(&mut self, id: u32) {
        if self.open_spans.last() == Some(&id) {
            self.open_spans.pop();
        }
    }

    /// Times a span id has been opened.
    pub fn span_count(&self, id: u32) -> u64 {
        self.span_counts.get(&id).copied().unwrap_or(0)
    }
}
