//! Call interception.
//!
//! The dispatcher keeps a stack of instrumented calls that are still open in
//! the current backend. Each call is measured on its own from entry to exit,
//! so a recursive call and its caller are two samples, not one cumulative
//! one. Calls unwound by an error are dropped by [`Dispatcher::abort_to`].

use crate::probe::{HookId, UprobeKind};
use crate::stats::Sample;

#[derive(Debug, Clone, Copy)]
struct OpenCall {
    hook: HookId,
    started_ns: u64,
    /// Allocated bytes at entry, MEM probes only.
    mem_at_entry: Option<i64>,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    open: Vec<OpenCall>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn enter(&mut self, hook: HookId, kind: UprobeKind, now_ns: u64, allocated: impl FnOnce() -> i64) {
        let mem_at_entry = (kind == UprobeKind::Mem).then(allocated);
        self.open.push(OpenCall {
            hook,
            started_ns: now_ns,
            mem_at_entry,
        });
    }

    /// Closes the innermost open call of `hook`. Calls opened after it and
    /// never exited were unwound and are discarded. Returns `None` when
    /// `hook` has no open call.
    #[inline]
    pub fn exit(&mut self, hook: HookId, now_ns: u64, allocated: impl FnOnce() -> i64) -> Option<Sample> {
        let pos = self.open.iter().rposition(|c| c.hook == hook)?;
        let call = self.open[pos];
        self.open.truncate(pos);
        Some(Sample {
            duration_ns: now_ns.saturating_sub(call.started_ns),
            mem_delta: call.mem_at_entry.map(|m| allocated() - m).unwrap_or(0),
        })
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Drops every call opened after the stack had `depth` entries.
    /// Returns the number of dropped calls.
    pub fn abort_to(&mut self, depth: usize) -> usize {
        let dropped = self.open.len().saturating_sub(depth);
        self.open.truncate(depth);
        dropped
    }
}
