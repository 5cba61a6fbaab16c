//! Stat collectors.
//!
//! Every probe feeds one [`StatSlot`]. Where the slot lives depends on the
//! probe locality: a [`LocalCollector`] keeps it inside the owning backend,
//! a [`SharedCollector`](crate::shared::SharedCollector) points at a slot in
//! the shared region. Both are driven through the [`Collector`] trait.

pub mod hist;
pub mod mem;
pub mod time;

pub use hist::{HistRow, HistSketch};
pub use mem::{MemRow, MemStat};
pub use time::TimeStat;

use crate::probe::UprobeKind;

/// One finished call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    pub duration_ns: u64,
    /// Net bytes allocated during the call, negative when it freed more.
    pub mem_delta: i64,
}

/// Accumulated state of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum StatSlot {
    Time(TimeStat),
    Hist(HistSketch),
    Mem(MemStat),
}

impl StatSlot {
    pub fn new(kind: UprobeKind) -> Self {
        match kind {
            UprobeKind::Time => StatSlot::Time(TimeStat::default()),
            UprobeKind::Hist => StatSlot::Hist(HistSketch::default()),
            UprobeKind::Mem => StatSlot::Mem(MemStat::default()),
        }
    }

    pub fn kind(&self) -> UprobeKind {
        match self {
            StatSlot::Time(_) => UprobeKind::Time,
            StatSlot::Hist(_) => UprobeKind::Hist,
            StatSlot::Mem(_) => UprobeKind::Mem,
        }
    }

    #[inline]
    pub fn record(&mut self, sample: Sample) {
        match self {
            StatSlot::Time(s) => s.record(sample.duration_ns),
            StatSlot::Hist(s) => s.record(sample.duration_ns),
            StatSlot::Mem(s) => s.record(sample.mem_delta),
        }
    }

    /// Adds `other` into `self`. Slots of different kinds are left alone.
    pub fn merge(&mut self, other: StatSlot) {
        match (self, other) {
            (StatSlot::Time(a), StatSlot::Time(b)) => a.merge(&b),
            (StatSlot::Hist(a), StatSlot::Hist(b)) => a.merge(&b),
            (StatSlot::Mem(a), StatSlot::Mem(b)) => a.merge(&b),
            _ => {}
        }
    }

    /// Replaces the state with an empty slot of the same kind and returns
    /// the old one.
    pub fn take(&mut self) -> StatSlot {
        let kind = self.kind();
        std::mem::replace(self, StatSlot::new(kind))
    }
}

/// Access to a probe's stat storage.
pub trait Collector: Send {
    fn kind(&self) -> UprobeKind;

    /// Adds one sample. Must not block on I/O.
    fn record(&mut self, sample: Sample);

    /// Copy of the current state.
    fn snapshot(&self) -> StatSlot;

    /// Takes the current state, leaving the collector empty. A concurrent
    /// sample lands either in the returned state or in the fresh one.
    fn take(&mut self) -> StatSlot;

    /// Puts back state returned by [`Collector::take`].
    fn merge(&mut self, state: StatSlot);
}

/// Collector owned by a single backend.
#[derive(Debug)]
pub struct LocalCollector {
    slot: StatSlot,
}

impl LocalCollector {
    pub fn new(kind: UprobeKind) -> Self {
        Self {
            slot: StatSlot::new(kind),
        }
    }
}

impl Collector for LocalCollector {
    fn kind(&self) -> UprobeKind {
        self.slot.kind()
    }

    fn record(&mut self, sample: Sample) {
        self.slot.record(sample);
    }

    fn snapshot(&self) -> StatSlot {
        self.slot.clone()
    }

    fn take(&mut self) -> StatSlot {
        self.slot.take()
    }

    fn merge(&mut self, state: StatSlot) {
        self.slot.merge(state);
    }
}
