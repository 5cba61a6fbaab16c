//! Buffer content lock accounting.
//!
//! Lock acquisitions are grouped by scope (parsing, planning, inside or
//! outside the portal run, one executor node). A scope counts calls and
//! sleeps per buffer and lock mode.

use std::collections::BTreeMap;

use crate::host::Catalog;
use crate::trace::buffer_tag::BufferTag;
use crate::trace::model::{LWLockStat, LockModeStat};

/// Buffers reported per scope. The ones that slept longest are kept.
pub const MAX_REPORTED_BUFFERS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TagCounters {
    exclusive: LockModeStat,
    shared: LockModeStat,
}

impl TagCounters {
    fn slept(&self) -> bool {
        self.exclusive.sleep_count > 0 || self.shared.sleep_count > 0
    }

    fn weight(&self) -> (u64, u64) {
        (
            self.exclusive.sleep_time_sum + self.shared.sleep_time_sum,
            self.exclusive.total_calls + self.shared.total_calls,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockScope {
    tags: BTreeMap<BufferTag, TagCounters>,
}

impl LockScope {
    /// Counts one acquisition; `sleep_ns` is zero when the lock was free.
    pub fn record(&mut self, tag: BufferTag, mode: LockMode, sleep_ns: u64) {
        let counters = self.tags.entry(tag).or_default();
        match mode {
            LockMode::Exclusive => counters.exclusive.record(sleep_ns),
            LockMode::Shared => counters.shared.record(sleep_ns),
        }
    }

    pub fn merge(&mut self, other: &LockScope) {
        for (tag, counters) in &other.tags {
            let mine = self.tags.entry(*tag).or_default();
            mine.exclusive.merge(&counters.exclusive);
            mine.shared.merge(&counters.shared);
        }
    }

    /// Report entries in buffer order, `None` when nothing is left to
    /// report. With `only_sleeps`, buffers whose locks never had to wait are
    /// skipped. At most [`MAX_REPORTED_BUFFERS`] entries are returned.
    pub fn to_stats(&self, catalog: &dyn Catalog, only_sleeps: bool) -> Option<Vec<LWLockStat>> {
        let mut kept: Vec<(&BufferTag, &TagCounters)> = self
            .tags
            .iter()
            .filter(|(_, c)| !only_sleeps || c.slept())
            .collect();
        if kept.len() > MAX_REPORTED_BUFFERS {
            kept.sort_by(|a, b| b.1.weight().cmp(&a.1.weight()));
            kept.truncate(MAX_REPORTED_BUFFERS);
            kept.sort_by(|a, b| a.0.cmp(b.0));
        }
        let stats: Vec<LWLockStat> = kept
            .into_iter()
            .map(|(tag, c)| LWLockStat {
                buffer_tag: tag.decode(catalog),
                exclusive: c.exclusive,
                shared: c.shared,
            })
            .collect();
        (!stats.is_empty()).then_some(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticCatalog;
    use crate::trace::buffer_tag::ForkNumber;

    fn tag(block: u32) -> BufferTag {
        BufferTag::new(1663, 5, 16384, ForkNumber::Main, block)
    }

    #[test]
    fn test_only_sleeps_filter() {
        let mut scope = LockScope::default();
        scope.record(tag(1), LockMode::Shared, 0);
        scope.record(tag(2), LockMode::Exclusive, 500);
        scope.record(tag(2), LockMode::Shared, 0);

        let catalog = StaticCatalog::new();
        let slept = scope.to_stats(&catalog, true).unwrap();
        assert_eq!(slept.len(), 1);
        assert_eq!(slept[0].buffer_tag.block_number, 2);
        assert_eq!(slept[0].exclusive.sleep_time_sum, 500);
        assert_eq!(slept[0].shared.total_calls, 1);

        let all = scope.to_stats(&catalog, false).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].shared.sleep_count, 0);
        assert_eq!(all[0].shared.max_sleep_time, 0);
    }

    #[test]
    fn test_nothing_to_report() {
        let mut scope = LockScope::default();
        let catalog = StaticCatalog::new();
        assert!(scope.to_stats(&catalog, false).is_none());
        scope.record(tag(1), LockMode::Shared, 0);
        assert!(scope.to_stats(&catalog, true).is_none());
    }

    #[test]
    fn test_busiest_buffers_are_reported() {
        let mut scope = LockScope::default();
        for block in 0..(MAX_REPORTED_BUFFERS as u32 + 100) {
            scope.record(tag(block), LockMode::Shared, 0);
        }
        scope.record(tag(5000), LockMode::Exclusive, 900);

        let stats = scope.to_stats(&StaticCatalog::new(), false).unwrap();
        assert_eq!(stats.len(), MAX_REPORTED_BUFFERS);
        assert_eq!(stats.last().unwrap().buffer_tag.block_number, 5000);
        assert!(stats.windows(2).all(|w| w[0].buffer_tag.block_number < w[1].buffer_tag.block_number));
    }

    #[test]
    fn test_merge_adds_counters() {
        let mut a = LockScope::default();
        a.record(tag(1), LockMode::Exclusive, 10);
        let mut b = LockScope::default();
        b.record(tag(1), LockMode::Exclusive, 40);
        b.record(tag(3), LockMode::Shared, 0);
        a.merge(&b);

        let stats = a.to_stats(&StaticCatalog::new(), false).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].exclusive.total_calls, 2);
        assert_eq!(stats[0].exclusive.max_sleep_time, 40);
    }
}
