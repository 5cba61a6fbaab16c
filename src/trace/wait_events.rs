use std::collections::BTreeMap;

use crate::host::Catalog;
use crate::trace::model::WaitEventStat;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WaitCounters {
    count: u64,
    time_sum: u64,
    max_time: u64,
}

/// Wait time per wait event id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitEvents {
    events: BTreeMap<u32, WaitCounters>,
}

impl WaitEvents {
    pub fn record(&mut self, event: u32, ns: u64) {
        let c = self.events.entry(event).or_default();
        c.count += 1;
        c.time_sum += ns;
        c.max_time = c.max_time.max(ns);
    }

    pub fn to_stats(&self, catalog: &dyn Catalog) -> Option<Vec<WaitEventStat>> {
        if self.events.is_empty() {
            return None;
        }
        let stats = self
            .events
            .iter()
            .map(|(&event, c)| WaitEventStat {
                name: catalog
                    .wait_event_name(event)
                    .unwrap_or_else(|| format!("unknown wait event {}", event)),
                count: c.count,
                time_sum: c.time_sum,
                max_time: c.max_time,
            })
            .collect();
        Some(stats)
    }
}
