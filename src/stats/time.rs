use crate::fmt::{avg, nanosec};

/// Call count and accumulated time of a TIME probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeStat {
    pub calls: u64,
    pub time_sum_ns: u64,
}

impl TimeStat {
    #[inline]
    pub fn record(&mut self, duration_ns: u64) {
        self.calls += 1;
        self.time_sum_ns = self.time_sum_ns.saturating_add(duration_ns);
    }

    pub fn merge(&mut self, other: &TimeStat) {
        self.calls += other.calls;
        self.time_sum_ns = self.time_sum_ns.saturating_add(other.time_sum_ns);
    }

    pub fn avg_ns(&self) -> u64 {
        avg(self.time_sum_ns, self.calls)
    }

    /// Value returned by the TIME accessor.
    pub fn text(&self) -> String {
        format!(
            "calls: {}  time sum: {} ns  avg time: {} ns",
            self.calls,
            self.time_sum_ns,
            self.avg_ns()
        )
    }

    /// Single line written to `TIME_<function>.txt`.
    pub fn dump_line(&self) -> String {
        format!(
            "num calls: {}, time sum: {}, avg time: {}",
            self.calls,
            nanosec(self.time_sum_ns),
            nanosec(self.avg_ns())
        )
    }
}
