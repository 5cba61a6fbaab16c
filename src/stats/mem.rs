use std::collections::BTreeMap;

/// Net allocation size in bytes with the number of calls that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRow {
    pub size: i64,
    pub count: u64,
}

/// Distribution of net memory allocated per call.
/// Buckets appear on first use, so none is ever empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemStat {
    buckets: BTreeMap<i64, u64>,
}

impl MemStat {
    #[inline]
    pub fn record(&mut self, delta: i64) {
        *self.buckets.entry(delta).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &MemStat) {
        for (&size, &count) in &other.buckets {
            *self.buckets.entry(size).or_insert(0) += count;
        }
    }

    pub fn rows(&self) -> Vec<MemRow> {
        self.buckets
            .iter()
            .map(|(&size, &count)| MemRow { size, count })
            .collect()
    }

    /// Contents of `MEM_<function>.txt`.
    pub fn dump_lines(&self) -> String {
        let mut out = String::from("memory,count\n");
        for (size, count) in &self.buckets {
            out.push_str(&format!("{},{}\n", size, count));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_sorted_and_non_empty() {
        let mut m = MemStat::default();
        m.record(128);
        m.record(-64);
        m.record(128);
        assert_eq!(
            m.rows(),
            vec![
                MemRow { size: -64, count: 1 },
                MemRow { size: 128, count: 2 }
            ]
        );
        assert!(m.rows().iter().all(|r| r.count > 0));
        assert_eq!(m.dump_lines(), "memory,count\n-64,1\n128,2\n");
    }

    #[test]
    fn test_empty_has_no_rows() {
        assert!(MemStat::default().rows().is_empty());
    }
}
