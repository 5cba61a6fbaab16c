//! Duration histograms.
//!
//! Samples are kept as a sketch: a sorted map from duration, rounded to
//! 100 ns ticks, to the number of calls that took that long. Buckets are
//! built at read time, either four equal-width buckets over the observed
//! range or a caller-supplied grid. The sketch never loses calls, so any
//! grid accounts for every recorded sample.

use std::collections::BTreeMap;

use crate::error::{Result, UprobeError};

/// Sketch resolution.
pub const TICK_NS: u64 = 100;
const TICKS_PER_US: f64 = 1000.0 / TICK_NS as f64;
pub const DEFAULT_BUCKETS: usize = 4;
/// Upper bound on the number of grid buckets a caller may ask for.
pub const MAX_GRID_BUCKETS: usize = 100_000;

/// One histogram row. Bounds are microseconds; `None` is an open end.
#[derive(Debug, Clone, PartialEq)]
pub struct HistRow {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub count: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistSketch {
    samples: BTreeMap<u64, u64>,
    total: u64,
}

impl HistSketch {
    #[inline]
    pub fn record(&mut self, duration_ns: u64) {
        let ticks = duration_ns.saturating_add(TICK_NS / 2) / TICK_NS;
        *self.samples.entry(ticks).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn merge(&mut self, other: &HistSketch) {
        for (&ticks, &count) in &other.samples {
            *self.samples.entry(ticks).or_insert(0) += count;
        }
        self.total += other.total;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Retained durations in microseconds with their call counts, ascending.
    pub fn iter_us(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.samples
            .iter()
            .map(|(&ticks, &count)| (ticks as f64 / TICKS_PER_US, count))
    }

    /// Four equal-width buckets spanning the observed min..max.
    /// Empty when nothing was recorded.
    pub fn default_rows(&self) -> Vec<HistRow> {
        let (Some((&lo, _)), Some((&hi, _))) =
            (self.samples.first_key_value(), self.samples.last_key_value())
        else {
            return Vec::new();
        };
        let min = lo as f64 / TICKS_PER_US;
        let max = hi as f64 / TICKS_PER_US;
        let width = (max - min) / DEFAULT_BUCKETS as f64;

        let mut counts = [0u64; DEFAULT_BUCKETS];
        for (us, count) in self.iter_us() {
            let idx = if width > 0.0 {
                (((us - min) / width) as usize).min(DEFAULT_BUCKETS - 1)
            } else {
                0
            };
            counts[idx] += count;
        }

        counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let lower = min + i as f64 * width;
                let upper = if i == DEFAULT_BUCKETS - 1 {
                    max
                } else {
                    min + (i + 1) as f64 * width
                };
                HistRow {
                    lower: Some(lower),
                    upper: Some(upper),
                    count,
                    percent: percent(count, self.total),
                }
            })
            .collect()
    }

    /// Buckets of `step` microseconds between `start` and `stop`, plus an
    /// open bucket on each side. Returns `round((stop - start) / step) + 2`
    /// rows regardless of the recorded samples.
    pub fn grid_rows(&self, start: f64, stop: f64, step: f64) -> Result<Vec<HistRow>> {
        if !start.is_finite() || !stop.is_finite() || start >= stop {
            return Err(UprobeError::InvalidRange { start, stop });
        }
        if !step.is_finite() || step <= 0.0 {
            return Err(UprobeError::InvalidStep(step));
        }
        let interior = (((stop - start) / step).round() as usize).max(1);
        if interior > MAX_GRID_BUCKETS {
            return Err(UprobeError::GridTooLarge {
                buckets: interior,
                max: MAX_GRID_BUCKETS,
            });
        }
        let size = interior + 2;

        let mut counts = vec![0u64; size];
        for (us, count) in self.iter_us() {
            let idx = if us <= start {
                0
            } else if us >= stop {
                size - 1
            } else {
                (((us - start) / step) as usize + 1).min(size - 2)
            };
            counts[idx] += count;
        }

        let rows = counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let (lower, upper) = if i == 0 {
                    (None, Some(start))
                } else if i == size - 1 {
                    (Some(stop), None)
                } else {
                    let lower = start + (i - 1) as f64 * step;
                    let upper = if i == interior {
                        stop
                    } else {
                        start + i as f64 * step
                    };
                    (Some(lower), Some(upper))
                };
                HistRow {
                    lower,
                    upper,
                    count,
                    percent: percent(count, self.total),
                }
            })
            .collect();
        Ok(rows)
    }

    /// Contents of `HIST_<function>.txt`: a `time,count` header followed by
    /// one row per retained duration in microseconds.
    pub fn dump_lines(&self) -> String {
        let mut out = String::from("time,count\n");
        for (us, count) in self.iter_us() {
            out.push_str(&format!("{:.1},{}\n", us, count));
        }
        out
    }
}

fn percent(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch(durations_ns: &[u64]) -> HistSketch {
        let mut h = HistSketch::default();
        for &d in durations_ns {
            h.record(d);
        }
        h
    }

    fn percent_sum(rows: &[HistRow]) -> f64 {
        rows.iter().map(|r| r.percent).sum()
    }

    #[test]
    fn test_default_rows_cover_all_samples() {
        let h = sketch(&[1_000, 2_000, 2_500, 9_000, 10_000, 10_000]);
        let rows = h.default_rows();
        assert_eq!(rows.len(), DEFAULT_BUCKETS);
        assert_eq!(rows.iter().map(|r| r.count).sum::<u64>(), 6);
        assert!((percent_sum(&rows) - 100.0).abs() <= 1.0);
        assert_eq!(rows[0].lower, Some(1.0));
        assert_eq!(rows[3].upper, Some(10.0));
        assert_eq!(rows[0].count, 3);
        assert_eq!(rows[3].count, 3);
    }

    #[test]
    fn test_default_rows_single_value() {
        let h = sketch(&[5_000, 5_000]);
        let rows = h.default_rows();
        assert_eq!(rows[0].count, 2);
        assert!((percent_sum(&rows) - 100.0).abs() <= 1.0);
    }

    #[test]
    fn test_default_rows_empty() {
        assert!(HistSketch::default().default_rows().is_empty());
    }

    #[test]
    fn test_grid_has_twelve_rows_for_any_distribution() {
        let distributions: [&[u64]; 4] = [
            &[],
            &[1],
            &[50_000; 10],
            &[0, 5_000, 55_000, 99_999, 100_000, 1_000_000_000],
        ];
        for d in distributions {
            let rows = sketch(d).grid_rows(0.0, 100.0, 10.0).unwrap();
            assert_eq!(rows.len(), 12);
            assert_eq!(rows.iter().map(|r| r.count).sum::<u64>(), d.len() as u64);
        }
    }

    #[test]
    fn test_grid_bucket_placement() {
        let h = sketch(&[0, 15_000, 99_000, 150_000]);
        let rows = h.grid_rows(0.0, 100.0, 10.0).unwrap();
        assert_eq!((rows[0].lower, rows[0].upper), (None, Some(0.0)));
        assert_eq!(rows[0].count, 1);
        assert_eq!((rows[2].lower, rows[2].upper), (Some(10.0), Some(20.0)));
        assert_eq!(rows[2].count, 1);
        assert_eq!((rows[10].lower, rows[10].upper), (Some(90.0), Some(100.0)));
        assert_eq!(rows[10].count, 1);
        assert_eq!((rows[11].lower, rows[11].upper), (Some(100.0), None));
        assert_eq!(rows[11].count, 1);
        assert!((percent_sum(&rows) - 100.0).abs() <= 1.0);
    }

    #[test]
    fn test_grid_uneven_step_keeps_stop_as_last_bound() {
        let h = sketch(&[95_000]);
        let rows = h.grid_rows(0.0, 100.0, 30.0).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[3].upper, Some(100.0));
        assert_eq!(rows[3].count, 1);
    }

    #[test]
    fn test_grid_rejects_bad_parameters() {
        let h = sketch(&[1_000]);
        assert!(matches!(
            h.grid_rows(100.0, 0.0, 10.0),
            Err(UprobeError::InvalidRange { .. })
        ));
        assert!(matches!(
            h.grid_rows(10.0, 10.0, 1.0),
            Err(UprobeError::InvalidRange { .. })
        ));
        assert!(matches!(
            h.grid_rows(0.0, 100.0, -10.0),
            Err(UprobeError::InvalidStep(_))
        ));
        assert!(matches!(
            h.grid_rows(0.0, 100.0, 0.0),
            Err(UprobeError::InvalidStep(_))
        ));
        assert!(matches!(
            h.grid_rows(0.0, 100.0, f64::NAN),
            Err(UprobeError::InvalidStep(_))
        ));
    }

    #[test]
    fn test_grid_bucket_limit_is_not_a_step_error() {
        let h = sketch(&[1_000]);
        assert!(matches!(
            h.grid_rows(0.0, 1_000_000.0, 1.0),
            Err(UprobeError::GridTooLarge { buckets: 1_000_000, max: MAX_GRID_BUCKETS })
        ));
        let rows = h.grid_rows(0.0, MAX_GRID_BUCKETS as f64, 1.0).unwrap();
        assert_eq!(rows.len(), MAX_GRID_BUCKETS + 2);
    }

    #[test]
    fn test_merge_and_dump() {
        let mut a = sketch(&[1_000, 1_040]);
        a.merge(&sketch(&[2_500]));
        assert_eq!(a.total(), 3);
        assert_eq!(a.dump_lines(), "time,count\n1.0,2\n2.5,1\n");
    }
}
