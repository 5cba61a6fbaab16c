//! Shared formatting helpers for stat output and trace records.

use chrono::{DateTime, TimeZone};

/// Timestamp layout used for `executionStart`: `2024:05:17T10:31:02.123`.
pub const EXECUTION_START_FORMAT: &str = "%Y:%m:%dT%H:%M:%S%.3f";

/// Format nanoseconds the way dump files and text traces spell them.
pub fn nanosec(ns: u64) -> String {
    format!("{} nanosec", ns)
}

pub fn execution_start<Tz: TimeZone>(ts: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    ts.format(EXECUTION_START_FORMAT).to_string()
}

/// Integer average, zero when nothing was counted.
pub fn avg(sum: u64, count: u64) -> u64 {
    if count == 0 { 0 } else { sum / count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_execution_start_layout() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 7, 9, 3, 2).unwrap()
            + chrono::Duration::milliseconds(45);
        assert_eq!(execution_start(&ts), "2024:05:07T09:03:02.045");
    }

    #[test]
    fn test_nanosec() {
        assert_eq!(nanosec(0), "0 nanosec");
        assert_eq!(nanosec(1500), "1500 nanosec");
    }

    #[test]
    fn test_avg() {
        assert_eq!(avg(10, 0), 0);
        assert_eq!(avg(10, 3), 3);
    }
}
