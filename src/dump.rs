//! Stat file persistence.
//!
//! Each probe dumps to `<data_dir>/<KIND>_<function>.txt`. Files are written
//! to a `.tmp` sibling and renamed into place, so a reader never sees a
//! partial dump.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::probe::UprobeKind;
use crate::stats::{Collector, StatSlot};

pub fn stat_file_name(kind: UprobeKind, function: &str) -> String {
    format!("{}_{}.txt", kind.as_str(), function)
}

pub fn stat_file_path(data_dir: &Path, kind: UprobeKind, function: &str) -> PathBuf {
    data_dir.join(stat_file_name(kind, function))
}

/// File contents for a stat slot.
pub fn render(slot: &StatSlot) -> String {
    match slot {
        StatSlot::Time(t) => format!("{}\n", t.dump_line()),
        StatSlot::Hist(h) => h.dump_lines(),
        StatSlot::Mem(m) => m.dump_lines(),
    }
}

pub fn write_stat(data_dir: &Path, function: &str, slot: &StatSlot) -> io::Result<PathBuf> {
    let path = stat_file_path(data_dir, slot.kind(), function);
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, render(slot))?;
    if let Err(e) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(path)
}

/// Writes the collector state to its stat file.
///
/// With `clear`, the state is taken out of the collector before writing, so
/// samples arriving meanwhile count toward the next dump. If the write
/// fails the taken state is merged back and nothing is lost.
pub fn dump(collector: &mut dyn Collector, function: &str, data_dir: &Path, clear: bool) -> Result<PathBuf> {
    if !clear {
        return Ok(write_stat(data_dir, function, &collector.snapshot())?);
    }

    let taken = collector.take();
    match write_stat(data_dir, function, &taken) {
        Ok(path) => {
            debug!(function, path = %path.display(), "stat dumped and cleared");
            Ok(path)
        }
        Err(e) => {
            warn!(function, error = %e, "stat dump failed, keeping collected data");
            collector.merge(taken);
            Err(e.into())
        }
    }
}

/// Removes a stat file, ignoring one that is already gone.
pub fn remove_stat_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{LocalCollector, Sample};
    use tempfile::tempdir;

    fn collector_with(kind: UprobeKind, durations: &[u64]) -> LocalCollector {
        let mut c = LocalCollector::new(kind);
        for &d in durations {
            c.record(Sample {
                duration_ns: d,
                mem_delta: 32,
            });
        }
        c
    }

    #[test]
    fn test_dump_without_clear_keeps_state() {
        let dir = tempdir().unwrap();
        let mut c = collector_with(UprobeKind::Time, &[100, 300]);

        let path = dump(&mut c, "PortalStart", dir.path(), false).unwrap();
        assert_eq!(path, dir.path().join("TIME_PortalStart.txt"));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "num calls: 2, time sum: 400 nanosec, avg time: 200 nanosec\n"
        );
        assert_eq!(c.snapshot(), collector_with(UprobeKind::Time, &[100, 300]).snapshot());
    }

    #[test]
    fn test_dump_with_clear_resets() {
        let dir = tempdir().unwrap();
        let mut c = collector_with(UprobeKind::Hist, &[1000]);
        let path = dump(&mut c, "palloc", dir.path(), true).unwrap();
        assert!(path.ends_with("HIST_palloc.txt"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "time,count\n1.0,1\n");
        assert_eq!(c.snapshot(), StatSlot::new(UprobeKind::Hist));
        assert!(!dir.path().join("HIST_palloc.tmp").exists());
    }

    #[test]
    fn test_failed_dump_keeps_state() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing");
        let mut c = collector_with(UprobeKind::Mem, &[1, 2, 3]);
        let before = c.snapshot();

        assert!(dump(&mut c, "palloc", &missing, true).is_err());
        assert_eq!(c.snapshot(), before);
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let dir = tempdir().unwrap();
        assert!(remove_stat_file(&dir.path().join("TIME_x.txt")).is_ok());
    }
}
