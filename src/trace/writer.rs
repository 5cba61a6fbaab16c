//! Trace file output.
//!
//! Records go to `<data_dir>/<trace_file_name>_<pid>`. Once that file has
//! reached the size limit, the next record opens a new segment
//! `<trace_file_name>_<pid>.1`, then `.2`, and so on. A closed segment
//! therefore ends between the limit and the limit plus one record.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{Settings, WriteMode};
use crate::error::Result;
use crate::fmt::nanosec;
use crate::trace::model::{ExecutionEvent, LWLockStat, QueryTrace, SessionRecord};

pub struct TraceWriter {
    dir: PathBuf,
    base_name: String,
    mode: WriteMode,
    limit: u64,
    segment: u32,
    file: File,
    size: u64,
}

impl TraceWriter {
    /// Opens the newest segment of the pid's trace file for appending.
    pub fn open(settings: &Settings, pid: u32) -> Result<Self> {
        let dir = settings.data_dir.clone();
        let base_name = format!("{}_{}", settings.trace_file_name, pid);
        let segment = latest_segment(&dir, &base_name);
        let path = segment_path(&dir, &base_name, segment);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            dir,
            base_name,
            mode: settings.trace_write_mode,
            limit: settings.trace_file_limit_bytes(),
            segment,
            file,
            size,
        })
    }

    pub fn path(&self) -> PathBuf {
        segment_path(&self.dir, &self.base_name, self.segment)
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Takes a changed size limit and write mode into account from the next
    /// record on. The file itself stays open.
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.limit = settings.trace_file_limit_bytes();
        self.mode = settings.trace_write_mode;
    }

    pub fn write_session(&mut self, record: &SessionRecord) -> Result<()> {
        let bytes = match self.mode {
            WriteMode::Structured => {
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');
                line
            }
            WriteMode::Text => render_text(record).into_bytes(),
        };
        if self.size >= self.limit {
            self.rotate()?;
        }
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Moves on to the next segment. On failure the writer stays on the
    /// current one and the next write tries again.
    fn rotate(&mut self) -> Result<()> {
        let closed = self.path();
        let path = segment_path(&self.dir, &self.base_name, self.segment + 1);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        self.file = file;
        self.size = size;
        self.segment += 1;
        info!(
            closed = %closed.display(),
            opened = %path.display(),
            "trace file reached size limit, rotated"
        );
        Ok(())
    }
}

pub fn segment_path(dir: &Path, base_name: &str, segment: u32) -> PathBuf {
    if segment == 0 {
        dir.join(base_name)
    } else {
        dir.join(format!("{}.{}", base_name, segment))
    }
}

fn latest_segment(dir: &Path, base_name: &str) -> u32 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            name.strip_prefix(base_name)?
                .strip_prefix('.')?
                .parse::<u32>()
                .ok()
        })
        .max()
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Text mode
// ---------------------------------------------------------------------------

/// Plain rendering of a session record, one event per line.
pub fn render_text(record: &SessionRecord) -> String {
    let mut out = format!(
        "TRACE SESSION. pid {} queries {}{}\n",
        record.pid,
        record.queries.len(),
        if record.partial { " (partial)" } else { "" }
    );
    for q in &record.queries {
        render_query(&mut out, q, 1);
    }
    out
}

fn render_query(out: &mut String, q: &QueryTrace, depth: usize) {
    let pad = "  ".repeat(depth);
    out.push_str(&format!(
        "{pad}TRACE QUERY. start {} text {}\n",
        q.execution_start,
        q.explain.query_text.replace('\n', " ")
    ));
    if let Some(ns) = q.parsing_time {
        out.push_str(&format!("{pad}  TRACE PARSE. parsing time {}\n", nanosec(ns)));
    }
    render_locks(out, &pad, "parsing", q.lwlock_parsing.as_deref());
    if let Some(ns) = q.planning_time {
        out.push_str(&format!("{pad}  TRACE PLAN. planning time {}\n", nanosec(ns)));
    }
    render_locks(out, &pad, "planning", q.lwlock_planning.as_deref());
    for event in &q.execution_events {
        match event {
            ExecutionEvent::Node(n) => {
                out.push_str(&format!(
                    "{pad}  TRACE EXECUTOR NODE. node {} finished execution for {}\n",
                    n.node,
                    nanosec(n.execute_time)
                ));
                render_locks(out, &pad, "node", n.lwlock_stat.as_deref());
            }
            ExecutionEvent::Query(nested) => render_query(out, nested, depth + 1),
        }
    }
    if q.events_dropped > 0 {
        out.push_str(&format!("{pad}  TRACE EVENTS DROPPED. count {}\n", q.events_dropped));
    }
    render_locks(out, &pad, "inside portal run", q.locks_inside_portal_run.as_deref());
    render_locks(out, &pad, "outside portal run", q.locks_outside_portal_run.as_deref());
    for w in q.wait_event_stat.iter().flatten() {
        out.push_str(&format!(
            "{pad}  TRACE WAIT EVENT. {} count {} time sum {} max time {}\n",
            w.name,
            w.count,
            nanosec(w.time_sum),
            nanosec(w.max_time)
        ));
    }
    out.push_str(&format!(
        "{pad}TRACE QUERY END. execution time {}{}\n",
        nanosec(q.execution_time),
        if q.truncated { " (truncated)" } else { "" }
    ));
}

fn render_locks(out: &mut String, pad: &str, scope: &str, stats: Option<&[LWLockStat]>) {
    for s in stats.into_iter().flatten() {
        let tag = &s.buffer_tag;
        out.push_str(&format!(
            "{pad}  TRACE LWLOCK. {} rel {} fork {} block {} exclusive calls {} sleeps {} sleep time {} shared calls {} sleeps {} sleep time {}\n",
            scope,
            tag.rel_name.as_deref().unwrap_or("?"),
            tag.fork_name,
            tag.block_number,
            s.exclusive.total_calls,
            s.exclusive.sleep_count,
            nanosec(s.exclusive.sleep_time_sum),
            s.shared.total_calls,
            s.shared.sleep_count,
            nanosec(s.shared.sleep_time_sum),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::model::Explain;
    use serde_json::json;
    use tempfile::tempdir;

    const MB: u64 = 1024 * 1024;

    fn query(text: &str) -> QueryTrace {
        QueryTrace {
            parsing_time: Some(1),
            lwlock_parsing: None,
            planning_time: Some(2),
            lwlock_planning: None,
            execution_start: "2024:01:02T03:04:05.006".into(),
            explain: Explain {
                query_text: text.into(),
                plan: json!({"Node Type": "Result"}),
            },
            execution_events: vec![],
            events_dropped: 0,
            execution_time: 3,
            executor_node_stat_in_plan: None,
            expr_node_stat: None,
            locks_inside_portal_run: None,
            locks_outside_portal_run: None,
            wait_event_stat: None,
            truncated: false,
        }
    }

    fn settings(dir: &Path) -> Settings {
        Settings::default().with_data_dir(dir)
    }

    #[test]
    fn test_appends_across_writers() {
        let dir = tempdir().unwrap();
        let record = SessionRecord {
            pid: 7,
            queries: vec![query("select 1")],
            partial: false,
        };
        for _ in 0..2 {
            let mut w = TraceWriter::open(&settings(dir.path()), 7).unwrap();
            w.write_session(&record).unwrap();
        }

        let content = fs::read_to_string(dir.path().join("trace_file.txt_7")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let back: SessionRecord = serde_json::from_str(line).unwrap();
            assert_eq!(back, record);
        }
    }

    #[test]
    fn test_rotation_keeps_overshoot_below_one_record() {
        let dir = tempdir().unwrap();
        let mut s = settings(dir.path());
        s.set("trace_file_limit", "1").unwrap();

        let record = SessionRecord {
            pid: 9,
            queries: vec![query(&"x".repeat(20_000))],
            partial: false,
        };
        let mut w = TraceWriter::open(&s, 9).unwrap();
        for _ in 0..80 {
            w.write_session(&record).unwrap();
        }

        let first = fs::metadata(dir.path().join("trace_file.txt_9")).unwrap().len();
        assert!(first > MB, "{first}");
        assert!(first < 2 * MB, "{first}");
        assert!(dir.path().join("trace_file.txt_9.1").exists());
        assert_eq!(w.path(), dir.path().join("trace_file.txt_9.1"));

        // a new writer continues in the newest segment
        let w2 = TraceWriter::open(&s, 9).unwrap();
        assert_eq!(w2.path(), dir.path().join("trace_file.txt_9.1"));
    }

    #[test]
    fn test_failed_rotation_retries_same_segment() {
        let dir = tempdir().unwrap();
        let mut s = settings(dir.path());
        s.set("trace_file_limit", "1").unwrap();
        let record = SessionRecord {
            pid: 4,
            queries: vec![query(&"x".repeat(300_000))],
            partial: false,
        };
        let blocker = dir.path().join("trace_file.txt_4.1");
        fs::create_dir(&blocker).unwrap();

        let mut w = TraceWriter::open(&s, 4).unwrap();
        for _ in 0..4 {
            w.write_session(&record).unwrap();
        }
        assert!(w.write_session(&record).is_err());
        assert!(w.write_session(&record).is_err());
        assert_eq!(w.path(), dir.path().join("trace_file.txt_4"));

        fs::remove_dir(&blocker).unwrap();
        w.write_session(&record).unwrap();
        assert_eq!(w.path(), blocker);
        assert!(!dir.path().join("trace_file.txt_4.2").exists());
    }

    #[test]
    fn test_settings_change_applies_to_next_record() {
        let dir = tempdir().unwrap();
        let mut s = settings(dir.path());
        let record = SessionRecord {
            pid: 6,
            queries: vec![query(&"x".repeat(300_000))],
            partial: false,
        };
        let mut w = TraceWriter::open(&s, 6).unwrap();
        for _ in 0..4 {
            w.write_session(&record).unwrap();
        }
        assert_eq!(w.path(), dir.path().join("trace_file.txt_6"));

        s.set("trace_file_limit", "1").unwrap();
        s.set("trace_write_mode", "text").unwrap();
        w.apply_settings(&s);
        w.write_session(&record).unwrap();
        assert_eq!(w.path(), dir.path().join("trace_file.txt_6.1"));
        let content = fs::read_to_string(w.path()).unwrap();
        assert!(content.starts_with("TRACE SESSION. pid 6"));
    }

    #[test]
    fn test_text_mode_is_not_structured() {
        let dir = tempdir().unwrap();
        let mut s = settings(dir.path());
        s.trace_write_mode = WriteMode::Text;
        let mut w = TraceWriter::open(&s, 3).unwrap();
        w.write_session(&SessionRecord {
            pid: 3,
            queries: vec![query("select 1"), query("select 2")],
            partial: false,
        })
        .unwrap();

        let content = fs::read_to_string(w.path()).unwrap();
        assert!(content.starts_with("TRACE SESSION. pid 3 queries 2"));
        assert!(content.contains("text select 2"));
        assert!(serde_json::from_str::<SessionRecord>(&content).is_err());
        for line in content.lines() {
            assert!(serde_json::from_str::<SessionRecord>(line).is_err());
        }
    }
}
