use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use clap::Parser;
use serde::Serialize;
use tracing::{Level, debug, warn};
use tracing_subscriber::EnvFilter;

use pg_uprobe::UprobeKind;
use pg_uprobe::shared::SHARED_CONFIG_FILE;
use pg_uprobe::trace::{QueryTrace, SessionRecord};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pg-uprobe-inspect", about = "Inspect pg-uprobe stat and trace files")]
struct Cli {
    /// Stat file, trace file, or data directory
    path: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Number of slowest queries to show per trace file
    #[arg(long, default_value_t = 5)]
    top: usize,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let path = cli.path.clone().unwrap_or_else(|| PathBuf::from("."));

    if path.is_dir() {
        dump_directory(&path, &cli);
    } else if let Some(kind) = stat_kind(&path) {
        let summary = summarize_stat(&path, kind).unwrap_or_else(|e| fail(&path, e));
        print_one(&summary, &cli, print_stat);
    } else if path.exists() {
        let summary = summarize_trace(&path, cli.top).unwrap_or_else(|e| fail(&path, e));
        print_one(&summary, &cli, print_trace);
    } else {
        eprintln!("No such file or directory: {}", path.display());
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["pg_uprobe", "pg_uprobe_inspect"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(path: &Path, e: std::io::Error) -> ! {
    eprintln!("Error reading {}: {e}", path.display());
    std::process::exit(1);
}

fn print_one<T: Serialize>(value: &T, cli: &Cli, print: fn(&T)) {
    if cli.json {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("Error encoding JSON: {e}"),
        }
    } else {
        print(value);
    }
}

/// Kind of a stat file, from its `<KIND>_<function>.txt` name.
fn stat_kind(path: &Path) -> Option<UprobeKind> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".txt")?;
    let (kind, function) = stem.split_once('_')?;
    if function.is_empty() {
        return None;
    }
    UprobeKind::parse(kind).ok()
}

// ── Formatting helpers ───────────────────────────────────────────────────────

fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GIB {
        format!("{:.1} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.1} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{bytes} B")
    }
}

fn human_ns(ns: u64) -> String {
    if ns >= 1_000_000_000 {
        format!("{:.2} s", ns as f64 / 1e9)
    } else if ns >= 1_000_000 {
        format!("{:.2} ms", ns as f64 / 1e6)
    } else if ns >= 1_000 {
        format!("{:.1} us", ns as f64 / 1e3)
    } else {
        format!("{ns} ns")
    }
}

fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn fmt_mtime(path: &Path) -> Option<String> {
    let modified: SystemTime = fs::metadata(path).ok()?.modified().ok()?;
    let dt: DateTime<Local> = modified.into();
    Some(dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}

fn one_line(text: &str, width: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= width {
        flat
    } else {
        let cut: String = flat.chars().take(width.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

// ── Stat files ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatSummary {
    file: String,
    file_size: u64,
    modified: Option<String>,
    kind: UprobeKind,
    function: String,
    calls: u64,
    /// TIME: summed call time in nanoseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    time_sum_ns: Option<u64>,
    /// HIST: distinct recorded durations (us); MEM: distinct sizes.
    #[serde(skip_serializing_if = "Option::is_none")]
    distinct_values: Option<usize>,
    /// Smallest and largest duration (us) or allocation size (bytes).
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<(f64, f64)>,
}

fn summarize_stat(path: &Path, kind: UprobeKind) -> std::io::Result<StatSummary> {
    let content = fs::read_to_string(path)?;
    let name = file_name(path);
    let function = name
        .strip_suffix(".txt")
        .and_then(|s| s.split_once('_'))
        .map(|(_, f)| f.to_string())
        .unwrap_or_default();

    let mut summary = StatSummary {
        file: name,
        file_size: content.len() as u64,
        modified: fmt_mtime(path),
        kind,
        function,
        calls: 0,
        time_sum_ns: None,
        distinct_values: None,
        range: None,
    };

    match kind {
        UprobeKind::Time => {
            // num calls: N, time sum: T nanosec, avg time: A nanosec
            for part in content.trim().split(", ") {
                if let Some(v) = part.strip_prefix("num calls: ") {
                    summary.calls = v.trim().parse().unwrap_or(0);
                } else if let Some(v) = part.strip_prefix("time sum: ") {
                    summary.time_sum_ns = v.trim_end_matches(" nanosec").parse().ok();
                }
            }
        }
        UprobeKind::Hist | UprobeKind::Mem => {
            let rows: Vec<(f64, u64)> = content
                .lines()
                .skip(1)
                .filter_map(|line| {
                    let (value, count) = line.split_once(',')?;
                    Some((value.trim().parse().ok()?, count.trim().parse().ok()?))
                })
                .collect();
            summary.calls = rows.iter().map(|(_, c)| c).sum();
            summary.distinct_values = Some(rows.len());
            let min = rows.iter().map(|(v, _)| *v).reduce(f64::min);
            let max = rows.iter().map(|(v, _)| *v).reduce(f64::max);
            summary.range = min.zip(max);
        }
    }
    Ok(summary)
}

fn print_stat(s: &StatSummary) {
    println!("File: {} ({})", s.file, human_bytes(s.file_size));
    if let Some(m) = &s.modified {
        println!("Modified: {}", m);
    }
    println!("Probe: {} on {}", s.kind.as_str(), s.function);
    println!("  Calls: {}", s.calls);
    if let Some(sum) = s.time_sum_ns {
        let avg = if s.calls == 0 { 0 } else { sum / s.calls };
        println!("  Time sum: {}, avg {}", human_ns(sum), human_ns(avg));
    }
    if let Some(n) = s.distinct_values {
        println!("  Distinct values: {}", n);
    }
    if let Some((min, max)) = s.range {
        let unit = if s.kind == UprobeKind::Mem { "B" } else { "us" };
        println!("  Range: {} {unit} .. {} {unit}", min, max);
    }
}

// ── Trace files ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SlowQuery {
    pid: u32,
    execution_start: String,
    execution_time_ns: u64,
    query: String,
}

#[derive(Serialize, Default)]
struct TraceSummary {
    file: String,
    file_size: u64,
    modified: Option<String>,
    records: usize,
    partial_records: usize,
    /// Sessions written in text mode; only counted.
    text_records: usize,
    unreadable_lines: usize,
    pids: Vec<u32>,
    queries: usize,
    nested_queries: usize,
    max_depth: usize,
    truncated: usize,
    execution_time_ns: u64,
    slowest: Vec<SlowQuery>,
}

impl TraceSummary {
    fn add_query(&mut self, pid: u32, q: &QueryTrace, top: usize) {
        self.queries += 1;
        self.nested_queries += count_nested(q);
        self.max_depth = self.max_depth.max(q.depth());
        if q.truncated {
            self.truncated += 1;
        }
        self.execution_time_ns += q.execution_time;

        if top == 0 {
            return;
        }
        let pos = self
            .slowest
            .partition_point(|s| s.execution_time_ns >= q.execution_time);
        if pos < top {
            self.slowest.insert(
                pos,
                SlowQuery {
                    pid,
                    execution_start: q.execution_start.clone(),
                    execution_time_ns: q.execution_time,
                    query: one_line(&q.explain.query_text, 60),
                },
            );
            self.slowest.truncate(top);
        }
    }
}

fn count_nested(q: &QueryTrace) -> usize {
    q.nested().map(|n| 1 + count_nested(n)).sum()
}

fn summarize_trace(path: &Path, top: usize) -> std::io::Result<TraceSummary> {
    let content = fs::read_to_string(path)?;
    let mut summary = TraceSummary {
        file: file_name(path),
        file_size: content.len() as u64,
        modified: fmt_mtime(path),
        ..Default::default()
    };

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        if line.starts_with("TRACE SESSION.") {
            summary.text_records += 1;
            continue;
        }
        if !line.starts_with('{') {
            // body of a text mode record
            continue;
        }
        match serde_json::from_str::<SessionRecord>(line) {
            Ok(record) => {
                summary.records += 1;
                if record.partial {
                    summary.partial_records += 1;
                }
                if !summary.pids.contains(&record.pid) {
                    summary.pids.push(record.pid);
                }
                for q in &record.queries {
                    summary.add_query(record.pid, q, top);
                }
            }
            Err(e) => {
                debug!(file = %summary.file, error = %e, "skipping unreadable line");
                summary.unreadable_lines += 1;
            }
        }
    }
    Ok(summary)
}

fn print_trace(s: &TraceSummary) {
    println!("File: {} ({})", s.file, human_bytes(s.file_size));
    if let Some(m) = &s.modified {
        println!("Modified: {}", m);
    }
    println!(
        "Records: {} ({} partial), {} text",
        s.records, s.partial_records, s.text_records
    );
    if s.unreadable_lines > 0 {
        println!("  Unreadable lines: {}", s.unreadable_lines);
    }
    if s.records == 0 {
        return;
    }
    let pids: Vec<String> = s.pids.iter().map(u32::to_string).collect();
    println!("  Pids: {}", pids.join(", "));
    println!(
        "  Queries: {} top level, {} nested, max depth {}",
        s.queries, s.nested_queries, s.max_depth
    );
    println!(
        "  Truncated: {} ({:.1}%)",
        s.truncated,
        pct(s.truncated as u64, s.queries as u64)
    );
    println!("  Execution time: {}", human_ns(s.execution_time_ns));

    if !s.slowest.is_empty() {
        println!("\nSlowest queries:");
        println!("  {:>8} {:>12} {:<23} {}", "Pid", "Time", "Start", "Query");
        println!("  {}", "─".repeat(100));
        for q in &s.slowest {
            println!(
                "  {:>8} {:>12} {:<23} {}",
                q.pid,
                human_ns(q.execution_time_ns),
                q.execution_start,
                q.query
            );
        }
    }
}

// ── dump_directory ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SharedProbeJson {
    function: String,
    kind: UprobeKind,
}

#[derive(Serialize)]
struct DirectoryJson {
    path: String,
    shared_probes: Vec<SharedProbeJson>,
    stats: Vec<StatSummary>,
    traces: Vec<TraceSummary>,
    total_size: u64,
}

fn dump_directory(path: &Path, cli: &Cli) {
    let entries = fs::read_dir(path).unwrap_or_else(|e| fail(path, e));

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut shared_probes = Vec::new();
    let mut stats = Vec::new();
    let mut traces = Vec::new();

    for file in &files {
        if file.file_name().and_then(|f| f.to_str()) == Some(SHARED_CONFIG_FILE) {
            shared_probes = read_shared_config(file);
        } else if let Some(kind) = stat_kind(file) {
            match summarize_stat(file, kind) {
                Ok(s) => stats.push(s),
                Err(e) => warn!(file = %file.display(), error = %e, "failed to read stat file"),
            }
        } else if looks_like_trace(file) {
            match summarize_trace(file, cli.top) {
                Ok(s) => traces.push(s),
                Err(e) => warn!(file = %file.display(), error = %e, "failed to read trace file"),
            }
        } else {
            debug!(file = %file.display(), "ignoring file");
        }
    }

    let total_size = stats.iter().map(|s| s.file_size).sum::<u64>()
        + traces.iter().map(|t| t.file_size).sum::<u64>();

    if cli.json {
        let json = DirectoryJson {
            path: path.display().to_string(),
            shared_probes,
            stats,
            traces,
            total_size,
        };
        print_one(&json, cli, |_| {});
        return;
    }

    println!("Data directory: {}", path.display());
    println!("  Shared probes: {}", shared_probes.len());
    for p in &shared_probes {
        println!("    {:<6} {}", p.kind.as_str(), p.function);
    }
    println!("  Stat files:  {}", stats.len());
    println!("  Trace files: {}", traces.len());
    println!("  Total:       {}", human_bytes(total_size));

    if !stats.is_empty() {
        println!("\nStats:");
        println!("  {:<6} {:<32} {:>10} {:>14}", "Kind", "Function", "Calls", "Time sum");
        println!("  {}", "─".repeat(66));
        for s in &stats {
            println!(
                "  {:<6} {:<32} {:>10} {:>14}",
                s.kind.as_str(),
                s.function,
                s.calls,
                s.time_sum_ns.map(human_ns).unwrap_or_default()
            );
        }
    }

    for t in &traces {
        println!();
        print_trace(t);
    }
}

/// A trace file starts with a structured or a text session record.
fn looks_like_trace(path: &Path) -> bool {
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };
    let first = content.lines().find(|l| !l.trim().is_empty());
    first.is_some_and(|l| l.starts_with("{\"pid\"") || l.starts_with("TRACE SESSION."))
}

fn read_shared_config(path: &Path) -> Vec<SharedProbeJson> {
    #[derive(serde::Deserialize)]
    struct Persisted {
        function: String,
        kind: UprobeKind,
    }

    let parsed = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str::<Vec<Persisted>>(&s).map_err(|e| e.to_string()));
    match parsed {
        Ok(list) => list
            .into_iter()
            .map(|p| SharedProbeJson {
                function: p.function,
                kind: p.kind,
            })
            .collect(),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "failed to read shared probe config");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stat_kind_from_name() {
        assert_eq!(stat_kind(Path::new("TIME_PortalStart.txt")), Some(UprobeKind::Time));
        assert_eq!(stat_kind(Path::new("/x/HIST_palloc.txt")), Some(UprobeKind::Hist));
        assert_eq!(stat_kind(Path::new("MEM_.txt")), None);
        assert_eq!(stat_kind(Path::new("trace_file.txt_10")), None);
    }

    #[test]
    fn test_summarize_time_and_hist() {
        let dir = tempdir().unwrap();
        let time = dir.path().join("TIME_PortalRun.txt");
        fs::write(&time, "num calls: 4, time sum: 400 nanosec, avg time: 100 nanosec\n").unwrap();
        let s = summarize_stat(&time, UprobeKind::Time).unwrap();
        assert_eq!(s.function, "PortalRun");
        assert_eq!(s.calls, 4);
        assert_eq!(s.time_sum_ns, Some(400));

        let hist = dir.path().join("HIST_PortalRun.txt");
        fs::write(&hist, "time,count\n1.5,2\n20.0,3\n").unwrap();
        let s = summarize_stat(&hist, UprobeKind::Hist).unwrap();
        assert_eq!(s.calls, 5);
        assert_eq!(s.distinct_values, Some(2));
        assert_eq!(s.range, Some((1.5, 20.0)));
    }

    #[test]
    fn test_human_ns() {
        assert_eq!(human_ns(999), "999 ns");
        assert_eq!(human_ns(1_500), "1.5 us");
        assert_eq!(human_ns(2_500_000), "2.50 ms");
    }

    #[test]
    fn test_one_line_truncates() {
        assert_eq!(one_line("select\n  1", 60), "select 1");
        assert_eq!(one_line("abcdefghij", 6), "abc...");
    }
}
