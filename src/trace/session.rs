//! Session tracer.
//!
//! ```text
//!            start()                      stop()
//!   Idle ───────────────► Tracing ───────────────► Idle
//!                           │  query_start / query_end
//!                           ▼
//!                  frames (arena, parent by index)
//!                  [0] select f()          ◄── top level
//!                  [1]   select ... (f)    ◄── nested, parent 0
//! ```
//!
//! Every executor run opens a frame. A frame closed while another one is
//! open becomes a nested query event of its parent; an outermost frame is
//! appended to the session's query list. Aborts close frames from the
//! innermost outwards and mark them truncated.
//!
//! Completed queries stay in memory until stop. When they grow past
//! [`FLUSH_THRESHOLD`] they are written early as a partial record. The
//! execution events of one frame are capped at [`MAX_FRAME_EVENT_BYTES`];
//! later events are only counted, so a single long query cannot grow a
//! record without bound. A record that fails to write stays buffered.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use serde::Serialize;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{Result, UprobeError};
use crate::fmt;
use crate::host::{Catalog, Clock};
use crate::trace::buffer_tag::BufferTag;
use crate::trace::lwlock::{LockMode, LockScope};
use crate::trace::model::{
    ExecutionEvent, Explain, ExprNodeStat, LWLockStat, NodeEvent, NodeTraceData, QueryTrace,
    SessionRecord,
};
use crate::trace::plan::{ExecutionPlan, NodeId};
use crate::trace::wait_events::WaitEvents;
use crate::trace::writer::TraceWriter;

/// Buffered bytes of completed queries that trigger a partial flush.
pub const FLUSH_THRESHOLD: usize = 256 * 1024;

/// Encoded size of the execution events kept per frame.
pub const MAX_FRAME_EVENT_BYTES: usize = 256 * 1024;

pub type FrameId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseKind {
    Parsing,
    Planning,
}

struct Phase {
    kind: PhaseKind,
    started_ns: u64,
    locks: LockScope,
}

/// Parsing and planning results waiting for the executor run they belong to.
#[derive(Default)]
struct Prelude {
    parsing: Option<(u64, LockScope)>,
    planning: Option<(u64, LockScope)>,
}

struct OpenNode {
    id: NodeId,
    started_ns: u64,
    locks: Option<LockScope>,
}

struct Frame {
    parent: Option<FrameId>,
    subxact_depth: u32,
    started_ns: u64,
    execution_start: String,
    prelude: Prelude,
    plan: ExecutionPlan,
    /// Node type and explain properties per node id.
    nodes: Vec<(String, serde_json::Value)>,
    node_stats: Vec<NodeTraceData>,
    open_nodes: Vec<OpenNode>,
    expr_stats: BTreeMap<String, NodeTraceData>,
    open_exprs: Vec<(String, u64)>,
    events: Vec<ExecutionEvent>,
    events_bytes: usize,
    events_dropped: u64,
    portal_depth: u32,
    locks_inside: LockScope,
    locks_outside: LockScope,
    waits: WaitEvents,
}

struct Session {
    writer: TraceWriter,
    only_sleeps: bool,
    per_node_locks: bool,
    queries: Vec<QueryTrace>,
    buffered: usize,
    frames: Vec<Frame>,
    current: Option<FrameId>,
    prelude: Prelude,
    phase: Option<Phase>,
    wait: Option<(u32, u64)>,
    subxact_depth: u32,
}

pub struct SessionTracer {
    pid: u32,
    clock: Arc<dyn Clock>,
    catalog: Arc<dyn Catalog>,
    session: Option<Session>,
}

impl SessionTracer {
    pub fn new(pid: u32, clock: Arc<dyn Clock>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            pid,
            clock,
            catalog,
            session: None,
        }
    }

    pub fn is_tracing(&self) -> bool {
        self.session.is_some()
    }

    /// Number of currently open executor frames.
    pub fn open_frames(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.frames.len())
    }

    /// Completed queries not yet written out.
    pub fn buffered_queries(&self) -> &[QueryTrace] {
        self.session
            .as_ref()
            .map(|s| s.queries.as_slice())
            .unwrap_or_default()
    }

    /// Applies changed settings to a running trace: size limit and write mode
    /// from the next record, the lock flags from the next event. The data
    /// directory and file name are read at the next start.
    pub fn apply_settings(&mut self, settings: &Settings) {
        if let Some(s) = self.session.as_mut() {
            s.writer.apply_settings(settings);
            s.only_sleeps = settings.write_only_sleep_lwlocks_stat;
            s.per_node_locks = settings.trace_lwlocks_for_each_node;
        }
    }

    pub fn start(&mut self, settings: &Settings) -> Result<()> {
        if self.session.is_some() {
            return Err(UprobeError::AlreadyActive(format!(
                "session trace for pid {}",
                self.pid
            )));
        }
        let writer = TraceWriter::open(settings, self.pid)?;
        info!(
            pid = self.pid,
            path = %writer.path().display(),
            mode = writer.mode().as_str(),
            "session trace started"
        );
        self.session = Some(Session {
            writer,
            only_sleeps: settings.write_only_sleep_lwlocks_stat,
            per_node_locks: settings.trace_lwlocks_for_each_node,
            queries: Vec::new(),
            buffered: 0,
            frames: Vec::new(),
            current: None,
            prelude: Prelude::default(),
            phase: None,
            wait: None,
            subxact_depth: 0,
        });
        Ok(())
    }

    /// Writes the session and returns to idle. Frames still open belong to
    /// the statement that stopped the trace and are not recorded. If the
    /// write fails the session keeps tracing with its queries.
    pub fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(UprobeError::NotFound(format!(
                "session trace for pid {}",
                self.pid
            )));
        };
        let record = SessionRecord {
            pid: self.pid,
            queries: std::mem::take(&mut session.queries),
            partial: false,
        };
        let queries = record.queries.len();
        if let Err(e) = session.writer.write_session(&record) {
            session.queries = record.queries;
            warn!(pid = self.pid, queries, error = %e, "session trace not written, still tracing");
            return Err(e);
        }
        if !session.frames.is_empty() {
            debug!(pid = self.pid, open = session.frames.len(), "dropping frames of the stopping statement");
        }
        let path = session.writer.path();
        self.session = None;
        info!(pid = self.pid, queries, path = %path.display(), "session trace stopped");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Parsing and planning
    // ---------------------------------------------------------------------

    pub fn parse_start(&mut self) {
        self.phase_start(PhaseKind::Parsing);
    }

    pub fn parse_end(&mut self) {
        self.phase_end(PhaseKind::Parsing);
    }

    pub fn plan_start(&mut self) {
        self.phase_start(PhaseKind::Planning);
    }

    pub fn plan_end(&mut self) {
        self.phase_end(PhaseKind::Planning);
    }

    fn phase_start(&mut self, kind: PhaseKind) {
        let now = self.clock.now_ns();
        let Some(s) = self.session.as_mut() else {
            return;
        };
        s.phase = Some(Phase {
            kind,
            started_ns: now,
            locks: LockScope::default(),
        });
    }

    fn phase_end(&mut self, kind: PhaseKind) {
        let now = self.clock.now_ns();
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let Some(phase) = s.phase.take_if(|p| p.kind == kind) else {
            return;
        };
        let result = Some((now.saturating_sub(phase.started_ns), phase.locks));
        match kind {
            PhaseKind::Parsing => {
                // a new statement starts with parsing; stale planning data is dropped
                s.prelude = Prelude {
                    parsing: result,
                    planning: None,
                };
            }
            PhaseKind::Planning => s.prelude.planning = result,
        }
    }

    // ---------------------------------------------------------------------
    // Executor runs
    // ---------------------------------------------------------------------

    /// Opens a frame for an executor run, nested in the current one if any.
    pub fn query_start(&mut self, plan: &ExecutionPlan) {
        let now = self.clock.now_ns();
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let nodes: Vec<(String, serde_json::Value)> = plan
            .root
            .preorder()
            .into_iter()
            .map(|n| (n.node_type.clone(), n.explain_node()))
            .collect();
        let frame = Frame {
            parent: s.current,
            subxact_depth: s.subxact_depth,
            started_ns: now,
            execution_start: fmt::execution_start(&chrono::Local::now()),
            prelude: std::mem::take(&mut s.prelude),
            plan: plan.clone(),
            node_stats: vec![NodeTraceData::default(); nodes.len()],
            nodes,
            open_nodes: Vec::new(),
            expr_stats: BTreeMap::new(),
            open_exprs: Vec::new(),
            events: Vec::new(),
            events_bytes: 0,
            events_dropped: 0,
            portal_depth: 0,
            locks_inside: LockScope::default(),
            locks_outside: LockScope::default(),
            waits: WaitEvents::default(),
        };
        s.frames.push(frame);
        s.current = Some(s.frames.len() - 1);
    }

    /// Closes the innermost frame. Ignored when no frame is open, e.g. for a
    /// run that began before tracing started.
    pub fn query_end(&mut self) -> Result<()> {
        self.close_current(false)?;
        Ok(())
    }

    pub fn portal_run_start(&mut self) {
        if let Some(frame) = self.current_frame() {
            frame.portal_depth += 1;
        }
    }

    pub fn portal_run_end(&mut self) {
        if let Some(frame) = self.current_frame() {
            frame.portal_depth = frame.portal_depth.saturating_sub(1);
        }
    }

    pub fn node_start(&mut self, id: NodeId) {
        let now = self.clock.now_ns();
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let per_node_locks = s.per_node_locks;
        let Some(frame) = s.current.map(|i| &mut s.frames[i]) else {
            return;
        };
        if id >= frame.nodes.len() {
            return;
        }
        frame.open_nodes.push(OpenNode {
            id,
            started_ns: now,
            locks: per_node_locks.then(LockScope::default),
        });
    }

    pub fn node_end(&mut self, id: NodeId) {
        let now = self.clock.now_ns();
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let only_sleeps = s.only_sleeps;
        let Some(frame) = s.current.map(|i| &mut s.frames[i]) else {
            return;
        };
        let Some(pos) = frame.open_nodes.iter().rposition(|n| n.id == id) else {
            return;
        };
        let Some(node) = frame.open_nodes.drain(pos..).next() else {
            return;
        };
        let elapsed = now.saturating_sub(node.started_ns);
        frame.node_stats[id].record(elapsed);

        let lwlock_stat = node.locks.and_then(|scope| {
            frame.locks_inside.merge(&scope);
            scope.to_stats(self.catalog.as_ref(), only_sleeps)
        });
        frame.push_event(|f| {
            let (node_type, explain) = &f.nodes[id];
            ExecutionEvent::Node(NodeEvent {
                node: node_type.clone(),
                explain: Some(explain.clone()),
                execute_time: elapsed,
                lwlock_stat,
            })
        });
    }

    /// Start of an expression evaluation inside the current executor run.
    pub fn expr_start(&mut self, expr: &str) {
        let now = self.clock.now_ns();
        if let Some(frame) = self.current_frame() {
            frame.open_exprs.push((expr.to_string(), now));
        }
    }

    pub fn expr_end(&mut self, expr: &str) {
        let now = self.clock.now_ns();
        let Some(frame) = self.current_frame() else {
            return;
        };
        let Some(pos) = frame.open_exprs.iter().rposition(|(name, _)| name == expr) else {
            return;
        };
        let Some((name, started)) = frame.open_exprs.drain(pos..).next() else {
            return;
        };
        let elapsed = now.saturating_sub(started);
        frame.expr_stats.entry(name.clone()).or_default().record(elapsed);
        frame.push_event(|_| {
            ExecutionEvent::Node(NodeEvent {
                node: name,
                explain: None,
                execute_time: elapsed,
                lwlock_stat: None,
            })
        });
    }

    // ---------------------------------------------------------------------
    // Locks and waits
    // ---------------------------------------------------------------------

    /// Counts a buffer content lock acquisition. `sleep_ns` is the time spent
    /// waiting for it, zero when it was granted at once.
    pub fn lwlock_acquired(&mut self, tag: BufferTag, mode: LockMode, sleep_ns: u64) {
        if let Some(scope) = self.session.as_mut().and_then(Session::lock_scope) {
            scope.record(tag, mode, sleep_ns);
        }
    }

    pub fn wait_start(&mut self, event: u32) {
        let now = self.clock.now_ns();
        if let Some(s) = self.session.as_mut() {
            s.wait = Some((event, now));
        }
    }

    pub fn wait_end(&mut self) {
        let now = self.clock.now_ns();
        let Some(s) = self.session.as_mut() else {
            return;
        };
        let Some((event, started)) = s.wait.take() else {
            return;
        };
        if let Some(i) = s.current {
            s.frames[i].waits.record(event, now.saturating_sub(started));
        }
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    pub fn begin_subtransaction(&mut self) {
        if let Some(s) = self.session.as_mut() {
            s.subxact_depth += 1;
        }
    }

    pub fn commit_subtransaction(&mut self) {
        if let Some(s) = self.session.as_mut() {
            s.subxact_depth = s.subxact_depth.saturating_sub(1);
        }
    }

    /// Closes, as truncated, every frame opened inside the aborted
    /// subtransaction. Frames of the enclosing levels stay open.
    pub fn abort_subtransaction(&mut self) -> Result<()> {
        let Some(depth) = self.session.as_ref().map(|s| s.subxact_depth) else {
            return Ok(());
        };
        let mut closed = 0;
        while self
            .session
            .as_ref()
            .and_then(|s| s.current.map(|i| s.frames[i].subxact_depth))
            .is_some_and(|d| depth > 0 && d >= depth)
        {
            self.close_current(true)?;
            closed += 1;
        }
        if let Some(s) = self.session.as_mut() {
            s.subxact_depth = depth.saturating_sub(1);
            s.phase = None;
            s.wait = None;
        }
        if closed > 0 {
            warn!(pid = self.pid, frames = closed, "subtransaction abort truncated traced queries");
        }
        Ok(())
    }

    /// Closes every open frame as truncated.
    pub fn abort_transaction(&mut self) -> Result<()> {
        let mut closed = 0;
        while self.open_frames() > 0 {
            self.close_current(true)?;
            closed += 1;
        }
        if let Some(s) = self.session.as_mut() {
            s.subxact_depth = 0;
            s.phase = None;
            s.wait = None;
            s.prelude = Prelude::default();
        }
        if closed > 0 {
            warn!(pid = self.pid, frames = closed, "transaction abort truncated traced queries");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn current_frame(&mut self) -> Option<&mut Frame> {
        let s = self.session.as_mut()?;
        let i = s.current?;
        s.frames.get_mut(i)
    }

    /// Turns the innermost frame into a query trace and attaches it to its
    /// parent, or to the session when it is outermost.
    fn close_current(&mut self, truncated: bool) -> Result<()> {
        let now = self.clock.now_ns();
        let Some(s) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(frame) = s.frames.pop() else {
            return Ok(());
        };
        s.current = frame.parent;
        let parent = frame.parent;
        let trace = frame.finish(now, truncated, self.catalog.as_ref(), s.only_sleeps);

        match parent {
            Some(p) => s.frames[p].push_event(|_| ExecutionEvent::Query(Box::new(trace))),
            None => {
                s.buffered += encoded_len(&trace);
                s.queries.push(trace);
                if s.buffered >= FLUSH_THRESHOLD {
                    let record = SessionRecord {
                        pid: self.pid,
                        queries: std::mem::take(&mut s.queries),
                        partial: true,
                    };
                    debug!(pid = self.pid, queries = record.queries.len(), "flushing partial session record");
                    if let Err(e) = s.writer.write_session(&record) {
                        s.queries = record.queries;
                        return Err(e);
                    }
                    s.buffered = 0;
                }
            }
        }
        Ok(())
    }
}

impl Session {
    /// Scope a lock acquisition is counted in: the parsing or planning
    /// phase, else the innermost running node when per-node locks are on,
    /// else the current frame inside or outside its portal run.
    fn lock_scope(&mut self) -> Option<&mut LockScope> {
        if let Some(phase) = self.phase.as_mut() {
            return Some(&mut phase.locks);
        }
        let frame = self.frames.get_mut(self.current?)?;
        if let Some(node) = frame.open_nodes.last_mut()
            && let Some(scope) = node.locks.as_mut()
        {
            return Some(scope);
        }
        Some(if frame.portal_depth > 0 {
            &mut frame.locks_inside
        } else {
            &mut frame.locks_outside
        })
    }
}

impl Frame {
    /// Appends an execution event while the frame's events stay under
    /// [`MAX_FRAME_EVENT_BYTES`]. Past that the event is counted, not built.
    fn push_event(&mut self, make: impl FnOnce(&Frame) -> ExecutionEvent) {
        if self.events_bytes >= MAX_FRAME_EVENT_BYTES {
            self.events_dropped += 1;
            return;
        }
        let event = make(self);
        self.events_bytes += encoded_len(&event);
        self.events.push(event);
    }

    fn finish(self, now: u64, truncated: bool, catalog: &dyn Catalog, only_sleeps: bool) -> QueryTrace {
        let (parsing_time, lwlock_parsing) = split_phase(self.prelude.parsing, catalog, only_sleeps);
        let (planning_time, lwlock_planning) = split_phase(self.prelude.planning, catalog, only_sleeps);
        let executed = self.node_stats.iter().any(|s| s.total_calls > 0);
        let expr_node_stat: Vec<ExprNodeStat> = self
            .expr_stats
            .into_iter()
            .map(|(node, trace_data)| ExprNodeStat { node, trace_data })
            .collect();

        QueryTrace {
            parsing_time,
            lwlock_parsing,
            planning_time,
            lwlock_planning,
            execution_start: self.execution_start,
            explain: Explain {
                query_text: self.plan.query_text.clone(),
                plan: self.plan.root.explain(),
            },
            execution_events: self.events,
            events_dropped: self.events_dropped,
            execution_time: now.saturating_sub(self.started_ns),
            executor_node_stat_in_plan: executed
                .then(|| self.plan.root.explain_with_stats(&self.node_stats)),
            expr_node_stat: (!expr_node_stat.is_empty()).then_some(expr_node_stat),
            locks_inside_portal_run: self.locks_inside.to_stats(catalog, only_sleeps),
            locks_outside_portal_run: self.locks_outside.to_stats(catalog, only_sleeps),
            wait_event_stat: self.waits.to_stats(catalog),
            truncated,
        }
    }
}

/// Counts bytes instead of keeping them.
struct ByteCount(usize);

impl io::Write for ByteCount {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Length of the value's JSON encoding.
fn encoded_len<T: Serialize>(value: &T) -> usize {
    let mut count = ByteCount(0);
    serde_json::to_writer(&mut count, value).map_or(0, |_| count.0)
}

fn split_phase(
    phase: Option<(u64, LockScope)>,
    catalog: &dyn Catalog,
    only_sleeps: bool,
) -> (Option<u64>, Option<Vec<LWLockStat>>) {
    match phase {
        Some((ns, locks)) => (Some(ns), locks.to_stats(catalog, only_sleeps)),
        None => (None, None),
    }
}
