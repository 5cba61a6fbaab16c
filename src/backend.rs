//! One server process.
//!
//! A [`Backend`] owns everything private to a process: its attached probes,
//! the stack of open instrumented calls, the session tracer and its
//! settings. Anything visible to other processes goes through the
//! [`SharedRegion`].
//!
//! ```text
//!   server hook ──► enter/exit ──► Dispatcher ──► Registry ──► Collector
//!                                                     │          ├─ Local
//!                                                     │          └─ Shared ──► SharedRegion slot
//!   server executor events ──► SessionTracer ──► TraceWriter ──► trace file
//!   ready_for_query ──► shared probe sync, pending trace start/stop
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::dump;
use crate::error::{Result, UprobeError};
use crate::host::Host;
use crate::probe::{HookId, Locality, Probe, Registry, UprobeDescriptor, UprobeKind};
use crate::shared::{BackendSlot, SharedRegion, TraceRequest};
use crate::stats::{Collector, HistRow, LocalCollector, MemRow, StatSlot};
use crate::trace::SessionTracer;

pub use crate::shared::BackendRole;

pub struct Backend {
    pid: u32,
    host: Host,
    settings: Settings,
    region: Arc<SharedRegion>,
    control: Arc<BackendSlot>,
    registry: Registry,
    dispatcher: Dispatcher,
    tracer: SessionTracer,
    /// Shared region version the attached shared probes reflect.
    shared_version: Option<u64>,
    /// Dispatcher depth at each open subtransaction.
    subxact_marks: Vec<usize>,
}

impl Backend {
    /// Client backend with the default host.
    pub fn new(pid: u32, region: Arc<SharedRegion>, settings: Settings) -> Result<Self> {
        Self::with_role(pid, BackendRole::Client, region, settings)
    }

    pub fn with_role(pid: u32, role: BackendRole, region: Arc<SharedRegion>, settings: Settings) -> Result<Self> {
        let control = region.register_backend(pid, role)?;
        let host = Host::default();
        let mut backend = Self {
            pid,
            tracer: SessionTracer::new(pid, host.clock.clone(), host.catalog.clone()),
            host,
            settings,
            region,
            control,
            registry: Registry::new(),
            dispatcher: Dispatcher::new(),
            shared_version: None,
            subxact_marks: Vec::new(),
        };
        backend.sync_shared();
        Ok(backend)
    }

    /// Replaces the host interfaces. Call before tracing starts.
    pub fn with_host(mut self, host: Host) -> Self {
        self.tracer = SessionTracer::new(self.pid, host.clock.clone(), host.catalog.clone());
        self.host = host;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Changes a setting for this backend. A running trace picks it up
    /// from its next record or event.
    pub fn set_setting(&mut self, name: &str, value: &str) -> Result<()> {
        self.settings.set(name, value)?;
        self.tracer.apply_settings(&self.settings);
        Ok(())
    }

    pub fn tracer(&mut self) -> &mut SessionTracer {
        &mut self.tracer
    }

    // ---------------------------------------------------------------------
    // Probe management
    // ---------------------------------------------------------------------

    pub fn set_uprobe(&mut self, function: &str, kind: &str, shared: bool) -> Result<()> {
        let hook = HookId::resolve(function)
            .ok_or_else(|| UprobeError::InvalidFunction(function.to_string()))?;
        let kind = UprobeKind::parse(kind)?;
        self.sync_shared();
        if self.registry.get(hook).is_some() {
            return Err(UprobeError::AlreadyActive(format!("uprobe on {}", function)));
        }

        let (locality, collector): (Locality, Box<dyn Collector>) = if shared {
            (Locality::Shared, Box::new(self.region.activate(function, kind)?))
        } else {
            (Locality::Local, Box::new(LocalCollector::new(kind)))
        };
        let descriptor = UprobeDescriptor {
            function: function.to_string(),
            kind,
            locality,
        };
        self.registry.insert(hook, Probe::new(descriptor, collector))?;
        info!(pid = self.pid, function, kind = kind.as_str(), shared, "uprobe set");
        Ok(())
    }

    /// Removes a probe. With `persist` the stat is dumped first; without it
    /// the stat file written during this activation, if any, is removed.
    pub fn delete_uprobe(&mut self, function: &str, persist: bool) -> Result<()> {
        let hook = self.active_hook(function)?;
        let data_dir = self.settings.data_dir.clone();
        let Some(probe) = self.registry.get(hook) else {
            return Err(not_found(function));
        };
        if persist {
            dump::write_stat(&data_dir, function, &probe.collector.snapshot())?;
        }

        let dumped = if probe.descriptor.is_shared() {
            let shared = self.region.deactivate(function)?;
            self.registry.remove(hook);
            shared.dumped
        } else {
            // a shared probe it shadowed gets attached at the next sync
            self.shared_version = None;
            self.registry.remove(hook).and_then(|p| p.dumped)
        };
        if !persist && let Some(path) = dumped {
            if let Err(e) = dump::remove_stat_file(&path) {
                warn!(error = %e, path = %path.display(), "failed to remove stat file");
            }
        }
        info!(pid = self.pid, function, persist, "uprobe deleted");
        Ok(())
    }

    pub fn dump_uprobe_stat(&mut self, function: &str, clear: bool) -> Result<PathBuf> {
        let hook = self.active_hook(function)?;
        let data_dir = self.settings.data_dir.clone();
        let Some(probe) = self.registry.get_mut(hook) else {
            return Err(not_found(function));
        };
        let path = dump::dump(probe.collector.as_mut(), function, &data_dir, clear)?;
        if probe.descriptor.is_shared() {
            self.region.mark_dumped(function, path.clone());
        } else {
            probe.dumped = Some(path.clone());
        }
        debug!(pid = self.pid, function, clear, path = %path.display(), "uprobe stat dumped");
        Ok(path)
    }

    /// Probes attached in this backend: its local ones and every shared one.
    /// A function has at most one entry, so a shared probe shadowed here by a
    /// local probe on the same function is listed as the local one, although
    /// it stays active in every other backend.
    pub fn list_uprobes(&mut self) -> Vec<UprobeDescriptor> {
        self.sync_shared();
        self.registry.descriptors()
    }

    // ---------------------------------------------------------------------
    // Stat accessors
    // ---------------------------------------------------------------------

    pub fn stat_time_uprobe(&mut self, function: &str) -> Result<String> {
        match self.stat_of(function)? {
            StatSlot::Time(t) => Ok(t.text()),
            other => Err(mismatch(function, UprobeKind::Time, other.kind())),
        }
    }

    /// Four buckets over the observed range.
    pub fn stat_hist_uprobe(&mut self, function: &str) -> Result<Vec<HistRow>> {
        match self.stat_of(function)? {
            StatSlot::Hist(h) => Ok(h.default_rows()),
            other => Err(mismatch(function, UprobeKind::Hist, other.kind())),
        }
    }

    /// Buckets of `step` microseconds from `start` to `stop`. Grids of more
    /// than [`MAX_GRID_BUCKETS`](crate::stats::hist::MAX_GRID_BUCKETS)
    /// buckets fail with `GridTooLarge`.
    pub fn stat_hist_uprobe_range(&mut self, function: &str, start: f64, stop: f64, step: f64) -> Result<Vec<HistRow>> {
        match self.stat_of(function)? {
            StatSlot::Hist(h) => h.grid_rows(start, stop, step),
            other => Err(mismatch(function, UprobeKind::Hist, other.kind())),
        }
    }

    pub fn stat_mem_uprobe(&mut self, function: &str) -> Result<Vec<MemRow>> {
        match self.stat_of(function)? {
            StatSlot::Mem(m) => Ok(m.rows()),
            other => Err(mismatch(function, UprobeKind::Mem, other.kind())),
        }
    }

    fn stat_of(&mut self, function: &str) -> Result<StatSlot> {
        let hook = self.active_hook(function)?;
        self.registry
            .get(hook)
            .map(|p| p.collector.snapshot())
            .ok_or_else(|| not_found(function))
    }

    fn active_hook(&mut self, function: &str) -> Result<HookId> {
        let hook = HookId::resolve(function).ok_or_else(|| not_found(function))?;
        self.sync_shared();
        if self.registry.get(hook).is_none() {
            return Err(not_found(function));
        }
        Ok(hook)
    }

    /// Re-attaches shared probes when the shared set changed since the last
    /// look. A local probe on the same function keeps precedence here.
    fn sync_shared(&mut self) {
        let version = self.region.version();
        if self.shared_version == Some(version) {
            return;
        }
        self.shared_version = Some(version);

        let stale: Vec<HookId> = self
            .registry
            .iter()
            .filter(|(_, p)| p.descriptor.is_shared())
            .map(|(hook, _)| hook)
            .collect();
        for hook in stale {
            self.registry.remove(hook);
        }

        for shared in self.region.probes() {
            let Some(hook) = HookId::resolve(&shared.function) else {
                continue;
            };
            if self.registry.get(hook).is_some() {
                debug!(pid = self.pid, function = %shared.function, "local uprobe shadows shared one");
                continue;
            }
            let probe = Probe::new(
                UprobeDescriptor {
                    function: shared.function.clone(),
                    kind: shared.kind,
                    locality: Locality::Shared,
                },
                Box::new(self.region.collector(&shared)),
            );
            if let Err(e) = self.registry.insert(hook, probe) {
                warn!(error = %e, "failed to attach shared uprobe");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Call interception
    // ---------------------------------------------------------------------

    /// Entry of a hook point. A no-op unless a probe is attached.
    #[inline]
    pub fn enter(&mut self, hook: HookId) {
        let Some(kind) = self.registry.kind_of(hook) else {
            return;
        };
        let memory = &self.host.memory;
        self.dispatcher
            .enter(hook, kind, self.host.clock.now_ns(), || memory.allocated_bytes());
    }

    #[inline]
    pub fn exit(&mut self, hook: HookId) {
        if self.dispatcher.depth() == 0 {
            return;
        }
        let memory = &self.host.memory;
        if let Some(sample) = self
            .dispatcher
            .exit(hook, self.host.clock.now_ns(), || memory.allocated_bytes())
        {
            self.registry.record(hook, sample);
        }
    }

    /// Runs `f` as one call of `hook`.
    pub fn instrument<R>(&mut self, hook: HookId, f: impl FnOnce(&mut Self) -> R) -> R {
        self.enter(hook);
        let result = f(self);
        self.exit(hook);
        result
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    pub fn begin_subtransaction(&mut self) {
        self.subxact_marks.push(self.dispatcher.depth());
        self.tracer.begin_subtransaction();
    }

    pub fn commit_subtransaction(&mut self) {
        self.subxact_marks.pop();
        self.tracer.commit_subtransaction();
    }

    /// Drops the calls unwound by the error and truncates the traced
    /// queries opened inside the subtransaction.
    pub fn abort_subtransaction(&mut self) {
        let mark = self.subxact_marks.pop().unwrap_or(0);
        let dropped = self.dispatcher.abort_to(mark);
        if dropped > 0 {
            debug!(pid = self.pid, dropped, "dropped unwound calls");
        }
        if let Err(e) = self.tracer.abort_subtransaction() {
            warn!(pid = self.pid, error = %e, "failed to record aborted subtransaction");
        }
    }

    pub fn abort_transaction(&mut self) {
        self.subxact_marks.clear();
        let dropped = self.dispatcher.abort_to(0);
        if dropped > 0 {
            debug!(pid = self.pid, dropped, "dropped unwound calls");
        }
        if let Err(e) = self.tracer.abort_transaction() {
            warn!(pid = self.pid, error = %e, "failed to record aborted transaction");
        }
    }

    // ---------------------------------------------------------------------
    // Session tracing
    // ---------------------------------------------------------------------

    /// Starts tracing this backend, or asks backend `pid` to start at its
    /// next safe point.
    pub fn start_session_trace(&mut self, pid: Option<u32>) -> Result<()> {
        match pid {
            Some(pid) if pid != self.pid => {
                self.region.backend(pid)?.request_start()?;
                info!(pid = self.pid, target = pid, "session trace start requested");
                Ok(())
            }
            _ => self.start_local(),
        }
    }

    /// Stops tracing this backend, or asks backend `pid` to stop at its
    /// next safe point.
    pub fn stop_session_trace(&mut self, pid: Option<u32>) -> Result<()> {
        match pid {
            Some(pid) if pid != self.pid => {
                self.region.backend(pid)?.request_stop()?;
                info!(pid = self.pid, target = pid, "session trace stop requested");
                Ok(())
            }
            _ => self.stop_local(),
        }
    }

    fn start_local(&mut self) -> Result<()> {
        if self.control.role != BackendRole::Client {
            return Err(UprobeError::PermissionDenied(format!(
                "process {} does not take part in session tracing",
                self.pid
            )));
        }
        self.tracer.start(&self.settings)?;
        self.control.set_tracing(true);
        Ok(())
    }

    fn stop_local(&mut self) -> Result<()> {
        let result = self.tracer.stop();
        self.control.set_tracing(self.tracer.is_tracing());
        result
    }

    /// Safe point between statements: picks up shared probe changes and
    /// trace requests from other backends.
    pub fn ready_for_query(&mut self) {
        self.sync_shared();
        let result = match self.control.take_request() {
            Some(TraceRequest::Start) => self.start_local(),
            Some(TraceRequest::Stop) => self.stop_local(),
            None => Ok(()),
        };
        if let Err(e) = result {
            warn!(pid = self.pid, error = %e, "failed to handle session trace request");
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if self.tracer.is_tracing()
            && let Err(e) = self.stop_local()
        {
            warn!(pid = self.pid, error = %e, "failed to write session trace on exit");
        }
        self.region.unregister_backend(self.pid);
    }
}

fn not_found(function: &str) -> UprobeError {
    UprobeError::NotFound(format!("uprobe on {}", function))
}

fn mismatch(function: &str, expected: UprobeKind, actual: UprobeKind) -> UprobeError {
    UprobeError::KindMismatch {
        function: function.to_string(),
        expected,
        actual,
    }
}
