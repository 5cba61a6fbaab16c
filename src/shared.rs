//! Cross-backend shared region.
//!
//! ```text
//!   ┌──────────────────────────── SharedRegion ───────────────────────────┐
//!   │ config (Mutex)          slots (Mutex each)        backends (Mutex)  │
//!   │  function -> slot  ───►  [0] gen 7  TIME           pid -> control   │
//!   │  persisted to            [1] gen 9  HIST           start/stop flag  │
//!   │  pg_uprobe_conf.json     [2] free                                   │
//!   └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Slots are allocated up front. A shared probe owns one slot for the
//! lifetime of its activation; the slot generation changes on every
//! activation so collectors held by backends that have not yet noticed a
//! deactivation stop feeding the slot.
//!
//! Lock order is config, then slot. The call path only takes a slot lock.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, UprobeError};
use crate::probe::{HookId, UprobeKind};
use crate::stats::{Collector, Sample, StatSlot};

pub const DEFAULT_SHARED_SLOTS: usize = 64;
pub const SHARED_CONFIG_FILE: &str = "pg_uprobe_conf.json";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SlotState {
    generation: u64,
    stat: StatSlot,
}

/// An active shared probe.
#[derive(Debug, Clone)]
pub struct SharedProbe {
    pub function: String,
    pub kind: UprobeKind,
    slot: usize,
    generation: u64,
    /// Stat file written by a dump during this activation.
    pub dumped: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct PersistedProbe {
    function: String,
    kind: UprobeKind,
}

struct SharedConfig {
    probes: BTreeMap<String, SharedProbe>,
    used: Vec<bool>,
}

pub struct SharedRegion {
    slots: Vec<Mutex<Option<SlotState>>>,
    config: Mutex<SharedConfig>,
    /// Bumped on every shared probe change; backends compare it at safe points.
    version: AtomicU64,
    generations: AtomicU64,
    config_path: Option<PathBuf>,
    backends: Mutex<HashMap<u32, Arc<BackendSlot>>>,
}

impl SharedRegion {
    /// Region without a persisted config.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self::build(capacity, None))
    }

    /// Region whose shared probe set is saved to and restored from
    /// `<data_dir>/pg_uprobe_conf.json`.
    pub fn open(data_dir: &Path, capacity: usize) -> Result<Arc<Self>> {
        let path = data_dir.join(SHARED_CONFIG_FILE);
        let region = Arc::new(Self::build(capacity, Some(path.clone())));

        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(region),
            Err(e) => return Err(e.into()),
        };
        let persisted: Vec<PersistedProbe> = serde_json::from_slice(&data)?;
        let mut restored = 0;
        for p in persisted {
            if HookId::resolve(&p.function).is_none() {
                warn!(function = %p.function, "skipping unknown function in shared uprobe config");
                continue;
            }
            match region.insert_probe(&p.function, p.kind) {
                Ok(_) => restored += 1,
                Err(e) => warn!(function = %p.function, error = %e, "failed to restore shared uprobe"),
            }
        }
        info!(probes = restored, path = %path.display(), "restored shared uprobes");
        Ok(region)
    }

    fn build(capacity: usize, config_path: Option<PathBuf>) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            config: Mutex::new(SharedConfig {
                probes: BTreeMap::new(),
                used: vec![false; capacity],
            }),
            version: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            config_path,
            backends: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Activates a shared probe and persists the probe set.
    pub fn activate(self: &Arc<Self>, function: &str, kind: UprobeKind) -> Result<SharedCollector> {
        let probe = self.insert_probe(function, kind)?;
        self.save_config();
        Ok(self.collector(&probe))
    }

    fn insert_probe(&self, function: &str, kind: UprobeKind) -> Result<SharedProbe> {
        let mut config = lock(&self.config);
        if config.probes.contains_key(function) {
            return Err(UprobeError::AlreadyActive(format!("shared uprobe on {}", function)));
        }
        let slot = config
            .used
            .iter()
            .position(|used| !used)
            .ok_or(UprobeError::SharedSlotsExhausted(self.capacity()))?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        *lock(&self.slots[slot]) = Some(SlotState {
            generation,
            stat: StatSlot::new(kind),
        });
        config.used[slot] = true;
        let probe = SharedProbe {
            function: function.to_string(),
            kind,
            slot,
            generation,
            dumped: None,
        };
        config.probes.insert(function.to_string(), probe.clone());
        self.version.fetch_add(1, Ordering::Release);
        debug!(function, slot, generation, "shared slot allocated");
        Ok(probe)
    }

    /// Removes a shared probe for every backend and frees its slot.
    pub fn deactivate(&self, function: &str) -> Result<SharedProbe> {
        let probe = {
            let mut config = lock(&self.config);
            let probe = config
                .probes
                .remove(function)
                .ok_or_else(|| UprobeError::NotFound(format!("shared uprobe on {}", function)))?;
            *lock(&self.slots[probe.slot]) = None;
            config.used[probe.slot] = false;
            self.version.fetch_add(1, Ordering::Release);
            probe
        };
        self.save_config();
        Ok(probe)
    }

    pub fn probes(&self) -> Vec<SharedProbe> {
        lock(&self.config).probes.values().cloned().collect()
    }

    pub fn probe(&self, function: &str) -> Option<SharedProbe> {
        lock(&self.config).probes.get(function).cloned()
    }

    pub fn collector(self: &Arc<Self>, probe: &SharedProbe) -> SharedCollector {
        SharedCollector {
            region: Arc::clone(self),
            slot: probe.slot,
            generation: probe.generation,
            kind: probe.kind,
        }
    }

    /// Remembers the stat file written for the current activation.
    pub fn mark_dumped(&self, function: &str, path: PathBuf) {
        if let Some(probe) = lock(&self.config).probes.get_mut(function) {
            probe.dumped = Some(path);
        }
    }

    fn with_slot<R>(&self, slot: usize, generation: u64, f: impl FnOnce(&mut StatSlot) -> R) -> Option<R> {
        let mut guard = lock(&self.slots[slot]);
        match guard.as_mut() {
            Some(state) if state.generation == generation => Some(f(&mut state.stat)),
            _ => None,
        }
    }

    fn save_config(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        let config = lock(&self.config);
        let persisted: Vec<PersistedProbe> = config
            .probes
            .values()
            .map(|p| PersistedProbe {
                function: p.function.clone(),
                kind: p.kind,
            })
            .collect();
        if let Err(e) = write_json(path, &persisted) {
            warn!(error = %e, path = %path.display(), "failed to save shared uprobe config");
        }
    }

    // ---------------------------------------------------------------------
    // Backend table
    // ---------------------------------------------------------------------

    pub fn register_backend(&self, pid: u32, role: BackendRole) -> Result<Arc<BackendSlot>> {
        let mut backends = lock(&self.backends);
        if backends.contains_key(&pid) {
            return Err(UprobeError::AlreadyActive(format!("backend {}", pid)));
        }
        let slot = Arc::new(BackendSlot::new(pid, role));
        backends.insert(pid, Arc::clone(&slot));
        Ok(slot)
    }

    pub fn unregister_backend(&self, pid: u32) {
        lock(&self.backends).remove(&pid);
    }

    pub fn backend(&self, pid: u32) -> Result<Arc<BackendSlot>> {
        lock(&self.backends)
            .get(&pid)
            .cloned()
            .ok_or_else(|| UprobeError::NotFound(format!("backend with pid {}", pid)))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Collector backed by a shared slot.
pub struct SharedCollector {
    region: Arc<SharedRegion>,
    slot: usize,
    generation: u64,
    kind: UprobeKind,
}

impl Collector for SharedCollector {
    fn kind(&self) -> UprobeKind {
        self.kind
    }

    fn record(&mut self, sample: Sample) {
        self.region
            .with_slot(self.slot, self.generation, |stat| stat.record(sample));
    }

    fn snapshot(&self) -> StatSlot {
        self.region
            .with_slot(self.slot, self.generation, |stat| stat.clone())
            .unwrap_or_else(|| StatSlot::new(self.kind))
    }

    fn take(&mut self) -> StatSlot {
        self.region
            .with_slot(self.slot, self.generation, StatSlot::take)
            .unwrap_or_else(|| StatSlot::new(self.kind))
    }

    fn merge(&mut self, state: StatSlot) {
        self.region
            .with_slot(self.slot, self.generation, |stat| stat.merge(state));
    }
}

// ---------------------------------------------------------------------------
// Backend control
// ---------------------------------------------------------------------------

/// How a server process takes part in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    /// Regular client backend; can be session traced.
    Client,
    /// Background or auxiliary process; probes only.
    Auxiliary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceRequest {
    Start,
    Stop,
}

#[derive(Debug, Default)]
struct Control {
    requested: Option<TraceRequest>,
    tracing: bool,
}

/// Per-backend entry other backends use to request trace start/stop.
/// The owner acts on the request at its next safe point.
#[derive(Debug)]
pub struct BackendSlot {
    pub pid: u32,
    pub role: BackendRole,
    control: Mutex<Control>,
}

impl BackendSlot {
    fn new(pid: u32, role: BackendRole) -> Self {
        Self {
            pid,
            role,
            control: Mutex::new(Control::default()),
        }
    }

    fn check_participates(&self) -> Result<()> {
        match self.role {
            BackendRole::Client => Ok(()),
            BackendRole::Auxiliary => Err(UprobeError::PermissionDenied(format!(
                "process {} does not take part in session tracing",
                self.pid
            ))),
        }
    }

    pub fn request_start(&self) -> Result<()> {
        self.check_participates()?;
        let mut control = lock(&self.control);
        if control.tracing || control.requested == Some(TraceRequest::Start) {
            return Err(UprobeError::AlreadyActive(format!(
                "session trace for pid {}",
                self.pid
            )));
        }
        control.requested = Some(TraceRequest::Start);
        Ok(())
    }

    /// Requests a stop. A start that was requested but not yet picked up
    /// is cancelled instead.
    pub fn request_stop(&self) -> Result<()> {
        self.check_participates()?;
        let mut control = lock(&self.control);
        match control.requested {
            Some(TraceRequest::Start) => control.requested = None,
            Some(TraceRequest::Stop) => {}
            None if control.tracing => control.requested = Some(TraceRequest::Stop),
            None => {
                return Err(UprobeError::NotFound(format!(
                    "session trace for pid {}",
                    self.pid
                )));
            }
        }
        Ok(())
    }

    pub fn take_request(&self) -> Option<TraceRequest> {
        lock(&self.control).requested.take()
    }

    pub fn set_tracing(&self, tracing: bool) {
        lock(&self.control).tracing = tracing;
    }

    pub fn is_tracing(&self) -> bool {
        lock(&self.control).tracing
    }
}
