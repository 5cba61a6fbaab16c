//! Interfaces to the embedding server.
//!
//! The engine never reads server internals directly. Time, allocator
//! counters and catalog lookups come through these traits so the same
//! code runs inside the server and against the in-crate fakes used by
//! tests.
//!
//! ```text
//!            ┌──────────┐
//!            │  Host    │
//!            ├──────────┤
//!  Clock ───►│ now_ns   │  monotonic durations
//!  Memory ──►│ bytes    │  net allocation per call (MEM probes)
//!  Catalog ─►│ names    │  buffer tag / wait event decoding
//!            └──────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic nanosecond clock.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Bytes currently allocated by the calling backend.
pub trait MemorySource: Send + Sync {
    fn allocated_bytes(&self) -> i64;
}

/// Name lookups used when decoding buffer tags and wait events.
pub trait Catalog: Send + Sync {
    fn tablespace_name(&self, spc_oid: u32) -> Option<String>;
    fn database_name(&self, db_oid: u32) -> Option<String>;
    fn relation(&self, db_oid: u32, rel_number: u32) -> Option<RelationInfo>;
    fn wait_event_name(&self, event: u32) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub namespace: String,
    pub name: String,
    /// Relation kind letter: `r` table, `i` index, `t` toast, ...
    pub kind: char,
}

/// Everything the engine needs from the server.
#[derive(Clone)]
pub struct Host {
    pub clock: Arc<dyn Clock>,
    pub memory: Arc<dyn MemorySource>,
    pub catalog: Arc<dyn Catalog>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::new()),
            memory: Arc::new(FixedMemory::default()),
            catalog: Arc::new(StaticCatalog::default()),
        }
    }
}

impl Host {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySource>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = catalog;
        self
    }
}

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Allocation counter moved by hand.
#[derive(Default)]
pub struct FixedMemory {
    bytes: AtomicI64,
}

impl FixedMemory {
    pub fn add(&self, delta: i64) {
        self.bytes.fetch_add(delta, Ordering::SeqCst);
    }
}

impl MemorySource for FixedMemory {
    fn allocated_bytes(&self) -> i64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// In-memory catalog filled through builder methods.
#[derive(Default, Clone)]
pub struct StaticCatalog {
    tablespaces: HashMap<u32, String>,
    databases: HashMap<u32, String>,
    relations: HashMap<(u32, u32), RelationInfo>,
    wait_events: HashMap<u32, String>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tablespace(mut self, oid: u32, name: &str) -> Self {
        self.tablespaces.insert(oid, name.to_string());
        self
    }

    pub fn with_database(mut self, oid: u32, name: &str) -> Self {
        self.databases.insert(oid, name.to_string());
        self
    }

    pub fn with_relation(
        mut self,
        db_oid: u32,
        rel_number: u32,
        namespace: &str,
        name: &str,
        kind: char,
    ) -> Self {
        self.relations.insert(
            (db_oid, rel_number),
            RelationInfo {
                namespace: namespace.to_string(),
                name: name.to_string(),
                kind,
            },
        );
        self
    }

    pub fn with_wait_event(mut self, event: u32, name: &str) -> Self {
        self.wait_events.insert(event, name.to_string());
        self
    }
}

impl Catalog for StaticCatalog {
    fn tablespace_name(&self, spc_oid: u32) -> Option<String> {
        self.tablespaces.get(&spc_oid).cloned()
    }

    fn database_name(&self, db_oid: u32) -> Option<String> {
        self.databases.get(&db_oid).cloned()
    }

    fn relation(&self, db_oid: u32, rel_number: u32) -> Option<RelationInfo> {
        self.relations.get(&(db_oid, rel_number)).cloned()
    }

    fn wait_event_name(&self, event: u32) -> Option<String> {
        self.wait_events.get(&event).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_ns(), 150);
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_static_catalog_lookups() {
        let catalog = StaticCatalog::new()
            .with_tablespace(1663, "pg_default")
            .with_database(5, "postgres")
            .with_relation(5, 16384, "public", "t", 'r')
            .with_wait_event(7, "DataFileRead");

        assert_eq!(catalog.tablespace_name(1663).as_deref(), Some("pg_default"));
        assert_eq!(catalog.database_name(5).as_deref(), Some("postgres"));
        assert_eq!(catalog.relation(5, 16384).unwrap().kind, 'r');
        assert!(catalog.relation(6, 16384).is_none());
        assert_eq!(catalog.wait_event_name(7).as_deref(), Some("DataFileRead"));
    }
}
