//! Hook points and probe descriptors.
//!
//! The set of functions a probe can be attached to is closed and compiled
//! in: [`HOOK_POINTS`]. Names are resolved to a [`HookId`] once, at the
//! interface boundary, and everything below works with the index.

mod registry;

pub use registry::{Probe, Registry};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UprobeError};

/// Server functions that can carry a probe.
pub const HOOK_POINTS: &[&str] = &[
    // query lifecycle
    "exec_simple_query",
    "pg_parse_query",
    "parse_analyze_fixedparams",
    "pg_analyze_and_rewrite_fixedparams",
    "pg_plan_query",
    "planner",
    "standard_planner",
    "PortalStart",
    "PortalRun",
    "PortalDrop",
    "ExecutorStart",
    "standard_ExecutorStart",
    "ExecutorRun",
    "standard_ExecutorRun",
    "ExecutorFinish",
    "ExecutorEnd",
    "ExecInitNode",
    "ExecProcNode",
    "ExecEndNode",
    "ProcessUtility",
    "standard_ProcessUtility",
    "SPI_execute",
    "SPI_execute_plan",
    "fmgr_sql",
    "plpgsql_exec_function",
    // transactions and WAL
    "StartTransactionCommand",
    "CommitTransactionCommand",
    "AbortCurrentTransaction",
    "XLogInsert",
    "XLogFlush",
    // locks and waits
    "LWLockAcquire",
    "LWLockRelease",
    "LockAcquire",
    "LockRelease",
    "WaitEventSetWait",
    // buffers and access methods
    "ReadBuffer_common",
    "ReadBufferExtended",
    "heap_insert",
    "heap_update",
    "heap_delete",
    "heap_getnext",
    "index_getnext_tid",
    "btinsert",
    // memory
    "palloc",
    "palloc0",
    "pfree",
    "MemoryContextAlloc",
    "AllocSetAlloc",
    "AllocSetFree",
];

/// Index into [`HOOK_POINTS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u16);

impl HookId {
    pub fn resolve(name: &str) -> Option<Self> {
        HOOK_POINTS
            .iter()
            .position(|&hook| hook == name)
            .map(|i| HookId(i as u16))
    }

    pub fn name(self) -> &'static str {
        HOOK_POINTS[self.0 as usize]
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = HookId> {
        (0..HOOK_POINTS.len()).map(|i| HookId(i as u16))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UprobeKind {
    /// Call count and total time.
    Time,
    /// Call duration distribution.
    Hist,
    /// Net memory allocated per call.
    Mem,
}

impl UprobeKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "TIME" => Ok(UprobeKind::Time),
            "HIST" => Ok(UprobeKind::Hist),
            "MEM" => Ok(UprobeKind::Mem),
            _ => Err(UprobeError::InvalidKind(value.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UprobeKind::Time => "TIME",
            UprobeKind::Hist => "HIST",
            UprobeKind::Mem => "MEM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    /// Private to one backend.
    Local,
    /// Aggregated across every backend.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UprobeDescriptor {
    pub function: String,
    pub kind: UprobeKind,
    pub locality: Locality,
}

impl UprobeDescriptor {
    pub fn is_shared(&self) -> bool {
        self.locality == Locality::Shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_round_trip() {
        for hook in HookId::all() {
            assert_eq!(HookId::resolve(hook.name()), Some(hook));
        }
        assert_eq!(HookId::resolve("PortalStart").unwrap().name(), "PortalStart");
        assert!(HookId::resolve("portalstart").is_none());
        assert!(HookId::resolve("no_such_function").is_none());
    }

    #[test]
    fn test_hook_points_are_unique() {
        let mut names: Vec<_> = HOOK_POINTS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), HOOK_POINTS.len());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(UprobeKind::parse("TIME").unwrap(), UprobeKind::Time);
        assert_eq!(UprobeKind::parse("hist").unwrap(), UprobeKind::Hist);
        assert_eq!(UprobeKind::parse("Mem").unwrap(), UprobeKind::Mem);
        assert!(matches!(
            UprobeKind::parse("COUNT"),
            Err(UprobeError::InvalidKind(k)) if k == "COUNT"
        ));
    }

    #[test]
    fn test_descriptor_serializes_kind_uppercase() {
        let d = UprobeDescriptor {
            function: "PortalStart".into(),
            kind: UprobeKind::Hist,
            locality: Locality::Shared,
        };
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(
            json,
            r#"{"function":"PortalStart","kind":"HIST","locality":"shared"}"#
        );
    }
}
