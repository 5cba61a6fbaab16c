//! pg-uprobe - in-process instrumentation engine for a database server.
//!
//! Provides:
//! - `probe` - closed table of hookable functions, probe descriptors, per-backend registry
//! - `stats` - TIME/HIST/MEM collectors and the histogram engine
//! - `shared` - cross-backend region: shared collector slots, shared probe config, backend table
//! - `dispatch` - call interception with flat per-call accounting
//! - `dump` - stat file persistence
//! - `trace` - nested session tracing, lock/wait accounting, trace file writer
//! - `backend` - one server process; the entry point for every user-facing operation
//! - `config` - server-style settings
//! - `host` - traits the embedding server implements (clock, memory, catalog)
//! - `fmt` - shared formatting helpers

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod dump;
pub mod error;
pub mod fmt;
pub mod host;
pub mod probe;
pub mod shared;
pub mod stats;
pub mod trace;

pub use backend::{Backend, BackendRole};
pub use config::{Settings, WriteMode};
pub use error::{Result, UprobeError};
pub use probe::{HookId, Locality, UprobeDescriptor, UprobeKind};
pub use shared::SharedRegion;
