//! Session tracing.
//!
//! - `session` - per-backend state machine building nested query traces
//! - `writer` - trace file output and size rotation
//! - `model` - serialized record layout
//! - `plan` - executor plan shape and per-node statistics
//! - `lwlock`, `buffer_tag` - buffer lock contention accounting
//! - `wait_events` - wait time per wait event

pub mod buffer_tag;
pub mod lwlock;
pub mod model;
pub mod plan;
pub mod session;
pub mod wait_events;
pub mod writer;

pub use buffer_tag::{BufferTag, ForkNumber};
pub use lwlock::LockMode;
pub use model::{QueryTrace, SessionRecord};
pub use plan::{ExecutionPlan, NodeId, PlanNode};
pub use session::SessionTracer;
pub use writer::TraceWriter;
