use std::io;

use crate::probe::UprobeKind;

/// Error type for every user-facing operation.
#[derive(Debug)]
pub enum UprobeError {
    /// Function is not a known hook point.
    InvalidFunction(String),
    /// Probe kind string is not one of TIME, HIST, MEM.
    InvalidKind(String),
    /// Stat read through the accessor of another kind.
    KindMismatch {
        function: String,
        expected: UprobeKind,
        actual: UprobeKind,
    },
    /// No active probe, backend or session for the given key.
    NotFound(String),
    /// Probe or session is already active.
    AlreadyActive(String),
    /// Histogram range with start >= stop.
    InvalidRange { start: f64, stop: f64 },
    /// Histogram step that is not a positive number.
    InvalidStep(f64),
    /// Valid histogram grid with more buckets than the engine builds.
    GridTooLarge { buckets: usize, max: usize },
    /// Target backend does not take part in session tracing.
    PermissionDenied(String),
    /// Unknown setting or invalid value.
    InvalidSetting { name: String, reason: String },
    /// Every shared collector slot is taken.
    SharedSlotsExhausted(usize),
    /// Stat or trace file I/O failed.
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, UprobeError>;

impl std::fmt::Display for UprobeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UprobeError::InvalidFunction(name) => {
                write!(f, "can't set uprobe: unknown function {}", name)
            }
            UprobeError::InvalidKind(kind) => {
                write!(f, "invalid uprobe type {}, expected TIME, HIST or MEM", kind)
            }
            UprobeError::KindMismatch {
                function,
                expected,
                actual,
            } => write!(
                f,
                "uprobe on {} has type {}, not {}",
                function,
                actual.as_str(),
                expected.as_str()
            ),
            UprobeError::NotFound(what) => write!(f, "{} not found", what),
            UprobeError::AlreadyActive(what) => write!(f, "{} is already active", what),
            UprobeError::InvalidRange { start, stop } => {
                write!(f, "invalid range: start {} must be less than stop {}", start, stop)
            }
            UprobeError::InvalidStep(step) => {
                write!(f, "invalid step {}: must be greater than zero", step)
            }
            UprobeError::GridTooLarge { buckets, max } => write!(
                f,
                "histogram grid of {} buckets exceeds the limit of {}, use a larger step",
                buckets, max
            ),
            UprobeError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            UprobeError::InvalidSetting { name, reason } => {
                write!(f, "invalid value for {}: {}", name, reason)
            }
            UprobeError::SharedSlotsExhausted(capacity) => {
                write!(f, "all {} shared uprobe slots are in use", capacity)
            }
            UprobeError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for UprobeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UprobeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for UprobeError {
    fn from(e: io::Error) -> Self {
        UprobeError::Io(e)
    }
}

impl From<serde_json::Error> for UprobeError {
    fn from(e: serde_json::Error) -> Self {
        UprobeError::Io(e.into())
    }
}
