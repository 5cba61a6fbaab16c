//! Server-style settings.
//!
//! Options are addressed by name like server configuration parameters and
//! are read by the owning backend when used. In a running trace a new file
//! limit or write mode applies to the next record flush and the lock flags
//! to the next lock event; the data directory and trace file name are read
//! when a trace starts.

use std::path::{Path, PathBuf};

use crate::error::{Result, UprobeError};

pub const DEFAULT_DATA_DIR: &str = "./pg_uprobe";
pub const DEFAULT_TRACE_FILE_NAME: &str = "trace_file.txt";
/// Trace file limit in megabytes.
pub const DEFAULT_TRACE_FILE_LIMIT_MB: u64 = 16;
pub const MAX_TRACE_FILE_LIMIT_MB: u64 = 32 * 1024;

const MB: u64 = 1024 * 1024;

/// Output format of session traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// One JSON record per line.
    #[default]
    Structured,
    /// Plain text lines, cheaper to produce, not machine readable.
    Text,
}

impl WriteMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "structured" | "json" => Some(WriteMode::Structured),
            "text" => Some(WriteMode::Text),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteMode::Structured => "structured",
            WriteMode::Text => "text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory for stat dumps, trace files and the shared probe config.
    pub data_dir: PathBuf,
    /// Trace files are named `<trace_file_name>_<pid>`.
    pub trace_file_name: String,
    pub trace_file_limit_mb: u64,
    pub trace_write_mode: WriteMode,
    /// Skip buffer lock entries that never had to wait.
    pub write_only_sleep_lwlocks_stat: bool,
    /// Attach lock stats to every executor node event.
    pub trace_lwlocks_for_each_node: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            trace_file_name: DEFAULT_TRACE_FILE_NAME.to_string(),
            trace_file_limit_mb: DEFAULT_TRACE_FILE_LIMIT_MB,
            trace_write_mode: WriteMode::Structured,
            write_only_sleep_lwlocks_stat: true,
            trace_lwlocks_for_each_node: false,
        }
    }
}

impl Settings {
    /// Recognized option names.
    pub const NAMES: [&'static str; 6] = [
        "data_dir",
        "trace_file_name",
        "trace_file_limit",
        "trace_write_mode",
        "write_only_sleep_lwlocks_stat",
        "trace_lwlocks_for_each_node",
    ];

    /// Settings rooted at `data_dir`. The directory is not checked.
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn trace_file_limit_bytes(&self) -> u64 {
        self.trace_file_limit_mb * MB
    }

    /// Sets an option by name, validating the value.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "data_dir" => {
                let path = Path::new(value);
                if !path.is_dir() {
                    return Err(invalid(name, format!("{} is not a directory", value)));
                }
                self.data_dir = path.to_path_buf();
            }
            "trace_file_name" => {
                if value.is_empty() || value.contains('/') {
                    return Err(invalid(name, "must be a non-empty file name"));
                }
                self.trace_file_name = value.to_string();
            }
            "trace_file_limit" => {
                let limit: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid(name, format!("{} is not an integer", value)))?;
                if !(1..=MAX_TRACE_FILE_LIMIT_MB).contains(&limit) {
                    return Err(invalid(
                        name,
                        format!("{} is outside 1..{}", limit, MAX_TRACE_FILE_LIMIT_MB),
                    ));
                }
                self.trace_file_limit_mb = limit;
            }
            "trace_write_mode" => {
                self.trace_write_mode = WriteMode::parse(value)
                    .ok_or_else(|| invalid(name, "expected structured, json or text"))?;
            }
            "write_only_sleep_lwlocks_stat" => {
                self.write_only_sleep_lwlocks_stat = parse_bool(name, value)?;
            }
            "trace_lwlocks_for_each_node" => {
                self.trace_lwlocks_for_each_node = parse_bool(name, value)?;
            }
            _ => return Err(invalid(name, "unrecognized configuration parameter")),
        }
        Ok(())
    }

    /// Current value of an option, formatted the way `set` accepts it.
    pub fn get(&self, name: &str) -> Option<String> {
        let value = match name {
            "data_dir" => self.data_dir.display().to_string(),
            "trace_file_name" => self.trace_file_name.clone(),
            "trace_file_limit" => self.trace_file_limit_mb.to_string(),
            "trace_write_mode" => self.trace_write_mode.as_str().to_string(),
            "write_only_sleep_lwlocks_stat" => on_off(self.write_only_sleep_lwlocks_stat),
            "trace_lwlocks_for_each_node" => on_off(self.trace_lwlocks_for_each_node),
            _ => return None,
        };
        Some(value)
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> UprobeError {
    UprobeError::InvalidSetting {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(name, format!("{} is not a boolean", value))),
    }
}

fn on_off(value: bool) -> String {
    if value { "on" } else { "off" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.trace_file_name, "trace_file.txt");
        assert_eq!(s.trace_file_limit_bytes(), 16 * 1024 * 1024);
        assert_eq!(s.trace_write_mode, WriteMode::Structured);
        assert!(s.write_only_sleep_lwlocks_stat);
        assert!(!s.trace_lwlocks_for_each_node);
    }

    #[test]
    fn test_set_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let mut s = Settings::default();
        s.set("data_dir", dir.path().to_str().unwrap()).unwrap();
        s.set("trace_file_limit", "32").unwrap();
        s.set("trace_write_mode", "text").unwrap();
        s.set("write_only_sleep_lwlocks_stat", "off").unwrap();

        assert_eq!(s.data_dir, dir.path());
        assert_eq!(s.get("trace_file_limit").as_deref(), Some("32"));
        assert_eq!(s.get("trace_write_mode").as_deref(), Some("text"));
        assert_eq!(s.get("write_only_sleep_lwlocks_stat").as_deref(), Some("off"));
        for name in Settings::NAMES {
            assert!(s.get(name).is_some(), "{name}");
        }
    }

    #[test]
    fn test_json_is_alias_for_structured() {
        let mut s = Settings::default();
        s.set("trace_write_mode", "text").unwrap();
        s.set("trace_write_mode", "JSON").unwrap();
        assert_eq!(s.trace_write_mode, WriteMode::Structured);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut s = Settings::default();
        assert!(s.set("data_dir", "/definitely/not/here").is_err());
        assert!(s.set("trace_file_limit", "0").is_err());
        assert!(s.set("trace_file_limit", "32769").is_err());
        assert!(s.set("trace_file_limit", "big").is_err());
        assert!(s.set("trace_write_mode", "xml").is_err());
        assert!(s.set("trace_lwlocks_for_each_node", "maybe").is_err());
        assert!(s.set("trace_file_name", "a/b").is_err());
        assert!(matches!(
            s.set("no_such_option", "1"),
            Err(UprobeError::InvalidSetting { .. })
        ));
        assert_eq!(s.trace_file_limit_mb, DEFAULT_TRACE_FILE_LIMIT_MB);
    }
}
