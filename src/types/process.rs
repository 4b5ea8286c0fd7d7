use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subprocess lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Error,
}

impl Lifecycle {
    /// States in which an OS process exists, i.e. `pid` must be set.
    pub fn has_process(&self) -> bool {
        matches!(self, Lifecycle::Starting | Lifecycle::Running | Lifecycle::Stopping)
    }
}

/// Observable state of a supervised stdio subprocess.
///
/// Invariant: `pid.is_some()` iff the lifecycle is `starting`, `running`
/// or `stopping`. `restart_count` only ever grows; removal deletes the
/// whole record rather than resetting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Last captured stderr lines, newest last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_tail: Vec<String>,
}

impl ProcessState {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            pid: None,
            lifecycle: Lifecycle::Stopped,
            started_at: None,
            stopped_at: None,
            restart_count: 0,
            last_error: None,
            output_tail: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Lifecycle::Running).unwrap(), "\"running\"");
        assert_eq!(serde_json::to_string(&Lifecycle::Error).unwrap(), "\"error\"");
    }

    #[test]
    fn has_process_states() {
        assert!(Lifecycle::Starting.has_process());
        assert!(Lifecycle::Running.has_process());
        assert!(Lifecycle::Stopping.has_process());
        assert!(!Lifecycle::Stopped.has_process());
        assert!(!Lifecycle::Restarting.has_process());
        assert!(!Lifecycle::Error.has_process());
    }
}
