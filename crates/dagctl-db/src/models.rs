use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an [`Attempt`]. See the state machine in `dagctl_core::attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    None,
    Queued,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Cancelled,
    PartiallySucceeded,
}

impl AttemptStatus {
    /// Terminal statuses cannot transition to any other status except via
    /// an explicit retry (which creates a new attempt row, not a mutation
    /// of this one).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Aborted | Self::Cancelled | Self::PartiallySucceeded
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
            Self::PartiallySucceeded => "partially_succeeded",
        };
        f.write_str(s)
    }
}

impl FromStr for AttemptStatus {
    type Err = AttemptStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            "cancelled" => Ok(Self::Cancelled),
            "partially_succeeded" => Ok(Self::PartiallySucceeded),
            other => Err(AttemptStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AttemptStatus`] string.
#[derive(Debug, Clone)]
pub struct AttemptStatusParseError(pub String);

impl fmt::Display for AttemptStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid attempt status: {:?}", self.0)
    }
}

impl std::error::Error for AttemptStatusParseError {}

// ---------------------------------------------------------------------------

/// Dispatch priority class for a [`QueueEntry`]. High strictly precedes Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "low" => Ok(Self::Low),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Per-step status inside an attempt's `node_states`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A registered DAG definition. `yaml_source` is the immutable source
/// snapshotted into each attempt at enqueue time; this row is the
/// "current" definition used to validate new enqueues and resolve
/// `maxActiveRuns`/precondition checks at admission time.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DagDef {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub queue_name: String,
    /// 0 means unlimited, per the spec's documented resolution of the
    /// upstream ambiguity around `maxActiveRuns = 0`.
    pub max_active_runs: i32,
    pub max_active_steps: i32,
    pub worker_selector: serde_json::Value,
    pub yaml_source: String,
    pub created_at: DateTime<Utc>,
}

/// A single run attempt. `(dag_name, run_id)` is the `RunRef`; `attempt_number`
/// increments only when an attempt is retried from a terminal state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub dag_namespace: String,
    pub dag_name: String,
    pub run_id: String,
    pub attempt_number: i32,
    pub parent_dag_name: Option<String>,
    pub parent_run_id: Option<String>,
    pub root_dag_name: Option<String>,
    pub root_run_id: Option<String>,
    pub status: AttemptStatus,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub params: serde_json::Value,
    pub node_states: serde_json::Value,
    pub log_dir: String,
    pub yaml_data: String,
    pub created_at: DateTime<Utc>,
}

/// One append-only entry in an attempt's status history.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AttemptHistoryEntry {
    pub id: i64,
    pub attempt_id: Uuid,
    pub status: AttemptStatus,
    pub recorded_at: DateTime<Utc>,
}

/// A queued, not-yet-dispatched run. Exists iff the corresponding
/// attempt's status is `Queued`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub queue_name: String,
    pub dag_name: String,
    pub run_id: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

/// A step's recorded state inside an attempt's `node_states` JSON column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub step_name: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_status_display_and_parse_roundtrip() {
        for s in [
            AttemptStatus::None,
            AttemptStatus::Queued,
            AttemptStatus::Running,
            AttemptStatus::Succeeded,
            AttemptStatus::Failed,
            AttemptStatus::Aborted,
            AttemptStatus::Cancelled,
            AttemptStatus::PartiallySucceeded,
        ] {
            let parsed: AttemptStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn attempt_status_invalid_string_errors() {
        assert!("bogus".parse::<AttemptStatus>().is_err());
    }

    #[test]
    fn attempt_status_terminal_classification() {
        assert!(!AttemptStatus::None.is_terminal());
        assert!(!AttemptStatus::Queued.is_terminal());
        assert!(!AttemptStatus::Running.is_terminal());
        assert!(AttemptStatus::Succeeded.is_terminal());
        assert!(AttemptStatus::Failed.is_terminal());
        assert!(AttemptStatus::Aborted.is_terminal());
        assert!(AttemptStatus::Cancelled.is_terminal());
        assert!(AttemptStatus::PartiallySucceeded.is_terminal());
    }

    #[test]
    fn priority_display_and_parse_roundtrip() {
        for p in [Priority::High, Priority::Low] {
            let parsed: Priority = p.to_string().parse().unwrap();
            assert_eq!(parsed, p);
        }
    }

    #[test]
    fn priority_invalid_string_errors() {
        assert!("medium".parse::<Priority>().is_err());
    }
}
