//! Per-source checkpoints and the append-only run audit trail.

use crate::window::Window;
use anyhow::Result;
use serde::Serialize;

/// Last fully covered timestamp, plus the newest parent seen at that point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub at: i64,
    pub cursor: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "partial" => Some(RunStatus::Partial),
            _ => None,
        }
    }
}

/// Open run; closed by `record_run_result`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: String,
    pub source: String,
    pub window: Window,
    pub started_at: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub actors: u64,
    pub parents: u64,
    pub children: u64,
    pub aggregates: u64,
    pub errors: u64,
}

/// One row of the audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunAudit {
    pub run_id: String,
    pub source: String,
    pub window: Window,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub started_at: i64,
    pub finished_at: i64,
}

pub trait CheckpointStore: Send + Sync {
    /// Create the source row if missing.
    fn ensure_source(&self, source: &str) -> Result<()>;
    fn checkpoint(&self, source: &str) -> Result<Option<Checkpoint>>;
    fn record_run_start(&self, source: &str, window: Window) -> Result<RunHandle>;
    /// Append the audit row. Rows are never updated afterwards.
    fn record_run_result(&self, handle: &RunHandle, status: RunStatus, counts: RunCounts) -> Result<()>;
    /// Move the checkpoint forward. Returns false, leaving it untouched, when `cp` is older
    /// than the stored one.
    fn advance_checkpoint(&self, source: &str, cp: &Checkpoint) -> Result<bool>;
    /// Audit rows for `source`, oldest first.
    fn run_history(&self, source: &str) -> Result<Vec<RunAudit>>;
}
