//! Append-only audit trail
//!
//! Every persisted decision (diagnosis, nudge, escalation, cycle report,
//! status change) becomes one [`AuditRecord`]. The engine writes records and
//! never reads them back.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use coordination::escalation::CycleReport;
use coordination::state::{
    Diagnosis, Escalation, EscalationStatus, Nudge, NudgeStatus,
};

/// Errors that can occur while appending audit records
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    Diagnosis {
        company_id: String,
        prompt_version: String,
        diagnosis: Diagnosis,
    },
    Nudge {
        nudge: Nudge,
    },
    Escalation {
        escalation: Escalation,
    },
    Cycle {
        report: CycleReport,
    },
    NudgeStatus {
        nudge_id: String,
        from: NudgeStatus,
        to: NudgeStatus,
        at: DateTime<Utc>,
    },
    EscalationStatus {
        escalation_id: String,
        from: EscalationStatus,
        to: EscalationStatus,
        at: DateTime<Utc>,
    },
}

impl AuditRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Diagnosis { .. } => "diagnosis",
            Self::Nudge { .. } => "nudge",
            Self::Escalation { .. } => "escalation",
            Self::Cycle { .. } => "cycle",
            Self::NudgeStatus { .. } => "nudge_status",
            Self::EscalationStatus { .. } => "escalation_status",
        }
    }
}

/// Write-only destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> SinkResult<()>;
}

/// One JSON object per line, appended to a file.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    // serializes writers so lines never interleave
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &str) -> SinkResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: AuditRecord) -> SinkResult<()> {
        let kind = record.kind();
        let line = serde_json::to_string(&record)?;
        match self.write_line(&line) {
            Ok(()) => {
                debug!(kind, path = %self.path.display(), "Appended audit record");
                Ok(())
            }
            Err(e) => {
                warn!(kind, path = %self.path.display(), "Failed to append audit record: {e}");
                Err(e)
            }
        }
    }
}

/// Keeps records in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.records().iter().filter(|r| r.kind() == kind).count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> SinkResult<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}
