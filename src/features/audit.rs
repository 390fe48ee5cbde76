//! Append-only audit trail. Writes are best effort and never fail the
//! operation that triggered them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Created,
    Signed,
    Accepted,
    Rejected,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Created => "Created",
            AuditAction::Signed => "Signed",
            AuditAction::Accepted => "Accepted",
            AuditAction::Rejected => "Rejected",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Created" => Ok(AuditAction::Created),
            "Signed" => Ok(AuditAction::Signed),
            "Accepted" => Ok(AuditAction::Accepted),
            "Rejected" => Ok(AuditAction::Rejected),
            other => Err(format!("unknown_audit_action:{other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub document_id: String,
    pub action: AuditAction,
    pub performed_by: String,
    pub performed_at: DateTime<Utc>,
    pub details: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("audit store rejected entry: {0}")]
    Rejected(String),
    #[error("audit store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlite::Error> for AuditWriteError {
    fn from(err: sqlite::Error) -> Self {
        AuditWriteError::Rejected(err.to_string())
    }
}

pub trait AuditStore: Send + Sync {
    fn append(&self, entry: &AuditLogEntry) -> std::result::Result<(), AuditWriteError>;

    /// Entries for one document, ascending by `performed_at`.
    fn entries_for(&self, document_id: &str) -> Result<Vec<AuditLogEntry>>;
}

#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
}

impl fmt::Debug for AuditRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditRecorder").finish_non_exhaustive()
    }
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append an entry. Failures are logged and swallowed.
    pub fn record(
        &self,
        document_id: &str,
        action: AuditAction,
        performed_by: &str,
        details: Option<String>,
    ) -> Option<AuditLogEntry> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            action,
            performed_by: performed_by.to_string(),
            performed_at: Utc::now(),
            details,
        };
        match self.store.append(&entry) {
            Ok(()) => {
                info!(document_id, action = %action, performed_by, "audit entry recorded");
                Some(entry)
            }
            Err(e) => {
                warn!(document_id, action = %action, error = %e, "audit entry dropped");
                None
            }
        }
    }

    pub fn entries_for(&self, document_id: &str) -> Result<Vec<AuditLogEntry>> {
        let mut entries = self.store.entries_for(document_id)?;
        // Stable: ties keep insertion order from the store.
        entries.sort_by_key(|e| e.performed_at);
        Ok(entries)
    }
}
