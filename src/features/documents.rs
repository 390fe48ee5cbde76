use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::features::storage::AccessUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Signed,
    Verified,
    Rejected,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 4] = [
        DocumentStatus::Pending,
        DocumentStatus::Signed,
        DocumentStatus::Verified,
        DocumentStatus::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Signed => "SIGNED",
            DocumentStatus::Verified => "VERIFIED",
            DocumentStatus::Rejected => "REJECTED",
        }
    }

    /// PENDING → SIGNED → {VERIFIED | REJECTED}.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Pending, DocumentStatus::Signed)
                | (DocumentStatus::Signed, DocumentStatus::Verified)
                | (DocumentStatus::Signed, DocumentStatus::Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Verified | DocumentStatus::Rejected)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DocumentStatus::Pending),
            "SIGNED" => Ok(DocumentStatus::Signed),
            "VERIFIED" => Ok(DocumentStatus::Verified),
            "REJECTED" => Ok(DocumentStatus::Rejected),
            other => Err(format!("unknown_status:{other}")),
        }
    }
}

/// Authenticated caller of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, email: &str, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: normalize_email(email),
            display_name: display_name.into(),
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub name: String,
    pub original_file_name: String,
    pub storage_key: String,
    pub access_url: String,
    pub access_url_expires_at: DateTime<Utc>,
    pub uploader_id: String,
    pub uploader_name: String,
    pub assigned_to: String,
    pub status: DocumentStatus,
    pub signature_data: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn is_assigned_to(&self, actor: &Actor) -> bool {
        self.assigned_to == normalize_email(&actor.email)
    }

    pub fn is_owned_by(&self, actor: &Actor) -> bool {
        self.uploader_id == actor.user_id
    }

    pub fn is_visible_to(&self, actor: &Actor) -> bool {
        self.is_owned_by(actor) || self.is_assigned_to(actor)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub pending: u64,
    pub signed: u64,
    pub verified: u64,
    pub rejected: u64,
}

impl DocumentStats {
    pub fn add(&mut self, status: DocumentStatus, count: u64) {
        match status {
            DocumentStatus::Pending => self.pending += count,
            DocumentStatus::Signed => self.signed += count,
            DocumentStatus::Verified => self.verified += count,
            DocumentStatus::Rejected => self.rejected += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.signed + self.verified + self.rejected
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedUpdate {
    pub signature_data: String,
    pub signed_at: DateTime<Utc>,
    pub access_url: Option<AccessUrl>,
}

/// Persistence collaborator for documents.
///
/// Every `commit_*` method is a conditional update keyed on the expected
/// current status and reports whether it applied.
pub trait DocumentStore: Send + Sync {
    fn insert(&self, document: &Document) -> Result<()>;

    fn fetch(&self, id: &str) -> Result<Option<Document>>;

    /// Documents uploaded by `user_id` or assigned to `email`, newest first.
    fn fetch_visible_to(&self, user_id: &str, email: &str) -> Result<Vec<Document>>;

    fn count_by_status(&self, user_id: &str, email: &str) -> Result<DocumentStats>;

    /// Reserve a PENDING document for one signer. Claims recorded before
    /// `stale_before` are considered abandoned and may be taken over.
    fn claim_signing(
        &self,
        id: &str,
        token: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    fn release_signing_claim(&self, id: &str, token: &str) -> Result<()>;

    /// PENDING → SIGNED, only while `token` still holds the claim.
    fn commit_signed(&self, id: &str, token: &str, update: &SignedUpdate) -> Result<bool>;

    /// SIGNED → VERIFIED.
    fn commit_verified(&self, id: &str, verified_at: DateTime<Utc>) -> Result<bool>;

    /// SIGNED → REJECTED.
    fn commit_rejected(&self, id: &str, rejected_at: DateTime<Utc>, reason: &str) -> Result<bool>;

    fn update_access_url(&self, id: &str, url: &AccessUrl) -> Result<()>;

    /// Removes the document and, by cascade, its audit entries.
    fn delete(&self, id: &str) -> Result<bool>;
}
