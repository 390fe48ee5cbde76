//! SQLite persistence for documents and their audit trail.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use sqlite::{ConnectionThreadSafe, State, Statement};
use tracing::debug;

use crate::error::{Result, SignflowError};
use crate::features::audit::{AuditLogEntry, AuditStore, AuditWriteError};
use crate::features::documents::{Document, DocumentStats, DocumentStatus, DocumentStore, SignedUpdate};
use crate::features::storage::AccessUrl;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    original_file_name TEXT NOT NULL,
    storage_key TEXT NOT NULL,
    access_url TEXT NOT NULL,
    access_url_expires_at INTEGER NOT NULL,
    uploader_id TEXT NOT NULL,
    uploader_name TEXT NOT NULL,
    assigned_to TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'SIGNED', 'VERIFIED', 'REJECTED')),
    signature_data TEXT,
    signed_at INTEGER,
    verified_at INTEGER,
    rejected_at INTEGER,
    rejection_reason TEXT,
    created_at INTEGER NOT NULL,
    sign_claim TEXT,
    sign_claimed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_documents_uploader ON documents (uploader_id);
CREATE INDEX IF NOT EXISTS idx_documents_assigned ON documents (assigned_to);
CREATE TABLE IF NOT EXISTS audit_logs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    document_id TEXT NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
    action TEXT NOT NULL,
    performed_by TEXT NOT NULL,
    performed_at INTEGER NOT NULL,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_document ON audit_logs (document_id, performed_at);
";

const DOCUMENT_COLUMNS: &str = "id, name, original_file_name, storage_key, access_url, \
    access_url_expires_at, uploader_id, uploader_name, assigned_to, status, signature_data, \
    signed_at, verified_at, rejected_at, rejection_reason, created_at";

/// Single shared connection. Every store call runs under the lock, so each
/// conditional update is atomic with respect to the others.
pub struct Database {
    conn: Mutex<ConnectionThreadSafe>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SignflowError::Persistence(format!("create_dir_failed:{e}")))?;
        }
        let conn = sqlite::Connection::open_thread_safe(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = sqlite::Connection::open_thread_safe(":memory:")?;
        Self::init(conn)
    }

    fn init(conn: ConnectionThreadSafe) -> Result<Self> {
        conn.execute(SCHEMA)?;
        debug!("schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ConnectionThreadSafe>> {
        self.conn
            .lock()
            .map_err(|_| SignflowError::Persistence("connection_lock_poisoned".into()))
    }

    fn fetch_many(&self, sql: &str, binds: &[&str]) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        for (i, value) in binds.iter().enumerate() {
            stmt.bind((i + 1, *value))?;
        }
        let mut out = Vec::new();
        while let State::Row = stmt.next()? {
            out.push(read_document(&stmt)?);
        }
        Ok(out)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SignflowError::Persistence(format!("invalid_timestamp:{ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn read_document(stmt: &Statement<'_>) -> Result<Document> {
    let status: String = stmt.read("status")?;
    Ok(Document {
        id: stmt.read("id")?,
        name: stmt.read("name")?,
        original_file_name: stmt.read("original_file_name")?,
        storage_key: stmt.read("storage_key")?,
        access_url: stmt.read("access_url")?,
        access_url_expires_at: from_millis(stmt.read("access_url_expires_at")?)?,
        uploader_id: stmt.read("uploader_id")?,
        uploader_name: stmt.read("uploader_name")?,
        assigned_to: stmt.read("assigned_to")?,
        status: status.parse().map_err(SignflowError::Persistence)?,
        signature_data: stmt.read::<Option<String>, _>("signature_data")?,
        signed_at: opt_from_millis(stmt.read::<Option<i64>, _>("signed_at")?)?,
        verified_at: opt_from_millis(stmt.read::<Option<i64>, _>("verified_at")?)?,
        rejected_at: opt_from_millis(stmt.read::<Option<i64>, _>("rejected_at")?)?,
        rejection_reason: stmt.read::<Option<String>, _>("rejection_reason")?,
        created_at: from_millis(stmt.read("created_at")?)?,
    })
}

impl DocumentStore for Database {
    fn insert(&self, doc: &Document) -> Result<()> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(format!(
            "INSERT INTO documents ({DOCUMENT_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))?;
        stmt.bind((1, doc.id.as_str()))?;
        stmt.bind((2, doc.name.as_str()))?;
        stmt.bind((3, doc.original_file_name.as_str()))?;
        stmt.bind((4, doc.storage_key.as_str()))?;
        stmt.bind((5, doc.access_url.as_str()))?;
        stmt.bind((6, to_millis(doc.access_url_expires_at)))?;
        stmt.bind((7, doc.uploader_id.as_str()))?;
        stmt.bind((8, doc.uploader_name.as_str()))?;
        stmt.bind((9, doc.assigned_to.as_str()))?;
        stmt.bind((10, doc.status.as_str()))?;
        stmt.bind((11, doc.signature_data.as_deref()))?;
        stmt.bind((12, doc.signed_at.map(to_millis)))?;
        stmt.bind((13, doc.verified_at.map(to_millis)))?;
        stmt.bind((14, doc.rejected_at.map(to_millis)))?;
        stmt.bind((15, doc.rejection_reason.as_deref()))?;
        stmt.bind((16, to_millis(doc.created_at)))?;
        while stmt.next()? != State::Done {}
        Ok(())
    }

    fn fetch(&self, id: &str) -> Result<Option<Document>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?");
        Ok(self.fetch_many(&sql, &[id])?.into_iter().next())
    }

    fn fetch_visible_to(&self, user_id: &str, email: &str) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE uploader_id = ? OR assigned_to = ? \
             ORDER BY created_at DESC, rowid DESC"
        );
        self.fetch_many(&sql, &[user_id, email])
    }

    fn count_by_status(&self, user_id: &str, email: &str) -> Result<DocumentStats> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) AS n FROM documents \
             WHERE uploader_id = ? OR assigned_to = ? GROUP BY status",
        )?;
        stmt.bind((1, user_id))?;
        stmt.bind((2, email))?;
        let mut stats = DocumentStats::default();
        while let State::Row = stmt.next()? {
            let status: String = stmt.read("status")?;
            let count: i64 = stmt.read("n")?;
            let status: DocumentStatus = status.parse().map_err(SignflowError::Persistence)?;
            stats.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }

    fn claim_signing(
        &self,
        id: &str,
        token: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "UPDATE documents SET sign_claim = ?, sign_claimed_at = ? \
             WHERE id = ? AND status = 'PENDING' \
             AND (sign_claim IS NULL OR sign_claimed_at < ?)",
        )?;
        stmt.bind((1, token))?;
        stmt.bind((2, to_millis(now)))?;
        stmt.bind((3, id))?;
        stmt.bind((4, to_millis(stale_before)))?;
        while stmt.next()? != State::Done {}
        drop(stmt);
        Ok(conn.change_count() == 1)
    }

    fn release_signing_claim(&self, id: &str, token: &str) -> Result<()> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "UPDATE documents SET sign_claim = NULL, sign_claimed_at = NULL \
             WHERE id = ? AND sign_claim = ?",
        )?;
        stmt.bind((1, id))?;
        stmt.bind((2, token))?;
        while stmt.next()? != State::Done {}
        Ok(())
    }

    fn commit_signed(&self, id: &str, token: &str, update: &SignedUpdate) -> Result<bool> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "UPDATE documents SET status = 'SIGNED', signature_data = ?, signed_at = ?, \
             access_url = COALESCE(?, access_url), \
             access_url_expires_at = COALESCE(?, access_url_expires_at), \
             sign_claim = NULL, sign_claimed_at = NULL \
             WHERE id = ? AND status = 'PENDING' AND sign_claim = ?",
        )?;
        stmt.bind((1, update.signature_data.as_str()))?;
        stmt.bind((2, to_millis(update.signed_at)))?;
        stmt.bind((3, update.access_url.as_ref().map(|u| u.url.as_str())))?;
        stmt.bind((4, update.access_url.as_ref().map(|u| to_millis(u.expires_at))))?;
        stmt.bind((5, id))?;
        stmt.bind((6, token))?;
        while stmt.next()? != State::Done {}
        drop(stmt);
        Ok(conn.change_count() == 1)
    }

    fn commit_verified(&self, id: &str, verified_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "UPDATE documents SET status = 'VERIFIED', verified_at = ? \
             WHERE id = ? AND status = 'SIGNED'",
        )?;
        stmt.bind((1, to_millis(verified_at)))?;
        stmt.bind((2, id))?;
        while stmt.next()? != State::Done {}
        drop(stmt);
        Ok(conn.change_count() == 1)
    }

    fn commit_rejected(&self, id: &str, rejected_at: DateTime<Utc>, reason: &str) -> Result<bool> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "UPDATE documents SET status = 'REJECTED', rejected_at = ?, rejection_reason = ? \
             WHERE id = ? AND status = 'SIGNED'",
        )?;
        stmt.bind((1, to_millis(rejected_at)))?;
        stmt.bind((2, reason))?;
        stmt.bind((3, id))?;
        while stmt.next()? != State::Done {}
        drop(stmt);
        Ok(conn.change_count() == 1)
    }

    fn update_access_url(&self, id: &str, url: &AccessUrl) -> Result<()> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "UPDATE documents SET access_url = ?, access_url_expires_at = ? WHERE id = ?",
        )?;
        stmt.bind((1, url.url.as_str()))?;
        stmt.bind((2, to_millis(url.expires_at)))?;
        stmt.bind((3, id))?;
        while stmt.next()? != State::Done {}
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("DELETE FROM documents WHERE id = ?")?;
        stmt.bind((1, id))?;
        while stmt.next()? != State::Done {}
        drop(stmt);
        Ok(conn.change_count() == 1)
    }
}

impl AuditStore for Database {
    fn append(&self, entry: &AuditLogEntry) -> std::result::Result<(), AuditWriteError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AuditWriteError::Unavailable("connection_lock_poisoned".into()))?;
        let mut stmt = conn.prepare(
            "INSERT INTO audit_logs (id, document_id, action, performed_by, performed_at, details) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, entry.id.as_str()))?;
        stmt.bind((2, entry.document_id.as_str()))?;
        stmt.bind((3, entry.action.as_str()))?;
        stmt.bind((4, entry.performed_by.as_str()))?;
        stmt.bind((5, to_millis(entry.performed_at)))?;
        stmt.bind((6, entry.details.as_deref()))?;
        while stmt.next()? != State::Done {}
        Ok(())
    }

    fn entries_for(&self, document_id: &str) -> Result<Vec<AuditLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, action, performed_by, performed_at, details \
             FROM audit_logs WHERE document_id = ? ORDER BY performed_at ASC, seq ASC",
        )?;
        stmt.bind((1, document_id))?;
        let mut out = Vec::new();
        while let State::Row = stmt.next()? {
            let action: String = stmt.read("action")?;
            out.push(AuditLogEntry {
                id: stmt.read("id")?,
                document_id: stmt.read("document_id")?,
                action: action.parse().map_err(SignflowError::Persistence)?,
                performed_by: stmt.read("performed_by")?,
                performed_at: from_millis(stmt.read("performed_at")?)?,
                details: stmt.read::<Option<String>, _>("details")?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::audit::AuditAction;
    use chrono::Duration;

    fn document(id: &str, uploader: &str, assignee: &str, created_at: DateTime<Utc>) -> Document {
        Document {
            id: id.to_string(),
            name: format!("Contract {id}"),
            original_file_name: "contract.pdf".into(),
            storage_key: format!("documents/202610/{id}-contract.pdf"),
            access_url: "http://localhost/files/x".into(),
            access_url_expires_at: created_at + Duration::days(7),
            uploader_id: uploader.to_string(),
            uploader_name: "Uma Uploader".into(),
            assigned_to: assignee.to_string(),
            status: DocumentStatus::Pending,
            signature_data: None,
            signed_at: None,
            verified_at: None,
            rejected_at: None,
            rejection_reason: None,
            created_at,
        }
    }

    fn signed_update(at: DateTime<Utc>) -> SignedUpdate {
        SignedUpdate {
            signature_data: "data:image/png;base64,AAAA".into(),
            signed_at: at,
            access_url: None,
        }
    }

    fn audit(id: &str, doc: &str, at: DateTime<Utc>) -> AuditLogEntry {
        AuditLogEntry {
            id: id.into(),
            document_id: doc.into(),
            action: AuditAction::Created,
            performed_by: "Uma Uploader".into(),
            performed_at: at,
            details: Some("Document uploaded".into()),
        }
    }

    #[test]
    fn insert_and_fetch_preserve_fields() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.timestamp_millis_opt(1_760_000_000_123).unwrap();
        let doc = document("d1", "u1", "signer@example.com", now);
        db.insert(&doc).unwrap();
        assert_eq!(db.fetch("d1").unwrap(), Some(doc));
        assert_eq!(db.fetch("missing").unwrap(), None);
    }

    #[test]
    fn visibility_covers_uploader_and_assignee_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        db.insert(&document("old", "u1", "a@example.com", t0)).unwrap();
        db.insert(&document("new", "u2", "a@example.com", t0 + Duration::seconds(5))).unwrap();
        db.insert(&document("other", "u2", "b@example.com", t0)).unwrap();

        let ids: Vec<String> = db
            .fetch_visible_to("u1", "a@example.com")
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);

        let stats = db.count_by_status("u2", "nobody@example.com").unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.total(), 2);
    }

    #[test]
    fn second_claim_is_refused_until_stale() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert(&document("d1", "u1", "a@example.com", now)).unwrap();

        let stale_before = now - Duration::minutes(5);
        assert!(db.claim_signing("d1", "first", now, stale_before).unwrap());
        assert!(!db.claim_signing("d1", "second", now, stale_before).unwrap());

        // A claim older than the cutoff may be taken over.
        let later = now + Duration::minutes(10);
        assert!(db.claim_signing("d1", "second", later, later - Duration::minutes(5)).unwrap());
        assert!(!db.commit_signed("d1", "first", &signed_update(later)).unwrap());
        assert!(db.commit_signed("d1", "second", &signed_update(later)).unwrap());
        assert_eq!(db.fetch("d1").unwrap().unwrap().status, DocumentStatus::Signed);
    }

    #[test]
    fn released_claim_can_be_taken_again() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert(&document("d1", "u1", "a@example.com", now)).unwrap();
        let stale_before = now - Duration::minutes(5);
        assert!(db.claim_signing("d1", "first", now, stale_before).unwrap());
        db.release_signing_claim("d1", "first").unwrap();
        assert!(db.claim_signing("d1", "second", now, stale_before).unwrap());
    }

    #[test]
    fn status_updates_are_conditional() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert(&document("d1", "u1", "a@example.com", now)).unwrap();

        assert!(!db.commit_verified("d1", now).unwrap());
        assert!(!db.commit_rejected("d1", now, "nope").unwrap());
        assert!(!db.commit_signed("d1", "unclaimed", &signed_update(now)).unwrap());

        assert!(db.claim_signing("d1", "t", now, now - Duration::minutes(5)).unwrap());
        let url = AccessUrl {
            url: "http://localhost/files/fresh".into(),
            expires_at: now + Duration::days(7),
        };
        let update = SignedUpdate {
            access_url: Some(url.clone()),
            ..signed_update(now)
        };
        assert!(db.commit_signed("d1", "t", &update).unwrap());
        let signed = db.fetch("d1").unwrap().unwrap();
        assert_eq!(signed.access_url, url.url);
        assert!(signed.signed_at.is_some());

        assert!(db.commit_rejected("d1", now, "Blurry").unwrap());
        assert!(!db.commit_verified("d1", now).unwrap());
        let rejected = db.fetch("d1").unwrap().unwrap();
        assert_eq!(rejected.status, DocumentStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("Blurry"));
        assert!(rejected.verified_at.is_none());
    }

    #[test]
    fn delete_cascades_to_audit_entries() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.insert(&document("d1", "u1", "a@example.com", now)).unwrap();
        db.append(&audit("a2", "d1", now + Duration::seconds(1))).unwrap();
        db.append(&audit("a1", "d1", now)).unwrap();

        let ids: Vec<String> = db.entries_for("d1").unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a1", "a2"]);

        assert!(db.delete("d1").unwrap());
        assert!(db.entries_for("d1").unwrap().is_empty());
        assert!(!db.delete("d1").unwrap());
    }

    #[test]
    fn audit_for_unknown_document_is_refused() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.append(&audit("a1", "ghost", Utc::now())).is_err());
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("signflow.sqlite3");
        let now = Utc::now();
        {
            let db = Database::open(&path).unwrap();
            db.insert(&document("d1", "u1", "a@example.com", now)).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.fetch("d1").unwrap().is_some());
    }
}
