//! Document lifecycle: upload, sign, verify, reject.
//!
//! Status moves PENDING → SIGNED → VERIFIED | REJECTED and never backwards.
//! Signing reserves the document with a claim token before the artifact is
//! replaced, so two signers can never both overwrite it.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Local, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, SignflowError};
use crate::features::annotation::{AnnotationSession, SessionError};
use crate::features::audit::{AuditAction, AuditLogEntry, AuditRecorder};
use crate::features::database::Database;
use crate::features::documents::{
    normalize_email, Actor, Document, DocumentStats, DocumentStatus, DocumentStore, SignedUpdate,
};
use crate::features::notify::{dispatch_assigned, AssignmentNotice, LogNotifier, Notifier};
use crate::features::pdf::{
    decode_signature_data, embed_annotation, page_count, server_signature_request, signed_caption,
    Viewport,
};
use crate::features::session_store::ExpiringMap;
use crate::features::storage::{delete_best_effort, AccessUrl, ArtifactStore, FsArtifactStore};

type SharedSession = Arc<Mutex<AnnotationSession>>;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
const DEFAULT_REJECTION_REASON: &str = "No reason provided";

#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub original_file_name: String,
    pub assigned_to: String,
    pub bytes: Vec<u8>,
}

/// Signing input. When `signed_artifact` is absent the signature image is
/// stamped onto the stored PDF here; otherwise the client-finalized PDF is
/// stored as is.
#[derive(Debug, Clone, Default)]
pub struct SignSubmission {
    pub signature_data: String,
    pub signed_artifact: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDownload {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub content_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    document_id: String,
    email: String,
}

impl SessionKey {
    fn new(document_id: &str, actor: &Actor) -> Self {
        Self {
            document_id: document_id.to_string(),
            email: normalize_email(&actor.email),
        }
    }
}

pub struct DocumentService {
    config: Config,
    documents: Arc<dyn DocumentStore>,
    audit: AuditRecorder,
    storage: Arc<dyn ArtifactStore>,
    notifier: Arc<dyn Notifier>,
    sessions: Mutex<ExpiringMap<SessionKey, SharedSession>>,
}

impl std::fmt::Debug for DocumentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DocumentService {
    pub fn new(
        config: Config,
        documents: Arc<dyn DocumentStore>,
        audit: AuditRecorder,
        storage: Arc<dyn ArtifactStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let sessions = Mutex::new(ExpiringMap::new(config.session_ttl()));
        Self {
            config,
            documents,
            audit,
            storage,
            notifier,
            sessions,
        }
    }

    /// SQLite at `db_path`, artifacts under `data_dir/artifacts`, log-only
    /// notifications.
    pub fn open(config: Config) -> Result<Self> {
        let database = Arc::new(Database::open(&config.db_path)?);
        let storage = FsArtifactStore::open(
            config.data_dir.join("artifacts"),
            &config.access_url_base,
            &config.access_url_secret,
        )?;
        info!(data_dir = %config.data_dir.display(), "document service ready");
        Ok(Self::new(
            config,
            database.clone(),
            AuditRecorder::new(database),
            Arc::new(storage),
            Arc::new(LogNotifier),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn upload(&self, actor: &Actor, upload: Upload) -> Result<Document> {
        let name = upload.name.trim();
        if name.is_empty() {
            return Err(SignflowError::Validation("Please provide a document name".into()));
        }
        let assigned_to = normalize_email(&upload.assigned_to);
        if !looks_like_email(&assigned_to) {
            return Err(SignflowError::Validation("Please provide a valid signer email".into()));
        }
        let pages = ensure_pdf(&upload.bytes)?;

        let storage_key = self.storage.put(&upload.bytes, &upload.original_file_name)?;
        let access = match self.storage.issue_access_url(&storage_key, self.config.access_url_ttl()) {
            Ok(access) => access,
            Err(e) => {
                delete_best_effort(self.storage.as_ref(), &storage_key);
                return Err(e.into());
            }
        };

        let document = Document {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            original_file_name: upload.original_file_name,
            storage_key,
            access_url: access.url,
            access_url_expires_at: access.expires_at,
            uploader_id: actor.user_id.clone(),
            uploader_name: actor.display_name.clone(),
            assigned_to,
            status: DocumentStatus::Pending,
            signature_data: None,
            signed_at: None,
            verified_at: None,
            rejected_at: None,
            rejection_reason: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.documents.insert(&document) {
            delete_best_effort(self.storage.as_ref(), &document.storage_key);
            return Err(e);
        }
        info!(document_id = %document.id, pages, assigned_to = %document.assigned_to, "document uploaded");

        self.audit.record(
            &document.id,
            AuditAction::Created,
            &actor.display_name,
            Some(format!("Document uploaded and assigned to {}", document.assigned_to)),
        );
        dispatch_assigned(
            self.notifier.clone(),
            AssignmentNotice {
                signer_email: document.assigned_to.clone(),
                uploader_name: document.uploader_name.clone(),
                document_name: document.name.clone(),
                document_id: document.id.clone(),
            },
        );
        Ok(document)
    }

    pub fn get(&self, document_id: &str, actor: &Actor) -> Result<Document> {
        let document = self.load(document_id)?;
        if !document.is_visible_to(actor) {
            return Err(SignflowError::Authorization(
                "You do not have permission to view this document".into(),
            ));
        }
        Ok(document)
    }

    pub fn list(&self, actor: &Actor) -> Result<Vec<Document>> {
        self.documents
            .fetch_visible_to(&actor.user_id, &normalize_email(&actor.email))
    }

    pub fn stats(&self, actor: &Actor) -> Result<DocumentStats> {
        self.documents
            .count_by_status(&actor.user_id, &normalize_email(&actor.email))
    }

    pub fn audit_trail(&self, document_id: &str, actor: &Actor) -> Result<Vec<AuditLogEntry>> {
        self.get(document_id, actor)?;
        self.audit.entries_for(document_id)
    }

    pub fn view(&self, document_id: &str, actor: &Actor) -> Result<ArtifactDownload> {
        let document = self.get(document_id, actor)?;
        let bytes = self.storage.get(&document.storage_key)?;
        Ok(ArtifactDownload {
            bytes,
            file_name: document.original_file_name,
            content_type: PDF_CONTENT_TYPE,
        })
    }

    pub fn refresh_access_url(&self, document_id: &str, actor: &Actor) -> Result<AccessUrl> {
        let document = self.get(document_id, actor)?;
        let access = self
            .storage
            .issue_access_url(&document.storage_key, self.config.access_url_ttl())?;
        self.documents.update_access_url(document_id, &access)?;
        debug!(document_id, expires_at = %access.expires_at, "access url refreshed");
        Ok(access)
    }

    pub fn sign_document(
        &self,
        document_id: &str,
        actor: &Actor,
        submission: SignSubmission,
    ) -> Result<Document> {
        if submission.signature_data.trim().is_empty() {
            return Err(SignflowError::Validation("Please provide signature data".into()));
        }
        let document = self.load(document_id)?;
        if !document.is_assigned_to(actor) {
            warn!(document_id, actor = %actor.user_id, "sign attempt by non-assignee");
            return Err(SignflowError::Authorization(
                "You are not assigned to sign this document".into(),
            ));
        }
        if !document.status.can_transition_to(DocumentStatus::Signed) {
            return Err(SignflowError::StateConflict(
                "Document has already been signed or processed".into(),
            ));
        }

        let now = Utc::now();
        let stale = chrono::Duration::from_std(self.config.sign_claim_stale())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let token = Uuid::new_v4().to_string();
        if !self.documents.claim_signing(document_id, &token, now, now - stale)? {
            return Err(SignflowError::StateConflict(
                "Document is already being signed".into(),
            ));
        }

        let outcome = self.finish_signing(&document, actor, &token, submission);
        if outcome.is_err() {
            if let Err(e) = self.documents.release_signing_claim(document_id, &token) {
                error!(document_id, error = %e, "sign claim release failed");
            }
        }
        outcome
    }

    fn finish_signing(
        &self,
        document: &Document,
        actor: &Actor,
        token: &str,
        submission: SignSubmission,
    ) -> Result<Document> {
        let current = self.storage.get(&document.storage_key)?;
        let signed_bytes = match submission.signed_artifact {
            Some(bytes) => {
                let pages = ensure_pdf(&bytes)?;
                if pages != page_count(&current)? {
                    return Err(SignflowError::Validation(
                        "Signed document does not match the original page count".into(),
                    ));
                }
                bytes
            }
            None => {
                let image = decode_signature_data(&submission.signature_data)?;
                let request = server_signature_request(image, signed_caption(&Local::now()));
                embed_annotation(&current, &request)?.bytes
            }
        };

        self.storage.replace(&document.storage_key, &signed_bytes)?;

        let access_url = match self
            .storage
            .issue_access_url(&document.storage_key, self.config.access_url_ttl())
        {
            Ok(access) => Some(access),
            Err(e) => {
                warn!(document_id = %document.id, error = %e, "access url not refreshed after signing");
                None
            }
        };
        let update = SignedUpdate {
            signature_data: submission.signature_data,
            signed_at: Utc::now(),
            access_url,
        };
        if !self.documents.commit_signed(&document.id, token, &update)? {
            error!(document_id = %document.id, "sign claim lost before commit");
            return Err(SignflowError::StateConflict(
                "Document has already been signed or processed".into(),
            ));
        }
        info!(document_id = %document.id, signer = %actor.email, "document signed");

        self.audit.record(
            &document.id,
            AuditAction::Signed,
            &actor.display_name,
            Some(format!("Document signed by {}", normalize_email(&actor.email))),
        );
        self.load(&document.id)
    }

    pub fn verify_document(&self, document_id: &str, actor: &Actor) -> Result<Document> {
        let document = self.load(document_id)?;
        if !document.is_owned_by(actor) {
            return Err(SignflowError::Authorization(
                "You do not have permission to verify this document".into(),
            ));
        }
        if !document.status.can_transition_to(DocumentStatus::Verified)
            || !self.documents.commit_verified(document_id, Utc::now())?
        {
            return Err(SignflowError::StateConflict(
                "Document must be signed before verification".into(),
            ));
        }
        info!(document_id, "document verified");
        self.audit.record(
            document_id,
            AuditAction::Accepted,
            &actor.display_name,
            Some(format!("Document accepted by {}", normalize_email(&actor.email))),
        );
        self.load(document_id)
    }

    pub fn reject_document(
        &self,
        document_id: &str,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Document> {
        let document = self.load(document_id)?;
        if !document.is_owned_by(actor) {
            return Err(SignflowError::Authorization(
                "You do not have permission to reject this document".into(),
            ));
        }
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REJECTION_REASON);
        if !document.status.can_transition_to(DocumentStatus::Rejected)
            || !self.documents.commit_rejected(document_id, Utc::now(), reason)?
        {
            return Err(SignflowError::StateConflict(
                "Only signed documents can be rejected".into(),
            ));
        }
        info!(document_id, reason, "document rejected");
        self.audit.record(
            document_id,
            AuditAction::Rejected,
            &actor.display_name,
            Some(reason.to_string()),
        );
        self.load(document_id)
    }

    /// Uploader only. The stored artifact is removed best effort.
    pub fn delete(&self, document_id: &str, actor: &Actor) -> Result<()> {
        let document = self.load(document_id)?;
        if !document.is_owned_by(actor) {
            return Err(SignflowError::Authorization(
                "You do not have permission to delete this document".into(),
            ));
        }
        if !self.documents.delete(document_id)? {
            return Err(SignflowError::NotFound(document_id.to_string()));
        }
        delete_best_effort(self.storage.as_ref(), &document.storage_key);
        self.lock_sessions()?.remove(&SessionKey {
            document_id: document_id.to_string(),
            email: document.assigned_to.clone(),
        });
        info!(document_id, "document deleted");
        Ok(())
    }

    /// Start (or restart) a placement session over the stored PDF.
    pub fn open_annotation_session(
        &self,
        document_id: &str,
        actor: &Actor,
        viewport: Viewport,
    ) -> Result<usize> {
        let document = self.load(document_id)?;
        if !document.is_assigned_to(actor) {
            return Err(SignflowError::Authorization(
                "You are not assigned to sign this document".into(),
            ));
        }
        if document.status != DocumentStatus::Pending {
            return Err(SignflowError::StateConflict(
                "Document has already been signed or processed".into(),
            ));
        }
        let bytes = self.storage.get(&document.storage_key)?;
        let session = AnnotationSession::new(bytes, viewport)?
            .with_history_limit(self.config.history_limit);
        let pages = session.page_count();
        self.lock_sessions()?
            .insert(SessionKey::new(document_id, actor), Arc::new(Mutex::new(session)));
        debug!(document_id, pages, "annotation session opened");
        Ok(pages)
    }

    /// Run `f` against the caller's open session. Access extends its lifetime.
    ///
    /// Only that session is locked while `f` runs; other callers' sessions
    /// stay usable.
    pub fn with_annotation_session<R>(
        &self,
        document_id: &str,
        actor: &Actor,
        f: impl FnOnce(&mut AnnotationSession) -> R,
    ) -> Result<R> {
        let shared = self
            .lock_sessions()?
            .get_mut(&SessionKey::new(document_id, actor))
            .map(|shared| Arc::clone(shared))
            .ok_or(SessionError::NotOpen)?;
        let mut session = shared
            .lock()
            .map_err(|_| SignflowError::Persistence("session_lock_poisoned".into()))?;
        Ok(f(&mut session))
    }

    /// Sign with the session's working copy, then close the session.
    pub fn submit_annotation_session(
        &self,
        document_id: &str,
        actor: &Actor,
        signature_data: String,
    ) -> Result<Document> {
        let bytes = self
            .with_annotation_session(document_id, actor, |session| session.finalize())??;
        let document = self.sign_document(
            document_id,
            actor,
            SignSubmission {
                signature_data,
                signed_artifact: Some(bytes),
            },
        )?;
        self.close_annotation_session(document_id, actor)?;
        Ok(document)
    }

    pub fn close_annotation_session(&self, document_id: &str, actor: &Actor) -> Result<bool> {
        Ok(self
            .lock_sessions()?
            .remove(&SessionKey::new(document_id, actor))
            .is_some())
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        let purged = self
            .lock_sessions()?
            .purge_expired_at(std::time::Instant::now());
        if purged > 0 {
            debug!(purged, "expired annotation sessions dropped");
        }
        Ok(purged)
    }

    fn load(&self, document_id: &str) -> Result<Document> {
        self.documents
            .fetch(document_id)?
            .ok_or_else(|| SignflowError::NotFound(document_id.to_string()))
    }

    fn lock_sessions(&self) -> Result<MutexGuard<'_, ExpiringMap<SessionKey, SharedSession>>> {
        self.sessions
            .lock()
            .map_err(|_| SignflowError::Persistence("session_lock_poisoned".into()))
    }
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn ensure_pdf(bytes: &[u8]) -> Result<usize> {
    if !infer::is(bytes, "pdf") {
        return Err(SignflowError::Validation("Only PDF files are allowed".into()));
    }
    Ok(page_count(bytes)?)
}
