//! PDF signing workflow: place annotations on a PDF, sign it, and track the
//! document through PENDING → SIGNED → VERIFIED | REJECTED with an audit trail.
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod config;
pub mod error;
pub mod features;
pub mod ui;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Result, SignflowError};
pub use features::annotation::{
    AnnotationSession, FieldKind, FieldPayload, JsonPresenter, SessionError, SessionPresenter,
    UndoOutcome,
};
pub use features::audit::{AuditAction, AuditLogEntry, AuditRecorder, AuditStore};
pub use features::database::Database;
pub use features::documents::{Actor, Document, DocumentStats, DocumentStatus, DocumentStore};
pub use features::lifecycle::{ArtifactDownload, DocumentService, SignSubmission, Upload};
pub use features::notify::{AssignmentNotice, LogNotifier, Notifier};
pub use features::pdf::{
    embed_annotation, screen_to_pdf, AnnotationContent, EmbedError, EmbedRequest, Embedded,
    PageSize, PageTarget, PdfPoint, Placement, ScreenPoint, Viewport,
};
pub use features::storage::{AccessUrl, ArtifactStore, FsArtifactStore, StorageError};
