use crate::features::annotation::SessionError;
use crate::features::pdf::EmbedError;
use crate::features::storage::StorageError;

/// Failures surfaced by the document service.
///
/// Audit write failures are deliberately absent: the recorder swallows them.
#[derive(Debug, thiserror::Error)]
pub enum SignflowError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl SignflowError {
    /// Short message safe to show to an end user.
    pub fn public_message(&self) -> String {
        match self {
            SignflowError::Validation(msg)
            | SignflowError::Authorization(msg)
            | SignflowError::StateConflict(msg) => msg.clone(),
            SignflowError::NotFound(_) => "Document not found".to_string(),
            SignflowError::Embed(err) => format!("Failed to embed annotation: {}", err.reason()),
            SignflowError::Storage(_) => "The document file could not be stored".to_string(),
            SignflowError::Session(err) => err.to_string(),
            SignflowError::Persistence(_) => "Server error".to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SignflowError::StateConflict(_))
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, SignflowError::Authorization(_))
    }
}

impl From<sqlite::Error> for SignflowError {
    fn from(err: sqlite::Error) -> Self {
        SignflowError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SignflowError>;
