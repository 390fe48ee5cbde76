//! Assignment notifications, dispatched off the request path.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentNotice {
    pub signer_email: String,
    pub uploader_name: String,
    pub document_name: String,
    pub document_id: String,
}

impl AssignmentNotice {
    pub fn subject(&self) -> String {
        format!("Document Signature Request: {}", self.document_name)
    }

    pub fn body(&self) -> String {
        format!(
            "{} has requested your signature on \"{}\" (document {}).",
            self.uploader_name, self.document_name, self.document_id
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

pub trait Notifier: Send + Sync {
    fn notify_assigned(&self, notice: &AssignmentNotice) -> Result<(), NotifyError>;
}

/// Writes the notice to the log instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_assigned(&self, notice: &AssignmentNotice) -> Result<(), NotifyError> {
        info!(
            to = %notice.signer_email,
            document_id = %notice.document_id,
            subject = %notice.subject(),
            "signature request"
        );
        Ok(())
    }
}

/// Fire and forget. Delivery errors are logged and never reach the caller.
pub fn dispatch_assigned(notifier: Arc<dyn Notifier>, notice: AssignmentNotice) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("signflow-notify".into())
        .spawn(move || {
            if let Err(e) = notifier.notify_assigned(&notice) {
                warn!(document_id = %notice.document_id, error = %e, "assignment notice not delivered");
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "notify thread spawn failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<AssignmentNotice>>,
        fail: bool,
    }

    impl Notifier for Recording {
        fn notify_assigned(&self, notice: &AssignmentNotice) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(notice.clone());
            if self.fail {
                Err(NotifyError("smtp down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn notice() -> AssignmentNotice {
        AssignmentNotice {
            signer_email: "signer@example.com".into(),
            uploader_name: "Uma Uploader".into(),
            document_name: "Lease".into(),
            document_id: "d1".into(),
        }
    }

    #[test]
    fn dispatch_delivers_on_background_thread() {
        let notifier = Arc::new(Recording::default());
        let handle = dispatch_assigned(notifier.clone(), notice()).unwrap();
        handle.join().unwrap();
        assert_eq!(notifier.seen.lock().unwrap().as_slice(), &[notice()]);
    }

    #[test]
    fn delivery_failure_does_not_panic() {
        let notifier = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let handle = dispatch_assigned(notifier.clone(), notice()).unwrap();
        assert!(handle.join().is_ok());
    }

    #[test]
    fn subject_names_the_document() {
        assert_eq!(notice().subject(), "Document Signature Request: Lease");
        assert!(notice().body().contains("Uma Uploader"));
    }
}
