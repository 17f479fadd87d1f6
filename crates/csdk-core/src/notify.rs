use std::{sync::Arc, time::Duration};

use tracing::{error, info, warn};

use crate::progress::{ProgressListener, TracingProgressListener};
use crate::status::{JobKind, JobResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// User-facing side of the lifecycle manager: notifications and progress UI.
///
/// Only `show_notification` is required; the job-specific methods format
/// their message and forward to it.
pub trait SdkNotifier: Send + Sync {
    fn show_notification(&self, message: &str, severity: Severity);

    fn create_progress_listener(&self, title: &str) -> Arc<dyn ProgressListener> {
        Arc::new(TracingProgressListener::new(title))
    }

    fn notify_job_success(&self, kind: JobKind, result: JobResult) {
        // Nothing to say when everything was already up to date.
        if result == JobResult::Processed {
            let message = match kind {
                JobKind::Install => "Managed Google Cloud SDK successfully installed.",
                JobKind::Update => "Managed Google Cloud SDK successfully updated.",
            };
            self.show_notification(message, Severity::Info);
        }
    }

    fn notify_job_failure(&self, kind: JobKind, error: &str) {
        let message = match kind {
            JobKind::Install => format!("Failed to install managed Google Cloud SDK: {error}"),
            JobKind::Update => format!("Failed to update managed Google Cloud SDK: {error}"),
        };
        self.show_notification(&message, Severity::Error);
    }

    fn notify_job_cancelled(&self, kind: JobKind) {
        let message = match kind {
            JobKind::Install => "Managed Google Cloud SDK installation cancelled.",
            JobKind::Update => "Managed Google Cloud SDK update cancelled.",
        };
        self.show_notification(message, Severity::Warning);
    }

    fn notify_update_pending(&self, grace: Duration) {
        let message = format!(
            "A new version of the managed Google Cloud SDK is available; updating in {}s.",
            grace.as_secs()
        );
        self.show_notification(&message, Severity::Info);
    }
}

/// Notifier that writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl SdkNotifier for LogNotifier {
    fn show_notification(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
    }
}
