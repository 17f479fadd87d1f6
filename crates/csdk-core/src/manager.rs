//! Gate for SDK-dependent actions: run them once the SDK is `Ready`, or
//! report why it is not.

use std::sync::{mpsc, Arc, Mutex, OnceLock};

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::lock::SdkWriteLock;
use crate::notify::Severity;
use crate::service::{ListenerId, ManagedSdkService, StatusUpdateListener};
use crate::status::SdkStatus;

/// Caller-supplied reaction to an SDK that did not become ready.
pub trait StatusHandler: Send + Sync {
    fn error_message(&self, status: SdkStatus) -> String {
        default_error_message(status).to_string()
    }

    fn on_error(&self, status: SdkStatus, message: &str);
}

pub fn default_error_message(status: SdkStatus) -> &'static str {
    match status {
        SdkStatus::Installing => {
            "Google Cloud SDK is still being installed or updated. Try again once it finishes."
        }
        SdkStatus::NotAvailable => {
            "Google Cloud SDK is not available. Install it or fix its location in the settings."
        }
        SdkStatus::Invalid => {
            "Google Cloud SDK is invalid: the last update did not complete. Update or reinstall it."
        }
        SdkStatus::Ready => "Google Cloud SDK is ready.",
    }
}

/// Handler that only logs; the notification is shown by the manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusHandler;

impl StatusHandler for LogStatusHandler {
    fn on_error(&self, status: SdkStatus, message: &str) {
        warn!("Cloud SDK not ready ({}): {}", status, message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyOutcome {
    Ready,
    NotReady(SdkStatus),
    /// The job the caller was waiting on was cancelled by the user.
    Cancelled,
}

#[derive(Clone)]
pub struct SdkServiceManager {
    service: ManagedSdkService,
}

impl SdkServiceManager {
    pub fn new(service: ManagedSdkService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ManagedSdkService {
        &self.service
    }

    pub fn write_lock(&self) -> &SdkWriteLock {
        self.service.write_lock()
    }

    /// Runs `callback` on the coordination thread once the SDK is `Ready`,
    /// starting an install if nothing is running. Otherwise reports through
    /// `handler`.
    pub fn run_when_sdk_ready<F>(&self, callback: F, handler: Arc<dyn StatusHandler>)
    where
        F: FnOnce() + Send + 'static,
    {
        let this = self.clone();
        self.when_sdk_settles(move |outcome| match outcome {
            ReadyOutcome::Ready => callback(),
            ReadyOutcome::NotReady(status) => this.report_error(status, handler.as_ref()),
            ReadyOutcome::Cancelled => info!("Cloud SDK job cancelled; dropping pending action"),
        });
    }

    /// Blocks until the SDK settles. On the coordination thread it cannot
    /// wait and answers from the current status instead.
    pub fn block_until_sdk_ready(&self, handler: &dyn StatusHandler) -> bool {
        if self.service.coordinator().is_current() {
            let status = self.service.status();
            if status != SdkStatus::Ready {
                warn!("Cloud SDK readiness requested on the coordination thread while {status}");
            }
            return self.resolve(ReadyOutcome::from_status(status), handler);
        }

        let (tx, rx) = mpsc::channel();
        self.when_sdk_settles(move |outcome| {
            let _ = tx.send(outcome);
        });
        let outcome = rx
            .recv()
            .unwrap_or_else(|_| ReadyOutcome::from_status(self.service.status()));
        self.resolve(outcome, handler)
    }

    pub async fn wait_until_sdk_ready(&self, handler: &dyn StatusHandler) -> bool {
        let (tx, rx) = oneshot::channel();
        self.when_sdk_settles(move |outcome| {
            let _ = tx.send(outcome);
        });
        let outcome = rx
            .await
            .unwrap_or_else(|_| ReadyOutcome::from_status(self.service.status()));
        self.resolve(outcome, handler)
    }

    pub fn show_cloud_sdk_notification(&self, message: &str, severity: Severity) {
        self.service.notifier().show_notification(message, severity);
    }

    fn resolve(&self, outcome: ReadyOutcome, handler: &dyn StatusHandler) -> bool {
        match outcome {
            ReadyOutcome::Ready => true,
            ReadyOutcome::NotReady(status) => {
                self.report_error(status, handler);
                false
            }
            ReadyOutcome::Cancelled => {
                info!("Cloud SDK job cancelled; not waiting any longer");
                false
            }
        }
    }

    fn report_error(&self, status: SdkStatus, handler: &dyn StatusHandler) {
        let message = handler.error_message(status);
        handler.on_error(status, &message);
        let severity = if status == SdkStatus::Installing {
            Severity::Warning
        } else {
            Severity::Error
        };
        self.show_cloud_sdk_notification(&message, severity);
    }

    /// Delivers exactly one outcome to `on_outcome`, on the coordination
    /// thread.
    fn when_sdk_settles<F>(&self, on_outcome: F)
    where
        F: FnOnce(ReadyOutcome) + Send + 'static,
    {
        let service = self.service.clone();
        self.service.coordinator().invoke(move || {
            if service.status() == SdkStatus::Ready {
                return on_outcome(ReadyOutcome::Ready);
            }
            // From inside a status listener the install is only queued.
            let started = !service.is_job_running()
                && service.is_install_supported()
                && service.install();
            if !started && !service.is_job_running() && service.status() != SdkStatus::Installing
            {
                return on_outcome(ReadyOutcome::from_status(service.status()));
            }

            let waiter = Arc::new(ReadyWaiter::new(on_outcome));
            let id = service.add_status_listener(waiter.clone());
            let _ = waiter.id.set(id);
        });
    }
}

impl ReadyOutcome {
    fn from_status(status: SdkStatus) -> Self {
        match status {
            SdkStatus::Ready => ReadyOutcome::Ready,
            other => ReadyOutcome::NotReady(other),
        }
    }
}

type OutcomeCallback = Box<dyn FnOnce(ReadyOutcome) + Send>;

/// One-shot listener that removes itself after the first terminal status.
struct ReadyWaiter {
    id: OnceLock<ListenerId>,
    on_outcome: Mutex<Option<OutcomeCallback>>,
}

impl ReadyWaiter {
    fn new<F>(on_outcome: F) -> Self
    where
        F: FnOnce(ReadyOutcome) + Send + 'static,
    {
        Self {
            id: OnceLock::new(),
            on_outcome: Mutex::new(Some(Box::new(on_outcome))),
        }
    }
}

impl StatusUpdateListener for ReadyWaiter {
    fn on_sdk_status_change(&self, service: &ManagedSdkService, status: SdkStatus) {
        let outcome = match status {
            SdkStatus::Installing => return,
            SdkStatus::Ready => ReadyOutcome::Ready,
            SdkStatus::Invalid | SdkStatus::NotAvailable => {
                if service.is_job_running() {
                    return;
                }
                if service.was_last_job_cancelled() {
                    ReadyOutcome::Cancelled
                } else {
                    ReadyOutcome::NotReady(status)
                }
            }
        };

        let callback = self
            .on_outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(callback) = callback else {
            return;
        };
        if let Some(id) = self.id.get() {
            service.remove_status_listener(*id);
        }
        callback(outcome);
    }
}
