//! Lifecycle management for an automatically installed Google Cloud SDK.
//!
//! [`ManagedSdkService`] owns the SDK status and runs install/update jobs in
//! the background; [`SdkServiceManager`] gates SDK-dependent actions on the
//! SDK being ready.

pub mod cancel;
pub mod coordinator;
pub mod error;
pub mod gcloud;
pub mod job;
pub mod lock;
pub mod manager;
pub mod notify;
pub mod progress;
pub mod sdk;
pub mod service;
pub mod settings;
pub mod status;
pub mod tracking;
pub mod updater;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use coordinator::Coordinator;
pub use error::SdkError;
pub use gcloud::{GcloudOptions, GcloudSdk};
pub use job::{JobOutcome, SdkJob, SdkJobRunner};
pub use lock::{SdkWriteGuard, SdkWriteLock};
pub use manager::{LogStatusHandler, SdkServiceManager, StatusHandler};
pub use notify::{LogNotifier, SdkNotifier, Severity};
pub use progress::{ConsoleListener, ProgressListener, UNKNOWN};
pub use sdk::{ManagedSdk, SdkFuture, APP_ENGINE_JAVA};
pub use service::{
    LastJob, LastJobOutcome, ListenerId, ManagedSdkService, StatusUpdateListener,
};
pub use settings::{SdkSettings, SettingsError, SettingsStore};
pub use status::{JobKind, JobResult, SdkStatus};
pub use tracking::{NoopTracker, TelemetryTracker, UsageTracker};
pub use updater::SdkUpdateScheduler;
