//! Owner of the managed SDK lifecycle: status, listeners and the one
//! in-flight install or update job.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelHandle, CancelToken};
use crate::coordinator::{panic_message, Coordinator};
use crate::error::SdkError;
use crate::job::{JobOutcome, SdkJob, SdkJobRunner};
use crate::lock::{SdkWriteGuard, SdkWriteLock};
use crate::notify::{LogNotifier, SdkNotifier};
use crate::progress::{ConsoleListener, ProgressListener, TracingConsole, UNKNOWN};
use crate::sdk::{ManagedSdk, SdkFuture, APP_ENGINE_JAVA};
use crate::status::{failure_event, next_status, JobKind, JobResult, SdkStatus, StatusEvent};
use crate::tracking::{
    cancelled_event, failed_event, succeeded_event, NoopTracker, UsageTracker,
    METADATA_MESSAGE_KEY,
};

pub const LOCK_WAIT_TITLE: &str = "Managed Google Cloud SDK";
pub const LOCK_WAIT_MESSAGE: &str = "Waiting for Cloud SDK processes to finish";

pub trait StatusUpdateListener: Send + Sync {
    fn on_sdk_status_change(&self, service: &ManagedSdkService, status: SdkStatus);
}

impl<F> StatusUpdateListener for F
where
    F: Fn(&ManagedSdkService, SdkStatus) + Send + Sync,
{
    fn on_sdk_status_change(&self, service: &ManagedSdkService, status: SdkStatus) {
        self(service, status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastJobOutcome {
    Succeeded(JobResult),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub outcome: LastJobOutcome,
    pub finished_at_millis: i64,
}

#[derive(Clone)]
pub struct ManagedSdkService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    sdk: Option<Arc<dyn ManagedSdk>>,
    unsupported_reason: String,
    unsupported_notified: AtomicBool,
    components: Vec<String>,
    coordinator: Coordinator,
    write_lock: SdkWriteLock,
    runner: SdkJobRunner,
    notifier: Arc<dyn SdkNotifier>,
    tracker: Arc<dyn UsageTracker>,
    state: Mutex<ServiceState>,
    active_job: Mutex<Option<ActiveJob>>,
    next_listener_id: AtomicU64,
}

#[derive(Default)]
struct ServiceState {
    status: SdkStatus,
    listeners: Vec<(ListenerId, Arc<dyn StatusUpdateListener>)>,
    last_job: Option<LastJob>,
    /// Set while listeners are being notified of a transition.
    dispatching: bool,
}

struct ActiveJob {
    id: Uuid,
    kind: JobKind,
    cancel: CancelHandle,
}

pub struct ServiceBuilder {
    coordinator: Coordinator,
    runtime: Handle,
    sdk: Result<Arc<dyn ManagedSdk>, String>,
    write_lock: SdkWriteLock,
    notifier: Arc<dyn SdkNotifier>,
    tracker: Arc<dyn UsageTracker>,
    components: Vec<String>,
}

impl ServiceBuilder {
    pub fn sdk(mut self, sdk: Arc<dyn ManagedSdk>) -> Self {
        self.sdk = Ok(sdk);
        self
    }

    /// Takes the platform probe result; an error leaves install unsupported.
    pub fn sdk_result(mut self, sdk: Result<Arc<dyn ManagedSdk>, SdkError>) -> Self {
        self.sdk = sdk.map_err(|err| err.to_string());
        self
    }

    pub fn unsupported(mut self, reason: impl Into<String>) -> Self {
        self.sdk = Err(reason.into());
        self
    }

    pub fn write_lock(mut self, lock: SdkWriteLock) -> Self {
        self.write_lock = lock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn SdkNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn UsageTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn required_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components = components.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> ManagedSdkService {
        let (sdk, unsupported_reason) = match self.sdk {
            Ok(sdk) => (Some(sdk), String::new()),
            Err(reason) => (None, reason),
        };
        ManagedSdkService {
            inner: Arc::new(ServiceInner {
                sdk,
                unsupported_reason,
                unsupported_notified: AtomicBool::new(false),
                components: self.components,
                coordinator: self.coordinator,
                write_lock: self.write_lock,
                runner: SdkJobRunner::new(self.runtime),
                notifier: self.notifier,
                tracker: self.tracker,
                state: Mutex::new(ServiceState::default()),
                active_job: Mutex::new(None),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }
}

impl ManagedSdkService {
    pub fn builder(coordinator: Coordinator, runtime: Handle) -> ServiceBuilder {
        ServiceBuilder {
            coordinator,
            runtime,
            sdk: Err("no managed SDK configured".to_string()),
            write_lock: SdkWriteLock::new(),
            notifier: Arc::new(LogNotifier),
            tracker: Arc::new(NoopTracker),
            components: vec![APP_ENGINE_JAVA.to_string()],
        }
    }

    /// Starts managing the SDK: installs (or completes) it when the platform
    /// is supported, otherwise pins the status at `NotAvailable`.
    pub fn activate(&self) -> bool {
        if self.inner.sdk.is_some() {
            return self.install();
        }

        let this = self.clone();
        self.inner
            .coordinator
            .invoke(move || this.apply_event(StatusEvent::PlatformUnsupported));
        if !self.inner.unsupported_notified.swap(true, Ordering::SeqCst) {
            warn!(
                "Managed Cloud SDK unsupported: {}",
                self.inner.unsupported_reason
            );
            self.inner
                .notifier
                .notify_job_failure(JobKind::Install, &self.inner.unsupported_reason);
        }
        false
    }

    /// Returns `false` when install is unsupported or a job is already running.
    /// Called from a status listener, the job is queued behind the current
    /// round of notifications.
    pub fn install(&self) -> bool {
        self.start_job(JobKind::Install)
    }

    /// Returns `false` when install is unsupported or a job is already running.
    pub fn update(&self) -> bool {
        self.start_job(JobKind::Update)
    }

    pub fn cancel_install_or_update(&self) -> bool {
        match self.active_job().as_ref() {
            Some(active) => {
                info!(job_id = %active.id, "Cancelling managed Cloud SDK {}", active.kind);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_up_to_date(&self) -> bool {
        let Some(sdk) = self.inner.sdk.as_ref() else {
            return false;
        };
        match sdk.is_up_to_date().await {
            Ok(up_to_date) => up_to_date,
            Err(err) => {
                debug!("Unable to check managed Cloud SDK freshness: {}", err);
                false
            }
        }
    }

    pub async fn sdk_version(&self) -> Option<String> {
        let sdk = self.inner.sdk.as_ref()?;
        match sdk.version().await {
            Ok(version) => Some(version),
            Err(err) => {
                debug!("Unable to read managed Cloud SDK version: {}", err);
                None
            }
        }
    }

    pub fn status(&self) -> SdkStatus {
        self.state().status
    }

    /// Only exposed while `Ready`.
    pub fn sdk_home_path(&self) -> Option<PathBuf> {
        if self.status() != SdkStatus::Ready {
            return None;
        }
        self.inner.sdk.as_ref().map(|sdk| sdk.sdk_home())
    }

    pub fn is_install_supported(&self) -> bool {
        self.inner.sdk.is_some()
    }

    pub fn is_job_running(&self) -> bool {
        self.active_job().is_some()
    }

    pub fn running_job_kind(&self) -> Option<JobKind> {
        self.active_job().as_ref().map(|active| active.kind)
    }

    pub fn last_job(&self) -> Option<LastJob> {
        self.state().last_job.clone()
    }

    pub fn was_last_job_cancelled(&self) -> bool {
        matches!(
            self.state().last_job,
            Some(LastJob {
                outcome: LastJobOutcome::Cancelled,
                ..
            })
        )
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusUpdateListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.state().listeners.push((id, listener));
        id
    }

    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state();
        let before = state.listeners.len();
        state.listeners.retain(|(listener_id, _)| *listener_id != id);
        state.listeners.len() != before
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.inner.coordinator
    }

    pub fn write_lock(&self) -> &SdkWriteLock {
        &self.inner.write_lock
    }

    pub fn notifier(&self) -> &Arc<dyn SdkNotifier> {
        &self.inner.notifier
    }

    pub fn runtime(&self) -> &Handle {
        self.inner.runner.runtime()
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active_job(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.inner
            .active_job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_job(&self, kind: JobKind) -> bool {
        let Some(sdk) = self.inner.sdk.clone() else {
            debug!("Managed Cloud SDK {} requested on an unsupported platform", kind);
            return false;
        };

        if self.is_dispatching() {
            if self.is_job_running() {
                return false;
            }
            debug!("Managed Cloud SDK {} requested by a status listener; queueing", kind);
            let this = self.clone();
            self.inner.coordinator.invoke_later(move || {
                this.start_job(kind);
            });
            return true;
        }

        let job = SdkJob::new(kind);
        {
            let mut slot = self.active_job();
            if let Some(active) = slot.as_ref() {
                debug!(
                    "Managed Cloud SDK {} requested while {} {} is running; ignoring",
                    kind, active.kind, active.id
                );
                return false;
            }
            *slot = Some(ActiveJob {
                id: job.id(),
                kind,
                cancel: job.cancel_handle(),
            });
        }

        // Queued before the job exists, so its completion cannot overtake it.
        let this = self.clone();
        self.inner
            .coordinator
            .invoke(move || this.apply_event(StatusEvent::JobStarted));

        info!(job_id = %job.id(), "Starting managed Cloud SDK {}", kind);
        let flow = JobFlow {
            sdk,
            write_lock: self.inner.write_lock.clone(),
            notifier: Arc::clone(&self.inner.notifier),
            components: self.inner.components.clone(),
        };
        let job_id = job.id();
        let this = self.clone();
        self.inner.runner.spawn(
            &job,
            move |token| async move { flow.run(kind, token).await },
            move |outcome| async move { this.complete_job(job_id, kind, outcome).await },
        );
        true
    }

    async fn complete_job(self, job_id: Uuid, kind: JobKind, outcome: JobOutcome<JobResult>) {
        let prior_install_valid = match (&outcome, kind) {
            (JobOutcome::Completed(_), _) | (_, JobKind::Install) => false,
            (_, JobKind::Update) => self.revalidate_after_failed_update().await,
        };
        let coordinator = self.inner.coordinator.clone();
        coordinator.invoke(move || self.finish_job(job_id, kind, outcome, prior_install_valid));
    }

    async fn revalidate_after_failed_update(&self) -> bool {
        let Some(sdk) = self.inner.sdk.as_ref() else {
            return false;
        };
        match sdk.is_installed().await {
            Ok(installed) => installed,
            Err(err) => {
                debug!("Managed Cloud SDK invalid after failed update: {}", err);
                false
            }
        }
    }

    fn finish_job(
        &self,
        job_id: Uuid,
        kind: JobKind,
        outcome: JobOutcome<JobResult>,
        prior_install_valid: bool,
    ) {
        {
            let mut slot = self.active_job();
            if slot.as_ref().is_some_and(|active| active.id == job_id) {
                *slot = None;
            }
        }

        let (event, last_outcome) = match &outcome {
            JobOutcome::Completed(result) => {
                info!(job_id = %job_id, "Managed Cloud SDK {} finished: {:?}", kind, result);
                (StatusEvent::JobSucceeded, LastJobOutcome::Succeeded(*result))
            }
            JobOutcome::Cancelled => {
                info!(job_id = %job_id, "Managed Cloud SDK {} cancelled by user", kind);
                (
                    failure_event(kind, prior_install_valid),
                    LastJobOutcome::Cancelled,
                )
            }
            JobOutcome::Failed(err) => {
                warn!(job_id = %job_id, "Managed Cloud SDK {} failed: {}", kind, err);
                (
                    failure_event(kind, prior_install_valid),
                    LastJobOutcome::Failed(err.to_string()),
                )
            }
        };

        self.state().last_job = Some(LastJob {
            id: job_id,
            kind,
            outcome: last_outcome,
            finished_at_millis: csdk_util::now_millis(),
        });
        self.apply_event(event);

        let notifier = &self.inner.notifier;
        let tracker = &self.inner.tracker;
        match outcome {
            JobOutcome::Completed(result) => {
                if result == JobResult::Processed {
                    tracker.track(succeeded_event(kind), &[]);
                }
                notifier.notify_job_success(kind, result);
            }
            JobOutcome::Cancelled => {
                tracker.track(cancelled_event(kind), &[]);
                notifier.notify_job_cancelled(kind);
            }
            JobOutcome::Failed(err) => {
                let message = err.to_string();
                tracker.track(failed_event(kind), &[(METADATA_MESSAGE_KEY, &message)]);
                notifier.notify_job_failure(kind, &message);
            }
        }
    }

    /// True only on the coordination thread while listeners are running.
    fn is_dispatching(&self) -> bool {
        self.inner.coordinator.is_current() && self.state().dispatching
    }

    /// Applies `event` and notifies listeners. Runs on the coordination thread.
    /// Events raised by a listener are applied after every listener has seen
    /// the current status.
    fn apply_event(&self, event: StatusEvent) {
        let (status, listeners) = {
            let mut state = self.state();
            if state.dispatching {
                let this = self.clone();
                self.inner
                    .coordinator
                    .invoke_later(move || this.apply_event(event));
                return;
            }
            match next_status(state.status, event) {
                Ok(next) => {
                    state.status = next;
                    state.dispatching = true;
                    (next, state.listeners.clone())
                }
                Err(err) => {
                    warn!("{}", err);
                    return;
                }
            }
        };
        debug!("Managed Cloud SDK status is now {}", status);

        for (id, listener) in listeners {
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                listener.on_sdk_status_change(self, status)
            }));
            if let Err(panic) = delivered {
                error!(
                    "Status listener {:?} panicked on {}: {}",
                    id,
                    status,
                    panic_message(&*panic)
                );
            }
        }
        self.state().dispatching = false;
    }
}

/// The install/update body, run off the coordination thread.
struct JobFlow {
    sdk: Arc<dyn ManagedSdk>,
    write_lock: SdkWriteLock,
    notifier: Arc<dyn SdkNotifier>,
    components: Vec<String>,
}

impl JobFlow {
    async fn run(self, kind: JobKind, token: CancelToken) -> Result<JobResult, SdkError> {
        let result = match kind {
            JobKind::Install => self.install(&token).await?,
            JobKind::Update => self.update(&token).await?,
        };
        token.check()?;
        if !self.sdk.is_installed().await? {
            return Err(SdkError::NotInstalled(self.sdk.sdk_home()));
        }
        Ok(result)
    }

    async fn install(&self, token: &CancelToken) -> Result<JobResult, SdkError> {
        token.check()?;
        let mut result = JobResult::UpToDate;

        if !self.safe_check(self.sdk.is_installed()).await? {
            let progress = self.progress("Installing Google Cloud SDK");
            self.with_write_lock(token, self.sdk.install(progress.listener(), console()))
                .await?;
            result = result.combine(JobResult::Processed);
        }

        for component in &self.components {
            token.check()?;
            if self.safe_check(self.sdk.has_component(component)).await? {
                continue;
            }
            let progress = self.progress(&format!("Installing Cloud SDK component {component}"));
            self.with_write_lock(
                token,
                self.sdk
                    .install_component(component, progress.listener(), console()),
            )
            .await?;
            result = result.combine(JobResult::Processed);
        }
        Ok(result)
    }

    async fn update(&self, token: &CancelToken) -> Result<JobResult, SdkError> {
        token.check()?;
        if !self.safe_check(self.sdk.is_installed()).await? {
            debug!("Managed Cloud SDK not installed; nothing to update");
            return Ok(JobResult::UpToDate);
        }
        if self.safe_check(self.sdk.is_up_to_date()).await? {
            return Ok(JobResult::UpToDate);
        }

        token.check()?;
        let progress = self.progress("Updating Google Cloud SDK");
        self.with_write_lock(token, self.sdk.update(progress.listener(), console()))
            .await?;
        Ok(JobResult::Processed)
    }

    /// Verification failures mean the install must be redone, not that the
    /// job failed.
    async fn safe_check(&self, check: SdkFuture<'_, bool>) -> Result<bool, SdkError> {
        match check.await {
            Ok(value) => Ok(value),
            Err(err) if err.is_recoverable_check() => {
                warn!("Managed Cloud SDK check failed, will re-install: {}", err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn with_write_lock<T>(
        &self,
        token: &CancelToken,
        op: SdkFuture<'_, T>,
    ) -> Result<T, SdkError> {
        token.check()?;
        let _guard = self.lock(token).await?;
        token.check()?;
        op.await
    }

    async fn lock(&self, token: &CancelToken) -> Result<SdkWriteGuard, SdkError> {
        if let Some(guard) = self.write_lock.try_acquire() {
            return Ok(guard);
        }
        let waiting = self.progress(LOCK_WAIT_TITLE);
        waiting.0.start(LOCK_WAIT_MESSAGE, UNKNOWN);
        self.write_lock.acquire_interruptibly(token).await
    }

    fn progress(&self, title: &str) -> ProgressDone {
        ProgressDone(self.notifier.create_progress_listener(title))
    }
}

fn console() -> Arc<dyn ConsoleListener> {
    Arc::new(TracingConsole)
}

/// Calls `done()` on the wrapped listener when the phase ends, however it ends.
struct ProgressDone(Arc<dyn ProgressListener>);

impl ProgressDone {
    fn listener(&self) -> Arc<dyn ProgressListener> {
        Arc::clone(&self.0)
    }
}

impl Drop for ProgressDone {
    fn drop(&mut self) {
        self.0.done();
    }
}
