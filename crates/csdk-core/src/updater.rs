//! Periodic background updates of the managed SDK.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tracing::{debug, info};

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::service::{LastJobOutcome, ListenerId, ManagedSdkService};
use crate::settings::SettingsStore;
use crate::status::{JobKind, JobResult, SdkStatus};

pub const SDK_UPDATE_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24 * 7);
pub const UPDATE_NOTIFICATION_GRACE: Duration = Duration::from_secs(20);

/// Delay before the first check: a full interval after the last update,
/// immediately if that is already in the past.
pub fn delay_before_first_update(
    now_millis: i64,
    last_update_millis: Option<i64>,
    interval: Duration,
) -> Duration {
    let interval_millis = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    let Some(last) = last_update_millis else {
        return interval;
    };
    let remaining = interval_millis
        .saturating_sub(now_millis.saturating_sub(last))
        .clamp(0, interval_millis);
    Duration::from_millis(remaining as u64)
}

pub struct SdkUpdateScheduler {
    service: ManagedSdkService,
    settings: Arc<SettingsStore>,
    interval: Duration,
    grace: Duration,
    schedule: Mutex<Option<CancelHandle>>,
    listener: Mutex<Option<ListenerId>>,
}

impl SdkUpdateScheduler {
    pub fn new(service: ManagedSdkService, settings: Arc<SettingsStore>) -> Self {
        Self {
            service,
            settings,
            interval: SDK_UPDATE_INTERVAL,
            grace: UPDATE_NOTIFICATION_GRACE,
            schedule: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn with_timing(mut self, interval: Duration, grace: Duration) -> Self {
        self.interval = interval;
        self.grace = grace;
        self
    }

    /// Starts (or restarts) the schedule. Returns `false` when automatic
    /// updates are turned off.
    pub fn activate(&self) -> bool {
        if !self.settings.get().effective_automatic_updates() {
            debug!("Automatic Cloud SDK updates disabled");
            return false;
        }
        self.register_completion_listener();

        let first_delay = delay_before_first_update(
            csdk_util::now_millis(),
            self.settings.get().last_automatic_update_millis,
            self.interval,
        );
        let (cancel, token) = cancel_pair();
        if let Some(previous) = lock(&self.schedule).replace(cancel) {
            previous.cancel();
        }

        info!(
            "Next managed Cloud SDK update check in {}s",
            first_delay.as_secs()
        );
        self.service.runtime().spawn(run_schedule(
            self.service.clone(),
            self.interval,
            self.grace,
            first_delay,
            token,
        ));
        true
    }

    pub fn is_active(&self) -> bool {
        lock(&self.schedule)
            .as_ref()
            .is_some_and(|cancel| !cancel.is_cancelled())
    }

    pub fn stop(&self) {
        if let Some(cancel) = lock(&self.schedule).take() {
            cancel.cancel();
        }
        if let Some(id) = lock(&self.listener).take() {
            self.service.remove_status_listener(id);
        }
    }

    pub fn disable_automatic_updates(&self) {
        self.stop();
        self.settings
            .update_best_effort(|settings| settings.automatic_updates = false);
        info!("Automatic Cloud SDK updates disabled");
    }

    fn register_completion_listener(&self) {
        let mut listener = lock(&self.listener);
        if listener.is_some() {
            return;
        }
        let settings = Arc::clone(&self.settings);
        let id = self.service.add_status_listener(Arc::new(
            move |service: &ManagedSdkService, status: SdkStatus| {
                if status != SdkStatus::Ready {
                    return;
                }
                // Only an update that changed the installation counts.
                if let Some(last) = service.last_job() {
                    if last.kind == JobKind::Update
                        && last.outcome == LastJobOutcome::Succeeded(JobResult::Processed)
                    {
                        settings.record_automatic_update(last.finished_at_millis);
                    }
                }
            },
        ));
        *listener = Some(id);
    }
}

impl Drop for SdkUpdateScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_schedule(
    service: ManagedSdkService,
    interval: Duration,
    grace: Duration,
    first_delay: Duration,
    token: CancelToken,
) {
    if !sleep_unless_cancelled(first_delay, &token).await {
        return;
    }
    loop {
        if !update_if_stale(&service, grace, &token).await {
            return;
        }
        if !sleep_unless_cancelled(interval, &token).await {
            return;
        }
    }
}

async fn sleep_unless_cancelled(delay: Duration, token: &CancelToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Returns `false` once the schedule is cancelled.
async fn update_if_stale(service: &ManagedSdkService, grace: Duration, token: &CancelToken) -> bool {
    if service.is_job_running() || !matches!(service.status(), SdkStatus::Ready | SdkStatus::Invalid) {
        debug!("Skipping Cloud SDK update check while {}", service.status());
        return true;
    }
    if service.is_up_to_date().await {
        debug!("Managed Cloud SDK is up to date");
        return true;
    }

    service.notifier().notify_update_pending(grace);
    if !sleep_unless_cancelled(grace, token).await {
        return false;
    }
    let target = service.clone();
    service.coordinator().invoke(move || {
        if !target.update() {
            debug!("Cloud SDK update not started; another job is running");
        }
    });
    true
}
