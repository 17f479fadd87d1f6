#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{mpsc, Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use futures_util::{future, FutureExt};
use tokio::{
    runtime::{Builder, Runtime},
    sync::Semaphore,
};

use csdk_core::{
    Coordinator, ConsoleListener, ManagedSdk, ManagedSdkService, ProgressListener, SdkError,
    SdkFuture, SdkNotifier, SdkServiceManager, SdkStatus, SdkWriteLock, Severity, StatusHandler,
    UsageTracker, APP_ENGINE_JAVA,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted SDK state; tests flip these to steer the service.
#[derive(Debug, Default, Clone)]
pub struct FakeState {
    pub installed: bool,
    pub up_to_date: bool,
    pub components: BTreeSet<String>,
    /// `is_installed` fails verification this many times before answering.
    pub verification_failures: usize,
    pub install_error: Option<String>,
    pub update_error: Option<String>,
    /// A failed update also wipes the installation.
    pub update_removes_install: bool,
    /// Install "succeeds" without leaving anything on disk.
    pub install_is_noop: bool,
    pub install_calls: usize,
    pub component_calls: usize,
    pub update_calls: usize,
    /// Mutations observed while the write lock was free.
    pub unlocked_mutations: usize,
}

impl FakeState {
    pub fn not_installed() -> Self {
        Self::default()
    }

    pub fn ready() -> Self {
        Self {
            installed: true,
            up_to_date: true,
            components: [APP_ENGINE_JAVA.to_string()].into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn stale() -> Self {
        Self {
            up_to_date: false,
            ..Self::ready()
        }
    }
}

/// Holds a job inside `install`/`update` until the test opens it.
pub struct Gate {
    entered_tx: Mutex<mpsc::Sender<&'static str>>,
    entered_rx: Mutex<mpsc::Receiver<&'static str>>,
    release: Semaphore,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        let (entered_tx, entered_rx) = mpsc::channel();
        Arc::new(Self {
            entered_tx: Mutex::new(entered_tx),
            entered_rx: Mutex::new(entered_rx),
            release: Semaphore::new(0),
        })
    }

    async fn pass(&self, step: &'static str) {
        let _ = self.entered_tx.lock().unwrap().send(step);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }

    pub fn wait_entered(&self) -> &'static str {
        self.entered_rx
            .lock()
            .unwrap()
            .recv_timeout(TIMEOUT)
            .expect("job never reached the gate")
    }

    pub fn open(&self) {
        self.release.add_permits(1);
    }
}

pub struct FakeSdk {
    home: PathBuf,
    state: Mutex<FakeState>,
    gate: Option<Arc<Gate>>,
    lock: SdkWriteLock,
}

impl FakeSdk {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn note_mutation(&self, state: &mut FakeState) {
        if !self.lock.is_locked() {
            state.unlocked_mutations += 1;
        }
    }
}

impl ManagedSdk for FakeSdk {
    fn sdk_home(&self) -> PathBuf {
        self.home.clone()
    }

    fn is_installed(&self) -> SdkFuture<'_, bool> {
        let result = {
            let mut state = self.state();
            if state.verification_failures > 0 {
                state.verification_failures -= 1;
                Err(SdkError::Verification("gcloud version exited with 1".into()))
            } else {
                Ok(state.installed)
            }
        };
        future::ready(result).boxed()
    }

    fn is_up_to_date(&self) -> SdkFuture<'_, bool> {
        let state = self.state();
        let result = if state.installed {
            Ok(state.up_to_date)
        } else {
            Err(SdkError::NotInstalled(self.home.clone()))
        };
        future::ready(result).boxed()
    }

    fn has_component<'a>(&'a self, component: &'a str) -> SdkFuture<'a, bool> {
        future::ready(Ok(self.state().components.contains(component))).boxed()
    }

    fn version(&self) -> SdkFuture<'_, String> {
        future::ready(Ok("470.0.0".to_string())).boxed()
    }

    fn install(
        &self,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'_, ()> {
        async move {
            progress.start("Installing fake SDK", 2);
            if let Some(gate) = &self.gate {
                gate.pass("install").await;
            }
            console.console("installing");
            let mut state = self.state();
            state.install_calls += 1;
            self.note_mutation(&mut state);
            if let Some(err) = state.install_error.clone() {
                return Err(SdkError::command("install.sh", err));
            }
            if !state.install_is_noop {
                state.installed = true;
                state.up_to_date = true;
            }
            progress.update(2);
            Ok(())
        }
        .boxed()
    }

    fn install_component<'a>(
        &'a self,
        component: &'a str,
        _progress: Arc<dyn ProgressListener>,
        _console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'a, ()> {
        async move {
            let mut state = self.state();
            state.component_calls += 1;
            self.note_mutation(&mut state);
            state.components.insert(component.to_string());
            Ok(())
        }
        .boxed()
    }

    fn update(
        &self,
        _progress: Arc<dyn ProgressListener>,
        _console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'_, ()> {
        async move {
            if let Some(gate) = &self.gate {
                gate.pass("update").await;
            }
            let mut state = self.state();
            state.update_calls += 1;
            self.note_mutation(&mut state);
            if let Some(err) = state.update_error.clone() {
                if state.update_removes_install {
                    state.installed = false;
                }
                return Err(SdkError::command("gcloud components update", err));
            }
            state.up_to_date = true;
            Ok(())
        }
        .boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started { title: String, message: String },
    Done { title: String },
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<(String, Severity)>>,
    progress: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<(String, Severity)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<String> {
        self.notifications()
            .into_iter()
            .filter(|(_, s)| *s == severity)
            .map(|(message, _)| message)
            .collect()
    }

    pub fn progress(&self) -> Vec<ProgressEvent> {
        self.progress.lock().unwrap().clone()
    }

    pub fn started(&self, message: &str) -> bool {
        self.progress()
            .iter()
            .any(|event| matches!(event, ProgressEvent::Started { message: m, .. } if m == message))
    }

    pub fn done_count(&self, title: &str) -> usize {
        self.progress()
            .iter()
            .filter(|event| matches!(event, ProgressEvent::Done { title: t } if t == title))
            .count()
    }
}

impl SdkNotifier for RecordingNotifier {
    fn show_notification(&self, message: &str, severity: Severity) {
        self.notifications
            .lock()
            .unwrap()
            .push((message.to_string(), severity));
    }

    fn create_progress_listener(&self, title: &str) -> Arc<dyn ProgressListener> {
        Arc::new(RecordingProgress {
            title: title.to_string(),
            events: Arc::clone(&self.progress),
        })
    }
}

struct RecordingProgress {
    title: String,
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl ProgressListener for RecordingProgress {
    fn start(&self, message: &str, _total_units: i64) {
        self.events.lock().unwrap().push(ProgressEvent::Started {
            title: self.title.clone(),
            message: message.to_string(),
        });
    }

    fn update(&self, _units: i64) {}

    fn update_message(&self, _message: &str) {}

    fn done(&self) {
        self.events.lock().unwrap().push(ProgressEvent::Done {
            title: self.title.clone(),
        });
    }
}

#[derive(Default)]
pub struct RecordingTracker {
    events: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl RecordingTracker {
    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn metadata(&self, event: &str) -> Option<Vec<(String, String)>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, metadata)| metadata.clone())
    }
}

impl UsageTracker for RecordingTracker {
    fn track(&self, event: &str, metadata: &[(&str, &str)]) {
        let metadata = metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.events
            .lock()
            .unwrap()
            .push((event.to_string(), metadata));
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    errors: Mutex<Vec<(SdkStatus, String)>>,
}

impl RecordingHandler {
    pub fn errors(&self) -> Vec<(SdkStatus, String)> {
        self.errors.lock().unwrap().clone()
    }
}

impl StatusHandler for RecordingHandler {
    fn on_error(&self, status: SdkStatus, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((status, message.to_string()));
    }
}

/// A real service wired to a [`FakeSdk`], with every status change recorded.
pub struct Harness {
    pub runtime: Runtime,
    pub coordinator: Coordinator,
    pub lock: SdkWriteLock,
    pub sdk: Arc<FakeSdk>,
    pub notifier: Arc<RecordingNotifier>,
    pub tracker: Arc<RecordingTracker>,
    pub service: ManagedSdkService,
    statuses: Mutex<mpsc::Receiver<SdkStatus>>,
}

impl Harness {
    pub fn new(state: FakeState) -> Self {
        Self::build(state, None, true)
    }

    pub fn gated(state: FakeState) -> (Self, Arc<Gate>) {
        let gate = Gate::new();
        (Self::build(state, Some(Arc::clone(&gate)), true), gate)
    }

    pub fn unsupported() -> Self {
        Self::build(FakeState::default(), None, false)
    }

    fn build(state: FakeState, gate: Option<Arc<Gate>>, supported: bool) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let coordinator = Coordinator::spawn("test-coordinator").unwrap();
        let lock = SdkWriteLock::new();
        let sdk = Arc::new(FakeSdk {
            home: PathBuf::from("/fake/google-cloud-sdk"),
            state: Mutex::new(state),
            gate,
            lock: lock.clone(),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = Arc::new(RecordingTracker::default());

        let builder = ManagedSdkService::builder(coordinator.clone(), runtime.handle().clone())
            .write_lock(lock.clone())
            .notifier(notifier.clone())
            .tracker(tracker.clone());
        let builder = if supported {
            builder.sdk(sdk.clone())
        } else {
            builder.unsupported("solaris/sparc64")
        };
        let service = builder.build();

        let (tx, rx) = mpsc::channel();
        service.add_status_listener(Arc::new(
            move |_: &ManagedSdkService, status: SdkStatus| {
                let _ = tx.send(status);
            },
        ));

        Self {
            runtime,
            coordinator,
            lock,
            sdk,
            notifier,
            tracker,
            service,
            statuses: Mutex::new(rx),
        }
    }

    pub fn manager(&self) -> SdkServiceManager {
        SdkServiceManager::new(self.service.clone())
    }

    pub fn next_status(&self) -> SdkStatus {
        self.statuses
            .lock()
            .unwrap()
            .recv_timeout(TIMEOUT)
            .expect("no status change")
    }

    pub fn expect_statuses(&self, expected: &[SdkStatus]) {
        let seen: Vec<_> = expected.iter().map(|_| self.next_status()).collect();
        assert_eq!(seen, expected);
    }

    pub fn no_more_statuses(&self) -> bool {
        self.statuses
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_millis(100))
            .is_err()
    }

    /// Waits until everything queued on the coordination thread has run.
    pub fn drain(&self) {
        self.coordinator.invoke_and_wait(|| ()).expect("coordinator stopped");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
