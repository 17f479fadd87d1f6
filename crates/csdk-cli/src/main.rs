use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use csdk_core::gcloud::gcloud_executable;
use csdk_core::{
    Coordinator, GcloudOptions, GcloudSdk, LogStatusHandler, ManagedSdk, ManagedSdkService,
    SdkServiceManager, SdkSettings, SdkStatus, SdkWriteLock, SettingsStore, TelemetryTracker,
};
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "csdk", version, about = "Managed Google Cloud SDK")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show the managed SDK installation and settings
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Install the SDK and its required components
    Install,
    /// Update an installed SDK to the latest release
    Update,
    /// Report whether an update is available
    CheckUpdate,
    /// Run gcloud from the managed SDK, installing it first when needed
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Keep the SDK installed and apply updates until interrupted
    Watch,
    /// Persisted settings
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    /// Print the stored settings and their effective values
    Show,
    /// Change one setting (sdk_root, automatic_updates)
    Set { key: String, value: String },
}

fn gcloud_options() -> GcloudOptions {
    GcloudOptions {
        version: env_value("CSDK_SDK_VERSION"),
        archive_url: env_value("CSDK_SDK_ARCHIVE_URL"),
        archive_sha256: env_value("CSDK_SDK_ARCHIVE_SHA256"),
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Serialize)]
struct StatusReport {
    sdk_root: PathBuf,
    sdk_home: Option<PathBuf>,
    supported: bool,
    installed: bool,
    version: Option<String>,
    automatic_updates: bool,
    last_automatic_update_millis: Option<i64>,
    locked: bool,
    telemetry: bool,
}

struct App {
    settings: Arc<SettingsStore>,
    sdk_root: PathBuf,
    sdk: Option<Arc<GcloudSdk>>,
    manager: SdkServiceManager,
}

impl App {
    fn build(settings: Arc<SettingsStore>) -> Result<Self, Box<dyn std::error::Error>> {
        let sdk_root = settings.get().effective_sdk_root();
        let coordinator = Coordinator::spawn("csdk-coordinator")?;
        let lock = SdkWriteLock::with_lock_file(sdk_root.join(".csdk.lock"));

        let (sdk, probe) = match GcloudSdk::for_host(&sdk_root, gcloud_options()) {
            Ok(sdk) => {
                let sdk = Arc::new(sdk);
                (Some(Arc::clone(&sdk)), Ok(sdk as Arc<dyn ManagedSdk>))
            }
            Err(err) => (None, Err(err)),
        };
        let service = ManagedSdkService::builder(coordinator, tokio::runtime::Handle::current())
            .sdk_result(probe)
            .write_lock(lock)
            .tracker(Arc::new(TelemetryTracker))
            .build();

        Ok(Self {
            settings,
            sdk_root,
            sdk,
            manager: SdkServiceManager::new(service),
        })
    }

    fn service(&self) -> &ManagedSdkService {
        self.manager.service()
    }

    async fn run(&self, cmd: Cmd) -> Result<i32, Box<dyn std::error::Error>> {
        match cmd {
            Cmd::Status { json } => {
                let report = self.status_report().await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_report(&report);
                }
                Ok(0)
            }
            Cmd::Install => {
                if !self.service().is_install_supported() {
                    self.service().activate();
                    return Ok(1);
                }
                self.service().install();
                Ok(exit_code(self.wait_for_job().await))
            }
            Cmd::Update => {
                if !self.service().update() {
                    eprintln!("update not started");
                    return Ok(1);
                }
                Ok(exit_code(self.wait_for_job().await))
            }
            Cmd::CheckUpdate => {
                let Some(sdk) = self.sdk.as_ref() else {
                    eprintln!("managed Cloud SDK is not supported on this platform");
                    return Ok(1);
                };
                if !sdk.is_installed().await.unwrap_or(false) {
                    eprintln!("managed Cloud SDK is not installed");
                    return Ok(1);
                }
                let up_to_date = self.service().is_up_to_date().await;
                println!("up_to_date={up_to_date}");
                Ok(if up_to_date { 0 } else { 2 })
            }
            Cmd::Run { args } => {
                if !self.wait_for_job().await {
                    return Ok(1);
                }
                let Some(home) = self.service().sdk_home_path() else {
                    return Ok(1);
                };
                let _guard = self.service().write_lock().acquire().await;
                let status = Command::new(gcloud_executable(&home))
                    .args(&args)
                    .status()
                    .await?;
                Ok(status.code().unwrap_or(1))
            }
            Cmd::Watch => self.watch().await,
            Cmd::Settings { cmd } => {
                match cmd {
                    SettingsCmd::Show => print_settings(&self.settings, &self.settings.get()),
                    SettingsCmd::Set { key, value } => {
                        let updated = self.settings.update(|current| current.set(&key, &value))?;
                        print_settings(&self.settings, &updated);
                    }
                }
                Ok(0)
            }
        }
    }

    /// Waits for the SDK to settle, starting an install when nothing is
    /// running. Ctrl-C cancels the job and keeps waiting for it to wind down.
    async fn wait_for_job(&self) -> bool {
        let handler = LogStatusHandler;
        let wait = self.manager.wait_until_sdk_ready(&handler);
        tokio::pin!(wait);
        tokio::select! {
            ready = &mut wait => return ready,
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() && self.service().cancel_install_or_update() {
                    eprintln!("cancelling...");
                }
            }
        }
        wait.await
    }

    async fn watch(&self) -> Result<i32, Box<dyn std::error::Error>> {
        if !self.service().activate() {
            return Ok(1);
        }
        let scheduler =
            csdk_core::SdkUpdateScheduler::new(self.service().clone(), Arc::clone(&self.settings));
        if !scheduler.activate() {
            info!("Automatic updates are disabled");
        }
        let handler = LogStatusHandler;
        tokio::select! {
            ready = self.manager.wait_until_sdk_ready(&handler) => {
                if !ready {
                    warn!("Managed Cloud SDK is not ready; waiting for scheduled updates");
                }
                tokio::signal::ctrl_c().await?;
            }
            signal = tokio::signal::ctrl_c() => signal?,
        }
        scheduler.stop();
        self.service().cancel_install_or_update();
        Ok(0)
    }

    async fn status_report(&self) -> StatusReport {
        let settings = self.settings.get();
        let (installed, version, home) = match self.sdk.as_ref() {
            Some(sdk) => {
                let installed = sdk.is_installed().await.unwrap_or(false);
                let version = if installed {
                    self.service().sdk_version().await
                } else {
                    None
                };
                (installed, version, installed.then(|| sdk.sdk_home()))
            }
            None => (false, None, None),
        };
        StatusReport {
            sdk_root: self.sdk_root.clone(),
            sdk_home: home,
            supported: self.service().is_install_supported(),
            installed,
            version,
            automatic_updates: settings.effective_automatic_updates(),
            last_automatic_update_millis: settings.last_automatic_update_millis,
            locked: self.service().write_lock().is_locked(),
            telemetry: csdk_telemetry::global()
                .map(|telemetry| telemetry.usage_enabled())
                .unwrap_or(false),
        }
    }

    fn shutdown(&self) {
        self.service().coordinator().shutdown();
    }
}

fn print_report(report: &StatusReport) {
    let status = if report.installed {
        SdkStatus::Ready
    } else {
        SdkStatus::NotAvailable
    };
    println!("status={status}");
    println!("sdk_root={}", report.sdk_root.display());
    if let Some(home) = &report.sdk_home {
        println!("sdk_home={}", home.display());
    }
    println!("version={}", report.version.as_deref().unwrap_or("-"));
    println!("automatic_updates={}", report.automatic_updates);
    if let Some(last) = report.last_automatic_update_millis {
        println!("last_automatic_update_millis={last}");
    }
    println!("locked={}", report.locked);
    println!("telemetry={}", report.telemetry);
}

fn print_settings(store: &SettingsStore, settings: &SdkSettings) {
    println!("file={}", store.path().display());
    println!(
        "sdk_root={}\teffective={}",
        settings
            .sdk_root
            .as_ref()
            .map(|root| root.display().to_string())
            .unwrap_or_default(),
        settings.effective_sdk_root().display()
    );
    println!(
        "automatic_updates={}\teffective={}",
        settings.automatic_updates,
        settings.effective_automatic_updates()
    );
}

fn exit_code(ready: bool) -> i32 {
    if ready {
        0
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    csdk_util::init_tracing()?;
    csdk_util::init_app_telemetry("csdk", env!("CARGO_PKG_VERSION"));
    let cli = Cli::parse();
    let settings = Arc::new(SettingsStore::open_default());

    let app = App::build(settings)?;
    let code = app.run(cli.cmd).await;
    app.shutdown();
    let code = code?;

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
