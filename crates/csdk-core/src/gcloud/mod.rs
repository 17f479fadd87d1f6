//! [`ManagedSdk`] backed by a Google Cloud CLI installation that this crate
//! downloads and maintains itself.

mod archive;
mod process;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::FutureExt;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

pub use archive::{archive_file_name, SdkArchive, DOWNLOAD_BASE_URL};

use crate::error::SdkError;
use crate::progress::{new_child, ConsoleListener, ProgressListener, UNKNOWN};
use crate::sdk::{ManagedSdk, SdkFuture};

const SDK_DIR_NAME: &str = "google-cloud-sdk";
const VERSION_KEY: &str = "Google Cloud SDK";
const INSTALLER_ARGS: [&str; 4] = [
    "--usage-reporting=false",
    "--path-update=false",
    "--command-completion=false",
    "--quiet",
];

const DOWNLOAD_UNITS: i64 = 60;
const EXTRACT_UNITS: i64 = 15;
const INSTALLER_UNITS: i64 = 25;

#[derive(Clone, Debug, Default)]
pub struct GcloudOptions {
    /// Pin to this SDK version instead of following the release channel.
    pub version: Option<String>,
    /// Mirror or local archive replacing the default download URL.
    pub archive_url: Option<String>,
    pub archive_sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ComponentInfo {
    id: String,
    state: ComponentState,
}

#[derive(Debug, Deserialize)]
struct ComponentState {
    name: String,
}

impl ComponentInfo {
    fn is_installed(&self) -> bool {
        self.state.name != "Not Installed"
    }

    fn has_update(&self) -> bool {
        self.state.name == "Update Available"
    }
}

#[derive(Debug, Clone)]
pub struct GcloudSdk {
    root: PathBuf,
    home: PathBuf,
    archive: SdkArchive,
    version: Option<String>,
    windows: bool,
}

impl GcloudSdk {
    pub fn for_host(root: impl Into<PathBuf>, options: GcloudOptions) -> Result<Self, SdkError> {
        Self::for_platform(root, std::env::consts::OS, std::env::consts::ARCH, options)
    }

    pub fn for_platform(
        root: impl Into<PathBuf>,
        os: &str,
        arch: &str,
        options: GcloudOptions,
    ) -> Result<Self, SdkError> {
        let file_name = archive_file_name(os, arch, options.version.as_deref())?;
        let root = root.into();
        Ok(Self {
            home: root.join(SDK_DIR_NAME),
            archive: SdkArchive {
                url: options
                    .archive_url
                    .unwrap_or_else(|| format!("{DOWNLOAD_BASE_URL}/{file_name}")),
                sha256: options.archive_sha256,
            },
            version: options.version,
            windows: os == "windows",
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive(&self) -> &SdkArchive {
        &self.archive
    }

    pub fn gcloud_path(&self) -> PathBuf {
        executable_in(&self.home, self.windows)
    }

    fn gcloud(&self) -> Command {
        let mut cmd = Command::new(self.gcloud_path());
        cmd.env("CLOUDSDK_CORE_DISABLE_PROMPTS", "1");
        cmd
    }

    fn installer(&self) -> Command {
        let mut cmd = if self.windows {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(self.home.join("install.bat"));
            cmd
        } else {
            Command::new(self.home.join("install.sh"))
        };
        cmd.args(INSTALLER_ARGS)
            .env("CLOUDSDK_CORE_DISABLE_PROMPTS", "1");
        cmd
    }

    async fn installed_version(&self) -> Result<String, SdkError> {
        let mut cmd = self.gcloud();
        cmd.args(["version", "--format=json"]);
        let out = process::run_captured(cmd, "gcloud version").await?;
        parse_version(&out)
    }

    async fn components(&self) -> Result<Vec<ComponentInfo>, SdkError> {
        let mut cmd = self.gcloud();
        cmd.args(["components", "list", "--format=json"]);
        let out = process::run_captured(cmd, "gcloud components list").await?;
        Ok(serde_json::from_str(&out)?)
    }

    async fn check_installed(&self) -> Result<bool, SdkError> {
        if !self.home.is_dir() || !self.gcloud_path().is_file() {
            return Ok(false);
        }
        let version = self.installed_version().await.map_err(|err| match err {
            SdkError::Command { .. } | SdkError::Json(_) | SdkError::Io(_) => {
                SdkError::Verification(err.to_string())
            }
            other => other,
        })?;
        if let Some(pinned) = self.version.as_deref() {
            if version != pinned {
                return Err(SdkError::VersionMismatch(format!(
                    "expected {pinned}, found {version}"
                )));
            }
        }
        Ok(true)
    }

    async fn check_up_to_date(&self) -> Result<bool, SdkError> {
        if let Some(pinned) = self.version.as_deref() {
            return Ok(self.installed_version().await? == pinned);
        }
        Ok(!self.components().await?.iter().any(ComponentInfo::has_update))
    }

    async fn check_component(&self, component: &str) -> Result<bool, SdkError> {
        Ok(self
            .components()
            .await?
            .iter()
            .any(|info| info.id == component && info.is_installed()))
    }

    async fn install_sdk(
        &self,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> Result<(), SdkError> {
        progress.start("Installing Google Cloud SDK", 100);
        fs::create_dir_all(&self.root)?;

        let download = new_child(&progress, DOWNLOAD_UNITS);
        let archive_path =
            archive::fetch(&self.archive, &self.root.join("downloads"), &download).await?;
        download.done();

        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging)?;
        let placed = self.unpack_into_place(&archive_path, &staging, &progress).await;
        let _ = fs::remove_dir_all(&staging);
        if archive_path.starts_with(self.root.join("downloads")) {
            let _ = fs::remove_file(&archive_path);
        }
        placed?;

        let installer = new_child(&progress, INSTALLER_UNITS);
        installer.start("Running Cloud SDK installer", UNKNOWN);
        process::run_streaming(self.installer(), "install.sh", &console).await?;
        installer.done();

        info!("Google Cloud SDK installed at {}", self.home.display());
        Ok(())
    }

    async fn unpack_into_place(
        &self,
        archive_path: &Path,
        staging: &Path,
        progress: &Arc<dyn ProgressListener>,
    ) -> Result<(), SdkError> {
        let extract = new_child(progress, EXTRACT_UNITS);
        extract.start("Extracting Cloud SDK", UNKNOWN);
        archive::extract(archive_path, staging).await?;

        let unpacked = staging.join(SDK_DIR_NAME);
        if !unpacked.is_dir() {
            return Err(SdkError::Download(format!(
                "archive has no {SDK_DIR_NAME} directory"
            )));
        }
        if self.home.exists() {
            debug!("Replacing broken install at {}", self.home.display());
            fs::remove_dir_all(&self.home)?;
        }
        fs::rename(&unpacked, &self.home)?;
        extract.done();
        Ok(())
    }

    async fn run_components_command(
        &self,
        args: &[&str],
        label: &str,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> Result<(), SdkError> {
        progress.start(label, UNKNOWN);
        let mut cmd = self.gcloud();
        cmd.arg("components").args(args).arg("--quiet");
        process::run_streaming(cmd, &format!("gcloud components {}", args[0]), &console).await
    }
}

impl ManagedSdk for GcloudSdk {
    fn sdk_home(&self) -> PathBuf {
        self.home.clone()
    }

    fn is_installed(&self) -> SdkFuture<'_, bool> {
        self.check_installed().boxed()
    }

    fn is_up_to_date(&self) -> SdkFuture<'_, bool> {
        self.check_up_to_date().boxed()
    }

    fn has_component<'a>(&'a self, component: &'a str) -> SdkFuture<'a, bool> {
        self.check_component(component).boxed()
    }

    fn version(&self) -> SdkFuture<'_, String> {
        self.installed_version().boxed()
    }

    fn install(
        &self,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'_, ()> {
        self.install_sdk(progress, console).boxed()
    }

    fn install_component<'a>(
        &'a self,
        component: &'a str,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'a, ()> {
        async move {
            let label = format!("Installing Cloud SDK component {component}");
            self.run_components_command(&["install", component], &label, progress, console)
                .await
        }
        .boxed()
    }

    fn update(
        &self,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'_, ()> {
        async move {
            let pinned = self.version.as_ref().map(|v| format!("--version={v}"));
            let mut args = vec!["update"];
            args.extend(pinned.as_deref());
            self.run_components_command(&args, "Updating Google Cloud SDK", progress, console)
                .await
        }
        .boxed()
    }
}

/// `gcloud` inside an SDK home on this host.
pub fn gcloud_executable(home: &Path) -> PathBuf {
    executable_in(home, cfg!(windows))
}

fn executable_in(home: &Path, windows: bool) -> PathBuf {
    home.join("bin")
        .join(if windows { "gcloud.cmd" } else { "gcloud" })
}

fn parse_version(output: &str) -> Result<String, SdkError> {
    let value: serde_json::Value = serde_json::from_str(output)?;
    value
        .get(VERSION_KEY)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SdkError::Verification(format!("`gcloud version` did not report {VERSION_KEY}")))
}
