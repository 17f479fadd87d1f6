use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::info;
use uuid::Uuid;

use crate::error::SdkError;
use crate::progress::{ProgressListener, UNKNOWN};

pub const DOWNLOAD_BASE_URL: &str = "https://dl.google.com/dl/cloudsdk/channels/rapid/downloads";

/// Where the SDK archive for this host comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdkArchive {
    pub url: String,
    pub sha256: Option<String>,
}

impl SdkArchive {
    pub fn file_name(&self) -> &str {
        let name = self.url.rsplit('/').next().unwrap_or(&self.url);
        name.split('?').next().unwrap_or(name)
    }
}

/// Archive name for `os`/`arch` as reported by `std::env::consts`.
pub fn archive_file_name(os: &str, arch: &str, version: Option<&str>) -> Result<String, SdkError> {
    let platform = match (os, arch) {
        ("linux", "x86_64") => "linux-x86_64.tar.gz",
        ("linux", "x86") => "linux-x86.tar.gz",
        ("linux", "aarch64") => "linux-arm.tar.gz",
        ("macos", "x86_64") => "darwin-x86_64.tar.gz",
        ("macos", "aarch64") => "darwin-arm.tar.gz",
        ("windows", "x86_64") => "windows-x86_64.zip",
        ("windows", "x86") => "windows-x86.zip",
        _ => return Err(SdkError::UnsupportedPlatform(format!("{os}/{arch}"))),
    };
    Ok(match version {
        Some(version) => format!("google-cloud-cli-{version}-{platform}"),
        None => format!("google-cloud-cli-{platform}"),
    })
}

fn local_archive_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        Some(PathBuf::from(path))
    } else if url.starts_with('/') {
        Some(PathBuf::from(url))
    } else {
        None
    }
}

/// Fetches `archive` into `download_dir`. Local paths and `file://` URLs are
/// used in place.
pub(crate) async fn fetch(
    archive: &SdkArchive,
    download_dir: &Path,
    progress: &Arc<dyn ProgressListener>,
) -> Result<PathBuf, SdkError> {
    if let Some(path) = local_archive_path(&archive.url) {
        if !path.is_file() {
            return Err(SdkError::Download(format!(
                "archive not found: {}",
                path.display()
            )));
        }
        progress.start("Using local Cloud SDK archive", UNKNOWN);
        if let Some(expected) = archive.sha256.as_deref() {
            verify_sha256(&sha256_file(&path)?, expected)?;
        }
        return Ok(path);
    }

    fs::create_dir_all(download_dir)?;
    let dest = download_dir.join(archive.file_name());
    download(archive, &dest, progress).await?;
    Ok(dest)
}

/// Removes the partial file unless the download completed.
struct PartialDownload(Option<PathBuf>);

impl PartialDownload {
    fn keep(&mut self) {
        self.0 = None;
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = fs::remove_file(path);
        }
    }
}

async fn download(
    archive: &SdkArchive,
    dest: &Path,
    progress: &Arc<dyn ProgressListener>,
) -> Result<(), SdkError> {
    let client = Client::builder()
        .user_agent(concat!("csdk/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SdkError::Download(format!("failed to build http client: {e}")))?;

    info!("Downloading Cloud SDK from {}", archive.url);
    let resp = client
        .get(&archive.url)
        .send()
        .await
        .map_err(|e| SdkError::Download(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(SdkError::Download(format!(
            "{} returned {}",
            archive.url,
            resp.status()
        )));
    }

    let total = resp
        .content_length()
        .and_then(|len| i64::try_from(len).ok())
        .unwrap_or(UNKNOWN);
    progress.start("Downloading Cloud SDK", total);

    let tmp = dest.with_extension(format!("tmp-{}", Uuid::new_v4()));
    let mut partial = PartialDownload(Some(tmp.clone()));
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut hasher = Sha256::new();
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| SdkError::Download(format!("read failed: {e}")))?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        progress.update(chunk.len() as i64);
    }
    file.flush().await?;
    drop(file);

    if let Some(expected) = archive.sha256.as_deref() {
        verify_sha256(&hex_encode(&hasher.finalize()), expected)?;
    }

    fs::rename(&tmp, dest)?;
    partial.keep();
    info!("Saved Cloud SDK archive {}", dest.display());
    Ok(())
}

fn verify_sha256(actual: &str, expected: &str) -> Result<(), SdkError> {
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(SdkError::Download(format!(
            "sha256 mismatch: expected {expected}, got {actual}"
        )))
    }
}

/// Unpacks with the system `tar`; bsdtar on Windows also reads zip files.
pub(crate) async fn extract(archive: &Path, dest: &Path) -> Result<(), SdkError> {
    let name = archive.to_string_lossy();
    let mut cmd = Command::new("tar");
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        cmd.arg("-xzf");
    } else if name.ends_with(".zip") {
        cmd.arg("-xf");
    } else {
        return Err(SdkError::Download(format!(
            "unsupported archive format: {}",
            archive.display()
        )));
    }
    cmd.arg(archive).arg("-C").arg(dest);
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    info!(
        "Extracting {} into {}",
        archive.display(),
        dest.display()
    );
    let output = cmd
        .output()
        .await
        .map_err(|e| SdkError::command("tar", e.to_string()))?;
    if !output.status.success() {
        return Err(SdkError::command(
            "tar",
            format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}

pub(crate) fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
