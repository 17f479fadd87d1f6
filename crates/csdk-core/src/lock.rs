//! Write lock over the managed SDK directory.
//!
//! Every job that mutates the installation holds the lock for the duration of
//! the mutation; consumers that run SDK binaries hold it around their use.
//! Release happens when the guard drops, so all exit paths unlock.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use fs2::FileExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::SdkError;

const FILE_LOCK_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, Default)]
pub struct SdkWriteLock {
    mutex: Arc<Mutex<()>>,
    lock_file: Option<Arc<PathBuf>>,
}

/// Held lock; dropping it releases the file lock, then the in-process lock.
#[derive(Debug)]
pub struct SdkWriteGuard {
    file: Option<File>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SdkWriteGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = FileExt::unlock(&file) {
                warn!("Failed to release SDK lock file: {}", err);
            }
        }
    }
}

impl SdkWriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also takes an exclusive advisory lock on `path`, so other processes
    /// sharing the SDK directory serialize against this one.
    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self {
            mutex: Arc::default(),
            lock_file: Some(Arc::new(path.into())),
        }
    }

    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref().map(PathBuf::as_path)
    }

    /// In-process view only.
    pub fn is_locked(&self) -> bool {
        self.mutex.try_lock().is_err()
    }

    pub fn try_acquire(&self) -> Option<SdkWriteGuard> {
        let guard = self.mutex.clone().try_lock_owned().ok()?;
        let file = match self.lock_file.as_deref() {
            None => None,
            Some(path) => match try_lock_file(path) {
                Ok(Some(file)) => Some(file),
                Ok(None) => return None,
                Err(err) => {
                    warn!(
                        "SDK lock file {} unusable, locking in-process only: {}",
                        path.display(),
                        err
                    );
                    None
                }
            },
        };
        Some(SdkWriteGuard {
            file,
            _guard: guard,
        })
    }

    /// Waits for the lock, giving up with `SdkError::Cancelled` as soon as the
    /// token fires, even when the lock is free.
    pub async fn acquire_interruptibly(
        &self,
        cancel: &CancelToken,
    ) -> Result<SdkWriteGuard, SdkError> {
        cancel.check()?;
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SdkError::Cancelled),
            guard = self.mutex.clone().lock_owned() => guard,
        };

        let file = match self.lock_file.as_deref() {
            None => None,
            Some(path) => loop {
                match try_lock_file(path) {
                    Ok(Some(file)) => break Some(file),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            "SDK lock file {} unusable, locking in-process only: {}",
                            path.display(),
                            err
                        );
                        break None;
                    }
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SdkError::Cancelled),
                    _ = tokio::time::sleep(FILE_LOCK_POLL) => {}
                }
            },
        };

        Ok(SdkWriteGuard {
            file,
            _guard: guard,
        })
    }

    pub async fn acquire(&self) -> SdkWriteGuard {
        let guard = self.mutex.clone().lock_owned().await;
        let file = match self.lock_file.as_deref() {
            None => None,
            Some(path) => loop {
                match try_lock_file(path) {
                    Ok(Some(file)) => break Some(file),
                    Ok(None) => tokio::time::sleep(FILE_LOCK_POLL).await,
                    Err(err) => {
                        warn!(
                            "SDK lock file {} unusable, locking in-process only: {}",
                            path.display(),
                            err
                        );
                        break None;
                    }
                }
            },
        };
        SdkWriteGuard {
            file,
            _guard: guard,
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

fn try_lock_file(path: &Path) -> io::Result<Option<File>> {
    let file = open_lock_file(path)?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(file)),
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
