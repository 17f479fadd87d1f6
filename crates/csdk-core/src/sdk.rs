use std::{path::PathBuf, sync::Arc};

use futures_util::future::BoxFuture;

use crate::error::SdkError;
use crate::progress::{ConsoleListener, ProgressListener};

pub type SdkFuture<'a, T> = BoxFuture<'a, Result<T, SdkError>>;

/// Component every managed install must carry.
pub const APP_ENGINE_JAVA: &str = "app-engine-java";

/// An SDK installation that can be inspected and mutated.
///
/// Queries may run at any time. `install`, `install_component` and `update`
/// mutate the directory tree and are only called with the write lock held.
/// Dropping a returned future abandons the operation.
pub trait ManagedSdk: Send + Sync {
    fn sdk_home(&self) -> PathBuf;

    /// `Err(Verification | VersionMismatch)` means "present but unusable".
    fn is_installed(&self) -> SdkFuture<'_, bool>;

    fn is_up_to_date(&self) -> SdkFuture<'_, bool>;

    fn has_component<'a>(&'a self, component: &'a str) -> SdkFuture<'a, bool>;

    fn version(&self) -> SdkFuture<'_, String>;

    fn install(
        &self,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'_, ()>;

    fn install_component<'a>(
        &'a self,
        component: &'a str,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'a, ()>;

    fn update(
        &self,
        progress: Arc<dyn ProgressListener>,
        console: Arc<dyn ConsoleListener>,
    ) -> SdkFuture<'_, ()>;
}
