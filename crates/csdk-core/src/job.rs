//! Background execution of install/update work.

use std::{future::Future, panic::AssertUnwindSafe};

use futures_util::FutureExt;
use tokio::{runtime::Handle, task::JoinHandle};
use uuid::Uuid;

use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::coordinator::panic_message;
use crate::error::SdkError;
use crate::status::JobKind;

#[derive(Debug)]
pub enum JobOutcome<T> {
    Completed(T),
    Failed(SdkError),
    Cancelled,
}

/// One install or update attempt.
#[derive(Debug)]
pub struct SdkJob {
    id: Uuid,
    kind: JobKind,
    cancel: CancelHandle,
    token: CancelToken,
}

impl SdkJob {
    pub fn new(kind: JobKind) -> Self {
        let (cancel, token) = cancel_pair();
        Self {
            id: Uuid::new_v4(),
            kind,
            cancel,
            token,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }
}

#[derive(Clone, Debug)]
pub struct SdkJobRunner {
    runtime: Handle,
}

impl SdkJobRunner {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Runs `work` for `job` on the runtime, then hands the outcome to `done`.
    ///
    /// Neither an error nor a panic escapes the spawned task: both end up as
    /// `JobOutcome::Failed`. Cancelling the job drops `work` at its next await.
    pub fn spawn<T, W, Fut, D, DFut>(&self, job: &SdkJob, work: W, done: D) -> JoinHandle<()>
    where
        T: Send + 'static,
        W: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<T, SdkError>> + Send + 'static,
        D: FnOnce(JobOutcome<T>) -> DFut + Send + 'static,
        DFut: Future<Output = ()> + Send + 'static,
    {
        let token = job.token();
        let work = work(token.clone());
        self.runtime.spawn(async move {
            let outcome = run_to_outcome(&token, work).await;
            done(outcome).await;
        })
    }
}

pub async fn run_to_outcome<T, Fut>(token: &CancelToken, work: Fut) -> JobOutcome<T>
where
    Fut: Future<Output = Result<T, SdkError>>,
{
    let guarded = AssertUnwindSafe(work).catch_unwind();
    tokio::select! {
        biased;
        _ = token.cancelled() => JobOutcome::Cancelled,
        result = guarded => match result {
            Ok(Ok(value)) => JobOutcome::Completed(value),
            Ok(Err(err)) if err.is_cancelled() || token.is_cancelled() => JobOutcome::Cancelled,
            Ok(Err(err)) => JobOutcome::Failed(err),
            Err(panic) => JobOutcome::Failed(SdkError::Panicked(panic_message(&*panic))),
        },
    }
}
