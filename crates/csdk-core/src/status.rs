//! Lifecycle states of the managed SDK and the single transition function.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SdkStatus {
    #[default]
    NotAvailable,
    Installing,
    Ready,
    /// A previous install is still on disk but the last update did not finish.
    Invalid,
}

impl SdkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SdkStatus::NotAvailable => "NOT_AVAILABLE",
            SdkStatus::Installing => "INSTALLING",
            SdkStatus::Ready => "READY",
            SdkStatus::Invalid => "INVALID",
        }
    }

    /// `Ready`, `Invalid` and `NotAvailable` end a wait; `Installing` does not.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SdkStatus::Installing)
    }
}

impl fmt::Display for SdkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Install,
    Update,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Install => "install",
            JobKind::Update => "update",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobResult {
    /// Work was done and completed.
    Processed,
    /// Nothing to do.
    UpToDate,
}

impl JobResult {
    pub fn combine(self, other: JobResult) -> JobResult {
        if self == JobResult::UpToDate && other == JobResult::UpToDate {
            JobResult::UpToDate
        } else {
            JobResult::Processed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    JobStarted,
    JobSucceeded,
    /// Install job failed or was cancelled.
    InstallFailed,
    /// Update job failed or was cancelled; carries the re-validation result.
    UpdateFailed { prior_install_valid: bool },
    PlatformUnsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid SDK status transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: SdkStatus,
    pub event: StatusEvent,
}

pub fn next_status(current: SdkStatus, event: StatusEvent) -> Result<SdkStatus, InvalidTransition> {
    use SdkStatus::*;

    let next = match (current, event) {
        (_, StatusEvent::PlatformUnsupported) => NotAvailable,
        (NotAvailable | Ready | Invalid, StatusEvent::JobStarted) => Installing,
        (Installing, StatusEvent::JobSucceeded) => Ready,
        (Installing, StatusEvent::InstallFailed) => NotAvailable,
        (
            Installing,
            StatusEvent::UpdateFailed {
                prior_install_valid: true,
            },
        ) => Invalid,
        (
            Installing,
            StatusEvent::UpdateFailed {
                prior_install_valid: false,
            },
        ) => NotAvailable,
        (from, event) => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

/// Event that ends a failed or cancelled job of `kind`.
pub fn failure_event(kind: JobKind, prior_install_valid: bool) -> StatusEvent {
    match kind {
        JobKind::Install => StatusEvent::InstallFailed,
        JobKind::Update => StatusEvent::UpdateFailed {
            prior_install_valid,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SdkStatus; 4] = [
        SdkStatus::NotAvailable,
        SdkStatus::Installing,
        SdkStatus::Ready,
        SdkStatus::Invalid,
    ];

    #[test]
    fn job_start_enters_installing_from_any_idle_state() {
        for status in [SdkStatus::NotAvailable, SdkStatus::Ready, SdkStatus::Invalid] {
            assert_eq!(
                next_status(status, StatusEvent::JobStarted),
                Ok(SdkStatus::Installing)
            );
        }
        assert!(next_status(SdkStatus::Installing, StatusEvent::JobStarted).is_err());
    }

    #[test]
    fn completion_events_only_apply_while_installing() {
        let completions = [
            StatusEvent::JobSucceeded,
            StatusEvent::InstallFailed,
            StatusEvent::UpdateFailed {
                prior_install_valid: true,
            },
            StatusEvent::UpdateFailed {
                prior_install_valid: false,
            },
        ];
        for status in ALL {
            for event in completions {
                let result = next_status(status, event);
                assert_eq!(result.is_ok(), status == SdkStatus::Installing, "{status} {event:?}");
            }
        }
    }

    #[test]
    fn ready_is_never_reached_without_installing() {
        for status in ALL {
            for event in [
                StatusEvent::JobStarted,
                StatusEvent::JobSucceeded,
                StatusEvent::InstallFailed,
                StatusEvent::PlatformUnsupported,
            ] {
                if let Ok(SdkStatus::Ready) = next_status(status, event) {
                    assert_eq!(status, SdkStatus::Installing);
                }
            }
        }
    }

    #[test]
    fn failed_update_keeps_valid_install_as_invalid() {
        let event = failure_event(JobKind::Update, true);
        assert_eq!(next_status(SdkStatus::Installing, event), Ok(SdkStatus::Invalid));

        let event = failure_event(JobKind::Update, false);
        assert_eq!(
            next_status(SdkStatus::Installing, event),
            Ok(SdkStatus::NotAvailable)
        );
    }

    #[test]
    fn failed_install_ignores_prior_install() {
        let event = failure_event(JobKind::Install, true);
        assert_eq!(
            next_status(SdkStatus::Installing, event),
            Ok(SdkStatus::NotAvailable)
        );
    }

    #[test]
    fn unsupported_platform_always_lands_on_not_available() {
        for status in ALL {
            assert_eq!(
                next_status(status, StatusEvent::PlatformUnsupported),
                Ok(SdkStatus::NotAvailable)
            );
        }
    }

    #[test]
    fn results_combine_to_up_to_date_only_when_both_are() {
        assert_eq!(
            JobResult::UpToDate.combine(JobResult::UpToDate),
            JobResult::UpToDate
        );
        assert_eq!(
            JobResult::UpToDate.combine(JobResult::Processed),
            JobResult::Processed
        );
        assert_eq!(
            JobResult::Processed.combine(JobResult::UpToDate),
            JobResult::Processed
        );
    }
}
