use crate::status::JobKind;

pub const METADATA_MESSAGE_KEY: &str = "message";

/// Usage-event sink for lifecycle outcomes.
pub trait UsageTracker: Send + Sync {
    fn track(&self, event: &str, metadata: &[(&str, &str)]);
}

/// Forwards events to the process-wide telemetry writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryTracker;

impl UsageTracker for TelemetryTracker {
    fn track(&self, event: &str, metadata: &[(&str, &str)]) {
        csdk_telemetry::event(event, metadata);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl UsageTracker for NoopTracker {
    fn track(&self, _event: &str, _metadata: &[(&str, &str)]) {}
}

pub fn succeeded_event(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Install => "managed_sdk.install.succeeded",
        JobKind::Update => "managed_sdk.update.succeeded",
    }
}

pub fn failed_event(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Install => "managed_sdk.install.failed",
        JobKind::Update => "managed_sdk.update.failed",
    }
}

pub fn cancelled_event(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Install => "managed_sdk.install.cancelled",
        JobKind::Update => "managed_sdk.update.cancelled",
    }
}
