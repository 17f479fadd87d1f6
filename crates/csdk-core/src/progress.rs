//! Progress and console sinks for install/update work.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

/// Total (or update) value signalling indeterminate progress.
pub const UNKNOWN: i64 = -1;

pub trait ProgressListener: Send + Sync {
    /// `total_units` may be [`UNKNOWN`].
    fn start(&self, message: &str, total_units: i64);

    /// Adds `units` of completed work; [`UNKNOWN`] switches to indeterminate.
    fn update(&self, units: i64);

    fn update_message(&self, message: &str);

    fn done(&self);
}

pub trait ConsoleListener: Send + Sync {
    fn console(&self, line: &str);
}

impl<F> ConsoleListener for F
where
    F: Fn(&str) + Send + Sync,
{
    fn console(&self, line: &str) {
        self(line)
    }
}

/// Gives a sub-task `allocation` units of `parent`'s range.
pub fn new_child(parent: &Arc<dyn ProgressListener>, allocation: i64) -> Arc<dyn ProgressListener> {
    Arc::new(ChildProgressListener::new(Arc::clone(parent), allocation))
}

pub struct ChildProgressListener {
    parent: Arc<dyn ProgressListener>,
    allocation: i64,
    state: Mutex<ChildState>,
}

#[derive(Default)]
struct ChildState {
    total: i64,
    done: i64,
    reported: i64,
}

impl ChildProgressListener {
    pub fn new(parent: Arc<dyn ProgressListener>, allocation: i64) -> Self {
        Self {
            parent,
            allocation: allocation.max(0),
            state: Mutex::new(ChildState {
                total: UNKNOWN,
                ..ChildState::default()
            }),
        }
    }
}

impl ProgressListener for ChildProgressListener {
    fn start(&self, message: &str, total_units: i64) {
        if let Ok(mut state) = self.state.lock() {
            state.total = total_units;
            state.done = 0;
        }
        self.parent.update_message(message);
    }

    fn update(&self, units: i64) {
        let delta = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.total <= 0 || units == UNKNOWN {
                return;
            }
            state.done = (state.done + units).min(state.total);
            let target = state.done * self.allocation / state.total;
            let delta = target - state.reported;
            if delta <= 0 {
                return;
            }
            state.reported = target;
            delta
        };
        self.parent.update(delta);
    }

    fn update_message(&self, message: &str) {
        self.parent.update_message(message);
    }

    fn done(&self) {
        let remaining = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let remaining = self.allocation - state.reported;
            state.reported = self.allocation;
            remaining
        };
        if remaining > 0 {
            self.parent.update(remaining);
        }
    }
}

/// Logs progress through `tracing`.
pub struct TracingProgressListener {
    label: String,
    state: Mutex<TracingState>,
}

#[derive(Default)]
struct TracingState {
    total: i64,
    done: i64,
    last_percent: i64,
    finished: bool,
}

impl TracingProgressListener {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(TracingState::default()),
        }
    }
}

impl ProgressListener for TracingProgressListener {
    fn start(&self, message: &str, total_units: i64) {
        if let Ok(mut state) = self.state.lock() {
            *state = TracingState {
                total: total_units,
                ..TracingState::default()
            };
        }
        info!("{}: {}", self.label, message);
    }

    fn update(&self, units: i64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if units == UNKNOWN || state.total <= 0 {
            return;
        }
        state.done = (state.done + units).min(state.total);
        let percent = state.done * 100 / state.total;
        if percent >= state.last_percent + 10 || (percent == 100 && state.last_percent != 100) {
            state.last_percent = percent;
            debug!("{}: {}%", self.label, percent);
        }
    }

    fn update_message(&self, message: &str) {
        info!("{}: {}", self.label, message);
    }

    fn done(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.finished {
                return;
            }
            state.finished = true;
        }
        debug!("{}: done", self.label);
    }
}

/// Forwards SDK console output to `tracing` at debug level.
pub struct TracingConsole;

impl ConsoleListener for TracingConsole {
    fn console(&self, line: &str) {
        debug!(target: "csdk::console", "{}", line);
    }
}
