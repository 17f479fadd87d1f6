mod support;

use std::{sync::Arc, time::Duration};

use csdk_core::{SdkStatus, SdkUpdateScheduler, Severity, SettingsStore};
use tempfile::TempDir;

use support::{wait_until, FakeState, Harness};

use SdkStatus::{Installing, Ready};

const INTERVAL: Duration = Duration::from_millis(50);
const GRACE: Duration = Duration::from_millis(10);

fn settings(temp: &TempDir) -> Arc<SettingsStore> {
    Arc::new(SettingsStore::load(temp.path().join("sdk-settings.json")))
}

#[test]
fn stale_sdk_is_updated_after_notice() {
    let temp = TempDir::new().unwrap();
    let harness = Harness::new(FakeState::stale());
    assert!(harness.service.install());
    harness.expect_statuses(&[Installing, Ready]);

    let settings = settings(&temp);
    let scheduler = SdkUpdateScheduler::new(harness.service.clone(), Arc::clone(&settings))
        .with_timing(INTERVAL, GRACE);
    assert!(scheduler.activate());
    assert!(scheduler.is_active());

    harness.expect_statuses(&[Installing, Ready]);
    harness.drain();

    assert_eq!(harness.sdk.state().update_calls, 1);
    assert!(harness
        .notifier
        .with_severity(Severity::Info)
        .iter()
        .any(|message| message.contains("updating in")));
    assert!(settings.get().last_automatic_update_millis.is_some());

    scheduler.stop();
    assert!(!scheduler.is_active());
}

#[test]
fn up_to_date_sdk_is_left_alone() {
    let temp = TempDir::new().unwrap();
    let harness = Harness::new(FakeState::ready());
    assert!(harness.service.install());
    harness.expect_statuses(&[Installing, Ready]);

    let scheduler = SdkUpdateScheduler::new(harness.service.clone(), settings(&temp))
        .with_timing(INTERVAL, GRACE);
    assert!(scheduler.activate());

    std::thread::sleep(INTERVAL * 4);
    assert!(harness.no_more_statuses());
    assert_eq!(harness.sdk.state().update_calls, 0);
    scheduler.stop();
}

#[test]
fn installs_do_not_count_as_automatic_updates() {
    let temp = TempDir::new().unwrap();
    let harness = Harness::new(FakeState::not_installed());
    let settings = settings(&temp);
    let scheduler = SdkUpdateScheduler::new(harness.service.clone(), Arc::clone(&settings))
        .with_timing(Duration::from_secs(3600), GRACE);
    assert!(scheduler.activate());

    assert!(harness.service.install());
    harness.expect_statuses(&[Installing, Ready]);
    assert!(harness.service.update());
    harness.expect_statuses(&[Installing, Ready]);
    harness.drain();

    assert_eq!(harness.sdk.state().install_calls, 1);
    assert_eq!(harness.sdk.state().update_calls, 0);
    assert_eq!(settings.get().last_automatic_update_millis, None);
    scheduler.stop();
}

#[test]
fn disabled_updates_do_not_schedule() {
    let temp = TempDir::new().unwrap();
    let harness = Harness::new(FakeState::stale());
    let settings = settings(&temp);
    settings.update_best_effort(|s| s.automatic_updates = false);

    let scheduler = SdkUpdateScheduler::new(harness.service.clone(), settings)
        .with_timing(INTERVAL, GRACE);
    assert!(!scheduler.activate());
    assert!(!scheduler.is_active());
}

#[test]
fn disabling_stops_the_schedule_and_persists() {
    let temp = TempDir::new().unwrap();
    let harness = Harness::new(FakeState::stale());
    assert!(harness.service.install());
    harness.expect_statuses(&[Installing, Ready]);

    let settings = settings(&temp);
    let scheduler = SdkUpdateScheduler::new(harness.service.clone(), Arc::clone(&settings))
        .with_timing(Duration::from_secs(3600), GRACE);
    assert!(scheduler.activate());

    scheduler.disable_automatic_updates();
    assert!(!scheduler.is_active());
    assert!(wait_until(|| !settings.get().automatic_updates));
    assert!(!SettingsStore::load(settings.path()).get().automatic_updates);
    assert_eq!(harness.sdk.state().update_calls, 0);
}
