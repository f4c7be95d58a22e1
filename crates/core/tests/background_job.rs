//! Background job controller: the storage-pressure downgrade pass, run
//! status, scheduling constraints, and the disable property.

mod common;

use common::FixtureBuilder;
use dexopt_core::background::ScheduleStatus;
use dexopt_core::daemon::DexoptTrigger;
use dexopt_core::errors::DexoptError;
use dexopt_core::metrics::BackgroundRunStatus;
use dexopt_core::package::PackageState;
use dexopt_core::result::BatchPass;
use dexopt_core::service::DexoptService;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const NOW_MS: i64 = 1_700_000_000_000;

fn pkg_last_used(name: &str, base: &str, last_used_ms: i64) -> PackageState {
    let mut pkg = PackageState::new(name);
    pkg.splits[0].path = PathBuf::from(base);
    pkg.last_used_ms_by_user.insert(0, last_used_ms);
    pkg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_pressure_downgrades_inactive_packages_first() {
    let fixture = FixtureBuilder::new()
        .package(pkg_last_used("com.x", "/x/base.apk", NOW_MS - DAY_MS))
        .package(pkg_last_used("com.y", "/y/base.apk", NOW_MS - 90 * DAY_MS))
        .prop("pm.dexopt.downgrade_after_inactive_days", "30")
        .now_ms(NOW_MS)
        .allocatable(100)
        .build();
    let service = DexoptService::new(fixture.platform.clone());
    let job = service.background_job();

    let outcome = job.start().await.unwrap();
    assert_eq!(outcome.status, BackgroundRunStatus::JobFinished);

    let result = outcome.result.as_ref().expect("run result");
    let passes: Vec<BatchPass> = result.passes.keys().copied().collect();
    assert_eq!(passes, vec![BatchPass::Downgrade, BatchPass::Main]);

    let downgrade = result.pass(BatchPass::Downgrade).unwrap();
    assert_eq!(downgrade.reason, "inactive");
    assert_eq!(
        downgrade
            .package_results
            .iter()
            .map(|r| r.package_name.as_str())
            .collect::<Vec<_>>(),
        vec!["com.y"]
    );

    let main = result.pass(BatchPass::Main).unwrap();
    assert_eq!(main.reason, "bg-dexopt");
    assert_eq!(
        main.package_results
            .iter()
            .map(|r| r.package_name.as_str())
            .collect::<Vec<_>>(),
        vec!["com.x"]
    );

    // The downgrade pass runs with the downgrade trigger only.
    let y_trigger = fixture.daemon.inspect(|s| {
        s.need_checks
            .iter()
            .find(|(path, ..)| path == &PathBuf::from("/y/base.apk"))
            .map(|(_, _, _, trigger)| *trigger)
    });
    assert_eq!(y_trigger, Some(DexoptTrigger::COMPILER_FILTER_IS_WORSE));

    // The janitor ran exactly once, after the passes.
    assert_eq!(fixture.daemon.inspect(|s| s.cleanup_calls.len()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_is_reported_separately_per_pass() {
    let fixture = FixtureBuilder::new()
        .package(pkg_last_used("com.x", "/x/base.apk", NOW_MS - DAY_MS))
        .package(pkg_last_used("com.y", "/y/base.apk", NOW_MS - 90 * DAY_MS))
        .prop("pm.dexopt.downgrade_after_inactive_days", "30")
        .now_ms(NOW_MS)
        .allocatable(100)
        .build();
    let service = DexoptService::new(fixture.platform.clone());
    let job = service.background_job();

    let events: Arc<Mutex<Vec<(BatchPass, i32, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    job.set_progress_callback(Some(Arc::new(move |pass, current, total| {
        sink.lock().unwrap().push((pass, current, total));
    })));

    job.start().await.unwrap();

    let events = events.lock().unwrap().clone();
    let downgrade: Vec<_> = events
        .iter()
        .filter(|(pass, ..)| *pass == BatchPass::Downgrade)
        .collect();
    let main: Vec<_> = events
        .iter()
        .filter(|(pass, ..)| *pass == BatchPass::Main)
        .collect();
    assert_eq!(downgrade.first(), Some(&&(BatchPass::Downgrade, 0, 1)));
    assert_eq!(downgrade.last(), Some(&&(BatchPass::Downgrade, 1, 1)));
    assert_eq!(main.first(), Some(&&(BatchPass::Main, 0, 1)));
    assert_eq!(main.last(), Some(&&(BatchPass::Main, 1, 1)));

    // The downgrade pass finishes before the main pass starts.
    let last_downgrade = events
        .iter()
        .rposition(|(pass, ..)| *pass == BatchPass::Downgrade)
        .unwrap();
    let first_main = events
        .iter()
        .position(|(pass, ..)| *pass == BatchPass::Main)
        .unwrap();
    assert!(last_downgrade < first_main);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_downgrade_pass_without_storage_pressure() {
    let fixture = FixtureBuilder::new()
        .package(pkg_last_used("com.x", "/x/base.apk", NOW_MS - DAY_MS))
        .package(pkg_last_used("com.y", "/y/base.apk", NOW_MS - 90 * DAY_MS))
        .prop("pm.dexopt.downgrade_after_inactive_days", "30")
        .now_ms(NOW_MS)
        .allocatable(10_000_000_000)
        .build();
    let service = DexoptService::new(fixture.platform.clone());

    let outcome = service.background_job().start().await.unwrap();
    let result = outcome.result.as_ref().unwrap();
    assert!(result.pass(BatchPass::Downgrade).is_none());
    assert!(result.pass(BatchPass::Main).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_start_joins_the_running_execution() {
    let fixture = FixtureBuilder::new()
        .package(pkg_last_used("com.x", "/x/base.apk", NOW_MS - DAY_MS))
        .now_ms(NOW_MS)
        .build();
    fixture.daemon.configure(|s| {
        s.dexopt_duration = Some(Duration::from_millis(300));
    });
    let service = DexoptService::new(fixture.platform.clone());
    let job = service.background_job().clone();

    let first = {
        let job = job.clone();
        tokio::spawn(async move { job.start().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = job.start().await.unwrap();
    let first = first.await.unwrap();

    // Both callers saw the same run.
    assert_eq!(first.status, second.status);
    assert_eq!(fixture.daemon.dexopt_count(), 1);
}

#[tokio::test]
async fn schedule_builds_constrained_job() {
    let fixture = FixtureBuilder::new().build();
    let service = DexoptService::new(fixture.platform.clone());

    let status = service.background_job().schedule(None).unwrap();
    assert_eq!(status, ScheduleStatus::Scheduled);

    let jobs = fixture.scheduler.scheduled.lock().unwrap().clone();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].require_device_idle);
    assert!(jobs[0].require_charging);
    assert!(jobs[0].require_battery_not_low);
    assert!(!jobs[0].require_storage_not_low);
    assert!(jobs[0].period >= Duration::from_secs(24 * 60 * 60));
    assert!(jobs[0].retry_policy.is_none());
}

#[tokio::test]
async fn schedule_rejects_reserved_overrides() {
    let fixture = FixtureBuilder::new().build();
    let service = DexoptService::new(fixture.platform.clone());
    let job = service.background_job();

    let hook: dexopt_core::background::ScheduleOverride =
        Box::new(|info| info.require_storage_not_low = true);
    assert!(matches!(
        job.schedule(Some(&hook)),
        Err(DexoptError::InvalidArgument { .. })
    ));

    let hook: dexopt_core::background::ScheduleOverride = Box::new(|info| {
        info.retry_policy = Some(dexopt_core::platform::RetryPolicy::Default)
    });
    assert!(matches!(
        job.schedule(Some(&hook)),
        Err(DexoptError::InvalidArgument { .. })
    ));
}

#[tokio::test]
async fn disable_property_short_circuits_scheduling() {
    let fixture = FixtureBuilder::new()
        .prop("pm.dexopt.disable_bg_dexopt", "true")
        .build();
    let service = DexoptService::new(fixture.platform.clone());

    let status = service.background_job().schedule(None).unwrap();
    assert_eq!(status, ScheduleStatus::DisabledBySystemProperty);
    assert!(fixture.scheduler.scheduled.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_stop_cancels_and_records_reason() {
    let fixture = FixtureBuilder::new()
        .package(pkg_last_used("com.x", "/x/base.apk", NOW_MS - DAY_MS))
        .now_ms(NOW_MS)
        .build();
    fixture.daemon.configure(|s| {
        s.dexopt_duration = Some(Duration::from_millis(2000));
    });
    let service = DexoptService::new(fixture.platform.clone());
    let job = service.background_job().clone();

    let runner = {
        let job = job.clone();
        tokio::spawn(async move { job.start().await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let policy = job.on_job_stopped(3);
    assert_eq!(policy, dexopt_core::platform::RetryPolicy::Default);

    let outcome = runner.await.unwrap();
    assert_eq!(outcome.status, BackgroundRunStatus::AbortByCancellation);
    assert_eq!(job.last_stop_reason(), Some(3));
}
