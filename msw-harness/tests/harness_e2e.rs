//! End-to-end runs of the harness against scripted stand-ins for the binary.

#![cfg(unix)]

mod common;

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use common::{FAKE_MSWITCH_BINARY, SHORT, fast_settings, init_test_logging, only, write_fake_binary};
use msw_harness::{Harness, HarnessError, Scenario, Verdict};
use tracing::info;

fn is_check(verdict: Option<&Verdict>, expected: bool) -> bool {
    matches!(verdict, Some(Verdict::Check { passed, .. }) if *passed == expected)
}

#[test]
fn test_full_catalog_passes_against_compliant_binary() {
    init_test_logging();
    info!("TEST START: test_full_catalog_passes_against_compliant_binary");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(bin_dir.path(), FAKE_MSWITCH_BINARY);

    let mut harness = Harness::new(fast_settings(binary, work_root.path())).unwrap();
    let work_dir = harness.work_dir().to_path_buf();
    let results = harness.run();
    let summary = results.summarize();
    info!("{}", summary.text);

    assert_eq!((summary.passed, summary.total), (9, 9), "{}", summary.text);
    assert!(results.success());
    assert!(results.fatal().is_none());
    // Readiness probe plus status, switch and failover.
    assert!(harness.simulator_requests() >= 4);
    assert_eq!(harness.registry().active_count(), 0);
    assert!(!work_dir.exists());

    info!("TEST PASS: test_full_catalog_passes_against_compliant_binary");
}

#[test]
fn test_threshold_sweep_reports_three_verdicts() {
    init_test_logging();
    info!("TEST START: test_threshold_sweep_reports_three_verdicts");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(bin_dir.path(), FAKE_MSWITCH_BINARY);

    let mut settings = fast_settings(binary, work_root.path());
    settings.only = only(&["health_strict", "health_moderate", "health_lenient"]);
    let mut harness = Harness::new(settings).unwrap();
    let results = harness.run();

    let summary = results.summarize();
    assert_eq!((summary.passed, summary.total), (3, 3));
    assert!(summary.text.contains("Total: 3/3 tests passed"));
    // No webhook scenario selected, so no simulator was started.
    assert_eq!(harness.simulator_requests(), 0);

    info!("TEST PASS: test_threshold_sweep_reports_three_verdicts");
}

#[test]
fn test_missing_binary_aborts_before_any_scenario() {
    init_test_logging();
    info!("TEST START: test_missing_binary_aborts_before_any_scenario");

    let work_root = tempfile::tempdir().unwrap();
    let settings = fast_settings(PathBuf::from("/nonexistent/msw/ffmpeg"), work_root.path());
    let mut harness = Harness::new(settings).unwrap();
    let results = harness.run();

    assert!(!results.success());
    assert!(results.get("preflight").is_some_and(Verdict::is_fatal));
    assert!(results.get("basic_parsing").is_none());
    assert_eq!(results.summarize().total, 0);

    info!("TEST PASS: test_missing_binary_aborts_before_any_scenario");
}

#[test]
fn test_failures_are_scenario_local() {
    init_test_logging();
    info!("TEST START: test_failures_are_scenario_local");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(
        bin_dir.path(),
        "#!/bin/sh\necho \"Unrecognized option 'msw.enable'\" >&2\nexit 1\n",
    );

    let mut settings = fast_settings(binary, work_root.path());
    settings.only = only(&["basic_parsing", "json_configuration"]);
    let mut harness = Harness::new(settings).unwrap();
    let results = harness.run();

    // The parsing check accepts feature diagnostics; the config run needs a clean exit.
    assert!(is_check(results.get("basic_parsing"), true));
    assert!(is_check(results.get("json_configuration"), false));
    match results.get("json_configuration") {
        Some(Verdict::Check { message: Some(message), .. }) => {
            assert!(message.contains("status 1"), "{message}");
            assert!(message.contains("Unrecognized option"), "{message}");
        }
        other => panic!("unexpected verdict {other:?}"),
    }
    assert!(results.fatal().is_none());
    assert!(!results.success());

    info!("TEST PASS: test_failures_are_scenario_local");
}

#[test]
fn test_fixture_failure_is_run_fatal() {
    init_test_logging();
    info!("TEST START: test_fixture_failure_is_run_fatal");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    // Exits cleanly but never writes its output.
    let binary = write_fake_binary(bin_dir.path(), "#!/bin/sh\nexit 0\n");

    let mut settings = fast_settings(binary, work_root.path());
    settings.only = only(&["basic_parsing", "failover_seamless", "health_strict"]);
    let mut harness = Harness::new(settings).unwrap();
    let results = harness.run();

    assert!(is_check(results.get("basic_parsing"), true));
    assert!(results.get("failover_seamless").is_some_and(Verdict::is_fatal));
    assert_eq!(
        results.get("health_strict"),
        Some(&Verdict::marker("not run"))
    );
    assert!(!results.success());
    assert_eq!(results.summarize().total, 1);

    info!("TEST PASS: test_fixture_failure_is_run_fatal");
}

#[test]
fn test_webhook_binary_crash_fails_control_scenario() {
    init_test_logging();
    info!("TEST START: test_webhook_binary_crash_fails_control_scenario");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(bin_dir.path(), "#!/bin/sh
echo 'fatal: crash' >&2
exit 1
");

    let mut settings = fast_settings(binary, work_root.path());
    settings.only = only(&["webhook_control"]);
    let mut harness = Harness::new(settings).unwrap();
    let results = harness.run();

    match results.get("webhook_control") {
        Some(Verdict::Check { passed: false, message: Some(message), .. }) => {
            assert!(message.contains("status 1"), "{message}");
            assert!(message.contains("fatal: crash"), "{message}");
        }
        other => panic!("unexpected verdict {other:?}"),
    }
    assert!(results.fatal().is_none());
    assert!(!results.success());
    assert_eq!(harness.registry().active_count(), 0);

    info!("TEST PASS: test_webhook_binary_crash_fails_control_scenario");
}

#[test]
fn test_kill_failure_skips_remaining_scenarios() {
    init_test_logging();
    info!("TEST START: test_kill_failure_skips_remaining_scenarios");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(bin_dir.path(), FAKE_MSWITCH_BINARY);

    let first = Scenario::new("first", "Passes", |_, _| Ok(()));
    let stuck = Scenario::new("stuck", "Process outlives its kill", |_, _| {
        Err(HarnessError::KillFailed { pid: 4242 })
    });
    let after = Scenario::new("after", "Never reached", |_, _| Ok(()));
    let last = Scenario::new("last", "Never reached", |_, _| Ok(()));

    let mut harness = Harness::new(fast_settings(binary, work_root.path()))
        .unwrap()
        .with_catalog(vec![first, stuck, after, last]);
    let results = harness.run();

    assert!(is_check(results.get("first"), true));
    assert!(results.get("stuck").is_some_and(Verdict::is_fatal));
    assert_eq!(results.get("after"), Some(&Verdict::marker("not run")));
    assert_eq!(results.get("last"), Some(&Verdict::marker("not run")));
    assert!(results.fatal().is_some());
    assert!(!results.success());
    // Markers never count toward the ratio.
    assert_eq!(results.summarize().total, 1);

    info!("TEST PASS: test_kill_failure_skips_remaining_scenarios");
}

#[test]
fn test_hung_binary_times_out_and_is_reaped() {
    init_test_logging();
    info!("TEST START: test_hung_binary_times_out_and_is_reaped");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(bin_dir.path(), "#!/bin/sh\nexec sleep 30\n");

    let hung = Scenario::new("hung", "Binary that never exits", |ctx, deadline| {
        ctx.supervisor.run(["-msw.enable", "1"], deadline)?.require_success(deadline)?;
        Ok(())
    })
    .with_timeout(SHORT);
    let after = Scenario::new("after", "Runs after the timeout", |_, _| Ok(()));

    let mut harness = Harness::new(fast_settings(binary, work_root.path()))
        .unwrap()
        .with_catalog(vec![hung, after]);
    let start = Instant::now();
    let results = harness.run();

    // Deadline plus grace period, with slack for process start-up.
    assert!(start.elapsed() < SHORT + Duration::from_millis(300) + Duration::from_secs(2));
    match results.get("hung") {
        Some(Verdict::Check { passed: false, message: Some(message), .. }) => {
            assert!(message.contains("timed out"), "{message}");
        }
        other => panic!("unexpected verdict {other:?}"),
    }
    assert!(is_check(results.get("after"), true));
    assert_eq!(harness.registry().active_count(), 0);

    info!("TEST PASS: test_hung_binary_times_out_and_is_reaped");
}

#[test]
fn test_panicking_scenario_becomes_failure() {
    init_test_logging();
    info!("TEST START: test_panicking_scenario_becomes_failure");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(bin_dir.path(), FAKE_MSWITCH_BINARY);

    let boom = Scenario::new("boom", "Panics", |_, _| -> Result<(), HarnessError> {
        panic!("scenario exploded")
    });
    let mut harness = Harness::new(fast_settings(binary, work_root.path()))
        .unwrap()
        .with_catalog(vec![boom]);
    let results = harness.run();

    match results.get("boom") {
        Some(Verdict::Check { passed: false, message: Some(message), .. }) => {
            assert!(message.contains("scenario exploded"));
        }
        other => panic!("unexpected verdict {other:?}"),
    }

    info!("TEST PASS: test_panicking_scenario_becomes_failure");
}

#[test]
fn test_interrupt_kills_process_and_skips_remaining() {
    init_test_logging();
    info!("TEST START: test_interrupt_kills_process_and_skips_remaining");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(bin_dir.path(), "#!/bin/sh\nexec sleep 30\n");

    let harness = Harness::new(fast_settings(binary, work_root.path())).unwrap();
    let interrupter = harness.interrupter();

    let long_run = Scenario::new("long_run", "Interrupted mid-run", move |ctx, deadline| {
        let interrupter = interrupter.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            interrupter.interrupt();
        });
        ctx.supervisor.run(["-msw.enable", "1"], deadline)?;
        Ok(())
    })
    .with_timeout(Duration::from_secs(20));
    let skipped = Scenario::new("skipped", "Never reached", |_, _| Ok(()));

    let mut harness = harness.with_catalog(vec![long_run, skipped]);
    let start = Instant::now();
    let results = harness.run();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(results.get("long_run"), Some(&Verdict::marker("interrupted")));
    assert_eq!(results.get("skipped"), Some(&Verdict::marker("not run")));
    assert!(!results.success());
    assert_eq!(harness.registry().active_count(), 0);

    info!("TEST PASS: test_interrupt_kills_process_and_skips_remaining");
}

#[test]
fn test_keep_artifacts_preserves_work_dir() {
    init_test_logging();
    info!("TEST START: test_keep_artifacts_preserves_work_dir");

    let bin_dir = tempfile::tempdir().unwrap();
    let work_root = tempfile::tempdir().unwrap();
    let binary = write_fake_binary(bin_dir.path(), FAKE_MSWITCH_BINARY);

    let mut settings = fast_settings(binary, work_root.path());
    settings.keep_artifacts = true;
    settings.only = only(&["json_configuration"]);
    let mut harness = Harness::new(settings).unwrap();
    let work_dir = harness.work_dir().to_path_buf();
    let results = harness.run();

    assert!(results.success());
    let config = std::fs::read_to_string(work_dir.join("mswitch_config.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(json["mswitch"]["buffer_ms"], 1000);
    assert_eq!(json["mswitch"]["webhook"]["methods"], serde_json::json!(["GET", "POST"]));
    assert_eq!(json["mswitch"]["revert"]["policy"], "auto");

    info!("TEST PASS: test_keep_artifacts_preserves_work_dir");
}
