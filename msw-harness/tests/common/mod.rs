//! Shared helpers for msw-harness integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use msw_harness::HarnessSettings;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().with_target(true))
        .with(filter)
        .try_init();
}

/// Stands in for the binary under test: accepts every flag, creates any
/// absolute `.ts` output it is given, and stays up when the webhook is on.
pub const FAKE_MSWITCH_BINARY: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    /*.ts) : > "$arg" ;;
    -msw.webhook.enable) exec sleep 30 ;;
  esac
done
exit 0
"#;

/// Write an executable shell script named `ffmpeg` into `dir`.
#[cfg(unix)]
pub fn write_fake_binary(dir: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("ffmpeg");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Settings tuned for short test runs against a fake binary.
pub fn fast_settings(binary: PathBuf, work_root: &Path) -> HarnessSettings {
    HarnessSettings {
        binary,
        grace_period_ms: 300,
        kill_timeout_ms: 1000,
        readiness_timeout_ms: 3000,
        http_timeout_ms: 2000,
        fixture_duration_secs: 1,
        work_root: Some(work_root.to_path_buf()),
        ..HarnessSettings::default()
    }
}

pub fn only(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

pub const SHORT: Duration = Duration::from_millis(300);
