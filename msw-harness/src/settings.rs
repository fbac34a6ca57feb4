//! Harness settings: defaults, optional TOML file, CLI overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSettings {
    /// Binary under test.
    pub binary: PathBuf,
    /// Program used to render fixtures; the binary under test when unset.
    pub encoder: Option<PathBuf>,
    /// Port for the control-plane simulator (0 picks a free port).
    pub simulator_port: u16,
    /// Port the binary under test is told to serve its webhook on.
    pub webhook_port: u16,
    pub grace_period_ms: u64,
    pub kill_timeout_ms: u64,
    pub readiness_timeout_ms: u64,
    pub http_timeout_ms: u64,
    /// Deadline for scenarios that do not declare their own.
    pub default_deadline_secs: u64,
    pub fixture_duration_secs: u32,
    /// Keep the scratch directory (fixtures, config documents) after the run.
    pub keep_artifacts: bool,
    /// Parent for the scratch directory; the system temp dir when unset.
    pub work_root: Option<PathBuf>,
    /// Scenario names to run; everything when empty.
    pub only: Vec<String>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./ffmpeg"),
            encoder: None,
            simulator_port: 0,
            webhook_port: 8080,
            grace_period_ms: 5000,
            kill_timeout_ms: 2000,
            readiness_timeout_ms: 5000,
            http_timeout_ms: 5000,
            default_deadline_secs: 30,
            fixture_duration_secs: 10,
            keep_artifacts: false,
            work_root: None,
            only: Vec::new(),
        }
    }
}

impl HarnessSettings {
    pub fn from_toml_str(raw: &str) -> HarnessResult<Self> {
        let settings: Self =
            toml::from_str(raw).map_err(|e| HarnessError::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file(path: &Path) -> HarnessResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Settings(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.binary.as_os_str().is_empty() {
            return Err(HarnessError::Settings("binary path is empty".into()));
        }
        if self.kill_timeout_ms == 0 {
            return Err(HarnessError::Settings(
                "kill_timeout_ms must be positive".into(),
            ));
        }
        if self.default_deadline_secs == 0 {
            return Err(HarnessError::Settings(
                "default_deadline_secs must be positive".into(),
            ));
        }
        if self.fixture_duration_secs == 0 {
            return Err(HarnessError::Settings(
                "fixture_duration_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn encoder(&self) -> &Path {
        self.encoder.as_deref().unwrap_or(&self.binary)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }

    pub fn selects(&self, scenario: &str) -> bool {
        self.only.is_empty() || self.only.iter().any(|name| name == scenario)
    }
}
