//! Harness error taxonomy.
//!
//! Scenario-local errors are converted into a failed verdict at the scenario
//! boundary. Run-fatal errors stop the catalog; teardown still runs.

use std::time::Duration;

use msw_common::{ConfigError, OptionsError};

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailure { program: String, reason: String },

    #[error("process timed out after {0:?}")]
    Timeout(Duration),

    #[error("process exited with status {exit_code}: {stderr_tail}")]
    NonZeroExit { exit_code: i32, stderr_tail: String },

    #[error("control plane unreachable at {url}: {reason}")]
    ControlPlaneUnreachable { url: String, reason: String },

    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("process {pid} survived a forced kill")]
    KillFailed { pid: u32 },

    #[error("fixture '{name}' could not be created: {reason}")]
    Fixture { name: String, reason: String },

    #[error("control-plane simulator error: {0}")]
    Simulator(String),

    #[error("invalid harness settings: {0}")]
    Settings(String),

    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    #[error("run interrupted")]
    Interrupted,

    #[error("scenario panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Errors that make continuing the catalog unsafe or pointless.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailure { .. } | Self::KillFailed { .. } | Self::Fixture { .. } | Self::Interrupted
        )
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
