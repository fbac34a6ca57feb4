//! Shared vocabulary for driving the MSwitch feature of the binary under test.
//!
//! - [`options`]: typed builder for the `-msw.*` command-line surface
//! - [`config`]: the structured configuration document passed via `-msw.config`
//! - [`logging`]: tracing bootstrap shared by the harness binary and tests

pub mod config;
pub mod logging;
pub mod options;

pub use config::{
    AutoFailoverConfig, ConfigDocument, ConfigError, MswitchConfig, RevertConfig, WebhookConfig,
};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use options::{
    FailoverMode, HealthThresholds, IngestMode, MSW_MAX_SOURCES, MswitchArgs, OnCut,
    OptionsError, RevertPolicy, Source, SourceList, THRESHOLD_PROFILES, ThresholdProfile,
};
