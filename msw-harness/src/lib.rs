//! MSwitch scenario harness.
//!
//! Drives an external media binary through its `-msw.*` command-line surface
//! and an HTTP control plane, and aggregates per-scenario verdicts.

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod fixtures;
pub mod harness;
pub mod report;
pub mod scenarios;
pub mod settings;
pub mod simulator;
pub mod supervisor;

pub use client::{ControlPlaneClient, FailoverAction};
pub use error::{HarnessError, HarnessResult};
pub use fixtures::{Fixture, FixtureProvider, FixtureSet, FixtureSpec};
pub use harness::{Harness, Interrupter, resolve_executable};
pub use report::{ResultAggregator, RunReport, Summary, TestResult, Verdict};
pub use scenarios::{Scenario, ScenarioContext, catalog};
pub use settings::HarnessSettings;
pub use simulator::{
    ControlPlaneSimulator, FailoverResponse, RequestLog, SimulatorContext, StatusResponse,
    SwitchResponse, WebhookRequestRecord, create_router,
};
pub use supervisor::{ExitOutcome, ProcessRegistry, ProcessState, ProcessSupervisor, Supervised};
