//! The scenario catalog.
//!
//! Each scenario builds an argument list (or configuration document) for the
//! binary under test, runs it through the supervisor, and turns what it
//! observes into `Ok(())` or an error describing why it failed.

use std::path::Path;
use std::time::Duration;

use msw_common::{
    ConfigDocument, FailoverMode, HealthThresholds, IngestMode, MswitchArgs, MswitchConfig, OnCut,
    SourceList, THRESHOLD_PROFILES,
};
use tracing::{debug, info, warn};

use crate::client::{ControlPlaneClient, FailoverAction};
use crate::error::{HarnessError, HarnessResult};
use crate::fixtures::FixtureSet;
use crate::settings::HarnessSettings;
use crate::simulator::ControlPlaneSimulator;
use crate::supervisor::{ExitOutcome, ProcessSupervisor};

/// Source names that are never rendered; used where only parsing matters.
const PLACEHOLDER_SOURCES: [&str; 3] = ["test1.ts", "test2.ts", "test3.ts"];
const WEBHOOK_METHODS: [&str; 2] = ["GET", "POST"];
const MIN_CONTROL_INTERACTIONS: usize = 3;
/// Time a webhook-enabled run gets to start before it is exercised.
const STARTUP_SETTLE: Duration = Duration::from_millis(250);

/// What a scenario may read while it runs.
pub struct ScenarioContext<'a> {
    pub supervisor: &'a ProcessSupervisor,
    pub settings: &'a HarnessSettings,
    pub work_dir: &'a Path,
    pub fixtures: Option<&'a FixtureSet>,
    pub simulator: Option<&'a ControlPlaneSimulator>,
}

impl ScenarioContext<'_> {
    fn fixtures(&self) -> HarnessResult<&FixtureSet> {
        self.fixtures.ok_or_else(|| HarnessError::Fixture {
            name: "pattern set".into(),
            reason: "fixtures were not prepared for this scenario".into(),
        })
    }

    fn simulator(&self) -> HarnessResult<&ControlPlaneSimulator> {
        self.simulator
            .ok_or_else(|| HarnessError::Simulator("simulator is not running".into()))
    }
}

type ScenarioBody = Box<dyn Fn(&ScenarioContext<'_>, Duration) -> HarnessResult<()>>;

pub struct Scenario {
    pub name: String,
    pub description: String,
    pub timeout: Option<Duration>,
    pub needs_fixtures: bool,
    pub needs_simulator: bool,
    body: ScenarioBody,
}

impl Scenario {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        body: impl Fn(&ScenarioContext<'_>, Duration) -> HarnessResult<()> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            timeout: None,
            needs_fixtures: false,
            needs_simulator: false,
            body: Box::new(body),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn needs_fixtures(mut self) -> Self {
        self.needs_fixtures = true;
        self
    }

    pub fn needs_simulator(mut self) -> Self {
        self.needs_simulator = true;
        self
    }

    pub fn deadline(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    pub fn run(&self, ctx: &ScenarioContext<'_>, deadline: Duration) -> HarnessResult<()> {
        (self.body)(ctx, deadline)
    }
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("needs_fixtures", &self.needs_fixtures)
            .field("needs_simulator", &self.needs_simulator)
            .finish_non_exhaustive()
    }
}

/// One failover-mode run against the rendered fixtures.
#[derive(Debug, Clone, Copy)]
pub struct FailoverCase {
    pub name: &'static str,
    pub label: &'static str,
    pub ingest: IngestMode,
    pub mode: FailoverMode,
    /// `(freeze_on_cut seconds, on_cut)`, set for cutover only.
    pub cut: Option<(u32, OnCut)>,
    pub thresholds: HealthThresholds,
}

pub const FAILOVER_CASES: [FailoverCase; 3] = [
    FailoverCase {
        name: "failover_seamless",
        label: "Seamless failover",
        ingest: IngestMode::Hot,
        mode: FailoverMode::Seamless,
        cut: None,
        thresholds: HealthThresholds::const_new(1, 0.5, 5),
    },
    FailoverCase {
        name: "failover_graceful",
        label: "Graceful failover",
        ingest: IngestMode::Standby,
        mode: FailoverMode::Graceful,
        cut: None,
        thresholds: HealthThresholds::const_new(2, 1.0, 8),
    },
    FailoverCase {
        name: "failover_cutover",
        label: "Cutover failover",
        ingest: IngestMode::Hot,
        mode: FailoverMode::Cutover,
        cut: Some((2, OnCut::Freeze)),
        thresholds: HealthThresholds::const_new(3, 1.5, 6),
    },
];

const FAILOVER_RUN_SECS: u32 = 5;
const HEALTH_RUN_SECS: u32 = 3;

fn placeholder_sources() -> HarnessResult<SourceList> {
    Ok(SourceList::from_paths(PLACEHOLDER_SOURCES)?)
}

pub fn basic_parsing_args() -> HarnessResult<Vec<String>> {
    Ok(MswitchArgs::new()
        .enable(true)
        .sources(placeholder_sources()?)
        .ingest(IngestMode::Hot)
        .mode(FailoverMode::Graceful)
        .auto_failover(HealthThresholds::moderate())
        .lavfi_input("testsrc=duration=1:size=320x240:rate=1")
        .null_output()
        .build()?)
}

pub fn failover_args(case: &FailoverCase, fixtures: &[String]) -> HarnessResult<Vec<String>> {
    let mut args = MswitchArgs::new()
        .enable(true)
        .sources(SourceList::from_paths(fixtures)?)
        .ingest(case.ingest)
        .mode(case.mode);
    if let Some((seconds, on_cut)) = case.cut {
        args = args.freeze_on_cut(seconds).on_cut(on_cut);
    }
    Ok(args
        .auto_failover(case.thresholds)
        .duration_secs(FAILOVER_RUN_SECS)
        .null_output()
        .build()?)
}

pub fn health_args(thresholds: HealthThresholds, fixtures: &[String]) -> HarnessResult<Vec<String>> {
    Ok(MswitchArgs::new()
        .enable(true)
        .sources(SourceList::from_paths(fixtures)?)
        .ingest(IngestMode::Hot)
        .mode(FailoverMode::Graceful)
        .auto_failover(thresholds)
        .duration_secs(HEALTH_RUN_SECS)
        .null_output()
        .build()?)
}

pub fn webhook_args(port: u16) -> HarnessResult<Vec<String>> {
    Ok(MswitchArgs::new()
        .enable(true)
        .sources(placeholder_sources()?)
        .webhook(port, WEBHOOK_METHODS)
        .lavfi_input("testsrc=duration=10:size=320x240:rate=1")
        .null_output()
        .build()?)
}

pub fn json_config_args(config_path: &Path) -> HarnessResult<Vec<String>> {
    Ok(MswitchArgs::new()
        .config_file(config_path)
        .lavfi_input("testsrc=duration=3:size=320x240:rate=1")
        .null_output()
        .build()?)
}

fn expect_clean_exit(ctx: &ScenarioContext<'_>, args: &[String], deadline: Duration) -> HarnessResult<()> {
    let outcome = ctx.supervisor.run(args, deadline)?;
    outcome.require_success(deadline)?;
    Ok(())
}

fn basic_parsing(ctx: &ScenarioContext<'_>, deadline: Duration) -> HarnessResult<()> {
    let outcome = ctx.supervisor.run(basic_parsing_args()?, deadline)?;
    // A binary that rejects a flag but names the feature still parsed it.
    if outcome.exit_code().is_some_and(|code| code != 0)
        && outcome.stderr_text().to_lowercase().contains("msw")
    {
        debug!(exit_code = ?outcome.exit_code(), "non-zero exit with feature diagnostics accepted");
        return Ok(());
    }
    outcome.require_success(deadline)?;
    Ok(())
}

fn failover(case: FailoverCase) -> impl Fn(&ScenarioContext<'_>, Duration) -> HarnessResult<()> {
    move |ctx: &ScenarioContext<'_>, deadline: Duration| {
        let args = failover_args(&case, &ctx.fixtures()?.paths())?;
        expect_clean_exit(ctx, &args, deadline)
    }
}

fn health(thresholds: HealthThresholds) -> impl Fn(&ScenarioContext<'_>, Duration) -> HarnessResult<()> {
    move |ctx: &ScenarioContext<'_>, deadline: Duration| {
        let args = health_args(thresholds, &ctx.fixtures()?.paths())?;
        expect_clean_exit(ctx, &args, deadline)
    }
}

/// Status query, source switch and failover toggle against the simulator.
fn exercise_control_plane(
    ctx: &ScenarioContext<'_>,
    simulator: &ControlPlaneSimulator,
    deadline: Duration,
) -> HarnessResult<()> {
    let client = ControlPlaneClient::new(simulator.base_url(), ctx.settings.http_timeout());
    client.wait_until_ready(ctx.settings.readiness_timeout().min(deadline))?;
    let baseline = simulator.log().len();

    let status = client.status()?;
    if status.status != "active" {
        return Err(HarnessError::MalformedResponse {
            url: format!("{}/status", client.base_url()),
            reason: format!("unexpected status '{}'", status.status),
        });
    }
    let switched = client.switch_source("1")?;
    let failover = client.toggle_failover(FailoverAction::Enable)?;
    debug!(?status, ?switched, ?failover, "control-plane responses");

    let recorded = simulator.log().since(baseline);
    for record in &recorded {
        debug!(
            seq = record.seq,
            method = %record.method,
            path = %record.path,
            body = %record.body_text(),
            "recorded interaction"
        );
    }
    info!(count = recorded.len(), "control-plane interactions recorded");

    if recorded.len() < MIN_CONTROL_INTERACTIONS {
        return Err(HarnessError::AssertionFailed(format!(
            "expected at least {MIN_CONTROL_INTERACTIONS} control-plane interactions, recorded {}",
            recorded.len()
        )));
    }
    Ok(())
}

fn webhook_control(ctx: &ScenarioContext<'_>, deadline: Duration) -> HarnessResult<()> {
    let simulator = ctx.simulator()?;
    let child = ctx.supervisor.spawn(webhook_args(ctx.settings.webhook_port)?)?;
    std::thread::sleep(STARTUP_SETTLE.min(deadline));

    let exercised = exercise_control_plane(ctx, simulator, deadline);
    // A webhook-enabled run stays up until stopped; leaving early is a failure.
    let exited_early = ctx.supervisor.exited(&child)?;

    match ctx.supervisor.terminate(child) {
        Ok(ExitOutcome::KillFailed { pid }) => return Err(HarnessError::KillFailed { pid }),
        Ok(outcome) if exited_early.is_some_and(|code| code != 0) => {
            outcome.require_success(deadline)?;
        }
        Ok(outcome) => debug!(exit_code = ?outcome.exit_code(), "webhook-enabled run stopped"),
        Err(e) if e.is_run_fatal() => return Err(e),
        Err(e) => warn!("stopping webhook-enabled run failed: {e}"),
    }
    exercised
}

fn json_configuration(ctx: &ScenarioContext<'_>, deadline: Duration) -> HarnessResult<()> {
    let document = ConfigDocument::new(MswitchConfig::sample(
        PLACEHOLDER_SOURCES,
        ctx.settings.webhook_port,
    ));
    let path = ctx.work_dir.join("mswitch_config.json");
    document.write_to(&path)?;
    // What the binary reads must survive our own strict schema.
    ConfigDocument::load(&path)?;

    expect_clean_exit(ctx, &json_config_args(&path)?, deadline)
}

/// Every scenario, in execution order.
pub fn catalog() -> Vec<Scenario> {
    let mut scenarios = vec![
        Scenario::new(
            "basic_parsing",
            "Basic MSwitch option parsing",
            basic_parsing,
        )
        .with_timeout(Duration::from_secs(10)),
    ];

    scenarios.extend(FAILOVER_CASES.iter().map(|case| {
        Scenario::new(case.name, case.label, failover(*case))
            .with_timeout(Duration::from_secs(15))
            .needs_fixtures()
    }));

    scenarios.push(
        Scenario::new(
            "webhook_control",
            "Webhook control-plane interaction",
            webhook_control,
        )
        .with_timeout(Duration::from_secs(15))
        .needs_simulator(),
    );

    scenarios.extend(THRESHOLD_PROFILES.iter().map(|profile| {
        Scenario::new(
            format!("health_{}", profile.name),
            profile.label,
            health(profile.thresholds),
        )
        .with_timeout(Duration::from_secs(10))
        .needs_fixtures()
    }));

    scenarios.push(
        Scenario::new(
            "json_configuration",
            "JSON configuration loading",
            json_configuration,
        )
        .with_timeout(Duration::from_secs(10)),
    );

    scenarios
}
