//! Run orchestration: preflight, the catalog loop, interruption and teardown.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::fixtures::{FixtureProvider, FixtureSet};
use crate::report::{ResultAggregator, Verdict};
use crate::scenarios::{Scenario, ScenarioContext, catalog};
use crate::settings::HarnessSettings;
use crate::simulator::ControlPlaneSimulator;
use crate::supervisor::{ProcessRegistry, ProcessSupervisor};

/// Stops the current run: kills supervised processes and skips the rest of
/// the catalog.
#[derive(Debug, Clone)]
pub struct Interrupter {
    flag: Arc<AtomicBool>,
    registry: ProcessRegistry,
}

impl Interrupter {
    pub fn interrupt(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let killed = self.registry.kill_all();
        warn!(killed, "Run interrupted, supervised processes killed");
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    settings: HarnessSettings,
    catalog: Vec<Scenario>,
    runtime: Runtime,
    registry: ProcessRegistry,
    supervisor: ProcessSupervisor,
    work_dir: Option<TempDir>,
    work_path: PathBuf,
    fixtures: Option<FixtureSet>,
    simulator: Option<ControlPlaneSimulator>,
    interrupted: Arc<AtomicBool>,
    torn_down: bool,
}

impl Harness {
    pub fn new(settings: HarnessSettings) -> HarnessResult<Self> {
        settings.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("msw-control-plane")
            .enable_all()
            .build()?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("mswitch_test_");
        let work_dir = match &settings.work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let work_path = work_dir.path().to_path_buf();
        info!(work_dir = %work_path.display(), "Scratch directory created");

        let registry = ProcessRegistry::default();
        let supervisor =
            Self::make_supervisor(&settings, settings.binary.clone(), &work_path, &registry);

        Ok(Self {
            settings,
            catalog: catalog(),
            runtime,
            registry,
            supervisor,
            work_dir: Some(work_dir),
            work_path,
            fixtures: None,
            simulator: None,
            interrupted: Arc::new(AtomicBool::new(false)),
            torn_down: false,
        })
    }

    /// Replace the built-in catalog.
    pub fn with_catalog(mut self, catalog: Vec<Scenario>) -> Self {
        self.catalog = catalog;
        self
    }

    fn make_supervisor(
        settings: &HarnessSettings,
        binary: PathBuf,
        work_dir: &Path,
        registry: &ProcessRegistry,
    ) -> ProcessSupervisor {
        ProcessSupervisor::new(binary, settings.grace_period(), settings.kill_timeout())
            .with_working_dir(work_dir)
            .with_registry(registry.clone())
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_path
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            flag: self.interrupted.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Requests recorded by the simulator, zero if it never started.
    pub fn simulator_requests(&self) -> usize {
        self.simulator.as_ref().map_or(0, |s| s.log().len())
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// The binary must exist and be executable before anything runs.
    fn preflight(&mut self) -> HarnessResult<()> {
        let binary = resolve_executable(&self.settings.binary)?;
        info!(binary = %binary.display(), "Binary under test resolved");
        self.supervisor =
            Self::make_supervisor(&self.settings, binary, &self.work_path, &self.registry);
        Ok(())
    }

    fn ensure_fixtures(&mut self) -> HarnessResult<()> {
        if self.fixtures.is_some() {
            return Ok(());
        }
        let encoder = resolve_executable(self.settings.encoder()).map_err(|e| {
            HarnessError::Fixture {
                name: "encoder".into(),
                reason: e.to_string(),
            }
        })?;

        println!("\nGenerating test streams...");
        let provider = FixtureProvider::new(
            encoder,
            &self.work_path,
            self.settings.fixture_duration_secs,
        );
        let set = provider.create(&self.supervisor)?;
        println!("Generated {} test streams", set.len());
        self.fixtures = Some(set);
        Ok(())
    }

    fn ensure_simulator(&mut self) -> HarnessResult<()> {
        if self.simulator.is_none() {
            let simulator =
                ControlPlaneSimulator::start(self.runtime.handle(), self.settings.simulator_port)?;
            self.simulator = Some(simulator);
        }
        Ok(())
    }

    /// Run one scenario. `Err` is reserved for run-fatal conditions.
    fn run_scenario(&mut self, scenario: &Scenario) -> HarnessResult<Verdict> {
        let start = Instant::now();
        if scenario.needs_fixtures {
            self.ensure_fixtures()?;
        }
        if scenario.needs_simulator {
            if let Err(e) = self.ensure_simulator() {
                return Ok(Verdict::fail(e.to_string(), start.elapsed()));
            }
        }

        let deadline = scenario.deadline(self.settings.default_deadline());
        let ctx = ScenarioContext {
            supervisor: &self.supervisor,
            settings: &self.settings,
            work_dir: &self.work_path,
            fixtures: self.fixtures.as_ref(),
            simulator: self.simulator.as_ref(),
        };

        let result = catch_unwind(AssertUnwindSafe(|| scenario.run(&ctx, deadline)))
            .unwrap_or_else(|panic| Err(HarnessError::Panicked(panic_message(panic.as_ref()))));
        let elapsed = start.elapsed();

        if self.is_interrupted() {
            return Err(HarnessError::Interrupted);
        }
        match result {
            Ok(()) => Ok(Verdict::pass(elapsed)),
            Err(e) if e.is_run_fatal() => Err(e),
            Err(e) => Ok(Verdict::fail(e.to_string(), elapsed)),
        }
    }

    /// Execute the selected catalog and tear everything down.
    pub fn run(&mut self) -> ResultAggregator {
        let mut results = ResultAggregator::new();
        info!(run_id = %results.run_id(), "Starting MSwitch scenario run");

        if let Err(e) = self.preflight() {
            error!("Preflight failed: {e}");
            println!("Error: {e}");
            results.record("preflight", Verdict::fatal(e.to_string()));
            self.teardown();
            return results;
        }

        let interrupter = self.interrupter();
        let watcher = self.runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupter.interrupt();
            }
        });

        let catalog = std::mem::take(&mut self.catalog);
        let selected: Vec<&Scenario> = catalog
            .iter()
            .filter(|s| self.settings.selects(&s.name))
            .collect();
        let mut aborted = false;
        for scenario in selected {
            if aborted {
                results.record(&scenario.name, Verdict::marker("not run"));
                continue;
            }
            if self.is_interrupted() {
                aborted = true;
                results.mark_fatal("run interrupted");
                results.record(&scenario.name, Verdict::marker("interrupted"));
                continue;
            }

            println!("\n=== {} ===", scenario.description);
            info!(scenario = %scenario.name, "Scenario started");
            match self.run_scenario(scenario) {
                Ok(verdict) => {
                    match &verdict {
                        Verdict::Check { passed: true, .. } => {
                            println!("{}: PASSED", scenario.name);
                        }
                        Verdict::Check { message, .. } => {
                            println!("{}: FAILED", scenario.name);
                            if let Some(message) = message {
                                println!("  {message}");
                            }
                        }
                        Verdict::Marker { text, .. } => println!("{}: {text}", scenario.name),
                    }
                    info!(scenario = %scenario.name, ?verdict, "Scenario finished");
                    results.record(&scenario.name, verdict);
                }
                Err(HarnessError::Interrupted) => {
                    println!("\nTest interrupted by user");
                    results.mark_fatal("run interrupted");
                    results.record(&scenario.name, Verdict::marker("interrupted"));
                    aborted = true;
                }
                Err(e) => {
                    error!(scenario = %scenario.name, "Run-fatal error: {e}");
                    println!("{}: FATAL - {e}", scenario.name);
                    results.record(&scenario.name, Verdict::fatal(e.to_string()));
                    aborted = true;
                }
            }
        }
        self.catalog = catalog;

        watcher.abort();
        self.teardown();
        results
    }

    /// Processes, then the simulator, then scratch storage. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let survivors = self.supervisor.shutdown();
        if !survivors.is_empty() {
            error!(?survivors, "Processes could not be reaped at teardown");
        }

        if let Some(simulator) = self.simulator.as_mut() {
            if let Err(e) = simulator.stop() {
                warn!("Simulator shutdown failed: {e}");
            }
        }

        if let Some(dir) = self.work_dir.take() {
            if self.settings.keep_artifacts {
                let kept = dir.keep();
                info!(path = %kept.display(), "Keeping test artifacts");
            } else if let Err(e) = dir.close() {
                warn!(path = %self.work_path.display(), "Failed to remove scratch directory: {e}");
            }
        }
        info!("Teardown complete");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Resolve `program` to an absolute path of an executable file. Bare names
/// are looked up on `PATH`.
pub fn resolve_executable(program: &Path) -> HarnessResult<PathBuf> {
    let failure = |reason: String| HarnessError::SpawnFailure {
        program: program.display().to_string(),
        reason,
    };

    let candidate = if program.components().count() > 1 || program.is_absolute() {
        program.to_path_buf()
    } else {
        std::env::var_os("PATH")
            .and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(program))
                    .find(|path| path.is_file())
            })
            .ok_or_else(|| failure("binary not found on PATH".into()))?
    };

    let metadata = std::fs::metadata(&candidate)
        .map_err(|e| failure(format!("binary not found: {e}")))?;
    if !metadata.is_file() {
        return Err(failure("not a regular file".into()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(failure("file is not executable".into()));
        }
    }
    std::fs::canonicalize(&candidate).map_err(|e| failure(e.to_string()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
