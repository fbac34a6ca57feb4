//! Process supervision for the binary under test.
//!
//! Every spawned process is registered in a [`ProcessRegistry`] owned by the
//! supervisor. A process is released from the registry when its owner has
//! reaped it; whatever is still registered at teardown is force-killed and
//! reaped by [`ProcessRegistry::shutdown_all`].
//!
//! On unix each process leads its own process group, and termination signals
//! go to the whole group so wrapper scripts cannot leave descendants behind.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{HarnessError, HarnessResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of one supervised process. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "code")]
pub enum ProcessState {
    Running,
    Exited(i32),
    TimedOut,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Final result of a supervised run.
#[derive(Debug, Clone)]
pub enum ExitOutcome {
    Completed {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        duration: Duration,
    },
    TimedOut {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        elapsed: Duration,
    },
    /// The process outlived a forced kill and could not be reaped.
    KillFailed { pid: u32 },
}

impl ExitOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Completed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code() == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        match self {
            Self::Completed { stdout, .. } | Self::TimedOut { stdout, .. } => {
                String::from_utf8_lossy(stdout).into_owned()
            }
            Self::KillFailed { .. } => String::new(),
        }
    }

    pub fn stderr_text(&self) -> String {
        match self {
            Self::Completed { stderr, .. } | Self::TimedOut { stderr, .. } => {
                String::from_utf8_lossy(stderr).into_owned()
            }
            Self::KillFailed { .. } => String::new(),
        }
    }

    /// Last `lines` lines of stderr, for failure messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let stderr = self.stderr_text();
        let all: Vec<&str> = stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    /// Require a clean exit: timeouts, kill failures and non-zero codes
    /// become the matching [`HarnessError`].
    pub fn require_success(self, deadline: Duration) -> HarnessResult<Self> {
        match self {
            Self::Completed { exit_code: 0, .. } => Ok(self),
            Self::Completed { exit_code, .. } => Err(HarnessError::NonZeroExit {
                exit_code,
                stderr_tail: self.stderr_tail(8),
            }),
            Self::TimedOut { .. } => Err(HarnessError::Timeout(deadline)),
            Self::KillFailed { pid } => Err(HarnessError::KillFailed { pid }),
        }
    }
}

/// One registered process. Owned by the registry until released.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    args: Vec<String>,
    started_at: Instant,
    state: ProcessState,
    child: Child,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn settle(&mut self, state: ProcessState) -> ProcessState {
        if !self.state.is_terminal() {
            self.state = state;
        }
        self.state
    }

    fn try_reap(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    /// SIGKILL the process group, then the leader itself.
    fn force_kill(&mut self) -> std::io::Result<()> {
        signal_group(self.pid, "KILL");
        match self.child.kill() {
            // Already reaped or already dead.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

/// Registry of every process the supervisor spawned and has not yet released.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<BTreeMap<u64, ProcessHandle>>>,
}

impl ProcessRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, ProcessHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.lock().values().map(ProcessHandle::pid).collect()
    }

    fn insert(&self, id: u64, handle: ProcessHandle) {
        self.lock().insert(id, handle);
    }

    fn release(&self, id: u64) -> Option<ProcessHandle> {
        self.lock().remove(&id)
    }

    fn with<R>(&self, id: u64, f: impl FnOnce(&mut ProcessHandle) -> R) -> Option<R> {
        self.lock().get_mut(&id).map(f)
    }

    /// Force-kill every running process and mark it killed. Owners still
    /// reap their own handles; used when the run is interrupted.
    pub fn kill_all(&self) -> usize {
        let mut killed = 0;
        for handle in self.lock().values_mut() {
            if handle.state.is_terminal() {
                continue;
            }
            handle.settle(ProcessState::Killed);
            if let Err(e) = handle.force_kill() {
                warn!(pid = handle.pid, "kill on interrupt failed: {e}");
            }
            killed += 1;
        }
        killed
    }

    /// Kill and reap everything still registered, leaving the registry empty.
    ///
    /// Returns the pids that could not be reaped within `kill_timeout`.
    pub fn shutdown_all(&self, kill_timeout: Duration) -> Vec<u32> {
        let mut survivors = Vec::new();
        let drained = std::mem::take(&mut *self.lock());
        for (_, mut handle) in drained {
            info!(
                pid = handle.pid,
                age_ms = handle.started_at.elapsed().as_millis() as u64,
                args = ?handle.args,
                "Reaping process left behind at teardown"
            );
            match handle.try_reap() {
                Ok(Some(code)) => {
                    handle.settle(ProcessState::Exited(code));
                    signal_group(handle.pid, "KILL");
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(pid = handle.pid, "try_wait failed at teardown: {e}"),
            }
            handle.settle(ProcessState::Killed);
            if let Err(e) = handle.force_kill() {
                warn!(pid = handle.pid, "kill at teardown failed: {e}");
            }
            let start = Instant::now();
            let reaped = loop {
                match handle.try_reap() {
                    Ok(Some(_)) => break true,
                    Ok(None) if start.elapsed() < kill_timeout => thread::sleep(POLL_INTERVAL),
                    _ => break false,
                }
            };
            if !reaped {
                error!(pid = handle.pid, "process could not be reaped at teardown");
                survivors.push(handle.pid);
            }
        }
        survivors
    }
}

/// A spawned process owned by the caller of [`ProcessSupervisor::spawn`].
#[derive(Debug)]
pub struct Supervised {
    id: u64,
    pid: u32,
    started_at: Instant,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl Supervised {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Reader threads finish once every holder of the pipes is gone; give up
    /// after `budget` rather than wait on a descendant that escaped the group.
    fn collect_output(&mut self, budget: Duration) -> (Vec<u8>, Vec<u8>) {
        let deadline = Instant::now() + budget;
        (
            join_output(self.stdout.take(), deadline),
            join_output(self.stderr.take(), deadline),
        )
    }
}

enum Poll {
    Running,
    Exited(i32),
    Killed,
    Released,
}

pub struct ProcessSupervisor {
    program: PathBuf,
    grace_period: Duration,
    kill_timeout: Duration,
    working_dir: Option<PathBuf>,
    registry: ProcessRegistry,
    next_id: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<PathBuf>, grace_period: Duration, kill_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            grace_period,
            kill_timeout,
            working_dir: None,
            registry: ProcessRegistry::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Share an existing registry, e.g. one an interrupt handler already holds.
    pub fn with_registry(mut self, registry: ProcessRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Run the binary under test to completion or until `deadline`.
    pub fn run<I, S>(&self, args: I, deadline: Duration) -> HarnessResult<ExitOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = self.spawn(args)?;
        self.wait(child, deadline)
    }

    /// Run an arbitrary program (e.g. the fixture encoder) under the same
    /// supervision rules.
    pub fn run_program<I, S>(
        &self,
        program: &Path,
        args: I,
        deadline: Duration,
    ) -> HarnessResult<ExitOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = self.spawn_program(program, args)?;
        self.wait(child, deadline)
    }

    pub fn spawn<I, S>(&self, args: I) -> HarnessResult<Supervised>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = self.program.clone();
        self.spawn_program(&program, args)
    }

    fn spawn_program<I, S>(&self, program: &Path, args: I) -> HarnessResult<Supervised>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect();

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!("Spawning: {} {}", program.display(), args.join(" "));
        let mut child = cmd.spawn().map_err(|e| HarnessError::SpawnFailure {
            program: program.display().to_string(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        let started_at = Instant::now();
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry.insert(
            id,
            ProcessHandle {
                pid,
                args,
                started_at,
                state: ProcessState::Running,
                child,
            },
        );
        info!(pid, program = %program.display(), "Process spawned");

        Ok(Supervised {
            id,
            pid,
            started_at,
            stdout,
            stderr,
        })
    }

    /// Wait for a spawned process, escalating termination past `deadline`.
    pub fn wait(&self, mut child: Supervised, deadline: Duration) -> HarnessResult<ExitOutcome> {
        loop {
            match self.poll(child.id)? {
                Poll::Exited(exit_code) => {
                    self.registry.release(child.id);
                    // Background descendants die with their leader.
                    signal_group(child.pid, "KILL");
                    let (stdout, stderr) = child.collect_output(self.kill_timeout);
                    let duration = child.started_at.elapsed();
                    debug!(pid = child.pid, exit_code, ?duration, "Process exited");
                    return Ok(ExitOutcome::Completed {
                        exit_code,
                        stdout,
                        stderr,
                        duration,
                    });
                }
                Poll::Killed | Poll::Released => {
                    self.registry.release(child.id);
                    signal_group(child.pid, "KILL");
                    child.collect_output(self.kill_timeout);
                    return Err(HarnessError::Interrupted);
                }
                Poll::Running => {}
            }

            if child.started_at.elapsed() >= deadline {
                warn!(pid = child.pid, ?deadline, "Deadline exceeded, terminating");
                return self.escalate(child, ProcessState::TimedOut);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Exit code of a spawned process that has already exited on its own.
    pub fn exited(&self, child: &Supervised) -> HarnessResult<Option<i32>> {
        Ok(match self.poll(child.id)? {
            Poll::Exited(code) => Some(code),
            _ => None,
        })
    }

    /// Stop a process that is expected to still be running.
    pub fn terminate(&self, child: Supervised) -> HarnessResult<ExitOutcome> {
        if let Poll::Exited(_) = self.poll(child.id)? {
            return self.wait(child, Duration::ZERO);
        }
        self.escalate(child, ProcessState::Killed)
    }

    /// Force-kill and reap every process still registered.
    pub fn shutdown(&self) -> Vec<u32> {
        self.registry.shutdown_all(self.kill_timeout)
    }

    fn poll(&self, id: u64) -> HarnessResult<Poll> {
        let polled = self.registry.with(id, |handle| {
            handle.try_reap().map(|reaped| match reaped {
                Some(_) if handle.state == ProcessState::Killed => Poll::Killed,
                Some(code) => {
                    handle.settle(ProcessState::Exited(code));
                    Poll::Exited(code)
                }
                None => Poll::Running,
            })
        });
        match polled {
            Some(result) => Ok(result?),
            None => Ok(Poll::Released),
        }
    }

    /// Poll until the process is reaped or `budget` elapses.
    fn wait_exit(&self, id: u64, budget: Duration) -> HarnessResult<Option<i32>> {
        let start = Instant::now();
        loop {
            let reaped = self
                .registry
                .with(id, |handle| handle.try_reap())
                .transpose()?
                .flatten();
            if reaped.is_some() {
                return Ok(reaped);
            }
            if start.elapsed() >= budget {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Graceful signal, grace period, forced kill, bounded reap.
    fn escalate(&self, mut child: Supervised, terminal: ProcessState) -> HarnessResult<ExitOutcome> {
        let pid = child.pid;

        let mut exit = None;
        if request_termination(pid) {
            exit = self.wait_exit(child.id, self.grace_period)?;
        }
        if exit.is_none() {
            debug!(pid, "Grace period elapsed, sending kill");
            if let Some(Err(e)) = self.registry.with(child.id, ProcessHandle::force_kill) {
                warn!(pid, "forced kill failed: {e}");
            }
            exit = self.wait_exit(child.id, self.kill_timeout)?;
        }

        let Some(exit_code) = exit else {
            error!(pid, "Process survived forced kill");
            return Ok(ExitOutcome::KillFailed { pid });
        };

        self.registry.with(child.id, |h| h.settle(terminal));
        self.registry.release(child.id);
        signal_group(pid, "KILL");
        let (stdout, stderr) = child.collect_output(self.kill_timeout);
        let elapsed = child.started_at.elapsed();
        Ok(match terminal {
            ProcessState::TimedOut => ExitOutcome::TimedOut {
                stdout,
                stderr,
                elapsed,
            },
            _ => ExitOutcome::Completed {
                exit_code,
                stdout,
                stderr,
                duration: elapsed,
            },
        })
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = reader.read_to_end(&mut buffer);
        buffer
    })
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>, deadline: Instant) -> Vec<u8> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
    }
    if handle.is_finished() {
        handle.join().unwrap_or_default()
    } else {
        warn!("output pipe still held open, dropping captured output");
        Vec::new()
    }
}

/// Exit code, with signal deaths mapped to `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn request_termination(pid: u32) -> bool {
    signal_group(pid, "TERM")
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: &str) -> bool {
    match Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Failed to send {signal} to group {pid}: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: &str) -> bool {
    false
}
