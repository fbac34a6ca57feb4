//! Result aggregation and the end-of-run report.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{HarnessError, HarnessResult};

const RULE_WIDTH: usize = 50;

/// Outcome of one catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    /// Counted toward pass/total.
    Check {
        passed: bool,
        message: Option<String>,
        duration_ms: u64,
    },
    /// Rendered in the report but never counted.
    Marker { text: String, fatal: bool },
}

impl Verdict {
    pub fn pass(duration: Duration) -> Self {
        Self::Check {
            passed: true,
            message: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn fail(message: impl Into<String>, duration: Duration) -> Self {
        Self::Check {
            passed: false,
            message: Some(message.into()),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn marker(text: impl Into<String>) -> Self {
        Self::Marker {
            text: text.into(),
            fatal: false,
        }
    }

    pub fn fatal(text: impl Into<String>) -> Self {
        Self::Marker {
            text: text.into(),
            fatal: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Marker { fatal: true, .. })
    }

    fn status_text(&self) -> String {
        match self {
            Self::Check { passed: true, .. } => "PASSED".to_string(),
            Self::Check {
                passed: false,
                message: Some(message),
                ..
            } => format!("FAILED ({message})"),
            Self::Check { passed: false, .. } => "FAILED".to_string(),
            Self::Marker { text, fatal: true } => format!("FATAL: {text}"),
            Self::Marker { text, .. } => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub verdict: Verdict,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub total: usize,
    pub text: String,
}

/// Serialized form written by `--report-json`.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub binary: String,
    pub passed: usize,
    pub total: usize,
    pub success: bool,
    pub fatal: Option<&'a str>,
    pub simulator_requests: usize,
    pub results: &'a [TestResult],
}

#[derive(Debug)]
pub struct ResultAggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    results: Vec<TestResult>,
    fatal: Option<String>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            results: Vec::new(),
            fatal: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record a verdict. Re-recording a name replaces it in place.
    pub fn record(&mut self, name: impl Into<String>, verdict: Verdict) {
        let name = name.into();
        if let Verdict::Marker {
            text, fatal: true, ..
        } = &verdict
        {
            self.fatal.get_or_insert_with(|| format!("{name}: {text}"));
        }
        let result = TestResult {
            name,
            verdict,
            recorded_at: Utc::now(),
        };
        match self.results.iter_mut().find(|r| r.name == result.name) {
            Some(existing) => *existing = result,
            None => self.results.push(result),
        }
    }

    /// Flag a run-level condition that is not tied to one entry's verdict.
    pub fn mark_fatal(&mut self, reason: impl Into<String>) {
        self.fatal.get_or_insert_with(|| reason.into());
    }

    pub fn fatal(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn get(&self, name: &str) -> Option<&Verdict> {
        self.results
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.verdict)
    }

    fn counts(&self) -> (usize, usize) {
        self.results
            .iter()
            .fold((0, 0), |(passed, total), r| match r.verdict {
                Verdict::Check { passed: true, .. } => (passed + 1, total + 1),
                Verdict::Check { .. } => (passed, total + 1),
                Verdict::Marker { .. } => (passed, total),
            })
    }

    pub fn success(&self) -> bool {
        let (passed, total) = self.counts();
        self.fatal.is_none() && passed == total
    }

    pub fn summarize(&self) -> Summary {
        let (passed, total) = self.counts();
        let mut text = String::new();

        let _ = writeln!(text, "{}", "=".repeat(RULE_WIDTH));
        let _ = writeln!(text, "MSWITCH TEST RESULTS");
        let _ = writeln!(text, "{}", "=".repeat(RULE_WIDTH));
        for result in &self.results {
            let _ = writeln!(text, "{:20} : {}", result.name, result.verdict.status_text());
        }
        let _ = writeln!(text, "{}", "-".repeat(RULE_WIDTH));
        let _ = writeln!(text, "Total: {passed}/{total} tests passed");
        match &self.fatal {
            Some(reason) => {
                let _ = writeln!(text, "Run aborted: {reason}");
            }
            None if passed == total => {
                let _ = writeln!(text, "ALL TESTS PASSED");
            }
            None => {
                let _ = writeln!(text, "Some tests failed");
            }
        }

        Summary {
            passed,
            total,
            text,
        }
    }

    pub fn to_report(&self, binary: &Path, simulator_requests: usize) -> RunReport<'_> {
        let (passed, total) = self.counts();
        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            binary: binary.display().to_string(),
            passed,
            total,
            success: self.success(),
            fatal: self.fatal.as_deref(),
            simulator_requests,
            results: &self.results,
        }
    }

    pub fn write_json(
        &self,
        path: &Path,
        binary: &Path,
        simulator_requests: usize,
    ) -> HarnessResult<()> {
        let report = self.to_report(binary, simulator_requests);
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| HarnessError::Io(std::io::Error::other(e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
