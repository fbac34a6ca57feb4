//! Synthetic MPEG-TS sources rendered with an external encoder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::error::{HarnessError, HarnessResult};
use crate::supervisor::ProcessSupervisor;

const COLOURS: [&str; 3] = ["red", "green", "blue"];
const BASE_TONE_HZ: u32 = 1000;
const TONE_STEP_HZ: u32 = 500;

/// Parameters one fixture was rendered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixtureSpec {
    pub name: String,
    pub duration_secs: u32,
    pub width: u32,
    pub height: u32,
    pub rate: u32,
    pub colour: &'static str,
    pub tone_hz: u32,
}

impl FixtureSpec {
    /// The `index`-th test pattern (`pattern_0`, `pattern_1`, ...).
    pub fn pattern(index: usize, duration_secs: u32) -> Self {
        Self {
            name: format!("pattern_{index}"),
            duration_secs,
            width: 640,
            height: 480,
            rate: 25,
            colour: COLOURS[index % COLOURS.len()],
            tone_hz: BASE_TONE_HZ + TONE_STEP_HZ * index as u32,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.ts", self.name)
    }

    /// Encoder arguments writing this fixture to `output`.
    pub fn encoder_args(&self, output: &Path) -> Vec<String> {
        vec![
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!(
                "color=c={}:size={}x{}:rate={}:duration={}",
                self.colour, self.width, self.height, self.rate, self.duration_secs
            ),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("sine=frequency={}:duration={}", self.tone_hz, self.duration_secs),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-f".into(),
            "mpegts".into(),
            output.to_string_lossy().into_owned(),
            "-y".into(),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Fixture {
    pub spec: FixtureSpec,
    pub path: PathBuf,
}

/// The rendered fixtures, shared read-only by scenarios.
#[derive(Debug, Clone, Default)]
pub struct FixtureSet {
    fixtures: Vec<Fixture>,
}

impl FixtureSet {
    pub fn paths(&self) -> Vec<String> {
        self.fixtures
            .iter()
            .map(|f| f.path.to_string_lossy().into_owned())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fixture> {
        self.fixtures.iter()
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }
}

pub struct FixtureProvider {
    encoder: PathBuf,
    dir: PathBuf,
    duration_secs: u32,
    count: usize,
}

impl FixtureProvider {
    pub fn new(encoder: impl Into<PathBuf>, dir: impl Into<PathBuf>, duration_secs: u32) -> Self {
        Self {
            encoder: encoder.into(),
            dir: dir.into(),
            duration_secs,
            count: msw_common::MSW_MAX_SOURCES,
        }
    }

    /// Render every pattern fixture. Any failure is fatal to the run.
    pub fn create(&self, supervisor: &ProcessSupervisor) -> HarnessResult<FixtureSet> {
        // Encoding runs faster than real time; allow generous headroom.
        let deadline = Duration::from_secs(u64::from(self.duration_secs) * 6 + 30);
        let mut fixtures = Vec::with_capacity(self.count);

        for index in 0..self.count {
            let spec = FixtureSpec::pattern(index, self.duration_secs);
            let path = self.dir.join(spec.file_name());
            info!(fixture = %spec.name, path = %path.display(), "Creating fixture");

            let fixture_error = |reason: String| HarnessError::Fixture {
                name: spec.name.clone(),
                reason,
            };

            let outcome = supervisor
                .run_program(&self.encoder, spec.encoder_args(&path), deadline)
                .map_err(|e| match e {
                    HarnessError::Interrupted => HarnessError::Interrupted,
                    other => fixture_error(other.to_string()),
                })?;
            outcome
                .require_success(deadline)
                .map_err(|e| fixture_error(e.to_string()))?;
            if !path.is_file() {
                return Err(fixture_error(format!(
                    "encoder exited cleanly but {} is missing",
                    path.display()
                )));
            }

            fixtures.push(Fixture { spec, path });
        }

        Ok(FixtureSet { fixtures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parameters() {
        let specs: Vec<FixtureSpec> = (0..3).map(|i| FixtureSpec::pattern(i, 10)).collect();
        let colours: Vec<&str> = specs.iter().map(|s| s.colour).collect();
        let tones: Vec<u32> = specs.iter().map(|s| s.tone_hz).collect();

        assert_eq!(colours, vec!["red", "green", "blue"]);
        assert_eq!(tones, vec![1000, 1500, 2000]);
        assert_eq!(specs[2].file_name(), "pattern_2.ts");
    }

    #[test]
    fn test_encoder_args_target_output() {
        let spec = FixtureSpec::pattern(1, 4);
        let args = spec.encoder_args(Path::new("/tmp/work/pattern_1.ts"));

        assert_eq!(args[3], "color=c=green:size=640x480:rate=25:duration=4");
        assert_eq!(args[7], "sine=frequency=1500:duration=4");
        assert_eq!(args[args.len() - 2], "/tmp/work/pattern_1.ts");
        assert_eq!(args.last().map(String::as_str), Some("-y"));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_output_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(
            "true",
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        let provider = FixtureProvider::new("true", dir.path(), 1);

        let err = provider.create(&supervisor).unwrap_err();
        assert!(matches!(err, HarnessError::Fixture { ref name, .. } if name == "pattern_0"));
        assert!(err.is_run_fatal());
    }
}
