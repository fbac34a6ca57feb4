//! Builder for the `-msw.*` command-line surface of the binary under test.
//!
//! The harness never parses these flags itself; it only renders them. Every
//! value is validated while building so a malformed profile fails inside the
//! harness instead of surfacing as an opaque exit code from the binary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of sources the switching feature accepts.
pub const MSW_MAX_SOURCES: usize = 3;

/// Errors raised while rendering MSwitch options.
#[derive(Debug, Error, PartialEq)]
pub enum OptionsError {
    #[error("at most {max} sources are supported, got {count}")]
    TooManySources { count: usize, max: usize },

    #[error("source list is empty")]
    NoSources,

    #[error("invalid source id '{0}': ids must be non-empty and contain neither ';' nor '='")]
    InvalidSourceId(String),

    #[error("invalid path for source '{id}': '{path}' contains ';'")]
    InvalidSourcePath { id: String, path: String },

    #[error("duplicate source id '{0}'")]
    DuplicateSourceId(String),

    #[error("invalid threshold entry '{0}'")]
    InvalidThreshold(String),

    #[error("missing required threshold '{0}'")]
    MissingThreshold(&'static str),

    #[error("packet_loss_percent must be within 0..=100, got {0}")]
    PacketLossOutOfRange(f64),

    #[error("webhook method list is empty")]
    NoWebhookMethods,
}

macro_rules! keyword_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

    };
}

keyword_enum!(
    /// Whether standby sources are kept warm or started on demand.
    IngestMode {
        Hot => "hot",
        Standby => "standby",
    }
);

keyword_enum!(
    /// Transition strategy on source loss.
    FailoverMode {
        Seamless => "seamless",
        Graceful => "graceful",
        Cutover => "cutover",
    }
);

keyword_enum!(
    /// What a cutover shows while the next source comes up.
    OnCut {
        Freeze => "freeze",
        Black => "black",
    }
);

keyword_enum!(
    /// Whether the binary returns to the primary source on its own.
    RevertPolicy {
        Auto => "auto",
        Manual => "manual",
    }
);

/// One `s<i>=<path>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub path: String,
}

/// Ordered list of sources rendered as `s0=a;s1=b;s2=c`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceList {
    sources: Vec<Source>,
}

impl SourceList {
    /// Build a list with ids `s0..sN` assigned in order.
    pub fn from_paths<I, P>(paths: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut list = Self::default();
        for (index, path) in paths.into_iter().enumerate() {
            list.push(format!("s{index}"), path.as_ref().to_string_lossy())?;
        }
        Ok(list)
    }

    pub fn push(
        &mut self,
        id: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<(), OptionsError> {
        let id = id.into();
        let path = path.into();
        if id.is_empty() || id.contains(';') || id.contains('=') {
            return Err(OptionsError::InvalidSourceId(id));
        }
        if path.contains(';') {
            return Err(OptionsError::InvalidSourcePath { id, path });
        }
        if self.sources.iter().any(|s| s.id == id) {
            return Err(OptionsError::DuplicateSourceId(id));
        }
        if self.sources.len() >= MSW_MAX_SOURCES {
            return Err(OptionsError::TooManySources {
                count: self.sources.len() + 1,
                max: MSW_MAX_SOURCES,
            });
        }
        self.sources.push(Source { id, path });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }
}

impl fmt::Display for SourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, source) in self.sources.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", source.id, source.path)?;
        }
        Ok(())
    }
}

/// Health thresholds that drive automatic failover.
///
/// Renders as `cc_errors_per_sec=<n>,packet_loss_percent=<f>,packet_loss_window_sec=<n>`
/// followed by any of the optional detectors that are set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthThresholds {
    pub cc_errors_per_sec: u32,
    pub packet_loss_percent: f64,
    pub packet_loss_window_sec: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_loss: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_loss: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub black_ms: Option<u32>,
}

impl HealthThresholds {
    pub fn new(
        cc_errors_per_sec: u32,
        packet_loss_percent: f64,
        packet_loss_window_sec: u32,
    ) -> Result<Self, OptionsError> {
        let thresholds = Self {
            cc_errors_per_sec,
            packet_loss_percent,
            packet_loss_window_sec,
            stream_loss: None,
            pid_loss: None,
            black_ms: None,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn strict() -> Self {
        Self::const_new(1, 0.1, 3)
    }

    pub fn moderate() -> Self {
        Self::const_new(5, 2.0, 10)
    }

    pub fn lenient() -> Self {
        Self::const_new(10, 5.0, 20)
    }

    /// Unvalidated constructor for constant tables.
    pub const fn const_new(cc: u32, loss: f64, window: u32) -> Self {
        Self {
            cc_errors_per_sec: cc,
            packet_loss_percent: loss,
            packet_loss_window_sec: window,
            stream_loss: None,
            pid_loss: None,
            black_ms: None,
        }
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if !(0.0..=100.0).contains(&self.packet_loss_percent) {
            return Err(OptionsError::PacketLossOutOfRange(self.packet_loss_percent));
        }
        Ok(())
    }

    /// Value for `-msw.auto.on`.
    pub fn to_auto_on(&self) -> String {
        self.to_string()
    }
}

/// Percentages always carry a fractional part (`2.0`, not `2`).
fn format_percent(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

impl fmt::Display for HealthThresholds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cc_errors_per_sec={},packet_loss_percent={},packet_loss_window_sec={}",
            self.cc_errors_per_sec,
            format_percent(self.packet_loss_percent),
            self.packet_loss_window_sec
        )?;
        if let Some(v) = self.stream_loss {
            write!(f, ",stream_loss={v}")?;
        }
        if let Some(v) = self.pid_loss {
            write!(f, ",pid_loss={v}")?;
        }
        if let Some(v) = self.black_ms {
            write!(f, ",black_ms={v}")?;
        }
        Ok(())
    }
}

impl FromStr for HealthThresholds {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cc = None;
        let mut loss = None;
        let mut window = None;
        let mut extra = (None, None, None);

        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| OptionsError::InvalidThreshold(token.to_string()))?;
            let bad = || OptionsError::InvalidThreshold(token.to_string());
            let as_u32 = |v: &str| v.trim().parse::<u32>().map_err(|_| bad());
            match key.trim() {
                "cc_errors_per_sec" => cc = Some(as_u32(value)?),
                "packet_loss_percent" => {
                    loss = Some(value.trim().parse::<f64>().map_err(|_| bad())?)
                }
                "packet_loss_window_sec" => window = Some(as_u32(value)?),
                "stream_loss" => extra.0 = Some(as_u32(value)?),
                "pid_loss" => extra.1 = Some(as_u32(value)?),
                "black_ms" => extra.2 = Some(as_u32(value)?),
                _ => return Err(bad()),
            }
        }

        let mut thresholds = Self::new(
            cc.ok_or(OptionsError::MissingThreshold("cc_errors_per_sec"))?,
            loss.ok_or(OptionsError::MissingThreshold("packet_loss_percent"))?,
            window.ok_or(OptionsError::MissingThreshold("packet_loss_window_sec"))?,
        )?;
        thresholds.stream_loss = extra.0;
        thresholds.pid_loss = extra.1;
        thresholds.black_ms = extra.2;
        Ok(thresholds)
    }
}

/// A named threshold profile used by the sweep scenarios.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdProfile {
    pub name: &'static str,
    pub label: &'static str,
    pub thresholds: HealthThresholds,
}

/// Strict, moderate and lenient monitoring, in sweep order.
pub const THRESHOLD_PROFILES: [ThresholdProfile; 3] = [
    ThresholdProfile {
        name: "strict",
        label: "Strict monitoring",
        thresholds: HealthThresholds::const_new(1, 0.1, 3),
    },
    ThresholdProfile {
        name: "moderate",
        label: "Moderate monitoring",
        thresholds: HealthThresholds::const_new(5, 2.0, 10),
    },
    ThresholdProfile {
        name: "lenient",
        label: "Lenient monitoring",
        thresholds: HealthThresholds::const_new(10, 5.0, 20),
    },
];

fn push_pair(args: &mut Vec<String>, name: &str, value: String) {
    args.push(name.to_string());
    args.push(value);
}

fn flag(enabled: bool) -> String {
    if enabled { "1" } else { "0" }.to_string()
}

/// Full argument list for one invocation of the binary under test.
///
/// MSwitch flags come first, then the generic input, duration and output
/// arguments, matching the order the binary documents.
#[derive(Debug, Clone, Default)]
pub struct MswitchArgs {
    enable: Option<bool>,
    sources: Option<SourceList>,
    ingest: Option<IngestMode>,
    mode: Option<FailoverMode>,
    freeze_on_cut: Option<u32>,
    on_cut: Option<OnCut>,
    auto: Option<(bool, Option<HealthThresholds>)>,
    webhook: Option<(bool, u16, Vec<String>)>,
    config: Option<PathBuf>,
    lavfi_input: Option<String>,
    duration_secs: Option<u32>,
    null_output: bool,
}

impl MswitchArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(mut self, enabled: bool) -> Self {
        self.enable = Some(enabled);
        self
    }

    pub fn sources(mut self, sources: SourceList) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn ingest(mut self, ingest: IngestMode) -> Self {
        self.ingest = Some(ingest);
        self
    }

    pub fn mode(mut self, mode: FailoverMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn freeze_on_cut(mut self, seconds: u32) -> Self {
        self.freeze_on_cut = Some(seconds);
        self
    }

    pub fn on_cut(mut self, on_cut: OnCut) -> Self {
        self.on_cut = Some(on_cut);
        self
    }

    /// Enables automatic failover with the given thresholds.
    pub fn auto_failover(mut self, thresholds: HealthThresholds) -> Self {
        self.auto = Some((true, Some(thresholds)));
        self
    }

    pub fn auto_disabled(mut self) -> Self {
        self.auto = Some((false, None));
        self
    }

    pub fn webhook<I, S>(mut self, port: u16, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.webhook = Some((true, port, methods.into_iter().map(Into::into).collect()));
        self
    }

    /// Emits `-msw.webhook.enable 0` with no port or methods.
    pub fn webhook_disabled(mut self) -> Self {
        self.webhook = Some((false, 0, Vec::new()));
        self
    }

    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    /// Adds `-f lavfi -i <graph>`.
    pub fn lavfi_input(mut self, graph: impl Into<String>) -> Self {
        self.lavfi_input = Some(graph.into());
        self
    }

    /// Adds `-t <secs>`.
    pub fn duration_secs(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    /// Adds `-f null -`.
    pub fn null_output(mut self) -> Self {
        self.null_output = true;
        self
    }

    pub fn build(&self) -> Result<Vec<String>, OptionsError> {
        let mut args: Vec<String> = Vec::new();

        if let Some(enabled) = self.enable {
            push_pair(&mut args, "-msw.enable", flag(enabled));
        }
        if let Some(sources) = &self.sources {
            if sources.is_empty() {
                return Err(OptionsError::NoSources);
            }
            push_pair(&mut args, "-msw.sources", sources.to_string());
        }
        if let Some(ingest) = self.ingest {
            push_pair(&mut args, "-msw.ingest", ingest.to_string());
        }
        if let Some(mode) = self.mode {
            push_pair(&mut args, "-msw.mode", mode.to_string());
        }
        if let Some(secs) = self.freeze_on_cut {
            push_pair(&mut args, "-msw.freeze_on_cut", secs.to_string());
        }
        if let Some(on_cut) = self.on_cut {
            push_pair(&mut args, "-msw.on_cut", on_cut.to_string());
        }
        if let Some((enabled, thresholds)) = &self.auto {
            push_pair(&mut args, "-msw.auto.enable", flag(*enabled));
            if let Some(thresholds) = thresholds {
                thresholds.validate()?;
                push_pair(&mut args, "-msw.auto.on", thresholds.to_auto_on());
            }
        }
        match &self.webhook {
            Some((true, port, methods)) => {
                if methods.is_empty() {
                    return Err(OptionsError::NoWebhookMethods);
                }
                push_pair(&mut args, "-msw.webhook.enable", flag(true));
                push_pair(&mut args, "-msw.webhook.port", port.to_string());
                push_pair(&mut args, "-msw.webhook.methods", methods.join(","));
            }
            Some((false, ..)) => push_pair(&mut args, "-msw.webhook.enable", flag(false)),
            None => {}
        }
        if let Some(path) = &self.config {
            push_pair(&mut args, "-msw.config", path.to_string_lossy().into_owned());
        }
        if let Some(graph) = &self.lavfi_input {
            push_pair(&mut args, "-f", "lavfi".to_string());
            push_pair(&mut args, "-i", graph.clone());
        }
        if let Some(secs) = self.duration_secs {
            push_pair(&mut args, "-t", secs.to_string());
        }
        if self.null_output {
            push_pair(&mut args, "-f", "null".to_string());
            args.push("-".to_string());
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_render_with_fractional_percent() {
        assert_eq!(
            HealthThresholds::moderate().to_auto_on(),
            "cc_errors_per_sec=5,packet_loss_percent=2.0,packet_loss_window_sec=10"
        );
        assert_eq!(
            HealthThresholds::strict().to_auto_on(),
            "cc_errors_per_sec=1,packet_loss_percent=0.1,packet_loss_window_sec=3"
        );
    }

    #[test]
    fn test_thresholds_parse_optional_detectors() {
        let parsed: HealthThresholds =
            "cc_errors_per_sec=3, packet_loss_percent=1.5,packet_loss_window_sec=6,black_ms=400"
                .parse()
                .unwrap();
        assert_eq!(parsed.cc_errors_per_sec, 3);
        assert_eq!(parsed.packet_loss_percent, 1.5);
        assert_eq!(parsed.black_ms, Some(400));
        assert_eq!(parsed.stream_loss, None);
        assert!(parsed.to_auto_on().ends_with(",black_ms=400"));
    }

    #[test]
    fn test_thresholds_reject_unknown_and_missing_keys() {
        assert_eq!(
            "cc_errors_per_sec=1,jitter=4".parse::<HealthThresholds>(),
            Err(OptionsError::InvalidThreshold("jitter=4".to_string()))
        );
        assert_eq!(
            "cc_errors_per_sec=1,packet_loss_percent=1".parse::<HealthThresholds>(),
            Err(OptionsError::MissingThreshold("packet_loss_window_sec"))
        );
        assert_eq!(
            HealthThresholds::new(1, 140.0, 3),
            Err(OptionsError::PacketLossOutOfRange(140.0))
        );
    }

    #[test]
    fn test_profiles_are_in_sweep_order() {
        let names: Vec<_> = THRESHOLD_PROFILES.iter().map(|p| p.name).collect();
        assert_eq!(names, ["strict", "moderate", "lenient"]);
        assert_eq!(THRESHOLD_PROFILES[2].thresholds, HealthThresholds::lenient());
    }

    #[test]
    fn test_source_list_limits() {
        let list = SourceList::from_paths(["a.ts", "b.ts", "c.ts"]).unwrap();
        assert_eq!(list.to_string(), "s0=a.ts;s1=b.ts;s2=c.ts");

        let err = SourceList::from_paths(["a", "b", "c", "d"]).unwrap_err();
        assert_eq!(err, OptionsError::TooManySources { count: 4, max: 3 });

        let mut list = SourceList::default();
        assert!(matches!(
            list.push("s0", "x;y"),
            Err(OptionsError::InvalidSourcePath { .. })
        ));
        assert!(matches!(
            list.push("s=0", "x"),
            Err(OptionsError::InvalidSourceId(_))
        ));
        list.push("s0", "x").unwrap();
        assert_eq!(
            list.push("s0", "y"),
            Err(OptionsError::DuplicateSourceId("s0".to_string()))
        );
    }

    #[test]
    fn test_keywords_match_serde_names() {
        assert_eq!(IngestMode::Standby.to_string(), "standby");
        assert_eq!(
            serde_json::to_value(FailoverMode::Cutover).unwrap(),
            serde_json::json!(FailoverMode::Cutover.as_str())
        );
        assert_eq!(
            serde_json::from_value::<OnCut>(serde_json::json!("black")).unwrap(),
            OnCut::Black
        );
    }

    #[test]
    fn test_cutover_args_in_documented_order() {
        let sources = SourceList::from_paths(["/tmp/p0.ts", "/tmp/p1.ts"]).unwrap();
        let args = MswitchArgs::new()
            .enable(true)
            .sources(sources)
            .ingest(IngestMode::Hot)
            .mode(FailoverMode::Cutover)
            .freeze_on_cut(2)
            .on_cut(OnCut::Freeze)
            .auto_failover(HealthThresholds::new(3, 1.5, 6).unwrap())
            .duration_secs(5)
            .null_output()
            .build()
            .unwrap();

        assert_eq!(
            args,
            [
                "-msw.enable",
                "1",
                "-msw.sources",
                "s0=/tmp/p0.ts;s1=/tmp/p1.ts",
                "-msw.ingest",
                "hot",
                "-msw.mode",
                "cutover",
                "-msw.freeze_on_cut",
                "2",
                "-msw.on_cut",
                "freeze",
                "-msw.auto.enable",
                "1",
                "-msw.auto.on",
                "cc_errors_per_sec=3,packet_loss_percent=1.5,packet_loss_window_sec=6",
                "-t",
                "5",
                "-f",
                "null",
                "-",
            ]
        );
    }

    #[test]
    fn test_webhook_and_config_flags() {
        let args = MswitchArgs::new()
            .webhook(8080, ["GET", "POST"])
            .config_file("/tmp/msw.json")
            .lavfi_input("testsrc=duration=3:size=320x240:rate=1")
            .build()
            .unwrap();
        assert_eq!(
            args,
            [
                "-msw.webhook.enable",
                "1",
                "-msw.webhook.port",
                "8080",
                "-msw.webhook.methods",
                "GET,POST",
                "-msw.config",
                "/tmp/msw.json",
                "-f",
                "lavfi",
                "-i",
                "testsrc=duration=3:size=320x240:rate=1",
            ]
        );

        let empty = MswitchArgs::new().webhook(8080, Vec::<String>::new()).build();
        assert_eq!(empty, Err(OptionsError::NoWebhookMethods));
        let disabled = MswitchArgs::new().auto_disabled().build().unwrap();
        assert_eq!(disabled, ["-msw.auto.enable", "0"]);
    }

    #[test]
    fn test_webhook_disabled_flag() {
        let args = MswitchArgs::new().enable(true).webhook_disabled().build().unwrap();
        assert_eq!(args, ["-msw.enable", "1", "-msw.webhook.enable", "0"]);

        // The later call wins.
        let reenabled = MswitchArgs::new()
            .webhook_disabled()
            .webhook(9090, ["POST"])
            .build()
            .unwrap();
        assert_eq!(
            reenabled,
            [
                "-msw.webhook.enable",
                "1",
                "-msw.webhook.port",
                "9090",
                "-msw.webhook.methods",
                "POST",
            ]
        );
    }
}
