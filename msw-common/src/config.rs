//! Structured configuration document consumed through `-msw.config <path>`.
//!
//! The document is a single `mswitch` object. Unknown fields are rejected at
//! load time and [`MswitchConfig::validate`] enforces the value ranges the
//! binary under test documents, so a bad document fails in the harness with a
//! descriptive error rather than as an exit code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::options::{FailoverMode, HealthThresholds, IngestMode, MSW_MAX_SOURCES, RevertPolicy};

/// Default buffering applied when `buffer_ms` is omitted.
pub const DEFAULT_BUFFER_MS: u32 = 800;
/// Default revert health window when `revert.health_window_ms` is omitted.
pub const DEFAULT_HEALTH_WINDOW_MS: u32 = 5000;

const KNOWN_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config is not a valid mswitch document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level document: `{"mswitch": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    pub mswitch: MswitchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MswitchConfig {
    pub enable: bool,
    /// Source id to path, ordered by id.
    pub sources: BTreeMap<String, String>,
    pub ingest_mode: IngestMode,
    pub mode: FailoverMode,
    #[serde(default = "default_buffer_ms")]
    pub buffer_ms: u32,
    pub auto_failover: AutoFailoverConfig,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub revert: RevertConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoFailoverConfig {
    pub enable: bool,
    pub thresholds: HealthThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    pub enable: bool,
    pub port: u16,
    /// HTTP verbs in the order the binary should register them.
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RevertConfig {
    pub policy: RevertPolicy,
    #[serde(default = "default_health_window_ms")]
    pub health_window_ms: u32,
}

impl Default for RevertConfig {
    fn default() -> Self {
        Self {
            policy: RevertPolicy::Auto,
            health_window_ms: DEFAULT_HEALTH_WINDOW_MS,
        }
    }
}

fn default_buffer_ms() -> u32 {
    DEFAULT_BUFFER_MS
}

fn default_health_window_ms() -> u32 {
    DEFAULT_HEALTH_WINDOW_MS
}

impl MswitchConfig {
    /// Document used by the structured-configuration scenario: three sources,
    /// hot ingest, graceful failover, moderate thresholds and the webhook on.
    pub fn sample<I, S>(sources: I, webhook_port: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources = sources
            .into_iter()
            .enumerate()
            .map(|(i, path)| (format!("s{i}"), path.into()))
            .collect();
        Self {
            enable: true,
            sources,
            ingest_mode: IngestMode::Hot,
            mode: FailoverMode::Graceful,
            buffer_ms: 1000,
            auto_failover: AutoFailoverConfig {
                enable: true,
                thresholds: HealthThresholds::moderate(),
            },
            webhook: WebhookConfig {
                enable: true,
                port: webhook_port,
                methods: vec!["GET".to_string(), "POST".to_string()],
            },
            revert: RevertConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::invalid("sources", "at least one source is required"));
        }
        if self.sources.len() > MSW_MAX_SOURCES {
            return Err(ConfigError::invalid(
                "sources",
                format!("at most {MSW_MAX_SOURCES} sources, got {}", self.sources.len()),
            ));
        }
        for (id, path) in &self.sources {
            if id.is_empty() || id.contains(';') || id.contains('=') {
                return Err(ConfigError::invalid("sources", format!("bad source id '{id}'")));
            }
            if path.is_empty() {
                return Err(ConfigError::invalid("sources", format!("source '{id}' has no path")));
            }
        }

        self.auto_failover
            .thresholds
            .validate()
            .map_err(|e| ConfigError::invalid("auto_failover.thresholds", e.to_string()))?;
        if self.auto_failover.thresholds.packet_loss_window_sec == 0 {
            return Err(ConfigError::invalid(
                "auto_failover.thresholds.packet_loss_window_sec",
                "window must be at least one second",
            ));
        }

        if self.webhook.enable && self.webhook.port == 0 {
            return Err(ConfigError::invalid("webhook.port", "port 0 is not a listen port"));
        }
        if self.webhook.methods.is_empty() {
            return Err(ConfigError::invalid("webhook.methods", "method list is empty"));
        }
        if let Some(bad) = self
            .webhook
            .methods
            .iter()
            .find(|m| !KNOWN_METHODS.contains(&m.as_str()))
        {
            return Err(ConfigError::invalid(
                "webhook.methods",
                format!("unsupported verb '{bad}'"),
            ));
        }

        if self.revert.health_window_ms == 0 {
            return Err(ConfigError::invalid(
                "revert.health_window_ms",
                "window must be positive",
            ));
        }
        Ok(())
    }
}

impl ConfigDocument {
    pub fn new(mswitch: MswitchConfig) -> Self {
        Self { mswitch }
    }

    /// Parse and validate a document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let doc: Self = serde_json::from_str(raw)?;
        doc.mswitch.validate()?;
        Ok(doc)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate, then write the document as pretty JSON.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.mswitch.validate()?;
        let json = self.to_json_pretty()?;
        std::fs::write(path, json).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_doc() -> ConfigDocument {
        ConfigDocument::new(MswitchConfig::sample(["test1.ts", "test2.ts", "test3.ts"], 8080))
    }

    #[test]
    fn test_sample_document_shape() {
        let value = serde_json::to_value(sample_doc()).unwrap();
        let msw = &value["mswitch"];

        assert_eq!(msw["enable"], true);
        assert_eq!(msw["sources"]["s2"], "test3.ts");
        assert_eq!(msw["ingest_mode"], "hot");
        assert_eq!(msw["mode"], "graceful");
        assert_eq!(msw["buffer_ms"], 1000);
        assert_eq!(msw["auto_failover"]["thresholds"]["cc_errors_per_sec"], 5);
        assert_eq!(msw["auto_failover"]["thresholds"]["packet_loss_percent"], 2.0);
        assert_eq!(msw["webhook"]["methods"], json!(["GET", "POST"]));
        assert_eq!(msw["revert"]["policy"], "auto");
        assert_eq!(msw["revert"]["health_window_ms"], 5000);
        assert!(msw["auto_failover"]["thresholds"].get("black_ms").is_none());
    }

    #[test]
    fn test_defaults_fill_optional_fields() {
        let raw = json!({
            "mswitch": {
                "enable": true,
                "sources": {"s0": "a.ts"},
                "ingest_mode": "standby",
                "mode": "cutover",
                "auto_failover": {
                    "enable": false,
                    "thresholds": {
                        "cc_errors_per_sec": 1,
                        "packet_loss_percent": 0.5,
                        "packet_loss_window_sec": 5
                    }
                },
                "webhook": {"enable": false, "port": 0, "methods": ["GET"]}
            }
        });
        let doc = ConfigDocument::from_json(&raw.to_string()).unwrap();
        assert_eq!(doc.mswitch.buffer_ms, DEFAULT_BUFFER_MS);
        assert_eq!(doc.mswitch.revert, RevertConfig::default());
        assert_eq!(doc.mswitch.ingest_mode, IngestMode::Standby);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let mut value = serde_json::to_value(sample_doc()).unwrap();
        value["mswitch"]["webhook"]["tls"] = json!(true);
        let err = ConfigDocument::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("tls"));
    }

    #[test]
    fn test_validation_errors_name_the_field() {
        let mut doc = sample_doc();
        doc.mswitch.sources.insert("s3".into(), "d.ts".into());
        let err = doc.mswitch.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "sources", .. }));

        let mut doc = sample_doc();
        doc.mswitch.webhook.methods.push("TRACE".into());
        let err = doc.mswitch.validate().unwrap_err();
        assert!(err.to_string().contains("TRACE"));

        let mut doc = sample_doc();
        doc.mswitch.auto_failover.thresholds.packet_loss_percent = 101.0;
        assert!(matches!(
            doc.mswitch.validate(),
            Err(ConfigError::Invalid {
                field: "auto_failover.thresholds",
                ..
            })
        ));
    }

    #[test]
    fn test_write_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mswitch_config.json");
        let doc = sample_doc();
        doc.write_to(&path).unwrap();

        let loaded = ConfigDocument::load(&path).unwrap();
        assert_eq!(loaded, doc);

        let missing = ConfigDocument::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
