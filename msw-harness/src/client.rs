//! Blocking HTTP client for the control-plane endpoints.

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::error::{HarnessError, HarnessResult};
use crate::simulator::{FailoverResponse, StatusResponse, SwitchResponse};

const READY_BACKOFF_START: Duration = Duration::from_millis(10);
const READY_BACKOFF_MAX: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    Enable,
    Disable,
}

impl FailoverAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

pub struct ControlPlaneClient {
    base_url: String,
    agent: ureq::Agent,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /status`.
    pub fn status(&self) -> HarnessResult<StatusResponse> {
        let url = self.url("/status");
        let response = self.agent.get(&url).call();
        decode(&url, response)
    }

    /// `POST /switch`, carrying the id both as query parameter and JSON body.
    pub fn switch_source(&self, source: &str) -> HarnessResult<SwitchResponse> {
        let url = self.url("/switch");
        let body = serde_json::json!({ "source": source }).to_string();
        let response = self
            .agent
            .post(&url)
            .query("source", source)
            .header("Content-Type", "application/json")
            .send(body.as_str());
        let decoded: SwitchResponse = decode(&url, response)?;
        if decoded.status != "switched" || decoded.source != source {
            return Err(HarnessError::MalformedResponse {
                url,
                reason: format!("unexpected switch acknowledgement {decoded:?}"),
            });
        }
        Ok(decoded)
    }

    /// `POST /failover`.
    pub fn toggle_failover(&self, action: FailoverAction) -> HarnessResult<FailoverResponse> {
        let url = self.url("/failover");
        let body = serde_json::json!({ "action": action.as_str() }).to_string();
        let response = self
            .agent
            .post(&url)
            .query("action", action.as_str())
            .header("Content-Type", "application/json")
            .send(body.as_str());
        let decoded: FailoverResponse = decode(&url, response)?;
        if decoded.status != "failover" || decoded.action != action.as_str() {
            return Err(HarnessError::MalformedResponse {
                url,
                reason: format!("unexpected failover acknowledgement {decoded:?}"),
            });
        }
        Ok(decoded)
    }

    /// Poll `/status` with exponential backoff until it answers or `timeout`
    /// elapses. The last error is returned on expiry.
    pub fn wait_until_ready(&self, timeout: Duration) -> HarnessResult<StatusResponse> {
        let start = Instant::now();
        let mut delay = READY_BACKOFF_START;
        loop {
            match self.status() {
                Ok(status) => {
                    debug!(url = %self.base_url, elapsed = ?start.elapsed(), "control plane ready");
                    return Ok(status);
                }
                Err(e) if start.elapsed() + delay >= timeout => return Err(e),
                Err(e) => trace!("control plane not ready: {e}"),
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(READY_BACKOFF_MAX);
        }
    }
}

fn decode<T: DeserializeOwned>(
    url: &str,
    response: Result<ureq::http::Response<ureq::Body>, ureq::Error>,
) -> HarnessResult<T> {
    let mut response = response.map_err(|e| HarnessError::ControlPlaneUnreachable {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let status = response.status();
    let text = response
        .body_mut()
        .read_to_string()
        .map_err(|e| HarnessError::MalformedResponse {
            url: url.to_string(),
            reason: format!("unreadable body: {e}"),
        })?;

    if !status.is_success() {
        return Err(HarnessError::MalformedResponse {
            url: url.to_string(),
            reason: format!("status {}: {}", status.as_u16(), text.trim()),
        });
    }

    serde_json::from_str(&text).map_err(|e| HarnessError::MalformedResponse {
        url: url.to_string(),
        reason: format!("undecodable body: {e}"),
    })
}
