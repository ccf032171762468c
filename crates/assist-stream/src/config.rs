use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::policy::RetryPolicy;

const ENV_BASE_URL: &str = "ASSIST_API_BASE_URL";
const ENV_API_KEY: &str = "ASSIST_API_KEY";
const ENV_REQUEST_TIMEOUT_MS: &str = "ASSIST_REQUEST_TIMEOUT_MS";
const ENV_IDLE_TIMEOUT_MS: &str = "ASSIST_IDLE_TIMEOUT_MS";
const ENV_MAX_TOOL_ROUNDS: &str = "ASSIST_MAX_TOOL_ROUNDS";

/// Connection settings for the upstream run endpoints.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL the `/run/...` paths are appended to.
    pub base_url: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Timeout for the short request/response calls (submit, cancel).
    ///
    /// The event stream itself is bounded by the session's idle timeout, not
    /// by this value.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Reads `ASSIST_API_BASE_URL`, `ASSIST_API_KEY` and
    /// `ASSIST_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var(ENV_BASE_URL).unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_BASE_URL.into()));
        }
        let mut config = Self::new(base_url.trim());
        if let Ok(key) = std::env::var(ENV_API_KEY)
            && !key.trim().is_empty()
        {
            config.api_key = Some(key.trim().to_string());
        }
        if let Some(ms) = env_u64(ENV_REQUEST_TIMEOUT_MS)? {
            config.request_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub(crate) fn stream_url(&self) -> String {
        format!("{}/run/stream", self.base())
    }

    pub(crate) fn submit_url(&self, run_id: &str) -> String {
        format!("{}/run/{run_id}/submit-tool-outputs", self.base())
    }

    pub(crate) fn cancel_url(&self, run_id: &str) -> String {
        format!("{}/run/{run_id}/cancel", self.base())
    }
}

/// Per-session behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Treat a stream that stays silent this long as closed. `None` waits
    /// forever.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: Option<u64>,
    /// Upper bound on tool-call submissions within one run.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default)]
    pub persist_retry: RetryPolicy,
}

fn default_idle_timeout_ms() -> Option<u64> {
    Some(120_000)
}

const fn default_max_tool_rounds() -> u32 {
    16
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            max_tool_rounds: default_max_tool_rounds(),
            persist_retry: RetryPolicy::default(),
        }
    }
}

impl SessionOptions {
    /// Defaults overridden by `ASSIST_IDLE_TIMEOUT_MS` (`0` disables) and
    /// `ASSIST_MAX_TOOL_ROUNDS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(ms) = env_u64(ENV_IDLE_TIMEOUT_MS)? {
            options.idle_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(rounds) = env_u64(ENV_MAX_TOOL_ROUNDS)? {
            options.max_tool_rounds = u32::try_from(rounds).map_err(|_| ConfigError::Invalid {
                key: ENV_MAX_TOOL_ROUNDS.into(),
                message: format!("{rounds} is out of range"),
            })?;
        }
        Ok(options)
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn persist_retry(mut self, policy: RetryPolicy) -> Self {
        self.persist_retry = policy;
        self
    }

    pub fn idle_timeout_duration(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}
