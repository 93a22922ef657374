//! Mirror configuration.
//!
//! Defaults match the authority's well-known names. `from_env` reads the
//! transport URL the same way every service in the deployment does
//! (`REDIS_URL`, credentials in the userinfo part).

use std::time::Duration;

use url::Url;
use worldstate_core::DEFAULT_TYPE_FIELD;

use crate::error::SyncError;

/// Where the transport lives and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
        }
    }
}

impl Endpoint {
    /// Parses `scheme://[user][:password@]host[:port]`.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let url = Url::parse(raw).map_err(|e| SyncError::Config(format!("bad transport url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| SyncError::Config(format!("transport url {raw:?} has no host")))?
            .to_string();
        let port = url.port().unwrap_or(6379);
        let password = url.password().map(str::to_string);
        Ok(Self { host, port, password })
    }
}

/// Mirror configuration.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Transport location and credentials
    pub endpoint: Endpoint,
    /// Pub/sub channel carrying compressed tick messages
    pub state_channel: String,
    /// Key holding the compressed snapshot
    pub snapshot_key: String,
    /// List receiving `{uuid, patch}` change commands
    pub command_list: String,
    /// List receiving legacy `{response, key}` requests
    pub request_list: String,
    /// Field required to create an entity from a patch (None = no check)
    pub type_field: Option<String>,
    /// Default deadline for `wait_for_tick`
    pub tick_timeout: Duration,
    /// Default deadline for condition waits
    pub condition_timeout: Duration,
    /// First snapshot retry delay; doubles per failed attempt
    pub retry_initial: Duration,
    /// Upper bound on the snapshot retry delay
    pub retry_ceiling: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            state_channel: "worldstate".to_string(),
            snapshot_key: "worldstate".to_string(),
            command_list: "commands".to_string(),
            request_list: "requests".to_string(),
            type_field: Some(DEFAULT_TYPE_FIELD.to_string()),
            tick_timeout: Duration::from_millis(120),
            condition_timeout: Duration::from_millis(500),
            retry_initial: Duration::from_millis(100),
            retry_ceiling: Duration::from_secs(5),
        }
    }
}

impl MirrorConfig {
    /// Reads `REDIS_URL` (required) plus optional millisecond overrides
    /// `WORLDSTATE_TICK_TIMEOUT_MS`, `WORLDSTATE_CONDITION_TIMEOUT_MS` and
    /// `WORLDSTATE_RETRY_CEILING_MS`.
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("REDIS_URL").ok_or_else(|| SyncError::Config("REDIS_URL is not set".into()))?;
        let mut config = Self {
            endpoint: Endpoint::parse(&url)?,
            ..Self::default()
        };

        let millis = |name: &str| -> Result<Option<Duration>, SyncError> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(|ms| Some(Duration::from_millis(ms)))
                    .map_err(|_| SyncError::Config(format!("{name} must be milliseconds, got {raw:?}"))),
            }
        };

        if let Some(d) = millis("WORLDSTATE_TICK_TIMEOUT_MS")? {
            config.tick_timeout = d;
        }
        if let Some(d) = millis("WORLDSTATE_CONDITION_TIMEOUT_MS")? {
            config.condition_timeout = d;
        }
        if let Some(d) = millis("WORLDSTATE_RETRY_CEILING_MS")? {
            config.retry_ceiling = d;
        }
        Ok(config)
    }

    /// Short retries, for tests.
    pub fn for_testing() -> Self {
        Self {
            retry_initial: Duration::from_millis(5),
            retry_ceiling: Duration::from_millis(40),
            ..Self::default()
        }
    }

    /// Delay before snapshot attempt number `attempt` (0 = first retry).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.retry_initial
            .checked_mul(factor)
            .unwrap_or(self.retry_ceiling)
            .min(self.retry_ceiling)
    }
}
