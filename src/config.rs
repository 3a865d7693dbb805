// Application configuration, loaded from environment variables and CLI flags.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::engine::activity::ActivitySettings;
use crate::engine::config::{DEFAULT_USERNAME, DEFAULT_VERSIONS};
use crate::engine::reconnect::BackoffPolicy;
use crate::engine::supervisor::ReconnectMode;
use crate::engine::timer::DelayPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Game server host.
    pub host: String,
    /// Game server port.
    pub port: u16,
    /// Display identity, suffix already applied.
    pub username: String,
    /// Ordered protocol version candidates. Never empty.
    pub versions: Vec<String>,
    pub reconnect_mode: ReconnectMode,
    /// Base delay for every retry.
    pub retry_delay: Duration,
    pub patrol_radius: f64,
    pub step_interval: DelayPolicy,
    pub turn_interval: DelayPolicy,
    pub chat_interval: DelayPolicy,
    pub heartbeat_interval: Duration,
    /// Port for the liveness HTTP server.
    pub http_port: u16,
    /// Address of the protocol-client sidecar.
    pub bridge_addr: String,
}

impl Config {
    /// Load configuration from the process environment and CLI arguments.
    ///
    /// Environment variables:
    /// - `SERVER_HOST`, `SERVER_PORT` - game server (required)
    /// - `BOT_NAME` - display name (default: `AFKBot`)
    /// - `BOT_NAME_SUFFIX` - `true` appends a random `_NNNN` suffix
    /// - `PROTOCOL_VERSIONS` - comma separated candidate list
    /// - `RECONNECT_MODE` - `retry` (default) or `exit`
    /// - `RETRY_DELAY_MS` - base retry delay (default: 5000)
    /// - `PATROL_RADIUS` - max distance from the anchor (default: 8)
    /// - `STEP_MIN_SECS`/`STEP_MAX_SECS`, `TURN_MIN_SECS`/`TURN_MAX_SECS`
    /// - `CHAT_INTERVAL_MS`/`CHAT_JITTER_MS`
    /// - `HEARTBEAT_SECS` - liveness log interval (default: 60)
    /// - `PORT` - liveness HTTP port (default: 3000)
    /// - `BRIDGE_ADDR` - protocol-client sidecar (default: `127.0.0.1:19140`)
    ///
    /// CLI flags:
    /// - `--host <HOST>` - Override the server host
    /// - `--port <PORT>` - Override the server port
    pub fn load() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_lookup(&args, |key| std::env::var(key).ok())
    }

    /// Build configuration from CLI arguments and an arbitrary key lookup.
    pub fn from_lookup<F>(args: &[String], lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // Host and port: CLI flag takes precedence, then env var
        let host = Self::parse_cli_value(args, "--host")
            .or_else(|| get("SERVER_HOST"))
            .ok_or(ConfigError::Missing("SERVER_HOST"))?;
        if host.chars().any(char::is_whitespace) || host.contains('/') {
            return Err(invalid("SERVER_HOST", &host, "not a host name or address"));
        }

        let port = Self::parse_cli_value(args, "--port")
            .or_else(|| get("SERVER_PORT"))
            .ok_or(ConfigError::Missing("SERVER_PORT"))?;
        let port = parse_port("SERVER_PORT", &port)?;

        let mut username = get("BOT_NAME").unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        if get("BOT_NAME_SUFFIX").is_some_and(|v| is_truthy(&v)) {
            let suffix: u16 = rand::thread_rng().gen_range(1000..10000);
            username = format!("{username}_{suffix}");
        }

        let versions = match get("PROTOCOL_VERSIONS") {
            Some(raw) => {
                let list: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                if list.is_empty() {
                    return Err(invalid("PROTOCOL_VERSIONS", &raw, "no version listed"));
                }
                list
            }
            None => DEFAULT_VERSIONS.iter().map(|v| v.to_string()).collect(),
        };

        let reconnect_mode = match get("RECONNECT_MODE") {
            Some(raw) => raw
                .parse::<ReconnectMode>()
                .map_err(|reason| invalid("RECONNECT_MODE", &raw, &reason))?,
            None => ReconnectMode::Retry,
        };

        let retry_delay = Duration::from_millis(parse_or(&get, "RETRY_DELAY_MS", 5000u64)?);

        let patrol_radius: f64 = parse_or(&get, "PATROL_RADIUS", 8.0)?;
        if !patrol_radius.is_finite() || patrol_radius <= 0.0 {
            return Err(invalid(
                "PATROL_RADIUS",
                &patrol_radius.to_string(),
                "must be a positive number",
            ));
        }

        let step_interval = uniform_secs(&get, ("STEP_MIN_SECS", 3.0), ("STEP_MAX_SECS", 8.0))?;
        let turn_interval = uniform_secs(&get, ("TURN_MIN_SECS", 5.0), ("TURN_MAX_SECS", 15.0))?;
        let chat_base: u64 = parse_or(&get, "CHAT_INTERVAL_MS", 90_000)?;
        let chat_jitter: u64 = parse_or(&get, "CHAT_JITTER_MS", 30_000)?;
        if chat_base.saturating_add(chat_jitter) == 0 {
            return Err(invalid(
                "CHAT_INTERVAL_MS",
                "0",
                "interval and jitter cannot both be zero",
            ));
        }
        let chat_interval = DelayPolicy::Jittered {
            base: Duration::from_millis(chat_base),
            jitter: Duration::from_millis(chat_jitter),
        };

        let heartbeat_secs: u64 = parse_or(&get, "HEARTBEAT_SECS", 60)?;
        if heartbeat_secs == 0 {
            return Err(invalid("HEARTBEAT_SECS", "0", "must be at least 1"));
        }

        let http_port = match get("PORT") {
            Some(raw) => parse_port("PORT", &raw)?,
            None => 3000,
        };

        let bridge_addr = get("BRIDGE_ADDR").unwrap_or_else(|| "127.0.0.1:19140".to_string());

        Ok(Config {
            host,
            port,
            username,
            versions,
            reconnect_mode,
            retry_delay,
            patrol_radius,
            step_interval,
            turn_interval,
            chat_interval,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            http_port,
            bridge_addr,
        })
    }

    pub fn activity_settings(&self) -> ActivitySettings {
        ActivitySettings {
            step: self.step_interval,
            turn: self.turn_interval,
            chat: self.chat_interval,
            patrol_radius: self.patrol_radius,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::with_base(self.retry_delay)
    }

    /// Parse a CLI flag value like `--port 19132`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

fn parse_port(key: &'static str, raw: &str) -> Result<u16, ConfigError> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(key, raw, "must be between 1 and 65535")),
        Ok(port) => Ok(port),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
        None => Ok(default),
    }
}

fn uniform_secs<G>(
    get: &G,
    (min_key, min_default): (&'static str, f64),
    (max_key, max_default): (&'static str, f64),
) -> Result<DelayPolicy, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let min: f64 = parse_or(get, min_key, min_default)?;
    let max: f64 = parse_or(get, max_key, max_default)?;
    if !min.is_finite() || min < 0.0 {
        return Err(invalid(min_key, &min.to_string(), "must be a non-negative number"));
    }
    if !max.is_finite() || max < min {
        return Err(invalid(max_key, &max.to_string(), &format!("must be at least {min_key}")));
    }
    if max == 0.0 {
        return Err(invalid(max_key, "0", "must be greater than zero"));
    }
    Ok(DelayPolicy::Uniform {
        min: Duration::from_secs_f64(min),
        max: Duration::from_secs_f64(max),
    })
}
