use std::{env, time::Duration};
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const MIN_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name} '{value}': {source}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
}

/// Command-line values that override the environment. Empty strings mean
/// "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub api_url: String,
    pub socket_url: String,
    pub token: String,
    pub poll_interval_ms: Option<u64>,
    pub push_disabled: bool,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub api_url: Url,
    pub socket_url: Url,
    pub token: Option<String>,
    pub poll_interval: Duration,
    pub push_enabled: bool,
}

pub fn load_config(overrides: &Overrides) -> Result<WatchConfig, ConfigError> {
    let api_url = resolve_api_url(&overrides.api_url)?;
    let socket_url = resolve_socket_url(&overrides.socket_url, &api_url)?;
    Ok(WatchConfig {
        token: resolve_token(&overrides.token),
        poll_interval: resolve_poll_interval(overrides.poll_interval_ms),
        push_enabled: !overrides.push_disabled && resolve_push_enabled(),
        api_url,
        socket_url,
    })
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// A non-blank flag wins over a non-blank env value.
fn first_non_empty(flag: &str, env_value: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env_value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        name,
        value: value.to_string(),
        source,
    })
}

pub fn resolve_api_url(flag: &str) -> Result<Url, ConfigError> {
    let value = first_non_empty(flag, env_value("DIG_API_URL"))
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    parse_url("api url", &value)
}

/// The push endpoint defaults to the API host.
pub fn resolve_socket_url(flag: &str, api_url: &Url) -> Result<Url, ConfigError> {
    match first_non_empty(flag, env_value("DIG_SOCKET_URL")) {
        Some(value) => parse_url("socket url", &value),
        None => Ok(api_url.clone()),
    }
}

pub fn resolve_token(flag: &str) -> Option<String> {
    first_non_empty(flag, env_value("DIG_TOKEN"))
}

pub fn resolve_poll_interval(flag: Option<u64>) -> Duration {
    let millis = flag
        .or_else(|| env_value("DIG_POLL_INTERVAL_MS").and_then(|value| value.trim().parse().ok()))
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    Duration::from_millis(millis.max(MIN_POLL_INTERVAL_MS))
}

pub fn resolve_push_enabled() -> bool {
    env_value("DIG_PUSH_ENABLED")
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(true)
}

pub fn resolve_log_stdout() -> bool {
    env_value("DIG_LOG_STDOUT")
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

pub fn resolve_log_level() -> String {
    first_non_empty("", env_value("DIG_LOG_LEVEL")).unwrap_or_else(|| "info".to_string())
}
