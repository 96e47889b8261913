//! Environment-backed configuration for `chat-console`.

use std::{env, path::PathBuf};

use chat_core::{RetryPolicy, RuntimeConfig};
use thiserror::Error;

const DEFAULT_DATA_DIR: &str = "./.notechat-console-store";
const COUNTERS_FILENAME: &str = "unread-counters.json";
const MAX_PAGE_SIZE: u16 = 100;
const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Settings for one console session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleConfig {
    /// Base URL of the REST endpoints.
    pub api_url: String,
    /// `ws://` or `wss://` URL of the push socket.
    pub socket_url: String,
    /// Authenticated user the session binds to.
    pub user_id: String,
    /// Optional bearer token for REST calls.
    pub token: Option<String>,
    pub data_dir: PathBuf,
    pub runtime: RuntimeConfig,
    pub reconnect: RetryPolicy,
}

impl ConsoleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_url = required("NOTECHAT_API_URL", &mut lookup)?;
        let socket_url = required("NOTECHAT_SOCKET_URL", &mut lookup)?;
        let user_id = required("NOTECHAT_USER_ID", &mut lookup)?;
        let token = optional_trimmed("NOTECHAT_TOKEN", &mut lookup);
        let data_dir = optional_trimmed("NOTECHAT_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let defaults = RuntimeConfig::default();
        let page_size = parse_or("NOTECHAT_PAGE_SIZE", defaults.page_size, &mut lookup)?
            .clamp(1, MAX_PAGE_SIZE);
        let search_debounce_ms = parse_or(
            "NOTECHAT_SEARCH_DEBOUNCE_MS",
            defaults.search_debounce_ms,
            &mut lookup,
        )?;
        let confirm_on_dispatch = parse_bool_or(
            "NOTECHAT_CONFIRM_ON_DISPATCH",
            defaults.confirm_on_dispatch,
            &mut lookup,
        )?;

        let reconnect_base_ms = parse_or(
            "NOTECHAT_RECONNECT_BASE_MS",
            DEFAULT_RECONNECT_BASE_MS,
            &mut lookup,
        )?;
        let reconnect_max_ms = parse_or(
            "NOTECHAT_RECONNECT_MAX_MS",
            DEFAULT_RECONNECT_MAX_MS,
            &mut lookup,
        )?;
        if reconnect_base_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOTECHAT_RECONNECT_BASE_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if reconnect_max_ms < reconnect_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "NOTECHAT_RECONNECT_MAX_MS",
                value: reconnect_max_ms.to_string(),
                reason: format!("must not be below the base delay of {reconnect_base_ms}ms"),
            });
        }

        Ok(Self {
            api_url,
            socket_url,
            user_id,
            token,
            data_dir,
            runtime: RuntimeConfig {
                page_size,
                search_debounce_ms,
                confirm_on_dispatch,
                ..defaults
            },
            reconnect: RetryPolicy::from_millis(reconnect_base_ms, reconnect_max_ms),
        })
    }

    /// JSON file holding the persisted unread counters.
    pub fn counters_path(&self) -> PathBuf {
        self.data_dir.join(COUNTERS_FILENAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed(key, lookup).ok_or(ConfigError::Missing { key })
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        reason: err.to_string(),
        value,
    })
}

fn parse_bool_or<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true or false".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, path::Path, time::Duration};

    use super::*;

    const REQUIRED: [(&str, &str); 3] = [
        ("NOTECHAT_API_URL", "https://chat.example.com/api"),
        ("NOTECHAT_SOCKET_URL", "wss://chat.example.com/socket"),
        ("NOTECHAT_USER_ID", "u-42"),
    ];

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<ConsoleConfig, ConfigError> {
        let map = REQUIRED
            .iter()
            .chain(pairs)
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        ConsoleConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_required_fields_and_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert_eq!(cfg.api_url, "https://chat.example.com/api");
        assert_eq!(cfg.user_id, "u-42");
        assert_eq!(cfg.token, None);
        assert_eq!(cfg.runtime, RuntimeConfig::default());
        assert_eq!(cfg.reconnect.base(), Duration::from_millis(500));
        assert_eq!(
            cfg.counters_path(),
            Path::new("./.notechat-console-store/unread-counters.json")
        );
    }

    #[test]
    fn missing_user_is_reported_by_key() {
        let err = ConsoleConfig::from_lookup(|key| match key {
            "NOTECHAT_API_URL" => Some("https://chat.example.com".to_owned()),
            "NOTECHAT_SOCKET_URL" => Some("wss://chat.example.com".to_owned()),
            "NOTECHAT_USER_ID" => Some("   ".to_owned()),
            _ => None,
        })
        .expect_err("blank user id must fail");
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "NOTECHAT_USER_ID"
            }
        );
    }

    #[test]
    fn page_size_is_clamped() {
        let cfg = config_from_pairs(&[("NOTECHAT_PAGE_SIZE", "0")]).expect("config should parse");
        assert_eq!(cfg.runtime.page_size, 1);

        let cfg = config_from_pairs(&[("NOTECHAT_PAGE_SIZE", "500")]).expect("config should parse");
        assert_eq!(cfg.runtime.page_size, 100);
    }

    #[test]
    fn parses_tuning_overrides() {
        let cfg = config_from_pairs(&[
            ("NOTECHAT_TOKEN", " secret "),
            ("NOTECHAT_DATA_DIR", "/tmp/notechat"),
            ("NOTECHAT_SEARCH_DEBOUNCE_MS", "150"),
            ("NOTECHAT_CONFIRM_ON_DISPATCH", "yes"),
            ("NOTECHAT_RECONNECT_BASE_MS", "100"),
            ("NOTECHAT_RECONNECT_MAX_MS", "1000"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.token.as_deref(), Some("secret"));
        assert_eq!(cfg.counters_path(), Path::new("/tmp/notechat/unread-counters.json"));
        assert_eq!(cfg.runtime.search_debounce_ms, 150);
        assert!(cfg.runtime.confirm_on_dispatch);
        assert_eq!(cfg.reconnect.max(), Duration::from_millis(1_000));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = config_from_pairs(&[("NOTECHAT_PAGE_SIZE", "lots")])
            .expect_err("non-numeric page size should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "NOTECHAT_PAGE_SIZE",
                ..
            }
        ));

        let err = config_from_pairs(&[("NOTECHAT_CONFIRM_ON_DISPATCH", "maybe")])
            .expect_err("unknown boolean should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "NOTECHAT_CONFIRM_ON_DISPATCH",
                ..
            }
        ));

        let err = config_from_pairs(&[
            ("NOTECHAT_RECONNECT_BASE_MS", "2000"),
            ("NOTECHAT_RECONNECT_MAX_MS", "100"),
        ])
        .expect_err("max below base should fail");
        assert!(err.to_string().contains("NOTECHAT_RECONNECT_MAX_MS"));
    }
}
