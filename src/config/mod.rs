//! Environment configuration.
//!
//! Reads the commercial API token, static proxy list and cache settings from
//! the process environment, after loading a `.env` file if one is present.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;
use thiserror::Error;

use crate::modules::cache::DEFAULT_CACHE_DIR;

pub const COMMERCIAL_API_KEY_VAR: &str = "TRENDS_COMMERCIAL_API_KEY";
pub const COMMERCIAL_API_KEY_ALIAS: &str = "SERPAPI_KEY";
pub const PROXIES_VAR: &str = "TRENDS_PROXIES";
pub const CACHE_DIR_VAR: &str = "TRENDS_CACHE_DIR";
pub const CACHE_TTL_VAR: &str = "TRENDS_CACHE_TTL_SECS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a whole number of seconds, got {value:?}")]
    InvalidDuration { var: &'static str, value: String },
}

/// Settings sourced from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendsEnv {
    pub commercial_api_key: Option<String>,
    pub proxies: Vec<String>,
    pub cache_dir: PathBuf,
    pub cache_ttl: Option<Duration>,
}

impl Default for TrendsEnv {
    fn default() -> Self {
        Self {
            commercial_api_key: None,
            proxies: Vec::new(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache_ttl: None,
        }
    }
}

impl TrendsEnv {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env is optional
        let _ = dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load through an arbitrary lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let cache_ttl = match non_empty(CACHE_TTL_VAR) {
            Some(raw) => Some(Duration::from_secs(raw.parse().map_err(|_| {
                ConfigError::InvalidDuration {
                    var: CACHE_TTL_VAR,
                    value: raw.clone(),
                }
            })?)),
            None => None,
        };

        Ok(Self {
            commercial_api_key: non_empty(COMMERCIAL_API_KEY_VAR)
                .or_else(|| non_empty(COMMERCIAL_API_KEY_ALIAS)),
            proxies: non_empty(PROXIES_VAR)
                .map(|raw| parse_proxy_list(&raw))
                .unwrap_or_default(),
            cache_dir: non_empty(CACHE_DIR_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            cache_ttl,
        })
    }
}

/// Split a comma- or whitespace-separated proxy list.
pub fn parse_proxy_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let env = TrendsEnv::from_lookup(lookup(&[])).unwrap();
        assert_eq!(env, TrendsEnv::default());
    }

    #[test]
    fn reads_all_variables() {
        let env = TrendsEnv::from_lookup(lookup(&[
            (COMMERCIAL_API_KEY_ALIAS, "abc"),
            (PROXIES_VAR, "http://a:1, http://b:2\nhttp://c:3"),
            (CACHE_DIR_VAR, "/tmp/trends"),
            (CACHE_TTL_VAR, "600"),
        ]))
        .unwrap();
        assert_eq!(env.commercial_api_key.as_deref(), Some("abc"));
        assert_eq!(env.proxies, vec!["http://a:1", "http://b:2", "http://c:3"]);
        assert_eq!(env.cache_dir, PathBuf::from("/tmp/trends"));
        assert_eq!(env.cache_ttl, Some(Duration::from_secs(600)));
    }

    #[test]
    fn primary_key_wins_over_alias() {
        let env = TrendsEnv::from_lookup(lookup(&[
            (COMMERCIAL_API_KEY_VAR, "primary"),
            (COMMERCIAL_API_KEY_ALIAS, "alias"),
        ]))
        .unwrap();
        assert_eq!(env.commercial_api_key.as_deref(), Some("primary"));
    }

    #[test]
    fn bad_ttl_is_rejected() {
        let err = TrendsEnv::from_lookup(lookup(&[(CACHE_TTL_VAR, "a day")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));
    }
}
