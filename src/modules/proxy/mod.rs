//! Proxy pool with failure tracking and validation.
//!
//! Selection is uniform over proxies not currently marked failed. When every
//! proxy has failed the failed set is cleared and selection retried, so
//! proxies are rehabilitated without a timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub url: String,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Proxy {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            failed_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy url {0} is invalid: {1}")]
    Invalid(String, String),
    #[error("probe through {proxy} failed: {message}")]
    Unreachable { proxy: String, message: String },
    #[error("probe through {proxy} returned status {status}")]
    Status { proxy: String, status: u16 },
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Connect and read timeout for each validation probe.
    pub validation_timeout: Duration,
    pub max_candidates: usize,
    pub test_urls: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            validation_timeout: Duration::from_secs(5),
            max_candidates: 3,
            test_urls: vec![
                "https://www.google.com/generate_204".into(),
                "https://www.gstatic.com/generate_204".into(),
                "https://httpbin.org/ip".into(),
            ],
        }
    }
}

/// Probes a proxy before it is handed out.
#[async_trait]
pub trait ProxyValidator: Send + Sync {
    async fn probe(&self, proxy: &Proxy, target: &str) -> Result<(), ProxyError>;
}

/// Issues a single GET through the proxy with tight timeouts.
#[derive(Debug, Clone)]
pub struct HttpProxyValidator {
    timeout: Duration,
}

impl HttpProxyValidator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProxyValidator for HttpProxyValidator {
    async fn probe(&self, proxy: &Proxy, target: &str) -> Result<(), ProxyError> {
        let route = reqwest::Proxy::all(&proxy.url)
            .map_err(|err| ProxyError::Invalid(proxy.url.clone(), err.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(route)
            .connect_timeout(self.timeout)
            .read_timeout(self.timeout)
            .build()
            .map_err(|err| ProxyError::Invalid(proxy.url.clone(), err.to_string()))?;

        let response = client
            .get(target)
            .send()
            .await
            .map_err(|err| ProxyError::Unreachable {
                proxy: proxy.url.clone(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(ProxyError::Status {
                proxy: proxy.url.clone(),
                status: status.as_u16(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyHealthReport {
    pub total_proxies: usize,
    pub available_proxies: usize,
    pub failed_proxies: usize,
    pub resets: u64,
    pub details: HashMap<String, ProxyStats>,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyStats {
    pub successes: u64,
    pub failures: u64,
    pub last_used: Option<Instant>,
    pub last_failure: Option<Instant>,
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    proxy: Proxy,
    stats: ProxyStats,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<ProxyEntry>,
    resets: u64,
}

impl PoolState {
    fn find_mut(&mut self, url: &str) -> Option<&mut ProxyEntry> {
        self.entries.iter_mut().find(|entry| entry.proxy.url == url)
    }
}

/// Shared proxy pool. `pick` and `mark_failed` are atomic under one mutex.
pub struct ProxyPool {
    config: ProxyConfig,
    state: Mutex<PoolState>,
    validator: Arc<dyn ProxyValidator>,
}

impl std::fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPool")
            .field("config", &self.config)
            .field("size", &self.len())
            .finish()
    }
}

impl ProxyPool {
    pub fn new(config: ProxyConfig) -> Self {
        let validator = Arc::new(HttpProxyValidator::new(config.validation_timeout));
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            validator,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ProxyValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the configured proxies. Duplicates and blanks are skipped.
    pub fn load<I>(&self, proxies: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut state = self.lock();
        state.entries.clear();
        for url in proxies {
            let url = url.into().trim().to_string();
            if url.is_empty() || state.entries.iter().any(|entry| entry.proxy.url == url) {
                continue;
            }
            state.entries.push(ProxyEntry {
                proxy: Proxy::new(url),
                stats: ProxyStats::default(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failed_count(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.proxy.failed_at.is_some())
            .count()
    }

    /// A non-failed proxy chosen uniformly at random, or `None` when the pool
    /// is empty.
    pub fn pick(&self) -> Option<Proxy> {
        let mut state = self.lock();
        if state.entries.is_empty() {
            return None;
        }

        let mut available: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.proxy.failed_at.is_none())
            .map(|(idx, _)| idx)
            .collect();

        if available.is_empty() {
            log::info!(
                "all {} proxies marked failed; resetting failed set",
                state.entries.len()
            );
            for entry in &mut state.entries {
                entry.proxy.failed_at = None;
            }
            state.resets += 1;
            available = (0..state.entries.len()).collect();
        }

        let index = *available.choose(&mut rand::thread_rng())?;
        let entry = &mut state.entries[index];
        entry.stats.last_used = Some(Instant::now());
        Some(entry.proxy.clone())
    }

    /// Pick and probe up to `max_candidates` proxies; failed probes are
    /// marked failed.
    pub async fn pick_validated(&self) -> Option<Proxy> {
        for _ in 0..self.config.max_candidates {
            let proxy = self.pick()?;
            let target = self
                .config
                .test_urls
                .choose(&mut rand::thread_rng())
                .cloned();
            let Some(target) = target else {
                return Some(proxy);
            };

            match self.validator.probe(&proxy, &target).await {
                Ok(()) => {
                    log::debug!("proxy {} validated against {target}", proxy.url);
                    return Some(proxy);
                }
                Err(err) => {
                    log::warn!("proxy validation failed: {err}");
                    self.mark_failed(&proxy);
                }
            }
        }
        log::warn!(
            "no proxy validated after {} candidates",
            self.config.max_candidates
        );
        None
    }

    pub fn mark_failed(&self, proxy: &Proxy) {
        let mut state = self.lock();
        if let Some(entry) = state.find_mut(&proxy.url) {
            entry.proxy.failed_at = Some(Utc::now());
            entry.stats.failures += 1;
            entry.stats.last_failure = Some(Instant::now());
        }
    }

    pub fn report_success(&self, proxy: &Proxy) {
        let mut state = self.lock();
        if let Some(entry) = state.find_mut(&proxy.url) {
            entry.stats.successes += 1;
        }
    }

    pub fn health_report(&self) -> ProxyHealthReport {
        let state = self.lock();
        let failed = state
            .entries
            .iter()
            .filter(|entry| entry.proxy.failed_at.is_some())
            .count();
        ProxyHealthReport {
            total_proxies: state.entries.len(),
            available_proxies: state.entries.len() - failed,
            failed_proxies: failed,
            resets: state.resets,
            details: state
                .entries
                .iter()
                .map(|entry| (entry.proxy.url.clone(), entry.stats.clone()))
                .collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}
