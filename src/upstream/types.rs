//! Shared transport types for the upstream clients.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::modules::proxy::Proxy;
use crate::normalize::NormalizeError;

static TOO_MANY_REQUESTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)too\s+many\s+requests").expect("invalid rate-limit regex"));

/// Failure classes the fetch ladder reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeouts, 5xx, dropped connections. Retried with backoff.
    Transient,
    /// 429 or a rate-limit body. Session reset plus proxy rotation.
    RateLimited,
    /// Upstream answered but had nothing for the timeframe.
    NoData,
    Parse,
    Proxy,
    Commercial,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("rate limited (status {status})")]
    RateLimited { status: u16 },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("proxy {proxy} failed: {message}")]
    Proxy { proxy: String, message: String },
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("response parse failure: {0}")]
    Parse(String),
    #[error("no {0} data available")]
    NoData(&'static str),
    #[error("connection error budget exhausted after {0} failures")]
    BudgetExhausted(u32),
    #[error("commercial api error: {0}")]
    Commercial(String),
    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::RateLimited { .. } => ErrorKind::RateLimited,
            FetchError::Connection(_) | FetchError::Status(_) | FetchError::BudgetExhausted(_) => {
                ErrorKind::Transient
            }
            FetchError::Proxy { .. } => ErrorKind::Proxy,
            FetchError::Parse(_) | FetchError::Url(_) => ErrorKind::Parse,
            FetchError::NoData(_) => ErrorKind::NoData,
            FetchError::Commercial(_) => ErrorKind::Commercial,
        }
    }

    /// Classify a transport error. Connect failures through a bound proxy
    /// are blamed on the proxy.
    pub fn from_reqwest(err: reqwest::Error, proxy: Option<&Proxy>) -> Self {
        if err.is_decode() {
            return FetchError::Parse(err.to_string());
        }
        if let Some(proxy) = proxy
            && err.is_connect()
        {
            return FetchError::Proxy {
                proxy: proxy.url.clone(),
                message: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return FetchError::from_status(status.as_u16());
        }
        FetchError::Connection(err.to_string())
    }

    pub fn from_status(status: u16) -> Self {
        if status == 429 {
            FetchError::RateLimited { status }
        } else {
            FetchError::Status(status)
        }
    }

    /// True when the failure should count against the bound proxy.
    pub fn implicates_proxy(&self) -> bool {
        matches!(
            self,
            FetchError::Proxy { .. } | FetchError::Connection(_) | FetchError::RateLimited { .. }
        )
    }

    /// Dropped connections and timeouts; these draw on the connection budget.
    pub fn is_connection(&self) -> bool {
        matches!(self, FetchError::Connection(_) | FetchError::Proxy { .. })
    }
}

impl From<NormalizeError> for FetchError {
    fn from(err: NormalizeError) -> Self {
        FetchError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Parse(err.to_string())
    }
}

/// Status, final URL and body of one upstream call.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub url: Url,
    pub body: String,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Map rate-limit bodies and non-2xx statuses to errors.
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.status == 429 || TOO_MANY_REQUESTS.is_match(&self.body) {
            return Err(FetchError::RateLimited {
                status: self.status,
            });
        }
        if !self.is_success() {
            return Err(FetchError::from_status(self.status));
        }
        Ok(self)
    }
}
