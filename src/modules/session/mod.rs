//! Short-lived HTTP sessions.
//!
//! Every session carries a fresh fingerprint (headers plus cookies), an
//! optional bound proxy and a status-code retry adapter. Every outbound
//! send, adapter retries included, first takes the factory's rate limiter.
//! The factory never fails: if the configured client cannot be built it
//! degrades to a minimal one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::Method;
use reqwest::Client;
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

use crate::modules::pacing::RateLimiter;
use crate::modules::proxy::Proxy;
use crate::modules::spoofing::{Fingerprint, cookie_domain};
use crate::types::ConnectionKind;
use crate::upstream::types::{FetchError, UpstreamResponse};

/// Status-code retry policy applied inside a single session call.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterRetry {
    /// Total attempts, first one included.
    pub total: u32,
    pub backoff_factor: f64,
    pub status_forcelist: Vec<u16>,
    pub allowed_methods: Vec<Method>,
}

impl Default for AdapterRetry {
    fn default() -> Self {
        Self {
            total: 5,
            backoff_factor: 2.0,
            status_forcelist: vec![429, 500, 502, 503, 504],
            allowed_methods: vec![Method::GET, Method::HEAD, Method::OPTIONS],
        }
    }
}

impl AdapterRetry {
    /// Plain retries without backoff; used when the full client cannot be built.
    pub fn minimal() -> Self {
        Self {
            total: 3,
            backoff_factor: 0.0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based). The first retry is immediate.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::ZERO;
        }
        let secs = self.backoff_factor * 2f64.powi(retry as i32 - 1);
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn should_retry(&self, method: &Method, status: u16) -> bool {
        self.allowed_methods.contains(method) && self.status_forcelist.contains(&status)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Read timeout for direct (unproxied) sessions.
    pub direct_read_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub keep_alive: Duration,
    pub retry: AdapterRetry,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
            direct_read_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 10,
            keep_alive: Duration::from_secs(300),
            retry: AdapterRetry::default(),
        }
    }
}

/// Builds sessions for one upstream origin.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    config: SessionConfig,
    origin: Url,
    region: String,
    limiter: Option<Arc<RateLimiter>>,
}

impl SessionFactory {
    pub fn new(config: SessionConfig, origin: Url, region: impl Into<String>) -> Self {
        Self {
            config,
            origin,
            region: region.into(),
            limiter: None,
        }
    }

    /// Pace every request of the sessions built from here.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn for_region(&self, region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..self.clone()
        }
    }

    pub fn new_session(&self, use_cache: bool, proxy: Option<Proxy>) -> Session {
        self.build(use_cache, proxy, self.config.read_timeout)
    }

    /// Unproxied session with the longer read timeout.
    pub fn new_direct_session(&self, use_cache: bool) -> Session {
        self.build(use_cache, None, self.config.direct_read_timeout)
    }

    fn build(&self, use_cache: bool, proxy: Option<Proxy>, read_timeout: Duration) -> Session {
        let fingerprint = Fingerprint::random(&self.region);
        let jar = Arc::new(Jar::default());
        let domain = cookie_domain(self.origin.host_str().unwrap_or_default());
        for cookie in fingerprint.cookies(&domain).set_cookie_strings() {
            jar.add_cookie_str(&cookie, &self.origin);
        }

        let (client, proxy, retry) =
            match self.full_client(&fingerprint, jar.clone(), proxy.as_ref(), read_timeout) {
                Ok(client) => (client, proxy, self.config.retry.clone()),
                Err(err) => {
                    log::warn!("session client construction failed ({err}); using minimal client");
                    (
                        minimal_client(jar.clone(), self.config.connect_timeout),
                        None,
                        AdapterRetry::minimal(),
                    )
                }
            };

        Session {
            client,
            jar,
            proxy,
            fingerprint: Arc::new(fingerprint),
            retry,
            limiter: self.limiter.clone(),
            memo: use_cache.then(|| Arc::new(Mutex::new(HashMap::new()))),
            created_at: Instant::now(),
        }
    }

    fn full_client(
        &self,
        fingerprint: &Fingerprint,
        jar: Arc<Jar>,
        proxy: Option<&Proxy>,
        read_timeout: Duration,
    ) -> Result<Client, String> {
        let headers = fingerprint
            .headers()
            .to_header_map()
            .map_err(|err| err.to_string())?;

        let mut builder = Client::builder()
            .default_headers(headers)
            .cookie_provider(jar)
            .connect_timeout(self.config.connect_timeout)
            .read_timeout(read_timeout)
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .pool_idle_timeout(self.config.keep_alive)
            .tcp_keepalive(self.config.keep_alive);

        builder = match proxy {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(&proxy.url).map_err(|err| err.to_string())?),
            None => builder.no_proxy(),
        };

        builder.build().map_err(|err| err.to_string())
    }
}

fn minimal_client(jar: Arc<Jar>, connect_timeout: Duration) -> Client {
    Client::builder()
        .cookie_provider(jar)
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|err| {
            log::error!("minimal client construction failed ({err}); using defaults");
            Client::new()
        })
}

/// One strategy step's HTTP identity.
#[derive(Clone)]
pub struct Session {
    client: Client,
    jar: Arc<Jar>,
    proxy: Option<Proxy>,
    fingerprint: Arc<Fingerprint>,
    retry: AdapterRetry,
    limiter: Option<Arc<RateLimiter>>,
    memo: Option<Arc<Mutex<HashMap<String, UpstreamResponse>>>>,
    created_at: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("proxy", &self.proxy.as_ref().map(|proxy| proxy.url.as_str()))
            .field("user_agent", &self.fingerprint.user_agent)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl Session {
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn connection(&self) -> ConnectionKind {
        if self.proxy.is_some() {
            ConnectionKind::Proxy
        } else {
            ConnectionKind::Direct
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn retry_policy(&self) -> &AdapterRetry {
        &self.retry
    }

    /// Cookies the jar would send to `url`.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.jar
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    pub async fn get(&self, url: Url) -> Result<UpstreamResponse, FetchError> {
        self.send(Method::GET, url).await
    }

    /// Send a request, retrying listed statuses per the adapter policy.
    /// Non-success responses are returned, not turned into errors.
    pub async fn send(&self, method: Method, url: Url) -> Result<UpstreamResponse, FetchError> {
        let memo_key = format!("{method} {url}");
        if let Some(memo) = &self.memo
            && let Ok(guard) = memo.lock()
            && let Some(hit) = guard.get(&memo_key)
        {
            log::trace!("session memo hit for {url}");
            return Ok(hit.clone());
        }

        let attempts = self.retry.total.max(1);
        let mut retry = 0;
        let response = loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            let response = self
                .client
                .request(method.clone(), url.clone())
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(err, self.proxy.as_ref()))?;
            let status = response.status().as_u16();
            let final_url = response.url().clone();

            if retry + 1 < attempts && self.retry.should_retry(&method, status) {
                retry += 1;
                let delay = self.retry.backoff(retry);
                log::debug!(
                    "{method} {url} -> {status}; adapter retry {retry} in {:.1}s",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|err| FetchError::from_reqwest(err, self.proxy.as_ref()))?;
            break UpstreamResponse {
                status,
                url: final_url,
                body,
            };
        };

        if let Some(memo) = &self.memo
            && response.is_success()
            && let Ok(mut guard) = memo.lock()
        {
            guard.insert(memo_key, response.clone());
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::pacing::PacingConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn factory(server: &MockServer, retry: AdapterRetry) -> SessionFactory {
        SessionFactory::new(
            SessionConfig {
                retry,
                ..SessionConfig::default()
            },
            Url::parse(&server.uri()).unwrap(),
            "IN",
        )
    }

    #[test]
    fn backoff_skips_first_retry() {
        let retry = AdapterRetry::default();
        assert_eq!(retry.backoff(1), Duration::ZERO);
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
        assert_eq!(retry.backoff(3), Duration::from_secs(8));
        assert!(!retry.should_retry(&Method::POST, 503));
        assert!(retry.should_retry(&Method::GET, 429));
    }

    #[tokio::test]
    async fn retries_listed_statuses_then_returns_last() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let session = factory(
            &server,
            AdapterRetry {
                total: 3,
                backoff_factor: 0.0,
                ..AdapterRetry::default()
            },
        )
        .new_session(false, None);
        let url = Url::parse(&format!("{}/flaky", server.uri())).unwrap();
        let response = session.get(url).await.unwrap();
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn adapter_retries_wait_for_the_rate_limiter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let interval = Duration::from_millis(120);
        let limiter = Arc::new(RateLimiter::new(PacingConfig {
            min_interval: interval,
            ..PacingConfig::fast()
        }));
        let session = factory(
            &server,
            AdapterRetry {
                total: 3,
                backoff_factor: 0.0,
                ..AdapterRetry::default()
            },
        )
        .with_rate_limiter(limiter)
        .new_session(false, None);

        let started = Instant::now();
        let url = Url::parse(&format!("{}/busy", server.uri())).unwrap();
        assert_eq!(session.get(url).await.unwrap().status, 503);
        assert!(started.elapsed() >= interval * 2);
    }

    #[tokio::test]
    async fn sends_fingerprint_headers_and_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/echo"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let session = factory(&server, AdapterRetry::default()).new_session(false, None);
        let url = Url::parse(&format!("{}/echo", server.uri())).unwrap();
        session.get(url.clone()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let ua = requests[0].headers.get("user-agent").unwrap().to_str().unwrap();
        assert_eq!(ua, session.fingerprint().user_agent);
        let cookies = session.cookie_header(&url).unwrap();
        assert!(cookies.contains("NID="));
        assert!(cookies.contains("CONSENT="));
        assert_eq!(session.connection(), ConnectionKind::Direct);
    }

    #[tokio::test]
    async fn memo_serves_repeat_gets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/explore"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let session = factory(&server, AdapterRetry::default()).new_session(true, None);
        let url = Url::parse(&format!("{}/explore", server.uri())).unwrap();
        session.get(url.clone()).await.unwrap();
        session.get(url).await.unwrap();
    }

    #[test]
    fn unusable_proxy_degrades_to_minimal_client() {
        let factory = SessionFactory::new(
            SessionConfig::default(),
            Url::parse("https://trends.google.com").unwrap(),
            "IN",
        );
        let session = factory.new_session(false, Some(Proxy::new("::not a proxy::")));
        assert!(session.proxy().is_none());
        assert_eq!(session.retry_policy(), &AdapterRetry::minimal());
    }
}
