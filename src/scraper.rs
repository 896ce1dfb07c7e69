//! High level scraper orchestration.
//!
//! Wires the proxy pool, session factory, pacing, cache, upstream clients and
//! event handlers into one [`TrendsScraper`] whose only entry point,
//! [`TrendsScraper::get_trends`], always returns a [`TrendsResult`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, TrendsEnv};
use crate::ladder::{self, LadderContext, RetryConfig};
use crate::modules::cache::{CacheConfig, TrendsCache};
use crate::modules::events::{EventDispatcher, EventHandler, LoggingHandler, MetricsHandler};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::pacing::{PacingConfig, RateLimiter, WarmupTargets};
use crate::modules::proxy::{ProxyConfig, ProxyHealthReport, ProxyPool, ProxyValidator};
use crate::modules::session::{SessionConfig, SessionFactory};
use crate::types::{Keywords, Metadata, QueryOptions, TrendsRequest, TrendsResult};
use crate::upstream::google::{DEFAULT_BASE_URL as GOOGLE_BASE_URL, DEFAULT_LANGUAGE};
use crate::upstream::commercial::DEFAULT_BASE_URL as COMMERCIAL_BASE_URL;
use crate::upstream::{CommercialClient, GoogleTrendsClient};

pub const DEFAULT_HOME_URL: &str = "https://www.google.com/";
pub const DEFAULT_REGION: &str = "IN";

/// Result alias used by the construction layer.
pub type TrendsScraperResult<T> = Result<T, TrendsScraperError>;

#[derive(Debug, Error)]
pub enum TrendsScraperError {
	#[error("invalid {name} url {value:?}: {source}")]
	InvalidUrl {
		name: &'static str,
		value: String,
		#[source]
		source: url::ParseError,
	},
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
}

/// Scraper configuration used by the builder.
#[derive(Debug, Clone)]
pub struct TrendsScraperConfig {
	pub google_base_url: String,
	pub home_url: String,
	pub commercial_base_url: String,
	pub commercial_api_key: Option<String>,
	pub proxies: Vec<String>,
	pub proxy_config: ProxyConfig,
	pub session: SessionConfig,
	/// Private pacing; `None` shares the process-wide limiter.
	pub pacing: Option<PacingConfig>,
	pub retry: RetryConfig,
	pub cache: CacheConfig,
	pub worker_pool: usize,
	pub soft_budget: Duration,
	pub enable_warmup: bool,
	pub enable_metrics: bool,
	pub language: String,
	pub timezone: Option<i32>,
	/// Region used for fingerprint locale and timezone.
	pub region: String,
}

impl Default for TrendsScraperConfig {
	fn default() -> Self {
		Self {
			google_base_url: GOOGLE_BASE_URL.to_string(),
			home_url: DEFAULT_HOME_URL.to_string(),
			commercial_base_url: COMMERCIAL_BASE_URL.to_string(),
			commercial_api_key: None,
			proxies: Vec::new(),
			proxy_config: ProxyConfig::default(),
			session: SessionConfig::default(),
			pacing: None,
			retry: RetryConfig::default(),
			cache: CacheConfig::default(),
			worker_pool: ladder::MAX_WORKERS,
			soft_budget: Duration::from_secs(30),
			enable_warmup: true,
			enable_metrics: true,
			language: DEFAULT_LANGUAGE.to_string(),
			timezone: None,
			region: DEFAULT_REGION.to_string(),
		}
	}
}

/// Fluent builder for [`TrendsScraper`].
#[derive(Default)]
pub struct TrendsScraperBuilder {
	config: TrendsScraperConfig,
	limiter: Option<Arc<RateLimiter>>,
	validator: Option<Arc<dyn ProxyValidator>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl TrendsScraperBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_config(mut self, config: TrendsScraperConfig) -> Self {
		self.config = config;
		self
	}

	/// Apply settings read from the environment.
	pub fn with_env(mut self, env: TrendsEnv) -> Self {
		if env.commercial_api_key.is_some() {
			self.config.commercial_api_key = env.commercial_api_key;
		}
		if !env.proxies.is_empty() {
			self.config.proxies = env.proxies;
		}
		if self.config.cache.directory.is_some() {
			self.config.cache.directory = Some(env.cache_dir);
		}
		if let Some(ttl) = env.cache_ttl {
			self.config.cache.ttl = ttl;
		}
		self
	}

	pub fn with_google_base_url(mut self, url: impl Into<String>) -> Self {
		self.config.google_base_url = url.into();
		self
	}

	pub fn with_home_url(mut self, url: impl Into<String>) -> Self {
		self.config.home_url = url.into();
		self
	}

	pub fn with_commercial_base_url(mut self, url: impl Into<String>) -> Self {
		self.config.commercial_base_url = url.into();
		self
	}

	pub fn with_commercial_api_key(mut self, key: impl Into<String>) -> Self {
		self.config.commercial_api_key = Some(key.into());
		self
	}

	pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.proxies = proxies.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_proxy_config(mut self, config: ProxyConfig) -> Self {
		self.config.proxy_config = config;
		self
	}

	pub fn with_proxy_validator(mut self, validator: Arc<dyn ProxyValidator>) -> Self {
		self.validator = Some(validator);
		self
	}

	pub fn with_session_config(mut self, config: SessionConfig) -> Self {
		self.config.session = config;
		self
	}

	/// Pace this scraper with its own limiter instead of the shared one.
	pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
		self.config.pacing = Some(pacing);
		self
	}

	/// Share an existing limiter, e.g. between several scrapers.
	pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
		self.limiter = Some(limiter);
		self
	}

	pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
		self.config.retry = retry;
		self
	}

	pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
		self.config.cache = cache;
		self
	}

	pub fn with_cache_dir(mut self, directory: impl Into<PathBuf>) -> Self {
		self.config.cache.directory = Some(directory.into());
		self
	}

	pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
		self.config.cache.ttl = ttl;
		self
	}

	pub fn in_memory_cache(mut self) -> Self {
		self.config.cache.directory = None;
		self
	}

	pub fn with_worker_pool(mut self, workers: usize) -> Self {
		self.config.worker_pool = workers.clamp(1, ladder::MAX_WORKERS);
		self
	}

	pub fn with_soft_budget(mut self, budget: Duration) -> Self {
		self.config.soft_budget = budget;
		self
	}

	pub fn disable_warmup(mut self) -> Self {
		self.config.enable_warmup = false;
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn with_language(mut self, language: impl Into<String>) -> Self {
		self.config.language = language.into();
		self
	}

	pub fn with_timezone(mut self, offset_minutes: i32) -> Self {
		self.config.timezone = Some(offset_minutes);
		self
	}

	pub fn with_region(mut self, region: impl Into<String>) -> Self {
		self.config.region = region.into();
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> TrendsScraperResult<TrendsScraper> {
		TrendsScraper::assemble(self)
	}
}

/// Main scraper orchestrator.
#[derive(Debug)]
pub struct TrendsScraper {
	config: TrendsScraperConfig,
	ctx: LadderContext,
	limiter: Arc<RateLimiter>,
	metrics: Option<MetricsCollector>,
}

impl TrendsScraper {
	/// Obtain a builder to customise the scraper instance.
	pub fn builder() -> TrendsScraperBuilder {
		TrendsScraperBuilder::new()
	}

	/// Construct a scraper configured from the environment (and `.env`).
	pub fn from_env() -> TrendsScraperResult<Self> {
		let env = TrendsEnv::from_env()?;
		Self::builder().with_env(env).build()
	}

	fn assemble(builder: TrendsScraperBuilder) -> TrendsScraperResult<Self> {
		let TrendsScraperBuilder {
			config,
			limiter,
			validator,
			handlers,
		} = builder;

		let google_base = parse_url("google base", &config.google_base_url)?;
		let home = parse_url("home", &config.home_url)?;

		let limiter = match (limiter, &config.pacing) {
			(Some(limiter), _) => limiter,
			(None, Some(pacing)) => Arc::new(RateLimiter::new(pacing.clone())),
			(None, None) => RateLimiter::global(),
		};

		let mut proxies = ProxyPool::new(config.proxy_config.clone());
		if let Some(validator) = validator {
			proxies = proxies.with_validator(validator);
		}
		proxies.load(config.proxies.iter().cloned());

		let mut google = GoogleTrendsClient::new(google_base)
			.with_language(config.language.clone());
		if let Some(offset) = config.timezone {
			google = google.with_timezone(offset);
		}

		let commercial = match &config.commercial_api_key {
			Some(key) => {
				let base = parse_url("commercial base", &config.commercial_base_url)?;
				Some(CommercialClient::with_timeouts(
					base,
					key.clone(),
					limiter.clone(),
					config.session.connect_timeout,
					config.session.read_timeout,
				))
			}
			None => None,
		};

		let sessions = SessionFactory::new(
			config.session.clone(),
			google.base().clone(),
			config.region.clone(),
		)
		.with_rate_limiter(limiter.clone());
		let warmup = config.enable_warmup.then(|| WarmupTargets {
			home,
			trends: google.base().clone(),
		});

		let metrics = config.enable_metrics.then(MetricsCollector::new);
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}

		log::debug!(
			"trends scraper ready: {} proxies, commercial fallback {}",
			proxies.len(),
			if commercial.is_some() { "on" } else { "off" }
		);

		let ctx = LadderContext {
			cache: Arc::new(TrendsCache::new(config.cache.clone())),
			proxies: Arc::new(proxies),
			sessions,
			google,
			commercial,
			events: Arc::new(events),
			retry: config.retry.clone(),
			pacing: limiter.config().clone(),
			warmup,
			worker_pool: config.worker_pool.clamp(1, ladder::MAX_WORKERS),
			soft_budget: config.soft_budget,
		};

		Ok(Self {
			config,
			ctx,
			limiter,
			metrics,
		})
	}

	/// Fetch trends for `request`. Never fails: exhausted upstreams yield
	/// synthetic data, invalid input an error-status result.
	pub async fn get_trends(&self, request: TrendsRequest) -> TrendsResult {
		ladder::fetch(&self.ctx, request).await
	}

	/// Shorthand for building a [`TrendsRequest`] inline.
	pub async fn get(
		&self,
		keywords: impl Into<Keywords>,
		timeframe: &str,
		geo: &str,
		options: QueryOptions,
	) -> TrendsResult {
		let request = TrendsRequest::new(keywords)
			.with_timeframe(timeframe)
			.with_geo(geo)
			.with_options(options);
		self.get_trends(request).await
	}

	pub fn config(&self) -> &TrendsScraperConfig {
		&self.config
	}

	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	pub fn proxy_health(&self) -> ProxyHealthReport {
		self.ctx.proxies.health_report()
	}

	pub fn cache(&self) -> &TrendsCache {
		&self.ctx.cache
	}

	pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
		&self.limiter
	}

	pub fn has_commercial_fallback(&self) -> bool {
		self.ctx.commercial.is_some()
	}
}

fn parse_url(name: &'static str, value: &str) -> TrendsScraperResult<Url> {
	Url::parse(value).map_err(|source| TrendsScraperError::InvalidUrl {
		name,
		value: value.to_string(),
		source,
	})
}

static GLOBAL_SCRAPER: OnceCell<TrendsScraper> = OnceCell::new();

/// Fetch trends through a process-wide scraper configured from the
/// environment on first use.
pub async fn get_trends(request: TrendsRequest) -> TrendsResult {
	match GLOBAL_SCRAPER.get_or_try_init(TrendsScraper::from_env) {
		Ok(scraper) => scraper.get_trends(request).await,
		Err(err) => {
			log::error!("trends scraper initialisation failed: {err}");
			let (request, _) = request.sanitize();
			TrendsResult::error(Metadata::for_request(&request), vec![err.to_string()])
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::Path;

	#[test]
	fn invalid_base_url_is_reported() {
		let err = TrendsScraper::builder()
			.with_google_base_url("not a url")
			.build()
			.unwrap_err();
		assert!(matches!(err, TrendsScraperError::InvalidUrl { name: "google base", .. }));
	}

	#[test]
	fn commercial_client_needs_a_key() {
		let scraper = TrendsScraper::builder().in_memory_cache().build().unwrap();
		assert!(!scraper.has_commercial_fallback());

		let scraper = TrendsScraper::builder()
			.in_memory_cache()
			.with_commercial_api_key("secret")
			.build()
			.unwrap();
		assert!(scraper.has_commercial_fallback());
	}

	#[test]
	fn private_pacing_does_not_touch_global_limiter() {
		let scraper = TrendsScraper::builder()
			.in_memory_cache()
			.with_pacing(PacingConfig::fast())
			.build()
			.unwrap();
		assert!(!Arc::ptr_eq(scraper.rate_limiter(), &RateLimiter::global()));
		assert_eq!(
			scraper.rate_limiter().config().min_interval,
			PacingConfig::fast().min_interval
		);

		let shared = TrendsScraper::builder().in_memory_cache().build().unwrap();
		assert!(Arc::ptr_eq(shared.rate_limiter(), &RateLimiter::global()));
	}

	#[test]
	fn env_settings_are_applied() {
		let env = TrendsEnv {
			commercial_api_key: Some("k".into()),
			proxies: vec!["http://10.0.0.1:8080".into(), "http://10.0.0.2:8080".into()],
			cache_dir: PathBuf::from("/tmp/trends-env"),
			cache_ttl: Some(Duration::from_secs(60)),
		};
		let scraper = TrendsScraper::builder().with_env(env).build().unwrap();
		assert!(scraper.has_commercial_fallback());
		assert_eq!(scraper.proxy_health().total_proxies, 2);
		assert_eq!(
			scraper.cache().config().directory.as_deref(),
			Some(Path::new("/tmp/trends-env"))
		);
		assert_eq!(scraper.cache().config().ttl, Duration::from_secs(60));
	}

	#[test]
	fn worker_pool_is_capped() {
		let scraper = TrendsScraper::builder()
			.in_memory_cache()
			.with_worker_pool(16)
			.build()
			.unwrap();
		assert_eq!(scraper.config().worker_pool, ladder::MAX_WORKERS);
	}
}
