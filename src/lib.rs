//! # trends-scraper
//!
//! Resilient Google Trends ingestion. A request walks a fixed ladder of
//! strategies and always comes back as a [`TrendsResult`]:
//!
//! 1. the response cache (memory, then JSON files),
//! 2. the public Trends API through a validated proxy,
//! 3. a shorter-timeframe retry for the time series,
//! 4. a direct connection,
//! 5. a token-authenticated commercial API (when a key is configured),
//! 6. synthetic data, labelled with a warning and never cached.
//!
//! ## Features
//!
//! - Per-session browser fingerprints (headers plus seeded cookies)
//! - Proxy pool with pre-use validation and failure tracking
//! - Process-wide request pacing with jitter and exponential backoff
//! - Bounded sub-query fan-out (time, region, city, related queries)
//! - Structured events for logging and metrics
//!
//! ## Example
//!
//! ```no_run
//! use trends_scraper::{QueryOptions, TrendsRequest, TrendsScraper};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scraper = TrendsScraper::from_env()?;
//!     let request = TrendsRequest::new(["bitcoin", "ethereum"])
//!         .with_timeframe("today 12-m")
//!         .with_geo("IN")
//!         .with_options(QueryOptions::time_only().with_region());
//!     let result = scraper.get_trends(request).await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

mod scraper;

pub mod config;
pub mod ladder;
pub mod modules;
pub mod normalize;
pub mod types;
pub mod upstream;

pub use crate::scraper::{
    DEFAULT_HOME_URL,
    DEFAULT_REGION,
    TrendsScraper,
    TrendsScraperBuilder,
    TrendsScraperConfig,
    TrendsScraperError,
    TrendsScraperResult,
    get_trends,
};

pub use crate::config::{ConfigError, TrendsEnv};

pub use crate::ladder::{LadderStep, RetryConfig};

pub use crate::modules::{
    AdapterRetry,
    CacheConfig,
    CompletedEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    PacingConfig,
    Proxy,
    ProxyConfig,
    ProxyError,
    ProxyHealthReport,
    ProxyValidator,
    RateLimiter,
    SessionConfig,
    StepOutcome,
    TrendsCache,
    TrendsEvent,
};

pub use crate::types::{
    ConnectionKind,
    FALLBACK_WARNING,
    GeoValue,
    Keywords,
    MAX_KEYWORDS,
    Metadata,
    QueryOptions,
    RelatedQueries,
    RelatedQuery,
    Source,
    Status,
    SubQuery,
    TrendPoint,
    TrendsData,
    TrendsRequest,
    TrendsResult,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
