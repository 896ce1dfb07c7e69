//! Cross-cutting services module
//!
//! Sessions, spoofing, proxy rotation, pacing, caching, events and metrics
//! shared by every step of the fetch ladder.

pub mod cache;
pub mod events;
pub mod metrics;
pub mod pacing;
pub mod proxy;
pub mod session;
pub mod spoofing;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheKey, TrendsCache};
pub use events::{
    AttemptEvent,
    BudgetEvent,
    CacheEvent,
    CompletedEvent,
    ErrorEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    MetricsHandler,
    RetryEvent,
    StepEvent,
    StepOutcome,
    TrendsEvent,
    WarningEvent,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use pacing::{PacingConfig, RateLimiter, WarmupReport, WarmupTargets};
pub use proxy::{
    HttpProxyValidator,
    Proxy,
    ProxyConfig,
    ProxyError,
    ProxyHealthReport,
    ProxyPool,
    ProxyStats,
    ProxyValidator,
};
pub use session::{AdapterRetry, Session, SessionConfig, SessionFactory};
pub use spoofing::{BrowserFamily, CookieBundle, Fingerprint, HeaderBundle};
