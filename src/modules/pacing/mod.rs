//! Request pacing: global rate limiting, jittered sleeps, backoff and
//! warmup browsing.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::modules::session::Session;

#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Minimum spacing between the starts of two outbound requests.
    pub min_interval: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub warmup_delay_min: Duration,
    pub warmup_delay_max: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(6),
            jitter_min: Duration::from_millis(500),
            jitter_max: Duration::from_secs(2),
            warmup_delay_min: Duration::from_millis(1500),
            warmup_delay_max: Duration::from_secs(5),
        }
    }
}

impl PacingConfig {
    /// Near-zero delays, for tests and local mocks.
    pub fn fast() -> Self {
        Self {
            min_interval: Duration::from_millis(20),
            jitter_min: Duration::ZERO,
            jitter_max: Duration::from_millis(5),
            warmup_delay_min: Duration::ZERO,
            warmup_delay_max: Duration::from_millis(5),
        }
    }
}

static GLOBAL_LIMITER: Lazy<Arc<RateLimiter>> =
    Lazy::new(|| Arc::new(RateLimiter::new(PacingConfig::default())));

/// Serialises the start of outbound requests.
#[derive(Debug)]
pub struct RateLimiter {
    config: PacingConfig,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            last_request: Mutex::new(None),
        }
    }

    /// Process-wide limiter shared by every scraper that does not bring its own.
    pub fn global() -> Arc<RateLimiter> {
        GLOBAL_LIMITER.clone()
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Wait until `min_interval` plus jitter has passed since the previous
    /// acquire. The lock is held while sleeping so callers queue in order.
    pub async fn acquire(&self) -> Instant {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.config.min_interval {
                let wait = self.config.min_interval - elapsed
                    + random_between(self.config.jitter_min, self.config.jitter_max);
                log::trace!("rate limiter sleeping {:.2}s", wait.as_secs_f64());
                tokio::time::sleep(wait).await;
            }
        }
        let now = Instant::now();
        *last = Some(now);
        now
    }
}

/// Sleep a uniform random duration in `[min, max]`.
pub async fn sleep_jitter(min: Duration, max: Duration) {
    tokio::time::sleep(random_between(min, max)).await;
}

/// `min(base * 2^attempt, cap)` plus uniform jitter of up to half that.
pub fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    backoff_with(&mut rand::thread_rng(), attempt, base, cap)
}

pub fn backoff_with<R: Rng + ?Sized>(
    rng: &mut R,
    attempt: u32,
    base: Duration,
    cap: Duration,
) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    let bounded = base.saturating_mul(factor).min(cap);
    let jitter = rng.gen_range(0.0..=0.5) * bounded.as_secs_f64();
    bounded + Duration::from_secs_f64(jitter)
}

fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let secs = rand::thread_rng().gen_range(min.as_secs_f64()..=max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

/// Origins the warmup navigation walks through.
#[derive(Debug, Clone)]
pub struct WarmupTargets {
    pub home: Url,
    pub trends: Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hop {
    Home,
    Search,
    TrendsHome,
    Explore,
    ExploreGeo,
}

const NAVIGATION_PATTERNS: [[Hop; 4]; 3] = [
    [Hop::Home, Hop::Search, Hop::TrendsHome, Hop::Explore],
    [Hop::TrendsHome, Hop::Explore, Hop::ExploreGeo, Hop::Explore],
    [Hop::Home, Hop::TrendsHome, Hop::ExploreGeo, Hop::Explore],
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub attempted: usize,
    pub succeeded: usize,
}

fn hop_url(hop: Hop, targets: &WarmupTargets, keyword: &str, geo: &str) -> Option<Url> {
    let mut url = match hop {
        Hop::Home => return Some(targets.home.clone()),
        Hop::Search => targets.home.join("search").ok()?,
        Hop::TrendsHome => targets.trends.join("trends/").ok()?,
        Hop::Explore | Hop::ExploreGeo => targets.trends.join("trends/explore").ok()?,
    };
    {
        let mut query = url.query_pairs_mut();
        match hop {
            Hop::Search => {
                query.append_pair("q", &format!("{keyword} trends"));
            }
            Hop::Explore => {
                query.append_pair("q", keyword);
            }
            Hop::ExploreGeo => {
                query.append_pair("q", keyword).append_pair("geo", geo);
            }
            _ => {}
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Some(url)
}

/// Plan 2-4 hops of one navigation pattern.
fn plan_warmup<R: Rng + ?Sized>(
    rng: &mut R,
    targets: &WarmupTargets,
    keyword: &str,
    geo: &str,
) -> Vec<Url> {
    let pattern = NAVIGATION_PATTERNS
        .choose(rng)
        .unwrap_or(&NAVIGATION_PATTERNS[0]);
    let steps = rng.gen_range(2..=pattern.len());
    pattern[..steps]
        .iter()
        .filter_map(|hop| hop_url(*hop, targets, keyword, geo))
        .collect()
}

/// Browse a short navigation pattern so the session collects cookies.
/// Individual failures are logged and skipped. Hops are paced by the
/// session's rate limiter like any other request.
pub async fn warmup(
    session: &Session,
    targets: &WarmupTargets,
    keyword: Option<&str>,
    geo: &str,
    config: &PacingConfig,
) -> WarmupReport {
    let keyword = keyword.unwrap_or("google trends");
    let plan = plan_warmup(&mut rand::thread_rng(), targets, keyword, geo);
    let mut report = WarmupReport::default();

    for (idx, url) in plan.into_iter().enumerate() {
        if idx > 0 {
            sleep_jitter(config.warmup_delay_min, config.warmup_delay_max).await;
        }
        report.attempted += 1;
        match session.get(url.clone()).await {
            Ok(response) if response.is_success() => report.succeeded += 1,
            Ok(response) => log::debug!("warmup {url} returned {}", response.status),
            Err(err) => log::debug!("warmup {url} failed: {err}"),
        }
    }

    log::debug!(
        "warmup finished: {}/{} steps succeeded",
        report.succeeded,
        report.attempted
    );
    report
}
