//! Fetch strategy ladder.
//!
//! A request walks an explicit state machine:
//!
//! ```text
//! CacheCheck -> Primary -> (TimeRetry) -> Direct -> Commercial -> Synthetic
//!      |           |           |            |           |
//!      +-> Done    +-----------+------------+-----------+--> Store -> Done
//! ```
//!
//! Each step owns its session and fills only the fields earlier steps left
//! empty. Errors are recorded on the result as `"<step>/<sub-query>: <error>"`
//! and never escape [`fetch`]. Synthetic results carry a warning and are not
//! cached.

pub mod subquery;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::modules::cache::TrendsCache;
use crate::modules::events::{
    BudgetEvent, CacheEvent, CompletedEvent, EventDispatcher, StepOutcome, TrendsEvent,
};
use crate::modules::pacing::{PacingConfig, WarmupTargets, warmup};
use crate::modules::proxy::ProxyPool;
use crate::modules::session::{Session, SessionFactory};
use crate::normalize::{
    GeoPayload, TimeseriesPayload, normalize_geo, normalize_related, normalize_timeseries,
    shorter_timeframe, synth_cities, synth_geo, synth_timeseries,
};
use crate::types::{
    ConnectionKind, FALLBACK_WARNING, Metadata, Source, SubQuery, TrendsData, TrendsRequest,
    TrendsResult,
};
use crate::upstream::{CommercialClient, DataType, FetchError, GoogleTrendsClient};

pub use subquery::{ConnectionMode, StepPlan, StepReport, SubqueryRunner};

/// Hard ceiling on concurrent sub-queries per fetch.
pub const MAX_WORKERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LadderStep {
    CacheCheck,
    Primary,
    TimeRetry,
    Direct,
    Commercial,
    Synthetic,
    Store,
    Done,
}

impl LadderStep {
    pub fn name(self) -> &'static str {
        match self {
            LadderStep::CacheCheck => "cache_check",
            LadderStep::Primary => "primary",
            LadderStep::TimeRetry => "time_retry",
            LadderStep::Direct => "direct",
            LadderStep::Commercial => "commercial",
            LadderStep::Synthetic => "synthetic",
            LadderStep::Store => "store",
            LadderStep::Done => "done",
        }
    }
}

impl std::fmt::Display for LadderStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per sub-query in the primary step.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Dropped connections tolerated per sub-query before it gives up.
    pub connection_error_budget: u32,
    /// Send a sub-query that exhausted its budget straight to synthetic
    /// data instead of retrying it in later steps.
    pub budget_short_circuit: bool,
    pub direct_attempts: u32,
    pub time_retry_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            connection_error_budget: 3,
            budget_short_circuit: true,
            direct_attempts: 2,
            time_retry_attempts: 2,
        }
    }
}

impl RetryConfig {
    /// Millisecond backoff, for tests and local mocks.
    pub fn fast() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Self::default()
        }
    }
}

/// Services shared by every fetch of one scraper.
#[derive(Debug)]
pub struct LadderContext {
    pub cache: Arc<TrendsCache>,
    pub proxies: Arc<ProxyPool>,
    pub sessions: SessionFactory,
    pub google: GoogleTrendsClient,
    pub commercial: Option<CommercialClient>,
    pub events: Arc<EventDispatcher>,
    pub retry: RetryConfig,
    pub pacing: PacingConfig,
    pub warmup: Option<WarmupTargets>,
    pub worker_pool: usize,
    pub soft_budget: Duration,
}

/// Run the ladder for one request.
pub async fn fetch(ctx: &LadderContext, request: TrendsRequest) -> TrendsResult {
    let started = Instant::now();
    let (request, warnings) = request.sanitize();
    for warning in warnings {
        ctx.events.dispatch(TrendsEvent::warning(warning));
    }

    let mut run = LadderRun::new(ctx, &request, started);
    let result = if request.keywords.is_empty() {
        ctx.events
            .dispatch(TrendsEvent::error("request", "no keywords supplied"));
        TrendsResult::error(Metadata::for_request(&request), vec!["no keywords supplied".into()])
    } else {
        run.drive().await
    };

    ctx.events.dispatch(TrendsEvent::Completed(CompletedEvent {
        source: result.metadata.source,
        cached: run.cached,
        synthetic: result.is_synthetic(),
        success: result.is_success(),
        elapsed: started.elapsed(),
        timestamp: Utc::now(),
    }));
    result
}

struct LadderRun<'a> {
    ctx: &'a LadderContext,
    request: &'a TrendsRequest,
    wanted: Vec<SubQuery>,
    data: TrendsData,
    errors: Vec<String>,
    source: Option<Source>,
    connection: Option<ConnectionKind>,
    cached: bool,
    synthesized: bool,
    /// Sub-queries that only synthetic data may fill.
    exhausted: Vec<SubQuery>,
    started: Instant,
    budget_reported: bool,
}

impl<'a> LadderRun<'a> {
    fn new(ctx: &'a LadderContext, request: &'a TrendsRequest, started: Instant) -> Self {
        Self {
            ctx,
            request,
            wanted: request.options.subqueries(),
            data: TrendsData::default(),
            errors: Vec::new(),
            source: None,
            connection: None,
            cached: false,
            synthesized: false,
            exhausted: Vec::new(),
            started,
            budget_reported: false,
        }
    }

    async fn drive(&mut self) -> TrendsResult {
        let mut step = LadderStep::CacheCheck;
        let mut cached = None;
        let mut stored = None;
        let mut synthetic_failed = false;

        while step != LadderStep::Done {
            self.check_budget(step);
            step = match step {
                LadderStep::CacheCheck => {
                    let key = self.ctx.cache.key(self.request);
                    let hit = self.ctx.cache.lookup(self.request).await;
                    self.ctx.events.dispatch(TrendsEvent::Cache(CacheEvent {
                        key: key.to_string(),
                        hit: hit.is_some(),
                        timestamp: Utc::now(),
                    }));
                    match hit {
                        Some(result) => {
                            self.cached = true;
                            cached = Some(result);
                            LadderStep::Done
                        }
                        None => LadderStep::Primary,
                    }
                }
                LadderStep::Primary => self.primary().await,
                LadderStep::TimeRetry => self.time_retry().await,
                LadderStep::Direct => self.direct().await,
                LadderStep::Commercial => self.commercial().await,
                LadderStep::Synthetic => {
                    synthetic_failed = !self.synthetic();
                    LadderStep::Done
                }
                LadderStep::Store => {
                    let result = self.result();
                    self.ctx.cache.store(self.request, &result).await;
                    stored = Some(result);
                    LadderStep::Done
                }
                LadderStep::Done => LadderStep::Done,
            };
        }

        if let Some(result) = cached.or(stored) {
            return result;
        }
        if synthetic_failed {
            return TrendsResult::error(self.metadata(), std::mem::take(&mut self.errors));
        }
        self.result()
    }

    async fn primary(&mut self) -> LadderStep {
        self.enter(LadderStep::Primary);
        let proxy = self.ctx.proxies.pick_validated().await;
        if proxy.is_none() && !self.ctx.proxies.is_empty() {
            self.errors
                .push(format!("{}: no proxy passed validation", LadderStep::Primary));
        }
        let session = self.ctx.sessions.new_session(true, proxy);
        self.warm(&session).await;

        let plan = StepPlan {
            step: LadderStep::Primary,
            subqueries: self.wanted.clone(),
            timeframe: self.request.timeframe.clone(),
            attempts: self.ctx.retry.max_attempts,
            mode: ConnectionMode::Proxied,
        };
        self.run_plan(&plan, session).await;

        if self.satisfied() {
            return self.leave(LadderStep::Primary, true, LadderStep::Store);
        }
        let partial = self.wanted.iter().any(|query| self.data.has(*query));
        let time_pending = self.wants(SubQuery::Time) && !self.exhausted.contains(&SubQuery::Time);
        let next = if time_pending && partial {
            LadderStep::TimeRetry
        } else {
            LadderStep::Direct
        };
        self.leave(LadderStep::Primary, false, next)
    }

    async fn time_retry(&mut self) -> LadderStep {
        self.enter(LadderStep::TimeRetry);
        let Some(proxy) = self.ctx.proxies.pick_validated().await else {
            self.ctx
                .events
                .dispatch(TrendsEvent::step(LadderStep::TimeRetry, StepOutcome::Skipped));
            return LadderStep::Direct;
        };
        let timeframe = shorter_timeframe(&self.request.timeframe, &mut rand::thread_rng())
            .unwrap_or_else(|| self.request.timeframe.clone());

        let plan = StepPlan {
            step: LadderStep::TimeRetry,
            subqueries: vec![SubQuery::Time],
            timeframe,
            attempts: self.ctx.retry.time_retry_attempts,
            mode: ConnectionMode::Proxied,
        };
        let session = self.ctx.sessions.new_session(true, Some(proxy));
        self.run_plan(&plan, session).await;

        if self.satisfied() {
            self.leave(LadderStep::TimeRetry, true, LadderStep::Store)
        } else {
            self.leave(LadderStep::TimeRetry, false, LadderStep::Direct)
        }
    }

    async fn direct(&mut self) -> LadderStep {
        self.enter(LadderStep::Direct);
        let subqueries: Vec<SubQuery> = self
            .pending()
            .into_iter()
            .filter(|query| matches!(query, SubQuery::Time | SubQuery::Region))
            .collect();
        if subqueries.is_empty() {
            self.ctx
                .events
                .dispatch(TrendsEvent::step(LadderStep::Direct, StepOutcome::Skipped));
            return LadderStep::Commercial;
        }

        let session = self.ctx.sessions.new_direct_session(true);
        self.warm(&session).await;
        let plan = StepPlan {
            step: LadderStep::Direct,
            subqueries,
            timeframe: self.request.timeframe.clone(),
            attempts: self.ctx.retry.direct_attempts,
            mode: ConnectionMode::Direct,
        };
        self.run_plan(&plan, session).await;

        if self.satisfied() {
            self.leave(LadderStep::Direct, true, LadderStep::Store)
        } else {
            self.leave(LadderStep::Direct, false, LadderStep::Commercial)
        }
    }

    /// Single-keyword commercial fallback for whatever is still missing.
    async fn commercial(&mut self) -> LadderStep {
        let ctx = self.ctx;
        let request = self.request;
        let pending = self.pending();
        let Some(client) = ctx.commercial.as_ref().filter(|_| !pending.is_empty()) else {
            ctx.events
                .dispatch(TrendsEvent::step(LadderStep::Commercial, StepOutcome::Skipped));
            return LadderStep::Synthetic;
        };
        self.enter(LadderStep::Commercial);

        let mut fetched = TrendsData::default();
        for query in pending {
            match commercial_subquery(client, request, query).await {
                Ok(data) => {
                    fetched.fill_missing(data);
                }
                Err(err) => self.record(LadderStep::Commercial, query, &err),
            }
        }

        if !fetched.is_empty() {
            self.data.fill_missing(fetched);
            self.source = Some(Source::Commercial);
            self.connection = Some(ConnectionKind::Api);
        }

        if self.satisfied() {
            self.leave(LadderStep::Commercial, true, LadderStep::Store)
        } else {
            self.leave(LadderStep::Commercial, false, LadderStep::Synthetic)
        }
    }

    /// Fill missing time, region and city fields with generated data.
    /// Returns false when generation itself failed.
    fn synthetic(&mut self) -> bool {
        let request = self.request;
        self.enter(LadderStep::Synthetic);
        let mut generated = TrendsData::default();

        for query in self.missing() {
            match query {
                SubQuery::Time => match synth_timeseries(&request.keywords, &request.timeframe) {
                    Ok(series) => generated.time_trends = series.data,
                    Err(err) => {
                        self.errors
                            .push(format!("{}/{}: {err}", LadderStep::Synthetic, query));
                        self.leave(LadderStep::Synthetic, false, LadderStep::Done);
                        return false;
                    }
                },
                SubQuery::Region => {
                    generated.region_data = synth_geo(&request.keywords, &request.geo).data
                }
                SubQuery::City => {
                    generated.city_data = synth_cities(&request.keywords, &request.geo).data
                }
                SubQuery::Related => {}
            }
        }

        if !generated.is_empty() {
            // a commercial tag implies single-value time points, so it only
            // survives when the commercial step supplied the time series
            let generated_time = !generated.time_trends.is_empty();
            self.data.fill_missing(generated);
            if generated_time || self.source != Some(Source::Commercial) {
                self.source = Some(Source::Synthetic);
            }
            self.synthesized = true;
        }
        self.ctx.events.dispatch(TrendsEvent::warning(format!(
            "{FALLBACK_WARNING} for {:?}",
            request.keywords
        )));
        self.leave(LadderStep::Synthetic, true, LadderStep::Done);
        true
    }

    async fn run_plan(&mut self, plan: &StepPlan, session: Session) {
        let report = SubqueryRunner::new(self.ctx, self.request)
            .run_step(plan, session)
            .await;
        self.errors.extend(report.errors);
        if self.ctx.retry.budget_short_circuit {
            for query in report.exhausted {
                if !self.exhausted.contains(&query) {
                    self.exhausted.push(query);
                }
            }
        }
        if !report.data.is_empty() {
            self.data.fill_missing(report.data);
            self.source = self.source.or(Some(Source::Google));
            self.connection = report.connection.or(self.connection);
        }
    }

    async fn warm(&self, session: &Session) {
        let Some(targets) = &self.ctx.warmup else {
            return;
        };
        warmup(
            session,
            targets,
            self.request.keywords.first().map(String::as_str),
            &self.request.geo,
            &self.ctx.pacing,
        )
        .await;
    }

    fn wants(&self, query: SubQuery) -> bool {
        self.wanted.contains(&query)
    }

    fn missing(&self) -> Vec<SubQuery> {
        self.wanted
            .iter()
            .copied()
            .filter(|query| !self.data.has(*query))
            .collect()
    }

    /// Missing fields later upstream steps may still try.
    fn pending(&self) -> Vec<SubQuery> {
        self.missing()
            .into_iter()
            .filter(|query| !self.exhausted.contains(query))
            .collect()
    }

    /// Time data when time was requested, otherwise any requested field.
    fn satisfied(&self) -> bool {
        if self.wants(SubQuery::Time) {
            self.data.has(SubQuery::Time)
        } else {
            self.wanted.iter().any(|query| self.data.has(*query))
        }
    }

    fn record(&mut self, step: LadderStep, query: SubQuery, err: &FetchError) {
        self.errors.push(format!("{step}/{query}: {err}"));
    }

    fn enter(&self, step: LadderStep) {
        self.ctx
            .events
            .dispatch(TrendsEvent::step(step, StepOutcome::Entered));
    }

    fn leave(&self, step: LadderStep, success: bool, next: LadderStep) -> LadderStep {
        let outcome = if success {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed
        };
        self.ctx.events.dispatch(TrendsEvent::step(step, outcome));
        next
    }

    fn check_budget(&mut self, step: LadderStep) {
        let elapsed = self.started.elapsed();
        if !self.budget_reported && elapsed > self.ctx.soft_budget {
            self.budget_reported = true;
            self.ctx.events.dispatch(TrendsEvent::BudgetExceeded(BudgetEvent {
                elapsed,
                budget: self.ctx.soft_budget,
                step,
            }));
        }
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::for_request(self.request);
        metadata.source = self.source;
        metadata.connection = self.connection;
        if self.synthesized || self.data.is_empty() {
            metadata.warning = Some(FALLBACK_WARNING.to_string());
        }
        metadata
    }

    fn result(&self) -> TrendsResult {
        TrendsResult::success(self.metadata(), self.data.clone(), self.errors.clone())
    }
}

/// One commercial call for `query`, keyed on the first keyword only.
async fn commercial_subquery(
    client: &CommercialClient,
    request: &TrendsRequest,
    query: SubQuery,
) -> Result<TrendsData, FetchError> {
    let keyword = &request.keywords[0];
    let single = std::slice::from_ref(keyword);
    let (timeframe, geo) = (request.timeframe.as_str(), request.geo.as_str());
    let mut data = TrendsData::default();

    match query {
        SubQuery::Time => {
            let payload: TimeseriesPayload = client.time_series(keyword, timeframe, geo).await?;
            data.time_trends = normalize_timeseries(&payload, single);
        }
        SubQuery::Region | SubQuery::City => {
            let payload: GeoPayload = client
                .geo(keyword, DataType::for_subquery(query), timeframe, geo)
                .await?;
            let regions = normalize_geo(&payload, single);
            if query == SubQuery::Region {
                data.region_data = regions;
            } else {
                data.city_data = regions;
            }
        }
        SubQuery::Related => {
            let payload = client.related(keyword, timeframe, geo).await?;
            data.related_queries = normalize_related(&payload, single);
        }
    }

    if data.has(query) {
        Ok(data)
    } else {
        Err(FetchError::NoData(query.name()))
    }
}
