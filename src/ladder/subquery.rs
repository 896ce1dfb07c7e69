//! One sub-query (time, region, city or related) within a ladder step,
//! with its own retry loop.

use chrono::Utc;
use futures::stream::{self, StreamExt};

use super::{LadderContext, LadderStep};
use crate::modules::events::{AttemptEvent, RetryEvent, TrendsEvent};
use crate::modules::pacing::backoff;
use crate::modules::session::Session;
use crate::normalize::{
    GeoPayload, TimeseriesPayload, normalize_geo, normalize_related, normalize_timeseries,
    shorter_timeframe,
};
use crate::types::{ConnectionKind, SubQuery, TrendsData, TrendsRequest};
use crate::upstream::{ErrorKind, FetchError, Resolution, TrendsQuery};

/// How new sessions are obtained when an attempt has to rotate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Validated proxy when one is available, direct otherwise.
    Proxied,
    Direct,
}

#[derive(Debug, Clone)]
pub struct StepPlan {
    pub step: LadderStep,
    pub subqueries: Vec<SubQuery>,
    pub timeframe: String,
    pub attempts: u32,
    pub mode: ConnectionMode,
}

#[derive(Debug, Default)]
pub struct SubqueryOutcome {
    pub data: Option<TrendsData>,
    pub connection: Option<ConnectionKind>,
    pub errors: Vec<String>,
    /// Gave up because the connection-error budget ran out.
    pub exhausted: bool,
}

#[derive(Debug, Default)]
pub struct StepReport {
    pub data: TrendsData,
    pub connection: Option<ConnectionKind>,
    pub errors: Vec<String>,
    pub exhausted: Vec<SubQuery>,
}

pub struct SubqueryRunner<'a> {
    ctx: &'a LadderContext,
    request: &'a TrendsRequest,
}

impl<'a> SubqueryRunner<'a> {
    pub fn new(ctx: &'a LadderContext, request: &'a TrendsRequest) -> Self {
        Self { ctx, request }
    }

    /// Fan the plan's sub-queries out over the worker pool. Every sub-query
    /// starts from `session`; failures leave their field empty.
    pub async fn run_step(&self, plan: &StepPlan, session: Session) -> StepReport {
        let workers = self.ctx.worker_pool.clamp(1, super::MAX_WORKERS);
        let outcomes: Vec<(SubQuery, SubqueryOutcome)> =
            stream::iter(plan.subqueries.iter().copied())
                .map(|query| {
                    let session = session.clone();
                    async move { (query, self.run(plan, query, session).await) }
                })
                .buffer_unordered(workers)
                .collect()
                .await;

        let mut step = StepReport::default();
        for (query, outcome) in outcomes {
            step.errors.extend(outcome.errors);
            if outcome.exhausted {
                step.exhausted.push(query);
            }
            if let Some(data) = outcome.data {
                step.data.fill_missing(data);
                step.connection = step.connection.or(outcome.connection);
            }
        }
        step
    }

    async fn run(&self, plan: &StepPlan, query: SubQuery, initial: Session) -> SubqueryOutcome {
        let retry = &self.ctx.retry;
        let attempts = plan.attempts.max(1);
        let mut session = initial;
        let mut timeframe = plan.timeframe.clone();
        let mut connection_errors = 0u32;
        let mut outcome = SubqueryOutcome::default();

        for attempt in 1..=attempts {
            self.ctx.events.dispatch(TrendsEvent::Attempt(AttemptEvent {
                step: plan.step,
                subquery: query,
                attempt,
                connection: session.connection(),
                timeframe: timeframe.clone(),
                timestamp: Utc::now(),
            }));

            let err = match self.fetch_once(&session, query, &timeframe).await {
                Ok(data) => {
                    if let Some(proxy) = session.proxy() {
                        self.ctx.proxies.report_success(proxy);
                    }
                    outcome.connection = Some(session.connection());
                    outcome.data = Some(data);
                    return outcome;
                }
                Err(err) => err,
            };

            outcome
                .errors
                .push(format!("{}/{}: {err}", plan.step, query));
            if err.implicates_proxy()
                && let Some(proxy) = session.proxy()
            {
                self.ctx.proxies.mark_failed(proxy);
            }
            if attempt == attempts {
                break;
            }

            let mut delay = backoff(attempt - 1, retry.base_delay, retry.max_delay);
            match err.kind() {
                ErrorKind::RateLimited => {
                    session = self.rotate(plan.mode, false).await;
                    delay = backoff(attempt, retry.base_delay, retry.max_delay);
                }
                ErrorKind::Transient | ErrorKind::Proxy => {
                    if err.is_connection() {
                        connection_errors += 1;
                        if connection_errors > retry.connection_error_budget {
                            outcome.errors.push(format!(
                                "{}/{}: {}",
                                plan.step,
                                query,
                                FetchError::BudgetExhausted(connection_errors)
                            ));
                            outcome.exhausted = true;
                            break;
                        }
                    }
                    if plan.mode == ConnectionMode::Proxied {
                        session = self.rotate(plan.mode, false).await;
                    }
                }
                ErrorKind::Parse => {
                    // odd retries go direct, even ones through a proxy
                    let go_direct = attempt % 2 == 1;
                    session = self.rotate(plan.mode, go_direct).await;
                }
                ErrorKind::NoData => {
                    let shorter = shorter_timeframe(&timeframe, &mut rand::thread_rng());
                    let Some(shorter) = shorter else {
                        break;
                    };
                    log::info!("{}/{query}: no data for {timeframe}; trying {shorter}", plan.step);
                    timeframe = shorter;
                }
                ErrorKind::Commercial => break,
            }

            self.ctx.events.dispatch(TrendsEvent::Retry(RetryEvent {
                step: plan.step,
                subquery: query,
                attempt,
                reason: err.to_string(),
                scheduled_after: delay,
                timestamp: Utc::now(),
            }));
            tokio::time::sleep(delay).await;
        }

        outcome
    }

    /// Fresh session for the next attempt.
    async fn rotate(&self, mode: ConnectionMode, force_direct: bool) -> Session {
        if mode == ConnectionMode::Direct || force_direct {
            return self.ctx.sessions.new_direct_session(true);
        }
        let proxy = self.ctx.proxies.pick_validated().await;
        self.ctx.sessions.new_session(true, proxy)
    }

    async fn fetch_once(
        &self,
        session: &Session,
        query: SubQuery,
        timeframe: &str,
    ) -> Result<TrendsData, FetchError> {
        let keywords = &self.request.keywords;
        let trends_query = TrendsQuery {
            keywords,
            timeframe,
            geo: &self.request.geo,
        };
        let google = &self.ctx.google;
        let mut data = TrendsData::default();

        match query {
            SubQuery::Time => {
                let frame = google.interest_over_time(session, trends_query).await?;
                data.time_trends = normalize_timeseries(&TimeseriesPayload::Frame(frame), keywords);
            }
            SubQuery::Region => {
                let (resolution, frame) = google
                    .interest_by_region_probing(session, trends_query)
                    .await?;
                log::debug!("region data for {} at {resolution}", self.request.geo);
                data.region_data = normalize_geo(&GeoPayload::Frame(frame), keywords);
            }
            SubQuery::City => {
                let frame = google
                    .interest_by_region(session, trends_query, Resolution::City)
                    .await?;
                data.city_data = normalize_geo(&GeoPayload::Frame(frame), keywords);
            }
            SubQuery::Related => {
                let payload = google.related_queries(session, trends_query).await?;
                data.related_queries = normalize_related(&payload, keywords);
            }
        }

        if data.has(query) {
            Ok(data)
        } else {
            Err(FetchError::NoData(query.name()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::tests::{EXPLORE, MULTILINE, context_at, dead_port, guarded, observed};
    use crate::modules::proxy::Proxy;
    use crate::normalize::TIMEFRAME_LADDER;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn time_plan(step: LadderStep, mode: ConnectionMode, timeframe: &str, attempts: u32) -> StepPlan {
        StepPlan {
            step,
            subqueries: vec![SubQuery::Time],
            timeframe: timeframe.to_string(),
            attempts,
            mode,
        }
    }

    fn explore_body(token: &str) -> String {
        guarded(json!({"widgets": [
            {"id": "TIMESERIES", "token": token, "request": {"time": "x"}}
        ]}))
    }

    async fn mount_timeline(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(MULTILINE))
            .respond_with(ResponseTemplate::new(200).set_body_string(guarded(json!({
                "default": {"timelineData": [{"time": "1704067200", "value": [50]}]}
            }))))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn rate_limit_marks_the_proxy_and_rotates_to_another() {
        let google = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(EXPLORE))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&google)
            .await;
        Mock::given(method("GET"))
            .and(path(EXPLORE))
            .respond_with(ResponseTemplate::new(200).set_body_string(explore_body("t")))
            .mount(&google)
            .await;
        mount_timeline(&google).await;

        // two spellings of the same local proxy, both served by the mock
        let first = google.uri();
        let second = format!("{}/", google.uri());
        let mut ctx = context_at(&google.uri(), None);
        let recorder = observed(&mut ctx, &[first.clone(), second.clone()]);
        let request = TrendsRequest::new("bitcoin");

        let session = ctx.sessions.new_session(true, Some(Proxy::new(first.clone())));
        let plan = time_plan(LadderStep::Primary, ConnectionMode::Proxied, "today 12-m", 2);
        let report = SubqueryRunner::new(&ctx, &request).run_step(&plan, session).await;

        assert!(report.data.has(SubQuery::Time));
        assert_eq!(report.connection, Some(ConnectionKind::Proxy));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("rate limited"));

        let health = ctx.proxies.health_report();
        assert_eq!(health.details[&first].failures, 1);
        assert_eq!(health.details[&second].successes, 1);

        let explores: Vec<_> = google
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|req| req.url.path() == EXPLORE)
            .collect();
        assert_eq!(explores.len(), 2);
        assert_ne!(explores[0].headers.get("cookie"), explores[1].headers.get("cookie"));
        assert_eq!(recorder.attempts().len(), 2);
    }

    #[tokio::test]
    async fn connection_budget_stops_retries() {
        let ctx = context_at(&format!("http://127.0.0.1:{}", dead_port()), None);
        let request = TrendsRequest::new("bitcoin");
        let session = ctx.sessions.new_direct_session(true);
        let plan = time_plan(LadderStep::Direct, ConnectionMode::Direct, "today 12-m", 10);

        let report = SubqueryRunner::new(&ctx, &request).run_step(&plan, session).await;
        let budget = ctx.retry.connection_error_budget as usize;
        assert!(report.data.is_empty());
        assert_eq!(report.exhausted, vec![SubQuery::Time]);
        assert_eq!(report.errors.len(), budget + 2);
        assert!(report.errors[..=budget].iter().all(|err| err.contains("connection error")));
        assert!(report.errors[budget + 1].contains("budget exhausted"));
    }

    #[tokio::test]
    async fn failing_proxy_is_marked_failed() {
        let google = MockServer::start().await;
        let broken = format!("http://127.0.0.1:{}", dead_port());
        let mut ctx = context_at(&google.uri(), None);
        observed(&mut ctx, &[broken.clone()]);
        let request = TrendsRequest::new("bitcoin");

        let session = ctx.sessions.new_session(true, Some(Proxy::new(broken.clone())));
        let plan = time_plan(LadderStep::Primary, ConnectionMode::Proxied, "today 12-m", 1);
        let report = SubqueryRunner::new(&ctx, &request).run_step(&plan, session).await;

        assert!(report.data.is_empty());
        assert!(report.errors[0].contains(&broken));
        assert_eq!(ctx.proxies.failed_count(), 1);
        assert!(google.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn parse_failures_alternate_direct_and_proxied() {
        let google = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(EXPLORE))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><body>Sorry...</body></html>"),
            )
            .mount(&google)
            .await;

        let mut ctx = context_at(&google.uri(), None);
        let recorder = observed(&mut ctx, &[google.uri()]);
        let request = TrendsRequest::new("bitcoin");
        let session = ctx.sessions.new_session(true, Some(Proxy::new(google.uri())));
        let plan = time_plan(LadderStep::Primary, ConnectionMode::Proxied, "today 12-m", 3);

        let report = SubqueryRunner::new(&ctx, &request).run_step(&plan, session).await;
        assert!(report.data.is_empty());
        assert!(report.errors.iter().all(|err| err.contains("parse failure")));

        let connections: Vec<ConnectionKind> = recorder
            .attempts()
            .iter()
            .map(|attempt| attempt.connection)
            .collect();
        assert_eq!(
            connections,
            vec![ConnectionKind::Proxy, ConnectionKind::Direct, ConnectionKind::Proxy]
        );
        assert_eq!(ctx.proxies.failed_count(), 0);
    }

    #[tokio::test]
    async fn empty_timeline_shortens_the_timeframe() {
        let google = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(EXPLORE))
            .and(query_param_contains("req", "\"time\":\"today 5-y\""))
            .respond_with(ResponseTemplate::new(200).set_body_string(explore_body("long")))
            .mount(&google)
            .await;
        Mock::given(method("GET"))
            .and(path(EXPLORE))
            .respond_with(ResponseTemplate::new(200).set_body_string(explore_body("short")))
            .mount(&google)
            .await;
        Mock::given(method("GET"))
            .and(path(MULTILINE))
            .and(query_param("token", "long"))
            .respond_with(ResponseTemplate::new(200).set_body_string(guarded(json!({
                "default": {"timelineData": []}
            }))))
            .mount(&google)
            .await;
        mount_timeline(&google).await;

        let mut ctx = context_at(&google.uri(), None);
        let recorder = observed(&mut ctx, &[]);
        let request = TrendsRequest::new("bitcoin");
        let session = ctx.sessions.new_direct_session(true);
        let plan = time_plan(LadderStep::Direct, ConnectionMode::Direct, "today 5-y", 2);

        let report = SubqueryRunner::new(&ctx, &request).run_step(&plan, session).await;
        assert!(report.data.has(SubQuery::Time));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("no time data"));

        let attempts = recorder.attempts();
        assert_eq!(attempts[0].timeframe, "today 5-y");
        assert!(TIMEFRAME_LADDER[1..].contains(&attempts[1].timeframe.as_str()));
    }
}
