//! Token-authenticated commercial Trends API (SerpApi-compatible).
//!
//! The API is single-keyword: one `q` per call, with `data_type` choosing the
//! view.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use super::types::FetchError;
use crate::modules::pacing::RateLimiter;
use crate::normalize::payload::{GeoPayload, RelatedPayload, TimeseriesPayload};
use crate::types::SubQuery;

pub const DEFAULT_BASE_URL: &str = "https://serpapi.com";
const SEARCH_PATH: &str = "search.json";
const ENGINE: &str = "google_trends";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Timeseries,
    GeoMap0,
    GeoMap1,
    RelatedQueries,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Timeseries => "TIMESERIES",
            DataType::GeoMap0 => "GEO_MAP_0",
            DataType::GeoMap1 => "GEO_MAP_1",
            DataType::RelatedQueries => "RELATED_QUERIES",
        }
    }

    pub fn for_subquery(query: SubQuery) -> Self {
        match query {
            SubQuery::Time => DataType::Timeseries,
            SubQuery::Region => DataType::GeoMap0,
            SubQuery::City => DataType::GeoMap1,
            SubQuery::Related => DataType::RelatedQueries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommercialClient {
    base: Url,
    api_key: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl CommercialClient {
    pub fn new(base: Url, api_key: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self::with_timeouts(
            base,
            api_key,
            limiter,
            Duration::from_secs(15),
            Duration::from_secs(60),
        )
    }

    pub fn with_timeouts(
        base: Url,
        api_key: impl Into<String>,
        limiter: Arc<RateLimiter>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .unwrap_or_else(|err| {
                log::warn!("commercial client construction failed ({err}); using defaults");
                reqwest::Client::new()
            });
        Self {
            base,
            api_key: api_key.into(),
            client,
            limiter,
        }
    }

    pub async fn fetch(
        &self,
        keyword: &str,
        data_type: DataType,
        timeframe: &str,
        geo: &str,
    ) -> Result<Value, FetchError> {
        let mut url = self.base.join(SEARCH_PATH)?;
        url.query_pairs_mut()
            .append_pair("engine", ENGINE)
            .append_pair("q", keyword)
            .append_pair("data_type", data_type.as_str())
            .append_pair("geo", geo)
            .append_pair("date", timeframe)
            .append_pair("api_key", &self.api_key);

        self.limiter.acquire().await;
        log::debug!("commercial {} for {keyword:?}", data_type.as_str());
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Commercial(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::Commercial(err.to_string()))?;

        let doc: Value = serde_json::from_str(&body)
            .map_err(|err| FetchError::Commercial(format!("invalid json: {err}")))?;
        if let Some(message) = doc.get("error").and_then(Value::as_str) {
            return Err(FetchError::Commercial(message.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Commercial(format!("status {status}")));
        }
        Ok(doc)
    }

    pub async fn time_series(
        &self,
        keyword: &str,
        timeframe: &str,
        geo: &str,
    ) -> Result<TimeseriesPayload, FetchError> {
        let doc = self
            .fetch(keyword, DataType::Timeseries, timeframe, geo)
            .await?;
        let payload = TimeseriesPayload::from_commercial(&doc)?;
        if payload.is_empty() {
            return Err(FetchError::NoData("time"));
        }
        Ok(payload)
    }

    pub async fn geo(
        &self,
        keyword: &str,
        data_type: DataType,
        timeframe: &str,
        geo: &str,
    ) -> Result<GeoPayload, FetchError> {
        let doc = self.fetch(keyword, data_type, timeframe, geo).await?;
        let payload = GeoPayload::from_commercial(keyword, &doc)?;
        if payload.is_empty() {
            return Err(FetchError::NoData("region"));
        }
        Ok(payload)
    }

    pub async fn related(
        &self,
        keyword: &str,
        timeframe: &str,
        geo: &str,
    ) -> Result<RelatedPayload, FetchError> {
        let doc = self
            .fetch(keyword, DataType::RelatedQueries, timeframe, geo)
            .await?;
        Ok(RelatedPayload::from_commercial(keyword, &doc)?)
    }
}
