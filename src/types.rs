//! Request and result model shared by every stage of the ingestion ladder.
//!
//! The result schema is the only shape that leaves the crate: upstream payloads
//! are normalised into [`TrendsData`] before they are cached or returned.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on keywords per request; extra terms are truncated.
pub const MAX_KEYWORDS: usize = 5;
pub const DEFAULT_TIMEFRAME: &str = "today 5-y";
pub const DEFAULT_GEO: &str = "IN";
/// Warning attached to every result that carries synthetic data.
pub const FALLBACK_WARNING: &str = "Using fallback data";

/// One independent upstream call composing into a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQuery {
    Time,
    Region,
    City,
    Related,
}

impl SubQuery {
    pub const ALL: [SubQuery; 4] = [
        SubQuery::Time,
        SubQuery::Region,
        SubQuery::City,
        SubQuery::Related,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SubQuery::Time => "time",
            SubQuery::Region => "region",
            SubQuery::City => "city",
            SubQuery::Related => "related",
        }
    }
}

impl std::fmt::Display for SubQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Flag set selecting which sub-queries a request fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryOptions {
    pub time: bool,
    pub region: bool,
    pub city: bool,
    pub related: bool,
    pub region_only: bool,
    pub city_only: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::time_only()
    }
}

impl QueryOptions {
    pub const fn none() -> Self {
        Self {
            time: false,
            region: false,
            city: false,
            related: false,
            region_only: false,
            city_only: false,
        }
    }

    pub const fn time_only() -> Self {
        Self {
            time: true,
            ..Self::none()
        }
    }

    pub const fn all() -> Self {
        Self {
            time: true,
            region: true,
            city: true,
            related: true,
            region_only: false,
            city_only: false,
        }
    }

    pub fn with_time(mut self) -> Self {
        self.time = true;
        self
    }

    pub fn with_region(mut self) -> Self {
        self.region = true;
        self
    }

    pub fn with_city(mut self) -> Self {
        self.city = true;
        self
    }

    pub fn with_related(mut self) -> Self {
        self.related = true;
        self
    }

    pub fn region_only() -> Self {
        Self {
            region_only: true,
            ..Self::none()
        }
    }

    pub fn city_only() -> Self {
        Self {
            city_only: true,
            ..Self::none()
        }
    }

    /// Stable bitmask used in cache keys.
    pub fn bits(&self) -> u8 {
        [
            self.time,
            self.region,
            self.city,
            self.related,
            self.region_only,
            self.city_only,
        ]
        .iter()
        .enumerate()
        .fold(0u8, |acc, (idx, flag)| if *flag { acc | (1 << idx) } else { acc })
    }

    /// Sub-queries to dispatch. `*_only` flags win over the others; an empty
    /// set falls back to the time series.
    pub fn subqueries(&self) -> Vec<SubQuery> {
        if self.region_only || self.city_only {
            let mut only = Vec::new();
            if self.region_only {
                only.push(SubQuery::Region);
            }
            if self.city_only {
                only.push(SubQuery::City);
            }
            return only;
        }

        let selected: Vec<SubQuery> = SubQuery::ALL
            .into_iter()
            .filter(|query| self.includes(*query))
            .collect();

        if selected.is_empty() {
            vec![SubQuery::Time]
        } else {
            selected
        }
    }

    fn includes(&self, query: SubQuery) -> bool {
        match query {
            SubQuery::Time => self.time,
            SubQuery::Region => self.region,
            SubQuery::City => self.city,
            SubQuery::Related => self.related,
        }
    }
}

/// Keyword input accepted by [`TrendsRequest::new`]: a single term or a list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Keywords(pub Vec<String>);

impl From<&str> for Keywords {
    fn from(value: &str) -> Self {
        Keywords(vec![value.to_string()])
    }
}

impl From<String> for Keywords {
    fn from(value: String) -> Self {
        Keywords(vec![value])
    }
}

impl From<Vec<String>> for Keywords {
    fn from(value: Vec<String>) -> Self {
        Keywords(value)
    }
}

impl From<Vec<&str>> for Keywords {
    fn from(value: Vec<&str>) -> Self {
        Keywords(value.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Keywords {
    fn from(value: &[&str]) -> Self {
        Keywords(value.iter().map(|kw| kw.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Keywords {
    fn from(value: [&str; N]) -> Self {
        Keywords(value.iter().map(|kw| kw.to_string()).collect())
    }
}

/// A trends request as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendsRequest {
    pub keywords: Vec<String>,
    pub timeframe: String,
    pub geo: String,
    pub options: QueryOptions,
}

impl TrendsRequest {
    pub fn new(keywords: impl Into<Keywords>) -> Self {
        Self {
            keywords: keywords.into().0,
            timeframe: DEFAULT_TIMEFRAME.to_string(),
            geo: DEFAULT_GEO.to_string(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.timeframe = timeframe.into();
        self
    }

    pub fn with_geo(mut self, geo: impl Into<String>) -> Self {
        self.geo = geo.into();
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Clamp the request into its canonical form.
    ///
    /// Keywords are trimmed, blanks dropped and the list truncated to
    /// [`MAX_KEYWORDS`]; duplicates and ordering are preserved. The geo code is
    /// upper-cased. Unknown timeframes pass through unchanged. Returns the
    /// warnings raised while clamping.
    pub fn sanitize(mut self) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();

        let before = self.keywords.len();
        self.keywords = self
            .keywords
            .into_iter()
            .map(|kw| kw.trim().to_string())
            .filter(|kw| !kw.is_empty())
            .collect();
        if self.keywords.len() < before {
            warnings.push(format!(
                "dropped {} blank keyword(s)",
                before - self.keywords.len()
            ));
        }

        if self.keywords.len() > MAX_KEYWORDS {
            warnings.push(format!(
                "received {} keywords, truncating to the first {MAX_KEYWORDS}",
                self.keywords.len()
            ));
            self.keywords.truncate(MAX_KEYWORDS);
        }

        self.timeframe = self.timeframe.trim().to_string();
        if self.timeframe.is_empty() {
            self.timeframe = DEFAULT_TIMEFRAME.to_string();
        }

        self.geo = self.geo.trim().to_ascii_uppercase();

        (self, warnings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Which tier of the ladder produced the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Google,
    Commercial,
    Synthetic,
}

/// How the producing tier reached the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Proxy,
    Direct,
    Api,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub keywords: Vec<String>,
    pub timeframe: String,
    pub geo: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl Metadata {
    pub fn for_request(request: &TrendsRequest) -> Self {
        Self {
            keywords: request.keywords.clone(),
            timeframe: request.timeframe.clone(),
            geo: request.geo.clone(),
            timestamp: Utc::now(),
            source: None,
            connection: None,
            warning: None,
        }
    }
}

/// A single time-series sample. Google rows carry one field per keyword,
/// commercial rows a single `value` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: String,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoValue {
    #[serde(rename = "geoName")]
    pub geo_name: String,
    pub values: BTreeMap<String, f64>,
}

impl GeoValue {
    pub fn peak(&self) -> f64 {
        self.values.values().copied().fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedQuery {
    pub query: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelatedQueries {
    pub top: Vec<RelatedQuery>,
    pub rising: Vec<RelatedQuery>,
}

impl RelatedQueries {
    pub fn is_empty(&self) -> bool {
        self.top.is_empty() && self.rising.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendsData {
    pub time_trends: Vec<TrendPoint>,
    pub region_data: Vec<GeoValue>,
    pub city_data: Vec<GeoValue>,
    pub related_queries: BTreeMap<String, RelatedQueries>,
}

impl TrendsData {
    pub fn is_empty(&self) -> bool {
        SubQuery::ALL.into_iter().all(|query| !self.has(query))
    }

    pub fn has(&self, query: SubQuery) -> bool {
        match query {
            SubQuery::Time => !self.time_trends.is_empty(),
            SubQuery::Region => !self.region_data.is_empty(),
            SubQuery::City => !self.city_data.is_empty(),
            SubQuery::Related => !self.related_queries.is_empty(),
        }
    }

    /// Copy fields from `other` that are still empty here. Returns the
    /// sub-queries that were filled.
    pub fn fill_missing(&mut self, other: TrendsData) -> Vec<SubQuery> {
        let mut filled = Vec::new();
        if self.time_trends.is_empty() && !other.time_trends.is_empty() {
            self.time_trends = other.time_trends;
            filled.push(SubQuery::Time);
        }
        if self.region_data.is_empty() && !other.region_data.is_empty() {
            self.region_data = other.region_data;
            filled.push(SubQuery::Region);
        }
        if self.city_data.is_empty() && !other.city_data.is_empty() {
            self.city_data = other.city_data;
            filled.push(SubQuery::City);
        }
        if self.related_queries.is_empty() && !other.related_queries.is_empty() {
            self.related_queries = other.related_queries;
            filled.push(SubQuery::Related);
        }
        filled
    }
}

/// Canonical output of [`crate::TrendsScraper::get_trends`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendsResult {
    pub status: Status,
    pub metadata: Metadata,
    pub errors: Vec<String>,
    pub data: TrendsData,
}

impl TrendsResult {
    pub fn success(metadata: Metadata, data: TrendsData, errors: Vec<String>) -> Self {
        Self {
            status: Status::Success,
            metadata,
            errors,
            data,
        }
    }

    pub fn error(metadata: Metadata, errors: Vec<String>) -> Self {
        Self {
            status: Status::Error,
            metadata,
            errors,
            data: TrendsData::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// True when any part of the data was generated locally.
    pub fn is_synthetic(&self) -> bool {
        self.metadata.warning.is_some()
    }
}
