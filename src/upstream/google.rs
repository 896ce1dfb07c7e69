//! Client for the public Google Trends web API.
//!
//! Every query starts with an `explore` call that returns one widget per
//! data view, each with a token. The widget request and token are then
//! replayed against the matching `widgetdata` endpoint. Responses carry an
//! anti-JSON prefix that is stripped before parsing.

use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::types::FetchError;
use crate::modules::session::Session;
use crate::normalize::payload::{
    GEO_CODE_COLUMN, GeoFrame, PARTIAL_COLUMN, RankedEntry, RankedLists, RelatedPayload,
    TrendsFrame,
};

pub const DEFAULT_BASE_URL: &str = "https://trends.google.com";
pub const DEFAULT_LANGUAGE: &str = "en-US";

const EXPLORE_PATH: &str = "trends/api/explore";
const MULTILINE_PATH: &str = "trends/api/widgetdata/multiline";
const COMPARED_GEO_PATH: &str = "trends/api/widgetdata/comparedgeo";
const RELATED_PATH: &str = "trends/api/widgetdata/relatedsearches";

const TIMESERIES_WIDGET: &str = "TIMESERIES";
const GEO_WIDGET: &str = "GEO_MAP";
const RELATED_WIDGET: &str = "RELATED_QUERIES";

/// Geographic granularity of a compared-geo query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Country,
    Region,
    Dma,
    City,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Country => "COUNTRY",
            Resolution::Region => "REGION",
            Resolution::Dma => "DMA",
            Resolution::City => "CITY",
        }
    }

    /// First-level resolutions to try for a region query, in order. The US
    /// starts at metro (DMA) level.
    pub fn region_probe_order(geo: &str) -> [Resolution; 3] {
        if geo.eq_ignore_ascii_case("US") {
            [Resolution::Dma, Resolution::Region, Resolution::Country]
        } else {
            [Resolution::Region, Resolution::Dma, Resolution::Country]
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Widget {
    pub id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub request: Value,
}

impl Widget {
    /// Keyword a related-queries widget was issued for.
    fn restricted_keyword(&self) -> Option<&str> {
        self.request
            .pointer("/restriction/complexKeywordsRestriction/keyword/0/value")
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct ExploreResponse {
    #[serde(default)]
    widgets: Vec<Widget>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimelineRow {
    time: String,
    #[serde(default)]
    value: Vec<Value>,
    #[serde(default)]
    is_partial: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoRow {
    #[serde(default)]
    geo_code: Option<String>,
    geo_name: String,
    #[serde(default)]
    value: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RankedList {
    #[serde(default)]
    ranked_keyword: Vec<RankedEntry>,
}

/// Query parameters shared by every call of one sub-query.
#[derive(Debug, Clone, Copy)]
pub struct TrendsQuery<'a> {
    pub keywords: &'a [String],
    pub timeframe: &'a str,
    pub geo: &'a str,
}

#[derive(Debug, Clone)]
pub struct GoogleTrendsClient {
    base: Url,
    language: String,
    timezone: Option<i32>,
}

impl GoogleTrendsClient {
    /// Requests go out through the caller's [`Session`], which does the
    /// pacing.
    pub fn new(base: Url) -> Self {
        Self {
            base: with_trailing_slash(base),
            language: DEFAULT_LANGUAGE.to_string(),
            timezone: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Fixed `tz` parameter; by default the session fingerprint's offset is used.
    pub fn with_timezone(mut self, offset_minutes: i32) -> Self {
        self.timezone = Some(offset_minutes);
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn explore(
        &self,
        session: &Session,
        query: TrendsQuery<'_>,
    ) -> Result<Vec<Widget>, FetchError> {
        let items: Vec<Value> = query
            .keywords
            .iter()
            .map(|keyword| json!({"keyword": keyword, "time": query.timeframe, "geo": query.geo}))
            .collect();
        let payload = json!({"comparisonItem": items, "category": 0, "property": ""});

        let doc = self.call(session, EXPLORE_PATH, &payload, None).await?;
        let explore: ExploreResponse = serde_json::from_value(doc)?;
        if explore.widgets.is_empty() {
            return Err(FetchError::Parse("explore returned no widgets".into()));
        }
        Ok(explore.widgets)
    }

    pub async fn interest_over_time(
        &self,
        session: &Session,
        query: TrendsQuery<'_>,
    ) -> Result<TrendsFrame, FetchError> {
        let widgets = self.explore(session, query).await?;
        let widget = find_widget(&widgets, TIMESERIES_WIDGET).ok_or(FetchError::NoData("time"))?;
        let doc = self
            .call(session, MULTILINE_PATH, &widget.request, Some(&widget.token))
            .await?;
        let rows: Vec<TimelineRow> = section(&doc, "timelineData")?;
        if rows.is_empty() {
            return Err(FetchError::NoData("time"));
        }
        Ok(timeline_frame(rows, query.keywords))
    }

    pub async fn interest_by_region(
        &self,
        session: &Session,
        query: TrendsQuery<'_>,
        resolution: Resolution,
    ) -> Result<GeoFrame, FetchError> {
        let widgets = self.explore(session, query).await?;
        self.compared_geo(session, &widgets, query.keywords, resolution)
            .await
    }

    /// Region breakdown, probing further resolutions while results are empty.
    pub async fn interest_by_region_probing(
        &self,
        session: &Session,
        query: TrendsQuery<'_>,
    ) -> Result<(Resolution, GeoFrame), FetchError> {
        let widgets = self.explore(session, query).await?;
        for resolution in Resolution::region_probe_order(query.geo) {
            match self
                .compared_geo(session, &widgets, query.keywords, resolution)
                .await
            {
                Ok(frame) => return Ok((resolution, frame)),
                Err(FetchError::NoData(_)) => {
                    log::debug!("no {resolution} breakdown for {}; probing next", query.geo);
                }
                Err(err) => return Err(err),
            }
        }
        Err(FetchError::NoData("region"))
    }

    pub async fn related_queries(
        &self,
        session: &Session,
        query: TrendsQuery<'_>,
    ) -> Result<RelatedPayload, FetchError> {
        let widgets = self.explore(session, query).await?;
        let related: Vec<&Widget> = widgets
            .iter()
            .filter(|widget| widget.id.contains(RELATED_WIDGET))
            .collect();
        if related.is_empty() {
            return Err(FetchError::NoData("related"));
        }

        let mut payload = RelatedPayload::default();
        for (idx, widget) in related.into_iter().enumerate() {
            let keyword = widget
                .restricted_keyword()
                .map(str::to_string)
                .or_else(|| query.keywords.get(idx).cloned());
            let Some(keyword) = keyword else {
                continue;
            };
            let doc = self
                .call(session, RELATED_PATH, &widget.request, Some(&widget.token))
                .await?;
            let mut lists = section::<RankedList>(&doc, "rankedList")?.into_iter();
            payload.insert(
                keyword,
                RankedLists {
                    top: lists.next().unwrap_or_default().ranked_keyword,
                    rising: lists.next().unwrap_or_default().ranked_keyword,
                },
            );
        }
        Ok(payload)
    }

    async fn compared_geo(
        &self,
        session: &Session,
        widgets: &[Widget],
        keywords: &[String],
        resolution: Resolution,
    ) -> Result<GeoFrame, FetchError> {
        let label = if resolution == Resolution::City {
            "city"
        } else {
            "region"
        };
        let widget = find_widget(widgets, GEO_WIDGET).ok_or(FetchError::NoData(label))?;
        let mut request = widget.request.clone();
        if let Some(fields) = request.as_object_mut() {
            fields.insert("resolution".into(), json!(resolution.as_str()));
            fields.insert("includeLowSearchVolumeGeos".into(), json!(false));
        }

        let doc = self
            .call(session, COMPARED_GEO_PATH, &request, Some(&widget.token))
            .await?;
        let rows: Vec<GeoRow> = section(&doc, "geoMapData")?;
        if rows.is_empty() {
            return Err(FetchError::NoData(label));
        }
        Ok(geo_frame(rows, keywords))
    }

    async fn call(
        &self,
        session: &Session,
        path: &str,
        request: &Value,
        token: Option<&str>,
    ) -> Result<Value, FetchError> {
        let mut url = self.base.join(path)?;
        {
            let tz = self
                .timezone
                .unwrap_or(session.fingerprint().timezone_offset);
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("hl", &self.language)
                .append_pair("tz", &tz.to_string())
                .append_pair("req", &request.to_string());
            if let Some(token) = token {
                pairs.append_pair("token", token);
            }
        }

        let response = session.get(url).await?.error_for_status()?;
        parse_body(&response.body)
    }
}

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

fn find_widget<'a>(widgets: &'a [Widget], id: &str) -> Option<&'a Widget> {
    widgets.iter().find(|widget| widget.id.starts_with(id))
}

/// Strip the anti-JSON prefix (`)]}'` and variants) and parse the rest.
pub fn parse_body(body: &str) -> Result<Value, FetchError> {
    let start = body
        .find(['{', '['])
        .ok_or_else(|| FetchError::Parse("response contained no JSON".into()))?;
    serde_json::from_str(&body[start..]).map_err(FetchError::from)
}

fn section<T: serde::de::DeserializeOwned>(doc: &Value, field: &str) -> Result<Vec<T>, FetchError> {
    match doc.get("default").and_then(|inner| inner.get(field)) {
        Some(rows) => Ok(serde_json::from_value(rows.clone())?),
        None => Err(FetchError::Parse(format!("missing default.{field}"))),
    }
}

fn timeline_frame(rows: Vec<TimelineRow>, keywords: &[String]) -> TrendsFrame {
    let mut frame = TrendsFrame::default();
    let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); keywords.len()];
    let mut partial = Vec::with_capacity(rows.len());

    for row in rows {
        let Some(date) = row
            .time
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        else {
            log::debug!("skipping timeline row with bad time {:?}", row.time);
            continue;
        };
        frame.index.push(date);
        for (idx, column) in columns.iter_mut().enumerate() {
            column.push(row.value.get(idx).cloned().unwrap_or(Value::Null));
        }
        partial.push(Value::Bool(row.is_partial));
    }

    for (keyword, column) in keywords.iter().zip(columns) {
        frame.push_column(keyword.clone(), column);
    }
    frame.push_column(PARTIAL_COLUMN, partial);
    frame
}

fn geo_frame(rows: Vec<GeoRow>, keywords: &[String]) -> GeoFrame {
    let mut frame = GeoFrame::default();
    let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); keywords.len()];
    let mut codes = Vec::with_capacity(rows.len());

    for row in rows {
        frame.index.push(row.geo_name);
        for (idx, column) in columns.iter_mut().enumerate() {
            column.push(row.value.get(idx).cloned().unwrap_or(Value::Null));
        }
        codes.push(row.geo_code.map(Value::String).unwrap_or(Value::Null));
    }

    for (keyword, column) in keywords.iter().zip(columns) {
        frame.columns.insert(keyword.clone(), column);
    }
    frame.columns.insert(GEO_CODE_COLUMN.to_string(), codes);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_anti_json_prefix() {
        let doc = parse_body(")]}'\n{\"default\":{\"timelineData\":[]}}").unwrap();
        assert!(doc["default"]["timelineData"].is_array());
        assert!(matches!(parse_body("<html>blocked</html>"), Err(FetchError::Parse(_))));
    }

    #[test]
    fn us_probes_dma_first() {
        assert_eq!(Resolution::region_probe_order("US")[0], Resolution::Dma);
        assert_eq!(
            Resolution::region_probe_order("IN"),
            [Resolution::Region, Resolution::Dma, Resolution::Country]
        );
    }

    #[test]
    fn timeline_rows_become_a_frame() {
        let rows: Vec<TimelineRow> = serde_json::from_value(json!([
            {"time": "1704067200", "value": [10, 20], "isPartial": false},
            {"time": "1704672000", "value": [30], "isPartial": true},
            {"time": "garbage", "value": [1, 1]}
        ]))
        .unwrap();
        let keywords = vec!["btc".to_string(), "eth".to_string()];
        let frame = timeline_frame(rows, &keywords);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.columns["btc"], vec![json!(10), json!(30)]);
        assert_eq!(frame.columns["eth"], vec![json!(20), Value::Null]);
        assert_eq!(frame.columns[PARTIAL_COLUMN][1], json!(true));
    }

    #[test]
    fn related_widget_keyword_is_extracted() {
        let widget: Widget = serde_json::from_value(json!({
            "id": "RELATED_QUERIES_0",
            "token": "t",
            "request": {"restriction": {"complexKeywordsRestriction": {
                "keyword": [{"type": "BROAD", "value": "bitcoin"}]
            }}}
        }))
        .unwrap();
        assert_eq!(widget.restricted_keyword(), Some("bitcoin"));
    }

    #[test]
    fn base_gets_trailing_slash() {
        let base = with_trailing_slash(Url::parse("http://127.0.0.1:9000/mock").unwrap());
        assert_eq!(
            base.join(EXPLORE_PATH).unwrap().as_str(),
            "http://127.0.0.1:9000/mock/trends/api/explore"
        );
    }
}
