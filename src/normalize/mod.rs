//! Response normalisation and synthetic fallback generation.
//!
//! Maps every upstream payload shape onto the result schema in
//! [`crate::types`]; nothing upstream-specific leaks past this module.

pub mod payload;
pub mod synthetic;
pub mod timeframe;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

use crate::types::{GeoValue, RelatedQueries, RelatedQuery, TrendPoint};

pub use payload::{
    CommercialRegion, DatedValue, GeoFrame, GeoPayload, RankedEntry, RankedLists,
    RelatedPayload, TimelineEntry, TimelineValue, TimeseriesPayload, TrendsFrame,
    coerce_number,
};
pub use synthetic::{SynthesisError, Synthesized, synth_cities, synth_geo, synth_timeseries};
pub use timeframe::{Frequency, TIMEFRAME_LADDER, Timeframe, TimeframeError, shorter_timeframe};

/// Field used for single-keyword (commercial) time-series points.
pub const SINGLE_VALUE_FIELD: &str = "value";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unrecognised payload shape (missing '{0}')")]
    UnknownShape(&'static str),
    #[error("payload json invalid: {0}")]
    Json(#[from] serde_json::Error),
}

/// Map a time-series payload to points sorted by date.
///
/// Frames yield one field per keyword (missing cells become 0); commercial
/// shapes yield a single [`SINGLE_VALUE_FIELD`].
pub fn normalize_timeseries(payload: &TimeseriesPayload, keywords: &[String]) -> Vec<TrendPoint> {
    let mut points: Vec<TrendPoint> = match payload {
        TimeseriesPayload::Frame(frame) => frame
            .index
            .iter()
            .enumerate()
            .map(|(row, date)| {
                let values = keywords
                    .iter()
                    .map(|keyword| {
                        let value = frame
                            .columns
                            .get(keyword)
                            .and_then(|column| column.get(row))
                            .map(coerce_number)
                            .unwrap_or(0.0);
                        (keyword.clone(), value)
                    })
                    .collect();
                TrendPoint {
                    date: iso(date),
                    values,
                }
            })
            .collect(),
        TimeseriesPayload::Timeline(entries) => entries
            .iter()
            .map(|entry| {
                let date = entry
                    .timestamp
                    .as_ref()
                    .and_then(timestamp_to_date)
                    .or_else(|| entry.date.as_deref().and_then(parse_loose_date))
                    .map(|date| iso(&date))
                    .or_else(|| entry.date.clone())
                    .unwrap_or_default();
                single_value_point(date, entry.first_value())
            })
            .collect(),
        TimeseriesPayload::Records(records) => records
            .iter()
            .map(|record| {
                let date = parse_loose_date(&record.date)
                    .map(|date| iso(&date))
                    .unwrap_or_else(|| record.date.clone());
                single_value_point(date, coerce_number(&record.value))
            })
            .collect(),
    };

    points.sort_by(|a, b| compare_dates(&a.date, &b.date));
    points
}

/// Map a geo payload to one entry per region, highest peak first.
///
/// Duplicate region names are merged keeping the larger score per keyword.
/// Zero-valued regions are kept.
pub fn normalize_geo(payload: &GeoPayload, keywords: &[String]) -> Vec<GeoValue> {
    let mut grouped: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();

    match payload {
        GeoPayload::Frame(frame) => {
            for (row, name) in frame.index.iter().enumerate() {
                let entry = grouped.entry(name.clone()).or_default();
                for keyword in keywords {
                    let value = frame
                        .columns
                        .get(keyword)
                        .and_then(|column| column.get(row))
                        .map(coerce_number)
                        .unwrap_or(0.0);
                    merge_score(entry, keyword, value);
                }
            }
        }
        GeoPayload::Regions { keyword, regions } => {
            for region in regions {
                let entry = grouped.entry(region.location.clone()).or_default();
                merge_score(entry, keyword, region.number());
            }
        }
    }

    let mut regions: Vec<GeoValue> = grouped
        .into_iter()
        .map(|(geo_name, values)| GeoValue { geo_name, values })
        .collect();
    sort_by_peak(&mut regions);
    regions
}

/// Map related-query lists per keyword. Keywords without data are omitted.
pub fn normalize_related(
    payload: &RelatedPayload,
    keywords: &[String],
) -> BTreeMap<String, RelatedQueries> {
    let mut related = BTreeMap::new();
    for keyword in keywords {
        let Some(lists) = payload.by_keyword.get(keyword) else {
            continue;
        };
        let queries = RelatedQueries {
            top: lists.top.iter().map(to_related_query).collect(),
            rising: lists.rising.iter().map(to_related_query).collect(),
        };
        if !queries.is_empty() {
            related.insert(keyword.clone(), queries);
        }
    }
    related
}

pub(crate) fn sort_by_peak(regions: &mut [GeoValue]) {
    regions.sort_by(|a, b| {
        b.peak()
            .partial_cmp(&a.peak())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.geo_name.cmp(&b.geo_name))
    });
}

pub(crate) fn iso(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn merge_score(entry: &mut BTreeMap<String, f64>, keyword: &str, value: f64) {
    let value = value.clamp(0.0, 100.0);
    entry
        .entry(keyword.to_string())
        .and_modify(|current| *current = current.max(value))
        .or_insert(value);
}

fn single_value_point(date: String, value: f64) -> TrendPoint {
    let mut values = BTreeMap::new();
    values.insert(SINGLE_VALUE_FIELD.to_string(), value);
    TrendPoint { date, values }
}

fn to_related_query(entry: &RankedEntry) -> RelatedQuery {
    RelatedQuery {
        query: entry.query.clone(),
        value: entry.number(),
        formatted_value: entry.formatted_value.clone(),
        link: entry.link.clone(),
    }
}

fn timestamp_to_date(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    let seconds = match raw {
        serde_json::Value::Number(number) => number.as_i64()?,
        serde_json::Value::String(text) => text.trim().parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_opt(seconds, 0).single()
}

fn parse_loose_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&date));
    }
    ["%Y-%m-%d", "%b %d, %Y", "%B %d, %Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| Utc.from_utc_datetime(&date))
}

fn compare_dates(a: &str, b: &str) -> Ordering {
    match (parse_loose_date(a), parse_loose_date(b)) {
        (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keywords(list: &[&str]) -> Vec<String> {
        list.iter().map(|kw| kw.to_string()).collect()
    }

    #[test]
    fn frame_drops_partial_column_and_fills_missing_keywords() {
        let mut frame = TrendsFrame::default();
        frame.index = vec![
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ];
        frame.push_column("bitcoin", vec![json!(80), json!("n/a")]);
        frame.push_column(payload::PARTIAL_COLUMN, vec![json!(true), json!(false)]);

        let points = normalize_timeseries(
            &TimeseriesPayload::Frame(frame),
            &keywords(&["bitcoin", "doge"]),
        );

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, "2024-01-01T00:00:00Z");
        assert_eq!(points[0].values["bitcoin"], 0.0);
        assert_eq!(points[1].values["bitcoin"], 80.0);
        assert_eq!(points[1].values["doge"], 0.0);
        assert!(!points[0].values.contains_key(payload::PARTIAL_COLUMN));
    }

    #[test]
    fn timeline_uses_single_value_field() {
        let payload = TimeseriesPayload::from_commercial(&json!({
            "interest_over_time": {"timeline_data": [
                {"date": "Jan 8, 2024", "timestamp": "1704672000",
                 "values": [{"query": "eth", "extracted_value": 12}]},
                {"date": "Jan 1, 2024", "timestamp": "1704067200",
                 "values": [{"query": "eth", "value": "9"}]}
            ]}
        }))
        .unwrap();
        let points = normalize_timeseries(&payload, &keywords(&["eth"]));
        assert_eq!(points[0].date, "2024-01-01T00:00:00Z");
        assert_eq!(points[0].values.get(SINGLE_VALUE_FIELD), Some(&9.0));
        assert_eq!(points[1].values.len(), 1);
    }

    #[test]
    fn records_keep_unparseable_dates_verbatim() {
        let payload = TimeseriesPayload::Records(vec![DatedValue {
            date: "week 3".into(),
            value: json!(4),
        }]);
        let points = normalize_timeseries(&payload, &keywords(&["x"]));
        assert_eq!(points[0].date, "week 3");
    }

    #[test]
    fn geo_groups_sorts_and_keeps_zeroes() {
        let frame = GeoFrame {
            index: vec!["Goa".into(), "Kerala".into(), "Goa".into(), "Assam".into()],
            columns: BTreeMap::from([
                ("btc".to_string(), vec![json!(10), json!(90), json!(40), json!(0)]),
                ("eth".to_string(), vec![json!(5), json!(1), json!(2), json!(0)]),
                (payload::GEO_CODE_COLUMN.to_string(), vec![json!("IN-GA"); 4]),
            ]),
        };
        let regions = normalize_geo(&GeoPayload::Frame(frame), &keywords(&["btc", "eth"]));
        let names: Vec<&str> = regions.iter().map(|r| r.geo_name.as_str()).collect();
        assert_eq!(names, vec!["Kerala", "Goa", "Assam"]);
        assert_eq!(regions[1].values["btc"], 40.0);
        assert_eq!(regions[1].values["eth"], 5.0);
        assert!(!regions[0].values.contains_key(payload::GEO_CODE_COLUMN));
    }

    #[test]
    fn related_omits_keywords_without_data() {
        let mut payload = RelatedPayload::default();
        payload.insert(
            "btc",
            serde_json::from_value(json!({
                "top": [{"query": "btc price", "value": 100}],
                "rising": [{"query": "btc etf", "value": 5000, "formattedValue": "Breakout"}]
            }))
            .unwrap(),
        );
        payload.insert("eth", RankedLists::default());
        let related = normalize_related(&payload, &keywords(&["btc", "eth", "doge"]));
        assert_eq!(related.len(), 1);
        assert_eq!(related["btc"].rising[0].formatted_value.as_deref(), Some("Breakout"));
    }
}
