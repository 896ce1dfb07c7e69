//! Upstream payload shapes.
//!
//! The primary upstream yields tabular frames (a date or region index with one
//! column per keyword); the commercial API yields either a nested timeline or a
//! flat list of dated records. Every shape the normalisers accept is one of the
//! variants below; anything else is reported as [`NormalizeError::UnknownShape`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::NormalizeError;

/// Column emitted by the primary upstream alongside keyword columns.
pub const PARTIAL_COLUMN: &str = "isPartial";
pub const GEO_CODE_COLUMN: &str = "geoCode";

/// Date-indexed table, one column per keyword plus optional flag columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendsFrame {
    pub index: Vec<DateTime<Utc>>,
    pub columns: BTreeMap<String, Vec<Value>>,
}

impl TrendsFrame {
    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) {
        self.columns.insert(name.into(), values);
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Region-indexed table, one column per keyword plus `geoCode`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoFrame {
    pub index: Vec<String>,
    pub columns: BTreeMap<String, Vec<Value>>,
}

impl GeoFrame {
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TimelineValue {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub extracted_value: Option<Value>,
}

impl TimelineValue {
    fn number(&self) -> f64 {
        self.extracted_value
            .as_ref()
            .or(self.value.as_ref())
            .map(coerce_number)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TimelineEntry {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub values: Vec<TimelineValue>,
}

impl TimelineEntry {
    pub fn first_value(&self) -> f64 {
        self.values.first().map(TimelineValue::number).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DatedValue {
    pub date: String,
    #[serde(default)]
    pub value: Value,
}

/// The three time-series shapes seen in the wild.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeseriesPayload {
    Frame(TrendsFrame),
    Timeline(Vec<TimelineEntry>),
    Records(Vec<DatedValue>),
}

impl TimeseriesPayload {
    /// Classify a commercial API document.
    pub fn from_commercial(doc: &Value) -> Result<Self, NormalizeError> {
        let section = doc.get("interest_over_time").unwrap_or(doc);

        if let Some(timeline) = section.get("timeline_data") {
            let entries: Vec<TimelineEntry> = serde_json::from_value(timeline.clone())?;
            return Ok(TimeseriesPayload::Timeline(entries));
        }

        if section.is_array() {
            let records: Vec<DatedValue> = serde_json::from_value(section.clone())?;
            return Ok(TimeseriesPayload::Records(records));
        }

        Err(NormalizeError::UnknownShape("interest_over_time"))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TimeseriesPayload::Frame(frame) => frame.is_empty(),
            TimeseriesPayload::Timeline(entries) => entries.is_empty(),
            TimeseriesPayload::Records(records) => records.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CommercialRegion {
    pub location: String,
    #[serde(default)]
    pub geo: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub extracted_value: Option<Value>,
    #[serde(default)]
    pub values: Vec<TimelineValue>,
}

impl CommercialRegion {
    pub fn number(&self) -> f64 {
        if let Some(raw) = self.extracted_value.as_ref().or(self.value.as_ref()) {
            return coerce_number(raw);
        }
        self.values.first().map(TimelineValue::number).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeoPayload {
    Frame(GeoFrame),
    Regions {
        keyword: String,
        regions: Vec<CommercialRegion>,
    },
}

impl GeoPayload {
    pub fn from_commercial(keyword: &str, doc: &Value) -> Result<Self, NormalizeError> {
        let section = doc
            .get("interest_by_region")
            .or_else(|| doc.get("compared_breakdown_by_region"))
            .ok_or(NormalizeError::UnknownShape("interest_by_region"))?;
        let regions: Vec<CommercialRegion> = serde_json::from_value(section.clone())?;
        Ok(GeoPayload::Regions {
            keyword: keyword.to_string(),
            regions,
        })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            GeoPayload::Frame(frame) => frame.is_empty(),
            GeoPayload::Regions { regions, .. } => regions.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RankedEntry {
    pub query: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub extracted_value: Option<Value>,
    #[serde(default, alias = "formattedValue")]
    pub formatted_value: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl RankedEntry {
    pub fn number(&self) -> f64 {
        coerce_number(self.extracted_value.as_ref().unwrap_or(&self.value))
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RankedLists {
    #[serde(default)]
    pub top: Vec<RankedEntry>,
    #[serde(default)]
    pub rising: Vec<RankedEntry>,
}

/// Related queries keyed by the keyword they were requested for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelatedPayload {
    pub by_keyword: BTreeMap<String, RankedLists>,
}

impl RelatedPayload {
    pub fn insert(&mut self, keyword: impl Into<String>, lists: RankedLists) {
        self.by_keyword.insert(keyword.into(), lists);
    }

    pub fn from_commercial(keyword: &str, doc: &Value) -> Result<Self, NormalizeError> {
        let section = doc
            .get("related_queries")
            .ok_or(NormalizeError::UnknownShape("related_queries"))?;
        let lists: RankedLists = serde_json::from_value(section.clone())?;
        let mut payload = RelatedPayload::default();
        payload.insert(keyword, lists);
        Ok(payload)
    }
}

/// Numbers stay numbers, numeric strings are parsed, anything else is 0.
pub fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => text.trim().trim_end_matches('%').parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_mixed_values() {
        assert_eq!(coerce_number(&json!(42)), 42.0);
        assert_eq!(coerce_number(&json!("17")), 17.0);
        assert_eq!(coerce_number(&json!("<1")), 0.0);
        assert_eq!(coerce_number(&json!(null)), 0.0);
        assert_eq!(coerce_number(&json!(true)), 0.0);
    }

    #[test]
    fn classifies_commercial_timeline() {
        let doc = json!({
            "interest_over_time": {
                "timeline_data": [
                    {"date": "Jan 1, 2024", "timestamp": "1704067200",
                     "values": [{"query": "eth", "value": "55", "extracted_value": 55}]}
                ]
            }
        });
        match TimeseriesPayload::from_commercial(&doc).unwrap() {
            TimeseriesPayload::Timeline(entries) => assert_eq!(entries[0].first_value(), 55.0),
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn classifies_flat_records() {
        let doc = json!({"interest_over_time": [{"date": "2024-01-01", "value": 3}]});
        assert!(matches!(
            TimeseriesPayload::from_commercial(&doc).unwrap(),
            TimeseriesPayload::Records(_)
        ));
    }

    #[test]
    fn unknown_shape_is_rejected() {
        let doc = json!({"search_metadata": {"status": "Success"}});
        assert!(matches!(
            TimeseriesPayload::from_commercial(&doc),
            Err(NormalizeError::UnknownShape(_))
        ));
    }
}
