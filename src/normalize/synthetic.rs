//! Synthetic stand-in data used once every upstream tier is exhausted.
//!
//! Series are random walks bounded to `[5, 100]`; geo scores are uniform in
//! `[20, 100]`. Everything produced here is tagged as fallback data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;

use crate::types::{GeoValue, TrendPoint};

use super::timeframe::{Timeframe, TimeframeError};
use super::{iso, sort_by_peak};

const WALK_FLOOR: f64 = 5.0;
const WALK_CEILING: f64 = 100.0;
const GEO_FLOOR: f64 = 20.0;
const GEO_CEILING: f64 = 100.0;
const NOISE_STD_DEV: f64 = 4.0;
const MAX_SLOPE: f64 = 0.6;

const INDIA_REGIONS: [&str; 10] = [
    "Maharashtra",
    "Karnataka",
    "Tamil Nadu",
    "Delhi",
    "Telangana",
    "Gujarat",
    "West Bengal",
    "Uttar Pradesh",
    "Kerala",
    "Rajasthan",
];

const US_REGIONS: [&str; 10] = [
    "California",
    "Texas",
    "New York",
    "Florida",
    "Illinois",
    "Pennsylvania",
    "Ohio",
    "Georgia",
    "Washington",
    "Massachusetts",
];

const GENERIC_REGIONS: [&str; 10] = [
    "United States",
    "India",
    "United Kingdom",
    "Canada",
    "Australia",
    "Germany",
    "France",
    "Brazil",
    "Japan",
    "Singapore",
];

const INDIA_CITIES: [&str; 10] = [
    "Mumbai",
    "Bengaluru",
    "New Delhi",
    "Hyderabad",
    "Chennai",
    "Pune",
    "Kolkata",
    "Ahmedabad",
    "Jaipur",
    "Kochi",
];

const US_CITIES: [&str; 10] = [
    "New York",
    "Los Angeles",
    "Chicago",
    "Houston",
    "San Francisco",
    "Seattle",
    "Boston",
    "Austin",
    "Miami",
    "Denver",
];

const GENERIC_CITIES: [&str; 10] = [
    "London",
    "New York",
    "Tokyo",
    "Singapore",
    "Sydney",
    "Toronto",
    "Berlin",
    "Paris",
    "Mumbai",
    "Sao Paulo",
];

/// Generated data with its fallback marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesized<T> {
    pub data: T,
    pub is_fallback: bool,
}

impl<T> Synthesized<T> {
    fn fallback(data: T) -> Self {
        Self {
            data,
            is_fallback: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("cannot derive a date range: {0}")]
    Timeframe(#[from] TimeframeError),
    #[error("no keywords to synthesise data for")]
    NoKeywords,
}

pub fn synth_timeseries(
    keywords: &[String],
    timeframe: &str,
) -> Result<Synthesized<Vec<TrendPoint>>, SynthesisError> {
    synth_timeseries_with(&mut rand::thread_rng(), keywords, timeframe, Utc::now())
}

/// Seedable variant of [`synth_timeseries`].
pub fn synth_timeseries_with<R: Rng + ?Sized>(
    rng: &mut R,
    keywords: &[String],
    timeframe: &str,
    now: DateTime<Utc>,
) -> Result<Synthesized<Vec<TrendPoint>>, SynthesisError> {
    if keywords.is_empty() {
        return Err(SynthesisError::NoKeywords);
    }

    let dates = timeframe.parse::<Timeframe>()?.sample_dates(now)?;
    let walks: Vec<(String, Vec<f64>)> = keywords
        .iter()
        .map(|keyword| (keyword.clone(), random_walk(&mut *rng, dates.len())))
        .collect();

    let points = dates
        .iter()
        .enumerate()
        .map(|(idx, date)| TrendPoint {
            date: iso(date),
            values: walks
                .iter()
                .map(|(keyword, walk)| (keyword.clone(), walk[idx]))
                .collect(),
        })
        .collect();

    Ok(Synthesized::fallback(points))
}

pub fn synth_geo(keywords: &[String], geo: &str) -> Synthesized<Vec<GeoValue>> {
    synth_geo_with(&mut rand::thread_rng(), keywords, geo)
}

pub fn synth_geo_with<R: Rng + ?Sized>(
    rng: &mut R,
    keywords: &[String],
    geo: &str,
) -> Synthesized<Vec<GeoValue>> {
    let names = match geo.to_ascii_uppercase().as_str() {
        "IN" => &INDIA_REGIONS,
        "US" => &US_REGIONS,
        _ => &GENERIC_REGIONS,
    };
    Synthesized::fallback(scored_places(rng, names, keywords))
}

pub fn synth_cities(keywords: &[String], geo: &str) -> Synthesized<Vec<GeoValue>> {
    synth_cities_with(&mut rand::thread_rng(), keywords, geo)
}

pub fn synth_cities_with<R: Rng + ?Sized>(
    rng: &mut R,
    keywords: &[String],
    geo: &str,
) -> Synthesized<Vec<GeoValue>> {
    let names = match geo.to_ascii_uppercase().as_str() {
        "IN" => &INDIA_CITIES,
        "US" => &US_CITIES,
        _ => &GENERIC_CITIES,
    };
    Synthesized::fallback(scored_places(rng, names, keywords))
}

fn scored_places<R: Rng + ?Sized>(
    rng: &mut R,
    names: &[&str; 10],
    keywords: &[String],
) -> Vec<GeoValue> {
    let mut places: Vec<GeoValue> = names
        .iter()
        .map(|name| GeoValue {
            geo_name: name.to_string(),
            values: keywords
                .iter()
                .map(|keyword| (keyword.clone(), rng.gen_range(GEO_FLOOR..=GEO_CEILING).round()))
                .collect::<BTreeMap<_, _>>(),
        })
        .collect();
    sort_by_peak(&mut places);
    places
}

fn random_walk<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Vec<f64> {
    let mut value: f64 = rng.gen_range(30.0..=70.0);
    let slope: f64 = rng.gen_range(-MAX_SLOPE..=MAX_SLOPE);
    let mut walk = Vec::with_capacity(len);
    for _ in 0..len {
        walk.push(value.round().clamp(WALK_FLOOR, WALK_CEILING));
        value = (value + slope + gaussian(rng) * NOISE_STD_DEV).clamp(WALK_FLOOR, WALK_CEILING);
    }
    walk
}

/// Standard normal sample via Box-Muller.
fn gaussian<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.r#gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn keywords(list: &[&str]) -> Vec<String> {
        list.iter().map(|kw| kw.to_string()).collect()
    }

    #[test]
    fn one_year_is_twelve_bounded_points() {
        let mut rng = StdRng::seed_from_u64(42);
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let series = synth_timeseries_with(&mut rng, &keywords(&["Doge"]), "today 1-y", now).unwrap();
        assert!(series.is_fallback);
        assert_eq!(series.data.len(), 12);
        for point in &series.data {
            let value = point.values["Doge"];
            assert!((WALK_FLOOR..=WALK_CEILING).contains(&value));
        }
        assert!(series.data.windows(2).all(|pair| pair[0].date <= pair[1].date));
    }

    #[test]
    fn every_keyword_gets_a_field() {
        let mut rng = StdRng::seed_from_u64(3);
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let series =
            synth_timeseries_with(&mut rng, &keywords(&["a", "b", "c"]), "now 7-d", now).unwrap();
        assert_eq!(series.data.len(), 7);
        assert!(series.data.iter().all(|point| point.values.len() == 3));
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let kws = keywords(&["x"]);
        let first = synth_timeseries_with(&mut StdRng::seed_from_u64(9), &kws, "today 3-m", now).unwrap();
        let second = synth_timeseries_with(&mut StdRng::seed_from_u64(9), &kws, "today 3-m", now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unparseable_timeframe_fails() {
        assert!(matches!(
            synth_timeseries(&keywords(&["x"]), "someday"),
            Err(SynthesisError::Timeframe(_))
        ));
    }

    #[test]
    fn geo_lists_are_region_specific() {
        let mut rng = StdRng::seed_from_u64(1);
        let india = synth_geo_with(&mut rng, &keywords(&["a"]), "IN");
        assert_eq!(india.data.len(), 10);
        assert!(india.data.iter().any(|region| region.geo_name == "Kerala"));
        let us = synth_geo_with(&mut rng, &keywords(&["a"]), "us");
        assert!(us.data.iter().any(|region| region.geo_name == "Texas"));
        let other = synth_geo_with(&mut rng, &keywords(&["a", "b"]), "FR");
        for region in &other.data {
            assert!(region.values.values().all(|v| (GEO_FLOOR..=GEO_CEILING).contains(v)));
        }
        assert!(other.data.windows(2).all(|pair| pair[0].peak() >= pair[1].peak()));
    }
}
