//! Upstream data sources: the public Google Trends API and the commercial
//! fallback.

pub mod commercial;
pub mod google;
pub mod types;

pub use commercial::{CommercialClient, DataType};
pub use google::{GoogleTrendsClient, Resolution, TrendsQuery};
pub use types::{ErrorKind, FetchError, UpstreamResponse};
