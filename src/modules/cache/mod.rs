//! Two-tier result cache.
//!
//! Keys are `<namespace>_<md5 hex>` over the normalised request. Lookups
//! consult an in-process map first, then one JSON file per key under the
//! cache directory; a fresh file hit is promoted into memory. Entries older
//! than the TTL are ignored. File-tier I/O errors are logged and treated as
//! misses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::types::{QueryOptions, TrendsRequest, TrendsResult};

pub const DEFAULT_NAMESPACE: &str = "trends";
pub const DEFAULT_CACHE_DIR: &str = "./trends_cache";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub namespace: String,
    pub ttl: Duration,
    /// File tier location; `None` keeps the cache in memory only.
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: Duration::from_secs(24 * 60 * 60),
            directory: Some(PathBuf::from(DEFAULT_CACHE_DIR)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(namespace: &str, request: &TrendsRequest) -> Self {
        Self::from_parts(
            namespace,
            &request.keywords,
            &request.timeframe,
            &request.geo,
            &request.options,
        )
    }

    /// Keywords are trimmed, lowercased, sorted and deduplicated for keying
    /// only.
    pub fn from_parts(
        namespace: &str,
        keywords: &[String],
        timeframe: &str,
        geo: &str,
        options: &QueryOptions,
    ) -> Self {
        let mut normalized: Vec<String> = keywords
            .iter()
            .map(|keyword| keyword.trim().to_lowercase())
            .filter(|keyword| !keyword.is_empty())
            .collect();
        normalized.sort();
        normalized.dedup();

        let material = format!(
            "{}|{}|{}|{}",
            normalized.join(","),
            timeframe.trim(),
            geo.trim().to_ascii_uppercase(),
            options.bits()
        );
        CacheKey(format!("{namespace}_{:x}", md5::compute(material.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct TrendsCache {
    config: CacheConfig,
    memory: Mutex<HashMap<CacheKey, TrendsResult>>,
}

impl TrendsCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(CacheConfig {
            directory: None,
            ..CacheConfig::default()
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key(&self, request: &TrendsRequest) -> CacheKey {
        CacheKey::for_request(&self.config.namespace, request)
    }

    pub fn path_for(&self, key: &CacheKey) -> Option<PathBuf> {
        self.config
            .directory
            .as_ref()
            .map(|dir| dir.join(key.file_name()))
    }

    pub async fn lookup(&self, request: &TrendsRequest) -> Option<TrendsResult> {
        let key = self.key(request);

        if let Some(result) = self.memory_get(&key) {
            if is_fresh(&result, self.config.ttl) {
                log::debug!("cache hit (memory) {key}");
                return Some(result);
            }
            self.memory_remove(&key);
        }

        let path = self.path_for(&key)?;
        let result = read_entry(&path).await?;
        if !is_fresh(&result, self.config.ttl) {
            log::debug!("cache entry {key} is stale");
            return None;
        }
        let stored_key = CacheKey::from_parts(
            &self.config.namespace,
            &result.metadata.keywords,
            &result.metadata.timeframe,
            &result.metadata.geo,
            &request.options,
        );
        if stored_key != key {
            log::warn!("cache file {} does not match its key; ignoring", path.display());
            return None;
        }

        log::debug!("cache hit (file) {key}");
        self.memory_put(key, result.clone());
        Some(result)
    }

    /// Write a result through both tiers. Only successful results without a
    /// fallback warning are kept; returns whether the result was stored.
    pub async fn store(&self, request: &TrendsRequest, result: &TrendsResult) -> bool {
        if !result.is_success() || result.is_synthetic() {
            return false;
        }
        let key = self.key(request);
        self.memory_put(key.clone(), result.clone());

        if let Some(path) = self.path_for(&key) {
            write_entry(&path, result).await;
        }
        true
    }

    pub async fn contains(&self, request: &TrendsRequest) -> bool {
        self.lookup(request).await.is_some()
    }

    pub fn clear_memory(&self) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.clear();
        }
    }

    fn memory_get(&self, key: &CacheKey) -> Option<TrendsResult> {
        self.memory.lock().ok()?.get(key).cloned()
    }

    /// Inserting also drops every other stale entry.
    fn memory_put(&self, key: CacheKey, result: TrendsResult) {
        let ttl = self.config.ttl;
        if let Ok(mut memory) = self.memory.lock() {
            memory.retain(|_, cached| is_fresh(cached, ttl));
            memory.insert(key, result);
        }
    }

    fn memory_remove(&self, key: &CacheKey) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.remove(key);
        }
    }
}

fn is_fresh(result: &TrendsResult, ttl: Duration) -> bool {
    let age = Utc::now().signed_duration_since(result.metadata.timestamp);
    age.to_std().map(|age| age <= ttl).unwrap_or(true)
}

async fn read_entry(path: &Path) -> Option<TrendsResult> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            log::warn!("cache read {} failed: {err}", path.display());
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(result) => Some(result),
        Err(err) => {
            log::warn!("cache file {} is corrupt: {err}", path.display());
            None
        }
    }
}

async fn write_entry(path: &Path, result: &TrendsResult) {
    let body = match serde_json::to_vec_pretty(result) {
        Ok(body) => body,
        Err(err) => {
            log::warn!("cache serialisation failed: {err}");
            return;
        }
    };
    if let Some(parent) = path.parent()
        && let Err(err) = tokio::fs::create_dir_all(parent).await
    {
        log::warn!("cache directory {} unavailable: {err}", parent.display());
        return;
    }
    if let Err(err) = tokio::fs::write(path, body).await {
        log::warn!("cache write {} failed: {err}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, TrendPoint, TrendsData};
    use std::collections::BTreeMap;

    fn request(keywords: &[&str]) -> TrendsRequest {
        TrendsRequest::new(keywords.to_vec())
            .with_timeframe("today 1-m")
            .with_geo("IN")
    }

    fn success(request: &TrendsRequest) -> TrendsResult {
        let data = TrendsData {
            time_trends: vec![TrendPoint {
                date: "2024-01-01T00:00:00Z".into(),
                values: BTreeMap::from([("Bitcoin".to_string(), 50.0)]),
            }],
            ..TrendsData::default()
        };
        TrendsResult::success(Metadata::for_request(request), data, Vec::new())
    }

    fn disk_cache(dir: &Path) -> TrendsCache {
        TrendsCache::new(CacheConfig {
            directory: Some(dir.to_path_buf()),
            ..CacheConfig::default()
        })
    }

    #[test]
    fn key_ignores_keyword_order_and_case() {
        let a = CacheKey::for_request("trends", &request(&["Bitcoin", " eth "]));
        let b = CacheKey::for_request("trends", &request(&["ETH", "bitcoin", "eth"]));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("trends_"));
        assert_eq!(a.as_str().len(), "trends_".len() + 32);

        let other = CacheKey::for_request(
            "trends",
            &request(&["Bitcoin", "eth"]).with_options(QueryOptions::all()),
        );
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn file_hits_are_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(&["Bitcoin"]);
        let result = success(&req);

        assert!(disk_cache(dir.path()).store(&req, &result).await);
        let key = CacheKey::for_request("trends", &req);
        assert!(dir.path().join(key.file_name()).exists());

        let fresh = disk_cache(dir.path());
        assert_eq!(fresh.lookup(&req).await, Some(result.clone()));
        std::fs::remove_file(dir.path().join(key.file_name())).unwrap();
        assert_eq!(fresh.lookup(&req).await, Some(result));
    }

    #[tokio::test]
    async fn synthetic_and_error_results_are_not_stored() {
        let cache = TrendsCache::in_memory();
        let req = request(&["Doge"]);
        let mut synthetic = success(&req);
        synthetic.metadata.warning = Some(crate::types::FALLBACK_WARNING.into());
        assert!(!cache.store(&req, &synthetic).await);

        let failed = TrendsResult::error(Metadata::for_request(&req), vec!["boom".into()]);
        assert!(!cache.store(&req, &failed).await);
        assert!(!cache.contains(&req).await);
    }

    #[tokio::test]
    async fn stale_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path());
        let req = request(&["Bitcoin"]);
        let mut result = success(&req);
        result.metadata.timestamp = Utc::now() - chrono::Duration::hours(25);
        cache.store(&req, &result).await;
        assert!(cache.lookup(&req).await.is_none());
    }

    #[tokio::test]
    async fn storing_evicts_stale_memory_entries() {
        let cache = TrendsCache::in_memory();
        let old = request(&["Bitcoin"]);
        let mut expired = success(&old);
        expired.metadata.timestamp = Utc::now() - chrono::Duration::hours(25);
        cache.store(&old, &expired).await;
        assert_eq!(cache.memory.lock().unwrap().len(), 1);

        let new = request(&["Ethereum"]);
        cache.store(&new, &success(&new)).await;
        let memory = cache.memory.lock().unwrap();
        assert_eq!(memory.len(), 1);
        assert!(memory.contains_key(&cache.key(&new)));
    }

    #[tokio::test]
    async fn corrupt_files_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache(dir.path());
        let req = request(&["Bitcoin"]);
        let key = cache.key(&req);
        std::fs::write(dir.path().join(key.file_name()), b"{not json").unwrap();
        assert!(cache.lookup(&req).await.is_none());
    }
}
