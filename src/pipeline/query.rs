//! Query engine - read-side composition over a `TrendStore`
//!
//! Unknown tags are never an error here: they produce empty series and
//! zero counts. The only error a query surfaces is the store being
//! unavailable.
//!
//! `hourly_trend` results are memoized in a `TrendCache` owned by the
//! engine. The cache is time-bounded and is invalidated by the scheduler
//! after every ingestion cycle that reaches completion.

use super::bucket::{hours_back, BUCKET_SECONDS};
use super::error::StoreError;
use super::store::{sort_by_count_desc, TrendStore};
use super::types::{Item, TrendSeries};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tag -> series, ordered by tag for stable serialization
pub type TrendMap = BTreeMap<String, TrendSeries>;

type CacheKey = (Vec<String>, u32);

/// Time-bounded memoization of hourly trend snapshots
///
/// Every `invalidate` bumps a generation. A result computed under an older
/// generation is never stored, so a read that straddles an ingestion cannot
/// repopulate the cache with pre-ingestion data.
pub struct TrendCache {
    ttl: Duration,
    generation: AtomicU64,
    entries: Mutex<HashMap<CacheKey, (Instant, TrendMap)>>,
}

impl TrendCache {
    /// A zero `ttl` disables caching
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            generation: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(tags: &[String], hours: u32) -> CacheKey {
        let mut tags = tags.to_vec();
        tags.sort();
        tags.dedup();
        (tags, hours)
    }

    fn get(&self, key: &CacheKey) -> Option<TrendMap> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Store `value` if no invalidation happened since `generation` was read
    fn put(&self, key: CacheKey, value: TrendMap, generation: u64) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        entries.insert(key, (Instant::now(), value));
        true
    }

    pub fn invalidate(&self) {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-side API used by presentation and push collaborators
pub struct QueryEngine {
    store: Arc<dyn TrendStore>,
    cache: TrendCache,

    /// Timestamp function (for testing with mock time)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl QueryEngine {
    /// Create a query engine using system time
    pub fn new(store: Arc<dyn TrendStore>, cache_ttl: Duration) -> Self {
        Self::new_with_timestamp_fn(store, cache_ttl, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Create a query engine with a custom timestamp function
    pub fn new_with_timestamp_fn(
        store: Arc<dyn TrendStore>,
        cache_ttl: Duration,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            store,
            cache: TrendCache::new(cache_ttl),
            now_fn,
        }
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }

    pub fn cache(&self) -> &TrendCache {
        &self.cache
    }

    /// Drop every memoized snapshot (called after ingestion completes)
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    /// First `limit` tags by cumulative count, ties by name
    pub fn top_tags(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .tag_distribution(limit)?
            .into_iter()
            .map(|(tag, _)| tag)
            .collect())
    }

    /// Top `limit` tags with their cumulative counts
    pub fn tag_distribution(&self, limit: usize) -> Result<Vec<(String, u64)>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut ranked = self.store.tags_by_count_desc()?;
        ranked.truncate(limit);
        Ok(ranked)
    }

    pub fn tag_trend(&self, tag: &str, start: i64, end: i64) -> Result<TrendSeries, StoreError> {
        Ok(TrendSeries {
            tag: tag.to_string(),
            points: self.store.buckets_in_range(tag, start, end)?,
        })
    }

    /// Trend over the last `days` days
    pub fn tag_trend_days(&self, tag: &str, days: u32) -> Result<TrendSeries, StoreError> {
        let now = self.now();
        let start = hours_back(now, days.saturating_mul(24));
        self.tag_trend(tag, start, now)
    }

    /// One series per requested tag; tags without data map to empty series
    pub fn multi_tag_trend(&self, tags: &[String], start: i64, end: i64) -> Result<TrendMap, StoreError> {
        let mut result = TrendMap::new();
        for tag in tags {
            if !result.contains_key(tag) {
                result.insert(tag.clone(), self.tag_trend(tag, start, end)?);
            }
        }
        Ok(result)
    }

    /// `multi_tag_trend` over `[now - hours * 3600, now]`, memoized
    pub fn hourly_trend(&self, tags: &[String], hours: u32) -> Result<TrendMap, StoreError> {
        let key = TrendCache::key(tags, hours);
        if let Some(cached) = self.cache.get(&key) {
            log::debug!("Trend cache hit ({} tags, {}h)", key.0.len(), hours);
            return Ok(cached);
        }

        let generation = self.cache.generation();
        let now = self.now();
        let trends = self.multi_tag_trend(tags, hours_back(now, hours), now)?;
        if !self.cache.put(key, trends.clone(), generation) {
            log::debug!("Trend snapshot not cached, invalidated while computing");
        }
        Ok(trends)
    }

    /// Ranking by in-window bucket total instead of all-time count
    ///
    /// Tags with nothing inside the window are left out.
    pub fn windowed_top_tags(&self, limit: usize, start: i64, end: i64) -> Result<Vec<(String, u64)>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut ranked = Vec::new();
        for (tag, _) in self.store.tags_by_count_desc()? {
            let total: u64 = self
                .store
                .buckets_in_range(&tag, start, end)?
                .iter()
                .map(|p| p.count)
                .sum();
            if total > 0 {
                ranked.push((tag, total));
            }
        }

        sort_by_count_desc(&mut ranked);
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Windowed ranking over the last `hours` hours
    pub fn top_tags_last_hours(&self, limit: usize, hours: u32) -> Result<Vec<(String, u64)>, StoreError> {
        let now = self.now();
        // Include the bucket containing the window start
        let start = hours_back(now, hours).saturating_sub(BUCKET_SECONDS - 1);
        self.windowed_top_tags(limit, start, now)
    }

    pub fn questions_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Item>, StoreError> {
        self.store.questions_by_tag(tag, limit)
    }

    /// `None` for identifiers never ingested
    pub fn question(&self, id: &str) -> Result<Option<Item>, StoreError> {
        self.store.question(id)
    }
}
