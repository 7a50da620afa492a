//! Trend store contract and the in-memory implementation
//!
//! A store holds, per tag, a cumulative counter and a sparse map of
//! hour-bucket -> count. Both are updated under the same per-tag lock, so
//! readers always see `sum(buckets) == cumulative_count` for a tag.
//!
//! ## Concurrency
//!
//! - Writes to one tag serialize on that tag's mutex
//! - Writes to different tags proceed in parallel
//! - The tag index is behind an `RwLock` that is only write-locked when a
//!   tag is seen for the first time
//! - Cross-tag reads (ranking) are not a consistent snapshot

use super::bucket::bucket_key;
use super::error::StoreError;
use super::types::{ApplyOutcome, Item, TimePoint};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Ingestion ledger hook
///
/// The set of item identifiers already applied to the store. Stores never
/// evict on their own; retention is driven from outside through these calls.
pub trait IngestionLedger: Send + Sync {
    /// Number of identifiers currently recorded
    fn ledger_len(&self) -> Result<usize, StoreError>;

    fn contains_identifier(&self, id: &str) -> Result<bool, StoreError>;

    /// Forget the given identifiers. Returns how many were present.
    fn retire_identifiers(&self, ids: &[String]) -> Result<usize, StoreError>;

    /// Forget every identifier whose item was created before `cutoff`
    fn retire_applied_before(&self, cutoff: i64) -> Result<usize, StoreError>;
}

/// Tag -> (cumulative count, hourly buckets) store
pub trait TrendStore: IngestionLedger {
    /// Add one occurrence of `tag` at `timestamp` (counter and bucket together)
    fn record_occurrence(&self, tag: &str, timestamp: i64) -> Result<(), StoreError>;

    /// Apply every tag of `item` and record its identifier, as one unit
    ///
    /// Returns `Duplicate` without touching any counter if the identifier is
    /// already recorded or currently being applied by another caller. On
    /// error nothing of the item is visible and the identifier stays
    /// unrecorded.
    fn apply_item(&self, item: &Item) -> Result<ApplyOutcome, StoreError>;

    /// 0 for unknown tags
    fn cumulative_count(&self, tag: &str) -> Result<u64, StoreError>;

    /// Buckets with `start <= key <= end`, ascending; empty for unknown tags
    fn buckets_in_range(&self, tag: &str, start: i64, end: i64) -> Result<Vec<TimePoint>, StoreError>;

    /// Every tag with its count, see [`sort_by_count_desc`]
    fn tags_by_count_desc(&self) -> Result<Vec<(String, u64)>, StoreError>;

    /// Stored items carrying `tag`, newest first
    fn questions_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Item>, StoreError>;

    /// The stored item with identifier `id`, if it was ever applied
    fn question(&self, id: &str) -> Result<Option<Item>, StoreError>;
}

/// Count descending, then tag name ascending
pub fn sort_by_count_desc(entries: &mut [(String, u64)]) {
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

#[derive(Debug, Default)]
struct TagRecord {
    cumulative_count: u64,
    buckets: BTreeMap<i64, u64>,
}

#[derive(Debug, Default)]
struct LedgerState {
    /// item id -> item creation date
    applied: HashMap<String, i64>,
    in_flight: HashSet<String>,
}

/// In-process `TrendStore`
#[derive(Default)]
pub struct MemoryTrendStore {
    tags: RwLock<HashMap<String, Arc<Mutex<TagRecord>>>>,
    ledger: Mutex<LedgerState>,
    questions: RwLock<HashMap<String, Item>>,
}

impl MemoryTrendStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.read().len()
    }

    fn record(&self, tag: &str) -> Arc<Mutex<TagRecord>> {
        if let Some(record) = self.tags.read().get(tag) {
            return record.clone();
        }

        let mut tags = self.tags.write();
        tags.entry(tag.to_string()).or_default().clone()
    }

    fn increment(&self, tag: &str, timestamp: i64) {
        bump(&self.record(tag), timestamp);
    }

    /// Claim `item.id` for application; `None` if applied or in flight
    fn reserve<'a>(&'a self, item: &'a Item) -> Option<Reservation<'a>> {
        let mut ledger = self.ledger.lock();
        if ledger.applied.contains_key(&item.id) || !ledger.in_flight.insert(item.id.clone()) {
            return None;
        }
        Some(Reservation {
            ledger: &self.ledger,
            id: &item.id,
            creation_date: item.creation_date,
            committed: false,
        })
    }
}

fn bump(record: &Mutex<TagRecord>, timestamp: i64) {
    let mut record = record.lock();
    record.cumulative_count = record.cumulative_count.saturating_add(1);
    let bucket = record.buckets.entry(bucket_key(timestamp)).or_insert(0);
    *bucket = bucket.saturating_add(1);
}

/// In-flight claim on an identifier
///
/// Released on drop unless committed, so an unwinding apply leaves the
/// item retryable instead of a permanent duplicate.
struct Reservation<'a> {
    ledger: &'a Mutex<LedgerState>,
    id: &'a str,
    creation_date: i64,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        let mut ledger = self.ledger.lock();
        ledger.in_flight.remove(self.id);
        ledger.applied.insert(self.id.to_string(), self.creation_date);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ledger.lock().in_flight.remove(self.id);
        }
    }
}

impl IngestionLedger for MemoryTrendStore {
    fn ledger_len(&self) -> Result<usize, StoreError> {
        Ok(self.ledger.lock().applied.len())
    }

    fn contains_identifier(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.ledger.lock().applied.contains_key(id))
    }

    fn retire_identifiers(&self, ids: &[String]) -> Result<usize, StoreError> {
        let mut ledger = self.ledger.lock();
        Ok(ids
            .iter()
            .filter(|id| ledger.applied.remove(id.as_str()).is_some())
            .count())
    }

    fn retire_applied_before(&self, cutoff: i64) -> Result<usize, StoreError> {
        let mut ledger = self.ledger.lock();
        let before = ledger.applied.len();
        ledger.applied.retain(|_, created| *created >= cutoff);
        Ok(before - ledger.applied.len())
    }
}

impl TrendStore for MemoryTrendStore {
    fn record_occurrence(&self, tag: &str, timestamp: i64) -> Result<(), StoreError> {
        self.increment(tag, timestamp);
        Ok(())
    }

    fn apply_item(&self, item: &Item) -> Result<ApplyOutcome, StoreError> {
        let Some(reservation) = self.reserve(item) else {
            return Ok(ApplyOutcome::Duplicate);
        };

        // Everything that allocates happens before the first increment
        let records: Vec<_> = item.tags.iter().map(|tag| self.record(tag)).collect();
        let stored = item.clone();

        for record in &records {
            bump(record, item.creation_date);
        }
        self.questions.write().insert(stored.id.clone(), stored);
        reservation.commit();

        Ok(ApplyOutcome::Applied)
    }

    fn cumulative_count(&self, tag: &str) -> Result<u64, StoreError> {
        let record = self.tags.read().get(tag).cloned();
        Ok(record.map(|r| r.lock().cumulative_count).unwrap_or(0))
    }

    fn buckets_in_range(&self, tag: &str, start: i64, end: i64) -> Result<Vec<TimePoint>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }

        let Some(record) = self.tags.read().get(tag).cloned() else {
            return Ok(Vec::new());
        };

        let record = record.lock();
        Ok(record
            .buckets
            .range(start..=end)
            .map(|(&timestamp, &count)| TimePoint { timestamp, count })
            .collect())
    }

    fn tags_by_count_desc(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let records: Vec<(String, Arc<Mutex<TagRecord>>)> = self
            .tags
            .read()
            .iter()
            .map(|(tag, record)| (tag.clone(), record.clone()))
            .collect();

        let mut entries: Vec<(String, u64)> = records
            .into_iter()
            .map(|(tag, record)| {
                let count = record.lock().cumulative_count;
                (tag, count)
            })
            .collect();

        sort_by_count_desc(&mut entries);
        Ok(entries)
    }

    fn questions_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Item>, StoreError> {
        let mut matches: Vec<Item> = self
            .questions
            .read()
            .values()
            .filter(|item| item.tags.contains(tag))
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            b.creation_date
                .cmp(&a.creation_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    fn question(&self, id: &str) -> Result<Option<Item>, StoreError> {
        Ok(self.questions.read().get(id).cloned())
    }
}
