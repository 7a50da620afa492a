//! Pipeline ingestion - applies fetched batches to the trend store
//!
//! This is the idempotence boundary. Per item:
//! 1. Validate (missing identifier or tags => failed, batch continues)
//! 2. Ledger lookup; already seen => duplicate, store untouched
//! 3. `apply_item` applies every tag increment and records the identifier
//!    as one unit; a store failure leaves the item retryable
//! 4. A panicking store is reported as `Unknown`; stores must leave nothing
//!    of the item applied when they unwind
//!
//! No single item's failure aborts the rest of the batch.

use super::error::ItemError;
use super::store::TrendStore;
use super::types::{ApplyOutcome, IngestResult, Item};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Reject items the store must never see
pub fn validate_item(item: &Item) -> Result<(), ItemError> {
    if item.id.trim().is_empty() {
        return Err(ItemError::Malformed("missing identifier".to_string()));
    }
    if item.tags.is_empty() {
        return Err(ItemError::Malformed(format!("item {} has no tags", item.id)));
    }
    if item.tags.iter().any(|t| t.is_empty()) {
        return Err(ItemError::Malformed(format!("item {} has an empty tag", item.id)));
    }
    Ok(())
}

/// Applies batches of items to a shared store
///
/// Safe to call concurrently; duplicate identifiers racing across calls are
/// resolved by the store's `apply_item`.
pub struct IngestionPipeline {
    store: Arc<dyn TrendStore>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn TrendStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TrendStore> {
        &self.store
    }

    /// Ingest a batch, returning accepted/duplicate/failed counts
    pub fn ingest(&self, items: &[Item]) -> IngestResult {
        let started = Instant::now();
        let mut result = IngestResult::default();

        for item in items {
            match self.ingest_item(item) {
                Ok(ApplyOutcome::Applied) => result.accepted += 1,
                Ok(ApplyOutcome::Duplicate) => {
                    log::debug!("Skipping already-ingested item {}", item.id);
                    result.duplicates += 1;
                }
                Err(ItemError::Malformed(reason)) => {
                    log::warn!("⚠️  Malformed item skipped: {}", reason);
                    result.failed += 1;
                }
                Err(ItemError::Store(e)) => {
                    log::warn!("⚠️  Item {} not applied, will retry next cycle: {}", item.id, e);
                    result.failed += 1;
                }
                Err(ItemError::Unknown(e)) => {
                    log::error!("❌ Item {} failed: {}", item.id, e);
                    result.failed += 1;
                }
            }
        }

        log::info!(
            "📥 Ingested batch: {} accepted, {} duplicates, {} failed | {}ms",
            result.accepted,
            result.duplicates,
            result.failed,
            started.elapsed().as_millis()
        );

        result
    }

    fn ingest_item(&self, item: &Item) -> Result<ApplyOutcome, ItemError> {
        validate_item(item)?;

        if self.store.contains_identifier(&item.id)? {
            return Ok(ApplyOutcome::Duplicate);
        }

        match catch_unwind(AssertUnwindSafe(|| self.store.apply_item(item))) {
            Ok(outcome) => Ok(outcome?),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "store panicked".to_string());
                Err(ItemError::Unknown(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::StoreError;
    use crate::pipeline::store::{IngestionLedger, MemoryTrendStore};
    use crate::pipeline::types::TimePoint;

    /// Store that refuses items carrying a given tag
    struct FlakyStore {
        inner: MemoryTrendStore,
        broken_tag: &'static str,
    }

    impl IngestionLedger for FlakyStore {
        fn ledger_len(&self) -> Result<usize, StoreError> {
            self.inner.ledger_len()
        }
        fn contains_identifier(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.contains_identifier(id)
        }
        fn retire_identifiers(&self, ids: &[String]) -> Result<usize, StoreError> {
            self.inner.retire_identifiers(ids)
        }
        fn retire_applied_before(&self, cutoff: i64) -> Result<usize, StoreError> {
            self.inner.retire_applied_before(cutoff)
        }
    }

    impl TrendStore for FlakyStore {
        fn record_occurrence(&self, tag: &str, timestamp: i64) -> Result<(), StoreError> {
            self.inner.record_occurrence(tag, timestamp)
        }
        fn apply_item(&self, item: &Item) -> Result<ApplyOutcome, StoreError> {
            if item.tags.contains(self.broken_tag) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            if item.tags.contains("panics") {
                panic!("driver bug on item {}", item.id);
            }
            self.inner.apply_item(item)
        }
        fn cumulative_count(&self, tag: &str) -> Result<u64, StoreError> {
            self.inner.cumulative_count(tag)
        }
        fn buckets_in_range(&self, tag: &str, start: i64, end: i64) -> Result<Vec<TimePoint>, StoreError> {
            self.inner.buckets_in_range(tag, start, end)
        }
        fn tags_by_count_desc(&self) -> Result<Vec<(String, u64)>, StoreError> {
            self.inner.tags_by_count_desc()
        }
        fn questions_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Item>, StoreError> {
            self.inner.questions_by_tag(tag, limit)
        }
        fn question(&self, id: &str) -> Result<Option<Item>, StoreError> {
            self.inner.question(id)
        }
    }

    fn memory_pipeline() -> IngestionPipeline {
        IngestionPipeline::new(Arc::new(MemoryTrendStore::new()))
    }

    #[test]
    fn test_ingest_counts_outcomes() {
        let pipeline = memory_pipeline();
        let batch = vec![
            Item::new("1", 100, ["rust"]),
            Item::new("2", 200, ["rust", "go"]),
            Item::new("1", 100, ["rust"]),
        ];

        let result = pipeline.ingest(&batch);
        assert_eq!(
            result,
            IngestResult {
                accepted: 2,
                duplicates: 1,
                failed: 0
            }
        );
        assert_eq!(pipeline.store().cumulative_count("rust").unwrap(), 2);
    }

    #[test]
    fn test_reingest_same_batch_is_noop() {
        let pipeline = memory_pipeline();
        let batch = vec![
            Item::new("a", 3700, ["go"]),
            Item::new("b", 9000, ["go", "rust"]),
        ];

        pipeline.ingest(&batch);
        let before = pipeline.store().buckets_in_range("go", 0, 100_000).unwrap();

        let second = pipeline.ingest(&batch);
        assert_eq!(second.accepted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(pipeline.store().cumulative_count("go").unwrap(), 2);
        assert_eq!(pipeline.store().buckets_in_range("go", 0, 100_000).unwrap(), before);
    }

    #[test]
    fn test_malformed_items_do_not_abort_batch() {
        let pipeline = memory_pipeline();
        let no_tags: [&str; 0] = [];
        let batch = vec![
            Item::new("", 100, ["rust"]),
            Item::new("x", 100, no_tags),
            Item::new("y", 100, [""]),
            Item::new("z", 100, ["rust"]),
        ];

        let result = pipeline.ingest(&batch);
        assert_eq!(result.failed, 3);
        assert_eq!(result.accepted, 1);
        assert_eq!(pipeline.store().cumulative_count("rust").unwrap(), 1);
        assert!(!pipeline.store().contains_identifier("x").unwrap());
    }

    #[test]
    fn test_store_failure_leaves_item_retryable() {
        let store = Arc::new(FlakyStore {
            inner: MemoryTrendStore::new(),
            broken_tag: "flaky",
        });
        let pipeline = IngestionPipeline::new(store.clone());

        let batch = vec![
            Item::new("ok", 100, ["rust"]),
            Item::new("bad", 100, ["rust", "flaky"]),
        ];
        let result = pipeline.ingest(&batch);

        assert_eq!(result.accepted, 1);
        assert_eq!(result.failed, 1);
        assert!(!store.contains_identifier("bad").unwrap());
        assert_eq!(store.cumulative_count("rust").unwrap(), 1);
    }

    #[test]
    fn test_store_panic_counts_as_failed_and_stays_retryable() {
        let store = Arc::new(FlakyStore {
            inner: MemoryTrendStore::new(),
            broken_tag: "flaky",
        });
        let pipeline = IngestionPipeline::new(store.clone());

        let result = pipeline.ingest(&[
            Item::new("before", 100, ["rust"]),
            Item::new("crash", 100, ["rust", "panics"]),
            Item::new("after", 100, ["rust"]),
        ]);

        assert_eq!(result.accepted, 2);
        assert_eq!(result.failed, 1);
        assert!(!store.contains_identifier("crash").unwrap());
        assert_eq!(store.cumulative_count("rust").unwrap(), 2);
    }

    #[test]
    fn test_validate_item() {
        assert!(validate_item(&Item::new("1", 0, ["a"])).is_ok());
        assert!(matches!(
            validate_item(&Item::new("  ", 0, ["a"])),
            Err(ItemError::Malformed(_))
        ));
    }
}
