//! Runtime configuration from environment variables

use super::broadcast::BroadcastSettings;
use super::bucket::BUCKET_SECONDS;
use super::source::SourceSettings;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which `TrendStore` implementation the runtime builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreKind::Memory),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(format!("unknown store kind: {}", other)),
        }
    }
}

/// Configuration for the tagflow runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct TagflowConfig {
    pub store: StoreKind,

    /// Path to SQLite database file
    pub db_path: String,

    /// Ingestion run interval in milliseconds
    pub fetch_interval_ms: u64,

    pub api_url: String,
    pub site: String,
    pub page_size: u32,

    pub broadcast_channel: String,
    pub broadcast_top_n: usize,
    pub broadcast_hours: u32,

    /// 0 disables the hourly-trend cache
    pub trend_cache_ttl_ms: u64,

    /// Ledger entries older than this are retired; 0 keeps them forever
    pub ledger_retention_hours: u64,
}

impl TagflowConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TAGFLOW_STORE` (default: sqlite)
    /// - `TAGFLOW_DB_PATH` (default: data/tagflow.db)
    /// - `FETCH_INTERVAL_MS` (default: 60000)
    /// - `STACKEXCHANGE_API_URL` (default: https://api.stackexchange.com/2.3/questions)
    /// - `STACKEXCHANGE_SITE` (default: stackoverflow)
    /// - `STACKEXCHANGE_PAGESIZE` (default: 100)
    /// - `BROADCAST_CHANNEL` (default: /topic/trends)
    /// - `BROADCAST_TOP_N` (default: 10)
    /// - `BROADCAST_HOURS` (default: 24)
    /// - `TREND_CACHE_TTL_MS` (default: 30000)
    /// - `LEDGER_RETENTION_HOURS` (default: 0)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let source_defaults = SourceSettings::default();
        let broadcast_defaults = BroadcastSettings::default();

        Self {
            store: parse_or(&lookup, "TAGFLOW_STORE", StoreKind::Sqlite),

            db_path: lookup("TAGFLOW_DB_PATH").unwrap_or_else(|| "data/tagflow.db".to_string()),

            fetch_interval_ms: parse_or(&lookup, "FETCH_INTERVAL_MS", 60_000),

            api_url: lookup("STACKEXCHANGE_API_URL").unwrap_or(source_defaults.api_url),
            site: lookup("STACKEXCHANGE_SITE").unwrap_or(source_defaults.site),
            page_size: parse_or(&lookup, "STACKEXCHANGE_PAGESIZE", source_defaults.page_size),

            broadcast_channel: lookup("BROADCAST_CHANNEL").unwrap_or(broadcast_defaults.channel),
            broadcast_top_n: parse_or(&lookup, "BROADCAST_TOP_N", broadcast_defaults.top_n),
            broadcast_hours: parse_or(&lookup, "BROADCAST_HOURS", broadcast_defaults.hours),

            trend_cache_ttl_ms: parse_or(&lookup, "TREND_CACHE_TTL_MS", 30_000),

            ledger_retention_hours: parse_or(&lookup, "LEDGER_RETENTION_HOURS", 0),
        }
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms.max(1))
    }

    pub fn trend_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.trend_cache_ttl_ms)
    }

    /// Ledger retention in seconds; `None` when retention is disabled
    ///
    /// Saturates at `i64::MAX` for absurdly large hour counts.
    pub fn ledger_retention_secs(&self) -> Option<i64> {
        if self.ledger_retention_hours == 0 {
            return None;
        }
        let hours = i64::try_from(self.ledger_retention_hours).unwrap_or(i64::MAX);
        Some(hours.saturating_mul(BUCKET_SECONDS))
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            api_url: self.api_url.clone(),
            site: self.site.clone(),
            page_size: self.page_size,
            ..SourceSettings::default()
        }
    }

    pub fn broadcast_settings(&self) -> BroadcastSettings {
        BroadcastSettings {
            channel: self.broadcast_channel.clone(),
            top_n: self.broadcast_top_n,
            hours: self.broadcast_hours,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}
