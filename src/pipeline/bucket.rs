//! Hour-bucket keying
//!
//! Writes and window filtering both go through `bucket_key`, so a bucket is
//! never split or counted twice.

/// Bucket width in seconds
pub const BUCKET_SECONDS: i64 = 3600;

/// Map a Unix timestamp (seconds) to the start of its hour bucket
///
/// Total for all inputs; negative timestamps round down as well.
pub fn bucket_key(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(BUCKET_SECONDS)
}

/// Window start for "the last `hours` hours" ending at `now`
pub fn hours_back(now: i64, hours: u32) -> i64 {
    now.saturating_sub(i64::from(hours) * BUCKET_SECONDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(bucket_key(0), 0);
        assert_eq!(bucket_key(3599), 0);
        assert_eq!(bucket_key(3600), 3600);
        assert_eq!(bucket_key(3661), 3600);
        assert_eq!(bucket_key(7199), 3600);
        assert_eq!(bucket_key(7200), 7200);
    }

    #[test]
    fn test_bucket_negative_timestamp() {
        assert_eq!(bucket_key(-1), -3600);
        assert_eq!(bucket_key(-3600), -3600);
    }

    #[test]
    fn test_hours_back() {
        assert_eq!(hours_back(100_000, 24), 100_000 - 86_400);
        assert_eq!(hours_back(i64::MIN + 10, 1), i64::MIN);
    }
}
