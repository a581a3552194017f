//! Retry backoff schedule.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule applied when a send attempt fails.
///
/// After the k-th failure the item waits `table[k - 1]`, clamped to `cap`.
/// Failures beyond the table length reuse the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_table_ms")]
    pub table_ms: Vec<u64>,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    /// Retry budget given to new items that do not set their own.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_table_ms() -> Vec<u64> {
    vec![1_000, 5_000, 15_000, 60_000]
}

fn default_cap_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            table_ms: default_table_ms(),
            cap_ms: default_cap_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackoffPolicy {
    /// Policy with no delay between attempts. Useful in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            table_ms: vec![0],
            cap_ms: 0,
            max_retries,
        }
    }

    /// Delay before the next attempt once `failures` attempts have failed.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let idx = failures.saturating_sub(1) as usize;
        let ms = self
            .table_ms
            .get(idx)
            .or_else(|| self.table_ms.last())
            .copied()
            .unwrap_or(self.cap_ms);
        Duration::from_millis(ms.min(self.cap_ms))
    }

    /// Whether an item that has used `retry_count` of `max_retries` may run again.
    pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(5));
        assert_eq!(policy.delay_after(3), Duration::from_secs(15));
        assert_eq!(policy.delay_after(4), Duration::from_secs(60));
        assert_eq!(policy.delay_after(9), Duration::from_secs(60));
    }

    #[test]
    fn test_cap_applies() {
        let policy = BackoffPolicy {
            table_ms: vec![1_000, 600_000],
            cap_ms: 120_000,
            max_retries: 5,
        };
        assert_eq!(policy.delay_after(2), Duration::from_secs(120));
    }

    #[test]
    fn test_empty_table_falls_back_to_cap() {
        let policy = BackoffPolicy {
            table_ms: Vec::new(),
            cap_ms: 2_000,
            max_retries: 1,
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
    }

    #[test]
    fn test_should_retry() {
        assert!(BackoffPolicy::should_retry(0, 3));
        assert!(BackoffPolicy::should_retry(2, 3));
        assert!(!BackoffPolicy::should_retry(3, 3));
        assert!(!BackoffPolicy::should_retry(0, 0));
    }
}
