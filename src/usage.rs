//! Best-effort per-user API usage counters.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Result;

#[async_trait]
pub trait UsageCounter: Send + Sync {
    /// Records one API call for `user_id`.
    async fn increment(&self, user_id: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageStats {
    pub api_calls: u64,
    pub last_usage_at: SystemTime,
}

/// Keeps counters in process memory.
#[derive(Debug, Default)]
pub struct MemoryUsageCounter {
    users: Mutex<HashMap<String, UsageStats>>,
}

impl MemoryUsageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, user_id: &str) -> Option<UsageStats> {
        self.users.lock().get(user_id).copied()
    }

    pub fn api_calls(&self, user_id: &str) -> u64 {
        self.stats(user_id).map_or(0, |stats| stats.api_calls)
    }
}

#[async_trait]
impl UsageCounter for MemoryUsageCounter {
    async fn increment(&self, user_id: &str) -> Result<()> {
        let now = SystemTime::now();
        let mut users = self.users.lock();
        let stats = users.entry(user_id.to_owned()).or_insert(UsageStats {
            api_calls: 0,
            last_usage_at: now,
        });
        stats.api_calls += 1;
        stats.last_usage_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryUsageCounter, UsageCounter};

    #[tokio::test]
    async fn counts_per_user() {
        let counter = MemoryUsageCounter::new();
        counter.increment("kit").await.expect("memory");
        counter.increment("kit").await.expect("memory");
        counter.increment("ana").await.expect("memory");

        assert_eq!(counter.api_calls("kit"), 2);
        assert_eq!(counter.api_calls("ana"), 1);
        assert_eq!(counter.api_calls("nobody"), 0);
        assert!(counter.stats("kit").is_some());
    }
}
