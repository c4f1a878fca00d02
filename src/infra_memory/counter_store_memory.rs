use crate::domain_port::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Counter {
    value: u64,
    deadline: Option<DateTime<Utc>>,
}

impl Counter {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Process-local counter store. Atomicity per key comes from the shard lock
/// held by the `DashMap` entry while the counter is updated.
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop counters whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ceiling: u64) -> Result<u64, CounterStoreError> {
        let now = self.clock.now();
        let mut counter = self.counters.entry(key.to_owned()).or_default();
        if counter.is_expired(now) {
            *counter = Counter::default();
        }
        if counter.value < ceiling {
            counter.value += 1;
        }
        Ok(counter.value)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CounterStoreError> {
        let now = self.clock.now();
        let ttl = self.counters.get(key).and_then(|counter| {
            if counter.is_expired(now) {
                return None;
            }
            counter
                .deadline
                .map(|deadline| (deadline - now).to_std().unwrap_or_default())
        });
        Ok(ttl)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| CounterStoreError::Store(e.to_string()))?;
        let deadline = now
            .checked_add_signed(ttl)
            .ok_or_else(|| CounterStoreError::Store(format!("expiry out of range: {:?}", ttl)))?;
        if let Some(mut counter) = self.counters.get_mut(key) {
            if !counter.is_expired(now) {
                counter.deadline = Some(deadline);
            }
        }
        Ok(())
    }
}
