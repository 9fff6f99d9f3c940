//! Request-id deduplication for side-effecting methods.
//!
//! The first request with a given id runs; every concurrent or later request
//! with the same id inside the TTL waits for and receives the same payload.
//! Only successful results are cached, so a failed request can be retried
//! under its original id. Entries live in memory only.

use std::{
    collections::HashSet,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    dashmap::DashMap,
    serde_json::Value,
    tokio::sync::OnceCell,
    tracing::debug,
};

use {tradeclaw_config::schema::IdempotencyConfig, tradeclaw_protocol::ErrorShape};

struct Entry {
    created_at: Instant,
    /// Payload plus the moment it was produced.
    result: OnceCell<(Value, Instant)>,
}

impl Entry {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            result: OnceCell::new(),
        }
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        match self.result.get() {
            Some((_, completed_at)) => now.duration_since(*completed_at) >= ttl,
            // Never completed: kept while a run may still be in flight.
            None => now.duration_since(self.created_at) >= ttl,
        }
    }
}

/// Outcome of [`IdempotencyCache::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct Cached {
    pub payload: Value,
    /// `true` when the payload came from an earlier run.
    pub replayed: bool,
}

pub struct IdempotencyCache {
    entries: DashMap<String, Arc<Entry>>,
    methods: HashSet<String>,
    ttl: Duration,
    max_entries: usize,
}

impl IdempotencyCache {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            entries: DashMap::new(),
            methods: config.methods.iter().cloned().collect(),
            ttl: Duration::from_millis(config.ttl_ms),
            max_entries: config.max_entries.max(1),
        }
    }

    pub fn applies_to(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `op` at most once per `key` within the TTL.
    ///
    /// No map lock is held while `op` runs; waiters block on the entry's cell.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> Result<Cached, ErrorShape>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ErrorShape>>,
    {
        let entry = self.entry(key);
        let mut ran = false;
        let (payload, _) = entry
            .result
            .get_or_try_init(|| {
                ran = true;
                let fut = op();
                async move { fut.await.map(|v| (v, Instant::now())) }
            })
            .await?;
        if !ran {
            debug!(key, "idempotent replay");
        }
        Ok(Cached {
            payload: payload.clone(),
            replayed: !ran,
        })
    }

    fn entry(&self, key: &str) -> Arc<Entry> {
        let now = Instant::now();
        let entry = {
            let mut slot = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Entry::new()));
            if slot.is_expired(self.ttl, now) && slot.result.initialized() {
                *slot = Arc::new(Entry::new());
            }
            Arc::clone(slot.value())
        };
        if self.entries.len() > self.max_entries {
            self.evict(now, key);
        }
        entry
    }

    /// Drop expired entries, then the oldest ones until within capacity.
    fn evict(&self, now: Instant, keep: &str) {
        self.purge(now);
        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(Instant, String)> = self
            .entries
            .iter()
            .filter(|e| e.key() != keep)
            .map(|e| (e.value().created_at, e.key().clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }

    /// Remove every expired entry. Called from the gateway tick.
    pub fn purge_expired(&self) -> usize {
        self.purge(Instant::now())
    }

    fn purge(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(self.ttl, now));
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        serde_json::json,
        std::sync::atomic::{AtomicUsize, Ordering},
        tradeclaw_protocol::error_codes,
    };

    fn cache(ttl_ms: u64, max_entries: usize) -> IdempotencyCache {
        IdempotencyCache::new(&IdempotencyConfig {
            ttl_ms,
            max_entries,
            methods: vec!["chat.send".into()],
        })
    }

    #[tokio::test]
    async fn reused_id_returns_cached_payload() {
        let cache = cache(60_000, 100);
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let op = move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "n": n }))
        };

        let first = cache.run("r1", op).await.unwrap();
        let second = cache.run("r1", op).await.unwrap();
        assert_eq!(first.payload, second.payload);
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cache.applies_to("chat.send"));
        assert!(!cache.applies_to("ping"));
    }

    #[tokio::test]
    async fn concurrent_duplicates_execute_once() {
        let cache = Arc::new(cache(60_000, 100));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                cache
                    .run("same", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("done"))
                    })
                    .await
                    .unwrap()
                    .payload
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), json!("done"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = cache(60_000, 100);
        let err = cache
            .run("r", || async { Err(ErrorShape::internal("boom")) })
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);

        let ok = cache.run("r", || async { Ok(json!(1)) }).await.unwrap();
        assert_eq!(ok.payload, json!(1));
        assert!(!ok.replayed);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = cache(20, 100);
        cache.run("r", || async { Ok(json!(1)) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = cache.run("r", || async { Ok(json!(2)) }).await.unwrap();
        assert_eq!(again.payload, json!(2));
        assert!(!again.replayed);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let cache = cache(60_000, 2);
        for id in ["a", "b", "c"] {
            cache.run(id, move || async move { Ok(json!(id)) }).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
        let a = cache.run("a", || async { Ok(json!("fresh")) }).await.unwrap();
        assert!(!a.replayed);
    }
}
