//! Pending requests awaiting a download choice

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct PendingRequest {
    url: String,
    created_at: Instant,
}

/// One pending URL per user. A new input replaces the previous one; reads do
/// not consume it, so a choice can be retried until the entry expires.
pub struct SessionStore {
    ttl: Duration,
    entries: Mutex<HashMap<i64, PendingRequest>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn put(&self, user_id: i64, url: String) {
        self.put_at(user_id, url, Instant::now()).await
    }

    pub async fn get(&self, user_id: i64) -> Option<String> {
        self.get_at(user_id, Instant::now()).await
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now()).await
    }

    async fn put_at(&self, user_id: i64, url: String, now: Instant) {
        self.entries.lock().await.insert(
            user_id,
            PendingRequest {
                url,
                created_at: now,
            },
        );
    }

    async fn get_at(&self, user_id: i64, now: Instant) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(&user_id) {
            Some(pending) if now.duration_since(pending.created_at) < self.ttl => {
                Some(pending.url.clone())
            }
            Some(_) => {
                entries.remove(&user_id);
                None
            }
            None => None,
        }
    }

    async fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, pending| now.duration_since(pending.created_at) < self.ttl);
        before - entries.len()
    }
}
