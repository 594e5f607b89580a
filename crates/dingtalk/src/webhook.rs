use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use tracing::debug;

/// A reply URL captured from an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWebhookEntry {
    pub url: String,
    pub captured_at: Instant,
    pub expires_at: Instant,
}

impl SessionWebhookEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Conversation ID → most recent session webhook.
///
/// Last writer wins. Entries expire at the vendor-issued expiry (or after the
/// configured TTL when the event carried none), and the oldest capture is
/// evicted once the store is full.
pub struct SessionWebhookStore {
    entries: RwLock<HashMap<String, SessionWebhookEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl SessionWebhookStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn store(&self, conversation_id: &str, url: &str) {
        self.store_until(conversation_id, url, None);
    }

    /// Upsert an entry, optionally with the expiry the vendor attached to it.
    pub fn store_until(&self, conversation_id: &str, url: &str, expires_at: Option<Instant>) {
        let url = url.trim();
        if conversation_id.is_empty() || url.is_empty() {
            return;
        }
        let now = Instant::now();
        let entry = SessionWebhookEntry {
            url: url.to_string(),
            captured_at: now,
            expires_at: expires_at.unwrap_or(now + self.ttl),
        };

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(conversation_id.to_string(), entry);
        if entries.len() > self.capacity {
            entries.retain(|_, e| e.is_live(now));
        }
        while entries.len() > self.capacity {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.captured_at)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            debug!(conversation_id = %oldest, "evicting session webhook");
            entries.remove(&oldest);
        }
    }

    /// Most recent live URL for the conversation.
    pub fn get(&self, conversation_id: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(conversation_id)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.url.clone())
    }

    pub fn entry(&self, conversation_id: &str) -> Option<SessionWebhookEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(conversation_id).cloned()
    }

    /// Drop expired entries, returning how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Convert the vendor's epoch-milliseconds expiry into a local instant.
pub fn expiry_from_epoch_ms(expires_at_ms: i64) -> Instant {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();
    let remaining = u64::try_from(expires_at_ms.saturating_sub(now_ms)).unwrap_or(0);
    Instant::now() + Duration::from_millis(remaining)
}
