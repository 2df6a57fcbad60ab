use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// How long a failing backend stays out of rotation.
pub const QUARANTINE_TTL: Duration = Duration::from_secs(60);
/// How long a conversation stays pinned to its backend after the last request.
pub const CONVERSATION_TTL: Duration = Duration::from_secs(120);
pub const CONVERSATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const QUARANTINE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct ConversationEntry {
    backend_id: String,
    last_seen: Instant,
}

/// Shared mutable routing state: the quarantine map and the
/// conversation -> backend pin map. Reads dominate; both maps are guarded by
/// their own reader/writer lock and swept periodically.
#[derive(Clone, Default)]
pub struct BackendState {
    quarantined: Arc<RwLock<HashMap<String, Instant>>>,
    conversations: Arc<RwLock<HashMap<String, ConversationEntry>>>,
}

impl BackendState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn quarantine(&self, backend_id: &str, ttl: Duration) {
        let id = backend_id.trim();
        if id.is_empty() || ttl.is_zero() {
            return;
        }
        let until = Instant::now() + ttl;
        self.quarantined.write().await.insert(id.to_string(), until);
        tracing::info!(backend = id, ttl_secs = ttl.as_secs(), "backend quarantined");
    }

    pub async fn is_quarantined(&self, backend_id: &str) -> bool {
        let id = backend_id.trim();
        if id.is_empty() {
            return false;
        }
        let now = Instant::now();
        let until = { self.quarantined.read().await.get(id).copied() };
        let Some(until) = until else {
            return false;
        };
        if now < until {
            return true;
        }
        // Expired: delete lazily, re-checking under the write lock.
        let mut map = self.quarantined.write().await;
        if let Some(current) = map.get(id).copied() {
            if now >= current {
                map.remove(id);
            }
        }
        false
    }

    pub async fn sweep_quarantine(&self) -> usize {
        let now = Instant::now();
        let mut map = self.quarantined.write().await;
        let before = map.len();
        map.retain(|_, until| now < *until);
        before - map.len()
    }

    pub async fn pin_conversation(&self, conversation_id: &str, backend_id: &str) {
        let cid = conversation_id.trim();
        let bid = backend_id.trim();
        if cid.is_empty() || bid.is_empty() {
            return;
        }
        self.conversations.write().await.insert(
            cid.to_string(),
            ConversationEntry {
                backend_id: bid.to_string(),
                last_seen: Instant::now(),
            },
        );
        tracing::debug!(conversation = cid, backend = bid, "conversation pinned");
    }

    /// Returns the pinned backend id when the entry is still within TTL,
    /// refreshing `last_seen`. Expired entries are deleted and treated as
    /// absent.
    pub async fn lookup_conversation(&self, conversation_id: &str) -> Option<String> {
        let cid = conversation_id.trim();
        if cid.is_empty() {
            return None;
        }
        let now = Instant::now();
        {
            let map = self.conversations.read().await;
            if !map.contains_key(cid) {
                return None;
            }
        }
        let mut map = self.conversations.write().await;
        let expired = match map.get(cid) {
            Some(entry) => now.duration_since(entry.last_seen) > CONVERSATION_TTL,
            None => return None,
        };
        if expired {
            map.remove(cid);
            return None;
        }
        let entry = map.get_mut(cid)?;
        entry.last_seen = now;
        Some(entry.backend_id.clone())
    }

    pub async fn unpin_conversation(&self, conversation_id: &str) {
        let cid = conversation_id.trim();
        if cid.is_empty() {
            return;
        }
        if self.conversations.write().await.remove(cid).is_some() {
            tracing::debug!(conversation = cid, "conversation unpinned");
        }
    }

    pub async fn sweep_conversations(&self) -> usize {
        let now = Instant::now();
        let mut map = self.conversations.write().await;
        let before = map.len();
        map.retain(|_, entry| {
            !entry.backend_id.is_empty() && now.duration_since(entry.last_seen) <= CONVERSATION_TTL
        });
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn quarantine_expires() {
        let state = BackendState::new();
        state.quarantine("b1", Duration::from_millis(30)).await;
        assert!(state.is_quarantined("b1").await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!state.is_quarantined("b1").await);
        // lazy delete removed the entry
        assert_eq!(state.sweep_quarantine().await, 0);
    }

    #[tokio::test]
    async fn conversation_pin_refreshes_and_unpins() {
        let state = BackendState::new();
        state.pin_conversation("conv", "b1").await;
        assert_eq!(state.lookup_conversation("conv").await.as_deref(), Some("b1"));
        state.unpin_conversation("conv").await;
        assert!(state.lookup_conversation("conv").await.is_none());
    }

    #[tokio::test]
    async fn blank_ids_are_ignored() {
        let state = BackendState::new();
        state.quarantine("  ", Duration::from_secs(60)).await;
        state.pin_conversation("", "b1").await;
        assert!(!state.is_quarantined("").await);
        assert!(state.lookup_conversation("").await.is_none());
        assert_eq!(state.sweep_conversations().await, 0);
    }
}
