//! Conversation session cache.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Upstream conversation ids cached per client session key.
///
/// Expiry is sliding: each read extends the entry's life, so an active
/// conversation never goes away mid-use. Stale entries are dropped on
/// the read that finds them.
pub struct SessionStore {
    entries: DashMap<String, SessionEntry>,
    ttl: Duration,
}

struct SessionEntry {
    conversation_id: String,
    touched: Instant,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cached conversation id for `key`, refreshing its expiry.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut entry = self.entries.get_mut(key)?;
        if entry.touched.elapsed() > self.ttl {
            // The shard lock must be released before removal.
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        entry.touched = Instant::now();
        Some(entry.conversation_id.clone())
    }

    /// Store the conversation id for `key`, resetting its expiry.
    pub fn put(&self, key: &str, conversation_id: String) {
        self.entries.insert(
            key.to_string(),
            SessionEntry {
                conversation_id,
                touched: Instant::now(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.put("alice", "conv-1".into());
        assert_eq!(store.get("alice"), Some("conv-1".into()));
    }

    #[test]
    fn test_missing_key() {
        let store = SessionStore::new(Duration::from_secs(60));
        assert_eq!(store.get("nobody"), None);
    }

    #[test]
    fn test_entry_expires() {
        let store = SessionStore::new(Duration::from_millis(40));
        store.put("alice", "conv-1".into());
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(store.get("alice"), None);
        // A second read after expiry still misses.
        assert_eq!(store.get("alice"), None);
    }

    #[test]
    fn test_read_slides_expiry() {
        let store = SessionStore::new(Duration::from_millis(200));
        store.put("alice", "conv-1".into());
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(80));
            assert_eq!(store.get("alice"), Some("conv-1".into()));
        }
        // 240ms total elapsed; without sliding the entry would be gone.
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(store.get("alice"), None);
    }

    #[test]
    fn test_put_overwrites() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.put("alice", "conv-1".into());
        store.put("alice", "conv-2".into());
        assert_eq!(store.get("alice"), Some("conv-2".into()));
    }
}
