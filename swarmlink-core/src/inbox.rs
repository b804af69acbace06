//! Retrieve cursors per (node, identity) and the received-hash set used for deduplication.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::message::{RawMessage, DEFAULT_TTL_MS};
use crate::node::Node;

/// How long a hash is remembered after its message expired.
pub const RECEIVED_HASH_GRACE: Duration = Duration::from_secs(60 * 60);

/// Last retrieved message hash and its expiry (unix ms).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub hash: String,
    pub expiration: u64,
}

#[derive(Debug, Default)]
pub struct CursorStore {
    cursors: HashMap<(Node, String), Cursor>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor hash. An expired cursor is pruned and treated as absent.
    pub fn last_hash(&mut self, node: &Node, identity: &str, now_ms: u64) -> Option<String> {
        let key = (node.clone(), identity.to_string());
        let cursor = self.cursors.get(&key)?;
        if cursor.expiration != 0 && cursor.expiration <= now_ms {
            trace!(node = %node, "cursor expired");
            self.cursors.remove(&key);
            return None;
        }
        Some(cursor.hash.clone())
    }

    pub fn get(&self, node: &Node, identity: &str) -> Option<&Cursor> {
        self.cursors.get(&(node.clone(), identity.to_string()))
    }

    /// Move the cursor to the trailing message. Empty batches leave it untouched.
    pub fn advance(&mut self, node: &Node, identity: &str, messages: &[RawMessage]) -> Option<Cursor> {
        let last = messages.last()?;
        let cursor = Cursor {
            hash: last.hash.clone(),
            expiration: last.expiration,
        };
        self.cursors
            .insert((node.clone(), identity.to_string()), cursor.clone());
        Some(cursor)
    }

    /// Set a cursor directly, e.g. when restoring from persistence.
    pub fn insert(&mut self, node: Node, identity: String, cursor: Cursor) {
        self.cursors.insert((node, identity), cursor);
    }

    /// Forget every cursor for a node (after it was evicted).
    pub fn forget_node(&mut self, node: &Node) {
        self.cursors.retain(|(n, _), _| n != node);
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Hashes already delivered, per identity, with the time each may be forgotten.
#[derive(Debug, Default)]
pub struct ReceivedHashes {
    seen: HashMap<String, HashMap<String, u64>>,
}

impl ReceivedHashes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the batch and return only messages not delivered before, in input order.
    pub fn filter_new(&mut self, identity: &str, messages: Vec<RawMessage>, now_ms: u64) -> Vec<RawMessage> {
        let grace = RECEIVED_HASH_GRACE.as_millis() as u64;
        let seen = self.seen.entry(identity.to_string()).or_default();
        messages
            .into_iter()
            .filter(|m| {
                if seen.contains_key(&m.hash) {
                    trace!(hash = %m.hash, "duplicate message dropped");
                    return false;
                }
                let expiration = if m.expiration == 0 {
                    now_ms.saturating_add(DEFAULT_TTL_MS)
                } else {
                    m.expiration
                };
                seen.insert(m.hash.clone(), expiration.saturating_add(grace));
                true
            })
            .collect()
    }

    pub fn contains(&self, identity: &str, hash: &str) -> bool {
        self.seen
            .get(identity)
            .map_or(false, |s| s.contains_key(hash))
    }

    /// Insert a hash with an explicit forget time, e.g. when restoring from persistence.
    pub fn insert(&mut self, identity: &str, hash: String, forget_at: u64) {
        self.seen
            .entry(identity.to_string())
            .or_default()
            .insert(hash, forget_at);
    }

    /// Entries for one identity as (hash, forget_at).
    pub fn entries(&self, identity: &str) -> Vec<(String, u64)> {
        self.seen
            .get(identity)
            .map(|s| s.iter().map(|(h, t)| (h.clone(), *t)).collect())
            .unwrap_or_default()
    }

    /// Drop hashes whose message expired more than the grace period ago. Returns how many.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let mut removed = 0;
        for set in self.seen.values_mut() {
            let before = set.len();
            set.retain(|_, forget_at| *forget_at > now_ms);
            removed += before - set.len();
        }
        self.seen.retain(|_, set| !set.is_empty());
        removed
    }

    pub fn len(&self, identity: &str) -> usize {
        self.seen.get(identity).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(hash: &str, expiration: u64) -> RawMessage {
        RawMessage {
            hash: hash.into(),
            expiration,
            data: String::new(),
        }
    }

    fn node() -> Node {
        Node::new("https://10.3.0.1", 443)
    }

    #[test]
    fn empty_batch_keeps_cursor() {
        let mut cursors = CursorStore::new();
        cursors.advance(&node(), "abc", &[msg("h1", 5_000)]);
        assert!(cursors.advance(&node(), "abc", &[]).is_none());
        assert_eq!(cursors.last_hash(&node(), "abc", 0), Some("h1".to_string()));
    }

    #[test]
    fn cursor_follows_trailing_message() {
        let mut cursors = CursorStore::new();
        cursors.advance(&node(), "abc", &[msg("h1", 5_000), msg("h2", 6_000)]);
        assert_eq!(cursors.get(&node(), "abc").unwrap().hash, "h2");
        assert!(cursors.get(&node(), "other").is_none());
    }

    #[test]
    fn expired_cursor_is_pruned() {
        let mut cursors = CursorStore::new();
        cursors.advance(&node(), "abc", &[msg("h1", 5_000)]);
        assert_eq!(cursors.last_hash(&node(), "abc", 5_000), None);
        assert!(cursors.is_empty());
    }

    #[test]
    fn duplicates_across_batches_dropped() {
        let mut hashes = ReceivedHashes::new();
        let first = hashes.filter_new("abc", vec![msg("a", 10), msg("b", 10)], 0);
        assert_eq!(first.len(), 2);
        let second = hashes.filter_new("abc", vec![msg("b", 10), msg("c", 10), msg("c", 10)], 0);
        assert_eq!(second, vec![msg("c", 10)]);
        assert!(hashes.contains("abc", "a"));
        assert!(!hashes.contains("other", "a"));
        assert_eq!(hashes.filter_new("other", vec![msg("a", 10)], 0).len(), 1);
    }

    #[test]
    fn prune_after_grace() {
        let mut hashes = ReceivedHashes::new();
        hashes.filter_new("abc", vec![msg("a", 1_000), msg("b", 0)], 0);
        let grace = RECEIVED_HASH_GRACE.as_millis() as u64;
        assert_eq!(hashes.prune(1_000 + grace - 1), 0);
        assert_eq!(hashes.prune(1_000 + grace), 1);
        assert!(hashes.contains("abc", "b"));
        assert_eq!(hashes.len("abc"), 1);
    }
}
