//! Bounded reply lookup: message key -> owning conversation

use lru::LruCache;
use std::num::NonZeroUsize;

use super::active::ConversationHandle;
use crate::record::MessageKey;

/// Fixed-capacity LRU map. A miss is normal: the entry was evicted or the
/// replied-to message was never seen.
pub struct RecencyIndex {
    entries: LruCache<MessageKey, ConversationHandle>,
}

impl RecencyIndex {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up `key` and mark it most recently used
    pub fn get(&mut self, key: &MessageKey) -> Option<ConversationHandle> {
        self.entries.get(key).copied()
    }

    /// Insert or refresh; evicts the least recently used entry when full
    pub fn insert(&mut self, key: MessageKey, handle: ConversationHandle) {
        self.entries.put(key, handle);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::active::{ActiveConversation, ActiveConversationSet};
    use crate::record::Record;

    fn key(id: i64) -> MessageKey {
        MessageKey {
            group_id: 1,
            message_id: id,
        }
    }

    fn handle(set: &mut ActiveConversationSet, id: i64) -> ConversationHandle {
        let record = Record::new(id, "2024-01-01T00:00:00Z", "x");
        let ts = record.timestamp().unwrap();
        set.push(ActiveConversation::new(record, ts))
    }

    #[test]
    fn test_lru_eviction_respects_promotion() {
        let mut set = ActiveConversationSet::new();
        let mut index = RecencyIndex::new(2);
        let (h1, h2, h3) = (handle(&mut set, 1), handle(&mut set, 2), handle(&mut set, 3));

        index.insert(key(1), h1);
        index.insert(key(2), h2);
        // touching 1 makes 2 the eviction candidate
        assert_eq!(index.get(&key(1)), Some(h1));
        index.insert(key(3), h3);

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&key(2)), None);
        assert_eq!(index.get(&key(1)), Some(h1));
        assert_eq!(index.get(&key(3)), Some(h3));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let index = RecencyIndex::new(0);
        assert_eq!(index.capacity(), 1);
        assert!(index.is_empty());
    }
}
