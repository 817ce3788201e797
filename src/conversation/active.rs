//! In-flight conversations kept in an arena, oldest first

use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};

use crate::record::{MessageKey, Record};

/// Message ids repeat across topics of one group, so membership is per topic
type MemberKey = (MessageKey, Option<i64>);

fn member_key(record: &Record) -> MemberKey {
    (record.key(), record.topic_id)
}

/// Reference to a conversation slot.
///
/// Handles outlive the conversation they point to (the reply index keeps
/// them), so every lookup checks the generation: a handle whose conversation
/// has been flushed resolves to nothing, even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationHandle {
    slot: usize,
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct ActiveConversation {
    messages: Vec<Record>,
    start: DateTime<Utc>,
    last: DateTime<Utc>,
    topic_id: Option<i64>,
    members: HashSet<MemberKey>,
}

impl ActiveConversation {
    pub fn new(record: Record, ts: DateTime<Utc>) -> Self {
        let mut members = HashSet::new();
        members.insert(member_key(&record));
        Self {
            topic_id: record.topic_id,
            messages: vec![record],
            start: ts,
            last: ts,
            members,
        }
    }

    /// Append a message; returns `false` (and drops it) if the same
    /// `(group_id, topic_id, id)` is already a member
    pub fn push(&mut self, record: Record, ts: DateTime<Utc>) -> bool {
        if !self.members.insert(member_key(&record)) {
            return false;
        }
        if ts > self.last {
            self.last = ts;
        }
        self.messages.push(record);
        true
    }

    pub fn contains(&self, record: &Record) -> bool {
        self.members.contains(&member_key(record))
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn last(&self) -> DateTime<Utc> {
        self.last
    }

    pub fn topic_id(&self) -> Option<i64> {
        self.topic_id
    }

    pub fn messages(&self) -> &[Record] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Record> {
        self.messages
    }
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    conversation: Option<ActiveConversation>,
}

/// Arrival-ordered set of live conversations.
///
/// Conversations only ever leave from the front, so `order` holds exactly
/// the live handles, oldest first.
#[derive(Debug, Default)]
pub struct ActiveConversationSet {
    slots: Vec<Slot>,
    free: Vec<usize>,
    order: VecDeque<ConversationHandle>,
    next_generation: u64,
}

impl ActiveConversationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conversation: ActiveConversation) -> ConversationHandle {
        let generation = self.next_generation;
        self.next_generation += 1;

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Slot {
                    generation,
                    conversation: Some(conversation),
                };
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation,
                    conversation: Some(conversation),
                });
                self.slots.len() - 1
            }
        };

        let handle = ConversationHandle { slot, generation };
        self.order.push_back(handle);
        handle
    }

    pub fn get(&self, handle: ConversationHandle) -> Option<&ActiveConversation> {
        self.slots
            .get(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.conversation.as_ref())
    }

    pub fn get_mut(&mut self, handle: ConversationHandle) -> Option<&mut ActiveConversation> {
        self.slots
            .get_mut(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.conversation.as_mut())
    }

    pub fn oldest(&self) -> Option<&ActiveConversation> {
        self.order.front().and_then(|handle| self.get(*handle))
    }

    pub fn pop_oldest(&mut self) -> Option<ActiveConversation> {
        let handle = self.order.pop_front()?;
        let conversation = self.slots.get_mut(handle.slot)?.conversation.take();
        self.free.push(handle.slot);
        conversation
    }

    /// First of the newest `depth` conversations (newest first) matching `pred`
    pub fn find_recent<P>(&self, depth: usize, mut pred: P) -> Option<ConversationHandle>
    where
        P: FnMut(&ActiveConversation) -> bool,
    {
        self.order
            .iter()
            .rev()
            .take(depth)
            .copied()
            .find(|handle| self.get(*handle).map(&mut pred).unwrap_or(false))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(id: i64, topic: i64, minute: u32) -> ActiveConversation {
        let mut record = Record::new(id, format!("2024-01-01T00:{:02}:00Z", minute), "x");
        record.topic_id = Some(topic);
        let ts = record.timestamp().unwrap();
        ActiveConversation::new(record, ts)
    }

    #[test]
    fn test_pop_oldest_is_fifo() {
        let mut set = ActiveConversationSet::new();
        set.push(conversation(1, 1, 0));
        set.push(conversation(2, 1, 1));
        set.push(conversation(3, 1, 2));

        assert_eq!(set.oldest().unwrap().messages()[0].id, 1);
        assert_eq!(set.pop_oldest().unwrap().messages()[0].id, 1);
        assert_eq!(set.pop_oldest().unwrap().messages()[0].id, 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_stale_handle_misses_after_slot_reuse() {
        // Test: a flushed conversation's handle must not resolve to the slot's new occupant
        let mut set = ActiveConversationSet::new();
        let old = set.push(conversation(1, 1, 0));
        set.pop_oldest();

        let new = set.push(conversation(2, 1, 1));
        assert_ne!(old, new);
        assert!(set.get(old).is_none());
        assert!(set.get_mut(old).is_none());
        assert_eq!(set.get(new).unwrap().messages()[0].id, 2);
    }

    #[test]
    fn test_find_recent_scans_newest_first_within_depth() {
        let mut set = ActiveConversationSet::new();
        let first = set.push(conversation(1, 7, 0));
        set.push(conversation(2, 8, 1));
        let third = set.push(conversation(3, 7, 2));

        assert_eq!(set.find_recent(3, |c| c.topic_id() == Some(7)), Some(third));
        // depth 1 only sees conversation 3
        assert_eq!(set.find_recent(1, |c| c.topic_id() == Some(8)), None);

        set.pop_oldest();
        assert!(set.get(first).is_none());
        assert_eq!(set.find_recent(10, |c| c.messages()[0].id == 1), None);
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut conv = conversation(1, 1, 0);
        let mut again = Record::new(1, "2024-01-01T00:05:00Z", "x");
        again.topic_id = Some(1);
        let ts = again.timestamp().unwrap();

        assert!(conv.contains(&again));
        assert!(!conv.push(again, ts));
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.last(), conv.start());
    }

    #[test]
    fn test_same_id_in_other_topic_is_member() {
        let mut conv = conversation(5, 1, 0);
        let mut other = Record::new(5, "2024-01-01T00:01:00Z", "y");
        other.topic_id = Some(2);
        let ts = other.timestamp().unwrap();

        assert!(!conv.contains(&other));
        assert!(conv.push(other, ts));
        assert_eq!(conv.len(), 2);
    }
}
