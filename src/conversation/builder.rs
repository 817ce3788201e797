//! Session windowing over a date-sorted record stream

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use super::active::{ActiveConversation, ActiveConversationSet, ConversationHandle};
use super::envelope::ConversationEnvelope;
use super::recency::RecencyIndex;
use crate::config::ConversationSettings;
use crate::record::Record;

const PROGRESS_INTERVAL: usize = 100_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuilderStats {
    pub records_in: usize,
    /// Records without a usable date
    pub records_skipped: usize,
    /// Records whose `(group_id, topic_id, id)` is already in the conversation they would join
    pub records_duplicate: usize,
    pub reply_attached: usize,
    pub conversations_emitted: usize,
}

/// Groups sorted records into conversations.
///
/// Attachment, first match wins:
/// 1. reply to a message whose conversation is still live
/// 2. newest of the last `scan_depth` conversations with the same topic,
///    inside both the time threshold and the session window
/// 3. a new conversation
///
/// The clock is the date of the record being processed, so output depends
/// only on the input order.
pub struct ConversationBuilder {
    settings: ConversationSettings,
    time_threshold: Duration,
    session_window: Duration,
    active: ActiveConversationSet,
    replies: RecencyIndex,
    ready: VecDeque<ConversationEnvelope>,
    stats: BuilderStats,
}

impl ConversationBuilder {
    /// Durations too large for a `Duration` are clamped to `Duration::MAX`
    pub fn new(settings: ConversationSettings) -> Self {
        Self {
            time_threshold: settings.time_threshold().unwrap_or(Duration::MAX),
            session_window: settings.session_window().unwrap_or(Duration::MAX),
            replies: RecencyIndex::new(settings.reply_index_capacity),
            active: ActiveConversationSet::new(),
            ready: VecDeque::new(),
            stats: BuilderStats::default(),
            settings,
        }
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    pub fn stats(&self) -> BuilderStats {
        self.stats
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Lazily turn `records` into envelopes.
    ///
    /// The first `Err` from the input is passed through and ends the stream
    /// without flushing; conversations still active at that point are
    /// discarded. Any state from a previous run is cleared first.
    pub fn process<I, E>(&mut self, records: I) -> Conversations<'_, I::IntoIter>
    where
        I: IntoIterator<Item = Result<Record, E>>,
    {
        self.reset();
        Conversations {
            builder: self,
            input: records.into_iter(),
            done: false,
        }
    }

    /// Feed one record; finished envelopes queue up for [`Self::pop_ready`]
    pub fn push(&mut self, record: Record) {
        let now = match record.timestamp() {
            Ok(ts) => ts,
            Err(reason) => {
                log::warn!("Dropping message {} before windowing: {}", record.id, reason);
                self.stats.records_skipped += 1;
                return;
            }
        };

        self.stats.records_in += 1;
        if self.stats.records_in % PROGRESS_INTERVAL == 0 {
            log::info!(
                "🧵 Processed {} messages, {} active conversations",
                self.stats.records_in,
                self.active.len()
            );
        }

        self.evict(now);
        self.attach(record, now);
        self.evict(now);
    }

    pub fn pop_ready(&mut self) -> Option<ConversationEnvelope> {
        self.ready.pop_front()
    }

    /// Flush every active conversation, oldest first
    pub fn finish(&mut self) {
        while let Some(conversation) = self.active.pop_oldest() {
            self.emit(conversation);
        }
        self.replies.clear();
        log::info!(
            "✅ Conversation building complete: {} messages -> {} conversations",
            self.stats.records_in,
            self.stats.conversations_emitted
        );
    }

    fn reset(&mut self) {
        self.active.clear();
        self.replies.clear();
        self.ready.clear();
        self.stats = BuilderStats::default();
    }

    fn attach(&mut self, record: Record, now: DateTime<Utc>) {
        let key = record.key();

        let reply_target = record
            .reply_key()
            .and_then(|reply_key| self.replies.get(&reply_key))
            .filter(|handle| self.active.get(*handle).is_some());

        let target = match reply_target {
            Some(handle) => {
                self.stats.reply_attached += 1;
                Some(handle)
            }
            None => self.find_nearby(&record, now),
        };

        let handle = match target {
            Some(handle) => match self.active.get_mut(handle) {
                Some(conversation) => {
                    if !conversation.push(record, now) {
                        log::debug!("Duplicate message {:?} dropped", key);
                        self.stats.records_duplicate += 1;
                        return;
                    }
                    handle
                }
                None => self.active.push(ActiveConversation::new(record, now)),
            },
            None => self.active.push(ActiveConversation::new(record, now)),
        };

        self.replies.insert(key, handle);
    }

    fn find_nearby(&self, record: &Record, now: DateTime<Utc>) -> Option<ConversationHandle> {
        let topic_id = record.topic_id;
        self.active.find_recent(self.settings.scan_depth, |conversation| {
            conversation.topic_id() == topic_id
                && now - conversation.last() < self.time_threshold
                && now - conversation.start() < self.session_window
        })
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.active.oldest() {
            if now - oldest.start() < self.session_window {
                break;
            }
            if let Some(conversation) = self.active.pop_oldest() {
                self.emit(conversation);
            }
        }

        while self.active.len() > self.settings.max_active {
            match self.active.pop_oldest() {
                Some(conversation) => self.emit(conversation),
                None => break,
            }
        }
    }

    fn emit(&mut self, conversation: ActiveConversation) {
        self.stats.conversations_emitted += 1;
        self.ready
            .push_back(ConversationEnvelope::from_conversation(conversation));
    }
}

/// Iterator returned by [`ConversationBuilder::process`]
pub struct Conversations<'a, I> {
    builder: &'a mut ConversationBuilder,
    input: I,
    done: bool,
}

impl<I> Conversations<'_, I> {
    pub fn stats(&self) -> BuilderStats {
        self.builder.stats
    }
}

impl<I, E> Iterator for Conversations<'_, I>
where
    I: Iterator<Item = Result<Record, E>>,
{
    type Item = Result<ConversationEnvelope, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(envelope) = self.builder.pop_ready() {
                return Some(Ok(envelope));
            }
            if self.done {
                return None;
            }

            match self.input.next() {
                Some(Ok(record)) => self.builder.push(record),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.builder.finish();
                    self.done = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::convert::Infallible;

    const T0: i64 = 1_704_067_200; // 2024-01-01T00:00:00Z

    fn settings(threshold: i64, window: i64, max_active: usize) -> ConversationSettings {
        ConversationSettings {
            time_threshold_secs: threshold,
            session_window_secs: window,
            max_active,
            reply_index_capacity: 1000,
            scan_depth: 200,
        }
    }

    fn msg(id: i64, offset_secs: i64, topic: i64) -> Record {
        let ts = DateTime::<Utc>::from_timestamp(T0 + offset_secs, 0).unwrap();
        let mut record = Record::new(id, ts.to_rfc3339(), format!("message {}", id));
        record.topic_id = Some(topic);
        record
    }

    fn run(settings: ConversationSettings, records: Vec<Record>) -> Vec<ConversationEnvelope> {
        let mut builder = ConversationBuilder::new(settings);
        builder
            .process(records.into_iter().map(Ok::<_, Infallible>))
            .map(|r| r.unwrap())
            .collect()
    }

    fn ids(envelope: &ConversationEnvelope) -> Vec<i64> {
        envelope.messages.iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_close_messages_share_conversation() {
        // Test: 10s apart, same topic -> one envelope
        let out = run(settings(600, 3600, 100), vec![msg(1, 0, 1), msg(2, 10, 1)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_count, 2);
    }

    #[test]
    fn test_gap_beyond_threshold_splits() {
        let out = run(settings(600, 3600, 100), vec![msg(1, 0, 1), msg(2, 1000, 1)]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_reply_reunites_across_gap() {
        let mut reply = msg(2, 1000, 1);
        reply.reply_to_id = Some(1);

        let out = run(settings(600, 3600, 100), vec![msg(1, 0, 1), reply]);
        assert_eq!(out.len(), 1);
        assert_eq!(ids(&out[0]), vec![1, 2]);
    }

    #[test]
    fn test_reply_ignores_topic() {
        let mut reply = msg(2, 30, 9);
        reply.reply_to_id = Some(1);

        let out = run(settings(600, 3600, 100), vec![msg(1, 0, 1), reply]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic_id, Some(1));
    }

    #[test]
    fn test_reply_to_expired_conversation_falls_through() {
        // Test: conversation of message 1 expires at 3600s; the reply starts a new one
        let mut reply = msg(2, 4000, 1);
        reply.reply_to_id = Some(1);

        let out = run(settings(600, 3600, 100), vec![msg(1, 0, 1), reply]);
        assert_eq!(out.len(), 2);
        assert_eq!(ids(&out[0]), vec![1]);
        assert_eq!(ids(&out[1]), vec![2]);
    }

    #[test]
    fn test_topics_kept_apart() {
        let out = run(
            settings(600, 3600, 100),
            vec![msg(1, 0, 1), msg(2, 5, 2), msg(3, 10, 1), msg(4, 15, 2)],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(ids(&out[0]), vec![1, 3]);
        assert_eq!(ids(&out[1]), vec![2, 4]);
    }

    #[test]
    fn test_session_window_caps_lifetime() {
        // messages every 500s keep the gap under threshold, but the window closes at 3600s
        let records: Vec<Record> = (0..10).map(|i| msg(i, i * 500, 1)).collect();

        let out = run(settings(600, 3600, 100), records);
        assert_eq!(out.len(), 2);
        assert_eq!(ids(&out[0]), (0..8).collect::<Vec<_>>());
        assert_eq!(ids(&out[1]), vec![8, 9]);
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        // Test: four topics, capacity two -> oldest flushed as soon as the third arrives
        let mut builder = ConversationBuilder::new(settings(600, 3600, 2));
        let records = vec![msg(1, 0, 1), msg(2, 1, 2), msg(3, 2, 3), msg(4, 3, 4)];
        let mut stream = builder.process(records.into_iter().map(Ok::<_, Infallible>));

        assert_eq!(ids(&stream.next().unwrap().unwrap()), vec![1]);
        assert_eq!(ids(&stream.next().unwrap().unwrap()), vec![2]);
        assert_eq!(ids(&stream.next().unwrap().unwrap()), vec![3]);
        assert_eq!(ids(&stream.next().unwrap().unwrap()), vec![4]);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_stale_reply_handle_does_not_misattach() {
        // Test: capacity 1 forces slot reuse; reply to flushed message 1 must not join conversation 2
        let mut reply = msg(3, 20, 3);
        reply.reply_to_id = Some(1);

        let out = run(settings(600, 3600, 1), vec![msg(1, 0, 1), msg(2, 10, 2), reply]);
        assert_eq!(out.len(), 3);
        for envelope in &out {
            assert_eq!(envelope.message_count, 1);
        }
    }

    #[test]
    fn test_every_record_in_exactly_one_envelope() {
        let records: Vec<Record> = (0..200)
            .map(|i| {
                let mut r = msg(i, i * 37, i % 3);
                if i % 7 == 0 && i > 0 {
                    r.reply_to_id = Some(i - 5);
                }
                r
            })
            .collect();

        let out = run(settings(120, 900, 4), records);

        let mut seen: HashMap<i64, usize> = HashMap::new();
        for envelope in &out {
            assert_eq!(envelope.message_count, envelope.messages.len());
            for message in &envelope.messages {
                *seen.entry(message.id).or_default() += 1;
            }
        }
        assert_eq!(seen.len(), 200);
        assert!(seen.values().all(|count| *count == 1));
    }

    #[test]
    fn test_duplicate_and_undated_records_dropped() {
        let mut undated = msg(3, 30, 1);
        undated.date = None;

        let mut builder = ConversationBuilder::new(settings(600, 3600, 100));
        let out: Vec<_> = builder
            .process(
                vec![msg(1, 0, 1), msg(1, 5, 1), undated, msg(2, 10, 1)]
                    .into_iter()
                    .map(Ok::<_, Infallible>),
            )
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(out.len(), 1);
        assert_eq!(ids(&out[0]), vec![1, 2]);
        let stats = builder.stats();
        assert_eq!(stats.records_duplicate, 1);
        assert_eq!(stats.records_skipped, 1);
        assert_eq!(stats.conversations_emitted, 1);
    }

    #[test]
    fn test_same_id_in_two_topics_both_kept() {
        // Test: id 5 exists in topics 1 and 2; the reply from topic 2 joins topic 1's conversation
        let mut reply = msg(5, 10, 2);
        reply.reply_to_id = Some(5);

        let mut builder = ConversationBuilder::new(settings(600, 3600, 100));
        let out: Vec<_> = builder
            .process(vec![msg(5, 0, 1), reply].into_iter().map(Ok::<_, Infallible>))
            .map(|r| r.unwrap())
            .collect();

        let total: usize = out.iter().map(|e| e.message_count).sum();
        assert_eq!(total, 2);
        assert_eq!(builder.stats().records_duplicate, 0);
        let topics: Vec<Option<i64>> = out[0].messages.iter().map(|m| m.topic_id).collect();
        assert_eq!(topics, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_oversized_durations_clamped() {
        let mut builder = ConversationBuilder::new(settings(i64::MAX, i64::MAX, 100));
        let out: Vec<_> = builder
            .process(
                vec![msg(1, 0, 1), msg(2, 10_000_000, 1)]
                    .into_iter()
                    .map(Ok::<_, Infallible>),
            )
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(out.len(), 1);
        assert_eq!(ids(&out[0]), vec![1, 2]);
    }

    #[test]
    fn test_input_error_stops_without_flush() {
        let mut builder = ConversationBuilder::new(settings(600, 3600, 100));
        let input = vec![Ok(msg(1, 0, 1)), Err("disk gone"), Ok(msg(2, 5, 1))];

        let out: Vec<_> = builder.process(input).collect();
        assert_eq!(out, vec![Err("disk gone")]);
    }
}
