//! Optimistic/echo message merging for support and chat conversations
//!
//! A locally sent message shows up immediately without a server id. The
//! server later echoes it back with one, possibly more than once after a
//! reconnect. Matching, in order:
//!
//! 1. same `server_id`: redelivery
//! 2. same `client_token`: echo of a local send
//! 3. same content and sender within the dedup window, unless both records
//!    carry different client tokens
//!
//! A match never adds a record. An authoritative echo of an optimistic
//! record promotes it in place.

use chrono::Utc;
use parking_lot::Mutex;
use shopsync_types::{MessageRecord, SenderRole};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// Configuration for the message merger
#[derive(Debug, Clone)]
pub struct MergerConfig {
    /// Records closer than this with equal content and sender are one message
    pub dedup_window: Duration,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(3),
        }
    }
}

/// What `merge` did with an incoming record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New message, appended
    Appended,
    /// Matched an optimistic record, which now carries the server id
    Promoted,
    /// Already present, discarded
    Duplicate,
}

/// Per-conversation message lists
pub struct MessageMerger {
    config: MergerConfig,
    conversations: Mutex<HashMap<String, Vec<MessageRecord>>>,
}

impl MessageMerger {
    pub fn new(config: MergerConfig) -> Self {
        Self {
            config,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Merge one record into a conversation
    pub fn merge(&self, conversation_id: &str, incoming: MessageRecord) -> MergeOutcome {
        let mut conversations = self.conversations.lock();
        let records = conversations.entry(conversation_id.to_string()).or_default();

        let Some(index) = find_match(records, &incoming, self.config.dedup_window) else {
            trace!(conversation = conversation_id, "Appending message");
            records.push(incoming);
            return MergeOutcome::Appended;
        };

        let existing = &mut records[index];
        if incoming.is_authoritative() && existing.is_optimistic() {
            debug!(
                conversation = conversation_id,
                server_id = ?incoming.server_id,
                "Promoting optimistic message"
            );
            existing.server_id = incoming.server_id;
            if existing.client_token.is_none() {
                existing.client_token = incoming.client_token;
            }
            MergeOutcome::Promoted
        } else {
            trace!(conversation = conversation_id, "Discarding duplicate message");
            MergeOutcome::Duplicate
        }
    }

    /// Create an optimistic record for a local send and merge it.
    ///
    /// The returned record carries the client token the server must echo.
    pub fn send_local(
        &self,
        conversation_id: &str,
        content: impl Into<String>,
        sender: SenderRole,
        sender_name: impl Into<String>,
    ) -> MessageRecord {
        let record = MessageRecord {
            content: content.into(),
            sender,
            sender_name: sender_name.into(),
            created_at: Utc::now(),
            server_id: None,
            client_token: Some(Uuid::new_v4().to_string()),
        };
        self.merge(conversation_id, record.clone());
        record
    }

    /// Merge a page of history; returns how many records were new
    pub fn load_history(
        &self,
        conversation_id: &str,
        records: impl IntoIterator<Item = MessageRecord>,
    ) -> usize {
        records
            .into_iter()
            .filter(|record| self.merge(conversation_id, record.clone()) == MergeOutcome::Appended)
            .count()
    }

    /// Records of a conversation in arrival order
    pub fn messages(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.conversations
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.conversations.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear_conversation(&self, conversation_id: &str) {
        self.conversations.lock().remove(conversation_id);
    }

    /// Drop everything (logout)
    pub fn clear(&self) {
        self.conversations.lock().clear();
    }
}

impl Default for MessageMerger {
    fn default() -> Self {
        Self::new(MergerConfig::default())
    }
}

fn find_match(records: &[MessageRecord], incoming: &MessageRecord, window: Duration) -> Option<usize> {
    if let Some(server_id) = &incoming.server_id {
        if let Some(i) = records
            .iter()
            .position(|r| r.server_id.as_ref() == Some(server_id))
        {
            return Some(i);
        }
    }

    if let Some(token) = &incoming.client_token {
        if let Some(i) = records
            .iter()
            .position(|r| r.client_token.as_ref() == Some(token))
        {
            return Some(i);
        }
    }

    // Newest first: an echo almost always matches the latest send
    records
        .iter()
        .enumerate()
        .rev()
        .find(|(_, existing)| fuzzy_match(existing, incoming, window))
        .map(|(i, _)| i)
}

fn fuzzy_match(existing: &MessageRecord, incoming: &MessageRecord, window: Duration) -> bool {
    if existing.content != incoming.content || existing.sender != incoming.sender {
        return false;
    }
    if !within_window(existing, incoming, window) {
        return false;
    }
    if let (Some(a), Some(b)) = (&existing.client_token, &incoming.client_token) {
        if a != b {
            debug!("Identical messages with distinct client tokens kept apart");
            return false;
        }
    }
    true
}

fn within_window(a: &MessageRecord, b: &MessageRecord, window: Duration) -> bool {
    (a.created_at - b.created_at)
        .abs()
        .to_std()
        .map(|gap| gap < window)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn at(seconds: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + seconds, millis * 1_000_000)
            .unwrap()
    }

    fn optimistic(content: &str, created_at: DateTime<Utc>) -> MessageRecord {
        MessageRecord {
            content: content.to_string(),
            sender: SenderRole::Customer,
            sender_name: "Ada".to_string(),
            created_at,
            server_id: None,
            client_token: None,
        }
    }

    fn authoritative(content: &str, created_at: DateTime<Utc>, server_id: &str) -> MessageRecord {
        MessageRecord {
            server_id: Some(server_id.to_string()),
            ..optimistic(content, created_at)
        }
    }

    #[test]
    fn test_echo_within_window_promotes_optimistic() {
        let merger = MessageMerger::default();
        merger.merge("t1", optimistic("hello", at(0, 0)));

        let outcome = merger.merge("t1", authoritative("hello", at(1, 200), "m-1"));

        assert_eq!(outcome, MergeOutcome::Promoted);
        let messages = merger.messages("t1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].server_id.as_deref(), Some("m-1"));
        // Optimistic timestamp kept
        assert_eq!(messages[0].created_at, at(0, 0));
    }

    #[test]
    fn test_outside_window_is_a_new_message() {
        let merger = MessageMerger::default();
        merger.merge("t1", optimistic("hello", at(0, 0)));

        let outcome = merger.merge("t1", authoritative("hello", at(3, 0), "m-1"));

        assert_eq!(outcome, MergeOutcome::Appended);
        assert_eq!(merger.messages("t1").len(), 2);
    }

    #[test]
    fn test_redelivery_by_server_id_is_duplicate() {
        let merger = MessageMerger::default();
        merger.merge("t1", authoritative("hi", at(0, 0), "m-1"));

        // Same id, different timestamp (replayed after reconnect)
        let outcome = merger.merge("t1", authoritative("hi", at(60, 0), "m-1"));

        assert_eq!(outcome, MergeOutcome::Duplicate);
        assert_eq!(merger.messages("t1").len(), 1);
    }

    #[test]
    fn test_client_token_match_ignores_clock_skew() {
        let merger = MessageMerger::default();
        let sent = merger.send_local("t1", "where is my order?", SenderRole::Customer, "Ada");
        let token = sent.client_token.clone();
        assert!(token.is_some());

        let echo = MessageRecord {
            created_at: sent.created_at + chrono::Duration::seconds(30),
            server_id: Some("m-9".to_string()),
            client_token: token.clone(),
            ..sent.clone()
        };
        assert_eq!(merger.merge("t1", echo), MergeOutcome::Promoted);

        let messages = merger.messages("t1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].client_token, token);
        assert_eq!(messages[0].server_id.as_deref(), Some("m-9"));
    }

    #[test]
    fn test_distinct_tokens_are_never_fuzzy_merged() {
        let merger = MessageMerger::default();
        let first = merger.send_local("t1", "ok", SenderRole::Customer, "Ada");
        let second = MessageRecord {
            created_at: first.created_at + chrono::Duration::milliseconds(500),
            client_token: Some(Uuid::new_v4().to_string()),
            ..first.clone()
        };

        assert_eq!(merger.merge("t1", second), MergeOutcome::Appended);
        assert_eq!(merger.messages("t1").len(), 2);
    }

    #[test]
    fn test_different_sender_is_not_a_match() {
        let merger = MessageMerger::default();
        merger.merge("t1", optimistic("thanks", at(0, 0)));
        let from_agent = MessageRecord {
            sender: SenderRole::Agent,
            ..authoritative("thanks", at(0, 500), "m-2")
        };

        assert_eq!(merger.merge("t1", from_agent), MergeOutcome::Appended);
    }

    #[test]
    fn test_optimistic_after_authoritative_is_duplicate() {
        let merger = MessageMerger::default();
        merger.merge("t1", authoritative("hello", at(0, 0), "m-1"));

        assert_eq!(
            merger.merge("t1", optimistic("hello", at(0, 900))),
            MergeOutcome::Duplicate
        );
        assert_eq!(merger.messages("t1")[0].server_id.as_deref(), Some("m-1"));
    }

    #[test]
    fn test_conversations_are_isolated() {
        let merger = MessageMerger::default();
        merger.merge("t1", optimistic("hello", at(0, 0)));

        assert_eq!(
            merger.merge("t2", authoritative("hello", at(0, 100), "m-1")),
            MergeOutcome::Appended
        );
        assert_eq!(merger.conversation_ids(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn test_load_history_counts_new_records() {
        let merger = MessageMerger::default();
        merger.merge("t1", authoritative("a", at(0, 0), "m-1"));

        let added = merger.load_history(
            "t1",
            vec![
                authoritative("a", at(0, 0), "m-1"),
                authoritative("b", at(10, 0), "m-2"),
                authoritative("c", at(20, 0), "m-3"),
            ],
        );

        assert_eq!(added, 2);
        let contents: Vec<String> = merger.messages("t1").into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_clear() {
        let merger = MessageMerger::default();
        merger.merge("t1", optimistic("hello", at(0, 0)));
        merger.merge("t2", optimistic("hello", at(0, 0)));

        merger.clear_conversation("t1");
        assert!(merger.messages("t1").is_empty());
        merger.clear();
        assert!(merger.conversation_ids().is_empty());
    }
}
