//! Server-side conversation sessions.
//!
//! Agents send `X-Gonka-Session-ID`; the gateway injects prior turns before
//! forwarding, so clients transmit only the incremental message. Sessions
//! expire after an idle TTL and their history is bounded — truncation always
//! preserves system messages in their original relative order.
//!
//! The store is a single mutex-guarded map. Every operation holds the lock
//! briefly; at high fan-out the upgrade path is sharding by session-id hash.

use std::{collections::HashMap, sync::Mutex, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message role — the only roles the gateway accepts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single chat message.
///
/// `content` is kept as raw JSON because OpenAI allows both a plain string
/// and a structured part list. Every other field (`tool_calls`, `name`, …)
/// survives round-tripping through the flattened `extra` map — the gateway
/// rewrites `messages` wholesale when merging, and must not drop anything
/// the client sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Plain-text message constructor.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: Value::String(content.into()), extra: Map::new() }
    }
}

/// One conversation, owned exclusively by the [`SessionStore`].
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub api_key: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl Session {
    fn new(session_id: &str, api_key: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            api_key: api_key.to_string(),
            messages: Vec::new(),
            created_at: now,
            last_accessed: now,
            metadata: Map::new(),
        }
    }

    fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    fn idle(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_accessed
    }
}

/// Serializable session summary for the HTTP surface.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub message_count: usize,
    pub created_at: f64,
    pub last_accessed: f64,
    pub idle_seconds: f64,
    pub metadata: Map<String, Value>,
}

fn epoch_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

impl SessionSummary {
    fn of(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            message_count: session.messages.len(),
            created_at: epoch_secs(session.created_at),
            last_accessed: epoch_secs(session.last_accessed),
            idle_seconds: session.idle(now).num_milliseconds() as f64 / 1000.0,
            metadata: session.metadata.clone(),
        }
    }
}

/// Mutex-guarded map of live sessions with TTL expiry and bounded history.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    max_history: usize,
}

impl SessionStore {
    pub fn new(ttl: StdDuration, max_history: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            // TTLs beyond ~292 billion years are not a supported configuration.
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
            max_history,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().expect("session map lock poisoned")
    }

    /// Fetch a session, creating it when absent. Always refreshes
    /// `last_accessed`.
    pub fn get_or_create(&self, session_id: &str, api_key: &str) -> Session {
        let mut sessions = self.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id, api_key));
        session.touch();
        session.clone()
    }

    /// Fetch a live session. An expired session (idle ≥ TTL) is evicted
    /// inline and `None` is returned; a live one is touched.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(session) if session.idle(now) < self.ttl => {
                session.touch();
                Some(session.clone())
            }
            Some(_) => {
                sessions.remove(session_id);
                None
            }
            None => None,
        }
    }

    /// Append messages to a session's history. No-op when the session is
    /// unknown. After appending, histories longer than `max_history` are
    /// truncated: all system messages are retained in original order,
    /// followed by the most recent non-system messages that fit.
    pub fn append(&self, session_id: &str, messages: Vec<ChatMessage>) {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(session_id) else { return };

        session.messages.extend(messages);
        session.touch();

        if session.messages.len() > self.max_history {
            let system: Vec<ChatMessage> = session
                .messages
                .iter()
                .filter(|m| m.role == Role::System)
                .cloned()
                .collect();
            let non_system: Vec<ChatMessage> = session
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned()
                .collect();
            let keep = self.max_history.saturating_sub(system.len());
            let tail_start = non_system.len().saturating_sub(keep);
            session.messages = system;
            session.messages.extend_from_slice(&non_system[tail_start..]);
        }
    }

    /// Merge stored history with an incoming request's message list.
    ///
    /// The incoming system messages win (a client may update its system
    /// prompt per call; stale ones must not stack), stored non-system turns
    /// come next, and the incoming non-system messages close the list. With
    /// no stored history the incoming list is returned untouched.
    pub fn inject_history(&self, session_id: &str, incoming: &[ChatMessage]) -> Vec<ChatMessage> {
        let history = {
            let mut sessions = self.lock();
            match sessions.get_mut(session_id) {
                Some(session) => {
                    session.touch();
                    session.messages.clone()
                }
                None => return incoming.to_vec(),
            }
        };
        if history.is_empty() {
            return incoming.to_vec();
        }

        let mut merged: Vec<ChatMessage> =
            incoming.iter().filter(|m| m.role == Role::System).cloned().collect();
        merged.extend(history.into_iter().filter(|m| m.role != Role::System));
        merged.extend(incoming.iter().filter(|m| m.role != Role::System).cloned());
        merged
    }

    /// Merge metadata entries into a session. No-op when unknown.
    pub fn merge_metadata(&self, session_id: &str, metadata: Map<String, Value>) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(session_id) {
            session.metadata.extend(metadata);
        }
    }

    pub fn delete(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    /// One-shot sweep of expired sessions; returns the number removed.
    /// Invoked by the periodic background task and the admin API.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.idle(now) < self.ttl);
        before - sessions.len()
    }

    /// Summaries of live sessions, optionally filtered by owning key.
    /// Expired sessions are skipped but not evicted here.
    pub fn list(&self, api_key: Option<&str>) -> Vec<SessionSummary> {
        let now = Utc::now();
        self.lock()
            .values()
            .filter(|s| s.idle(now) < self.ttl)
            .filter(|s| api_key.map_or(true, |k| s.api_key == k))
            .map(|s| SessionSummary::of(s, now))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.lock().values().filter(|s| s.idle(now) < self.ttl).count()
    }

    /// Test hook: rewind a session's `last_accessed` by `idle`.
    #[cfg(test)]
    pub(crate) fn backdate(&self, session_id: &str, idle: StdDuration) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_accessed = Utc::now() - Duration::from_std(idle).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl_secs: u64, max_history: usize) -> SessionStore {
        SessionStore::new(StdDuration::from_secs(ttl_secs), max_history)
    }

    fn msg(role: Role, content: &str) -> ChatMessage {
        ChatMessage::text(role, content)
    }

    fn contents(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str().unwrap()).collect()
    }

    // -----------------------------------------------------------------------
    // Creation, lookup, TTL
    // -----------------------------------------------------------------------

    #[test]
    fn get_or_create_inserts_once_and_touches() {
        let store = store(3600, 10);
        let first = store.get_or_create("s1", "key-a");
        let second = store.get_or_create("s1", "key-b");
        // Same session — the owning key is set at creation and kept.
        assert_eq!(second.api_key, "key-a");
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn get_returns_live_session_and_refreshes_it() {
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        store.backdate("s1", StdDuration::from_secs(99));

        let session = store.get("s1").expect("session just inside TTL must be alive");
        assert_eq!(session.session_id, "s1");

        // The read refreshed last_accessed, so another near-TTL wait
        // would be measured from now.
        let summaries = store.list(None);
        assert!(summaries[0].idle_seconds < 1.0);
    }

    #[test]
    fn get_at_exact_ttl_evicts_inline() {
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        store.backdate("s1", StdDuration::from_secs(100));

        assert!(store.get("s1").is_none());
        // Evicted, not merely hidden.
        assert_eq!(store.list(None).len(), 0);
        assert!(!store.delete("s1"));
    }

    #[test]
    fn get_unknown_session_is_none() {
        assert!(store(100, 10).get("nope").is_none());
    }

    // -----------------------------------------------------------------------
    // Append + truncation
    // -----------------------------------------------------------------------

    #[test]
    fn append_to_unknown_session_is_a_noop() {
        let store = store(100, 10);
        store.append("ghost", vec![msg(Role::User, "hi")]);
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    fn append_extends_history_in_arrival_order() {
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        store.append("s1", vec![msg(Role::User, "a")]);
        store.append("s1", vec![msg(Role::Assistant, "b"), msg(Role::User, "c")]);

        let session = store.get("s1").unwrap();
        assert_eq!(contents(&session.messages), ["a", "b", "c"]);
    }

    #[test]
    fn truncation_boundary_drops_exactly_the_oldest_non_system() {
        // MAX_HISTORY = 5, start at the cap, push one past it.
        let store = store(100, 5);
        store.get_or_create("s1", "k");
        store.append(
            "s1",
            vec![
                msg(Role::System, "S"),
                msg(Role::User, "u1"),
                msg(Role::Assistant, "a1"),
                msg(Role::User, "u2"),
                msg(Role::Assistant, "a2"),
            ],
        );
        store.append("s1", vec![msg(Role::User, "u3")]);

        let session = store.get("s1").unwrap();
        assert_eq!(contents(&session.messages), ["S", "a1", "u2", "a2", "u3"]);
    }

    #[test]
    fn truncation_preserves_all_system_messages_in_order() {
        let store = store(100, 4);
        store.get_or_create("s1", "k");
        store.append(
            "s1",
            vec![
                msg(Role::System, "S1"),
                msg(Role::User, "u1"),
                msg(Role::System, "S2"),
                msg(Role::User, "u2"),
                msg(Role::Assistant, "a2"),
                msg(Role::User, "u3"),
            ],
        );

        let session = store.get("s1").unwrap();
        assert_eq!(session.messages.len(), 4);
        // Both system messages kept, original relative order, then the two
        // most recent non-system turns.
        assert_eq!(contents(&session.messages), ["S1", "S2", "a2", "u3"]);
    }

    #[test]
    fn history_never_exceeds_max_after_any_append() {
        let store = store(100, 6);
        store.get_or_create("s1", "k");
        for i in 0..30 {
            store.append("s1", vec![msg(Role::User, &format!("m{i}"))]);
            let session = store.get("s1").unwrap();
            assert!(session.messages.len() <= 6);
        }
    }

    // -----------------------------------------------------------------------
    // Merge operator
    // -----------------------------------------------------------------------

    #[test]
    fn inject_history_with_empty_history_is_identity() {
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        // System message deliberately *not* first — identity must hold anyway.
        let incoming = vec![msg(Role::User, "u"), msg(Role::System, "S")];
        assert_eq!(store.inject_history("s1", &incoming), incoming);
    }

    #[test]
    fn inject_history_with_unknown_session_is_identity() {
        let store = store(100, 10);
        let incoming = vec![msg(Role::User, "u")];
        assert_eq!(store.inject_history("nope", &incoming), incoming);
    }

    #[test]
    fn inject_history_orders_system_then_history_then_new() {
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        store.append("s1", vec![msg(Role::User, "A"), msg(Role::Assistant, "B")]);

        let incoming = vec![msg(Role::System, "S"), msg(Role::User, "C")];
        let merged = store.inject_history("s1", &incoming);
        assert_eq!(contents(&merged), ["S", "A", "B", "C"]);
        assert_eq!(merged[0].role, Role::System);
    }

    #[test]
    fn inject_history_drops_stored_system_prompts() {
        // Old system prompts must not stack under the client's fresh one.
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        store.append("s1", vec![msg(Role::System, "old-S"), msg(Role::User, "A")]);

        let incoming = vec![msg(Role::System, "new-S"), msg(Role::User, "B")];
        let merged = store.inject_history("s1", &incoming);
        assert_eq!(contents(&merged), ["new-S", "A", "B"]);
    }

    #[test]
    fn inject_history_without_incoming_system_keeps_none() {
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        store.append("s1", vec![msg(Role::System, "old-S"), msg(Role::User, "A")]);

        let merged = store.inject_history("s1", &[msg(Role::User, "B")]);
        assert_eq!(contents(&merged), ["A", "B"]);
    }

    // -----------------------------------------------------------------------
    // Deletion, sweep, listing
    // -----------------------------------------------------------------------

    #[test]
    fn delete_reports_whether_session_existed() {
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        assert!(store.delete("s1"));
        assert!(!store.delete("s1"));
    }

    #[test]
    fn cleanup_expired_removes_only_stale_sessions() {
        let store = store(100, 10);
        store.get_or_create("fresh", "k");
        store.get_or_create("stale-1", "k");
        store.get_or_create("stale-2", "k");
        store.backdate("stale-1", StdDuration::from_secs(101));
        store.backdate("stale-2", StdDuration::from_secs(500));

        assert_eq!(store.cleanup_expired(), 2);
        assert_eq!(store.active_count(), 1);
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn list_filters_by_key_and_skips_expired() {
        let store = store(100, 10);
        store.get_or_create("a1", "key-a");
        store.get_or_create("a2", "key-a");
        store.get_or_create("b1", "key-b");
        store.get_or_create("a-stale", "key-a");
        store.backdate("a-stale", StdDuration::from_secs(200));

        let for_a = store.list(Some("key-a"));
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|s| s.session_id.starts_with('a')));

        // list() must not evict.
        assert_eq!(store.list(None).len(), 3);
        assert!(store.lock().contains_key("a-stale"));
    }

    #[test]
    fn metadata_merges_into_existing_entries() {
        let store = store(100, 10);
        store.get_or_create("s1", "k");
        let mut meta = Map::new();
        meta.insert("agent".into(), Value::String("planner".into()));
        store.merge_metadata("s1", meta);

        let session = store.get("s1").unwrap();
        assert_eq!(session.metadata["agent"], "planner");
    }

    // -----------------------------------------------------------------------
    // Wire shape
    // -----------------------------------------------------------------------

    #[test]
    fn chat_message_roundtrips_unknown_fields() {
        let raw = serde_json::json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "call_1", "type": "function"}],
            "name": "planner"
        });
        let message: ChatMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.extra["name"], "planner");

        let back = serde_json::to_value(&message).unwrap();
        assert_eq!(back["tool_calls"][0]["id"], "call_1");
        // Null content is omitted on re-serialization.
        assert!(back.get("content").is_none());
    }

    #[test]
    fn unknown_role_is_rejected() {
        let raw = serde_json::json!({"role": "narrator", "content": "hi"});
        assert!(serde_json::from_value::<ChatMessage>(raw).is_err());
    }
}
