use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    tracing::{debug, warn},
};

use tradeclaw_common::{
    EventPublisher, HookEvent,
    events::{MessageAdded, SessionChanged},
    time::now_ms,
};

use crate::{
    persist::{PersistJob, PersistenceQueue},
    transcript::TranscriptStore,
};

const PREVIEW_CHARS: usize = 80;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// One entry of a session history. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: String,
    pub display_name: Option<String>,
    pub channel: Option<String>,
    pub messages: VecDeque<Message>,
    pub metadata: Map<String, Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Session {
    fn new(key: &str, opts: CreateOptions) -> Self {
        let now = now_ms();
        Self {
            key: key.to_string(),
            display_name: opts.display_name,
            channel: opts.channel,
            messages: VecDeque::new(),
            metadata: opts.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    fn changed(&self) -> SessionChanged {
        SessionChanged {
            key: self.key.clone(),
            channel: self.channel.clone(),
            display_name: self.display_name.clone(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            key: self.key.clone(),
            display_name: self.display_name.clone(),
            channel: self.channel.clone(),
            message_count: self.messages.len(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Session listing entry (no message bodies).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub key: String,
    pub display_name: Option<String>,
    pub channel: Option<String>,
    pub message_count: usize,
    pub metadata: Map<String, Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub display_name: Option<String>,
    pub channel: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub channel: Option<String>,
    pub limit: Option<usize>,
}

/// Shared handle to one live session. Every caller asking for the same key
/// gets a clone of the same handle.
pub type SessionHandle = Arc<Mutex<Session>>;

fn lock(handle: &SessionHandle) -> MutexGuard<'_, Session> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Store ────────────────────────────────────────────────────────────────────

/// In-memory session registry with per-key locking.
///
/// The map is sharded (`DashMap`), and each session has its own mutex, so
/// writers to different sessions never contend. No lock is held across an
/// await point.
pub struct SessionStore {
    sessions: DashMap<String, SessionHandle>,
    max_messages: usize,
    persistence: Option<PersistenceQueue>,
    transcripts: Option<Arc<dyn TranscriptStore>>,
    events: EventPublisher,
}

impl SessionStore {
    pub fn new(max_messages: usize, events: EventPublisher) -> Self {
        Self {
            sessions: DashMap::new(),
            max_messages: max_messages.max(1),
            persistence: None,
            transcripts: None,
            events,
        }
    }

    /// Persist transcripts through `queue` and restore histories from `store`.
    pub fn with_persistence(
        mut self,
        queue: PersistenceQueue,
        store: Arc<dyn TranscriptStore>,
    ) -> Self {
        self.persistence = Some(queue);
        self.transcripts = Some(store);
        self
    }

    /// Wait for queued transcript writes. A no-op without persistence.
    pub async fn flush(&self) {
        if let Some(queue) = &self.persistence {
            queue.flush().await;
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Return the session for `key`, creating it with `opts` if absent.
    pub fn get_or_create(&self, key: &str, opts: CreateOptions) -> SessionHandle {
        let (handle, created) = match self.sessions.entry(key.to_string()) {
            Entry::Occupied(e) => (Arc::clone(e.get()), None),
            Entry::Vacant(e) => {
                let session = Session::new(key, opts);
                let changed = session.changed();
                let handle = Arc::new(Mutex::new(session));
                e.insert(Arc::clone(&handle));
                (handle, Some(changed))
            },
        };
        if let Some(changed) = created {
            debug!(key, "session created");
            self.events.publish(HookEvent::SessionCreated(changed));
        }
        handle
    }

    /// Like [`get_or_create`](Self::get_or_create), but a session unknown to
    /// memory is first rebuilt from its persisted transcript.
    pub async fn get_or_restore(&self, key: &str, opts: CreateOptions) -> SessionHandle {
        if let Some(handle) = self.handle(key) {
            return handle;
        }
        let restored = match &self.transcripts {
            Some(store) => match store.load(key).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(key, error = %e, "failed to load transcript");
                    Vec::new()
                },
            },
            None => Vec::new(),
        };

        let handle = self.get_or_create(key, opts);
        if !restored.is_empty() {
            let mut session = lock(&handle);
            if session.messages.is_empty() {
                let skip = restored.len().saturating_sub(self.max_messages);
                session.messages.extend(restored.into_iter().skip(skip));
                debug!(key, restored = session.messages.len(), "session restored from transcript");
            }
        }
        handle
    }

    pub fn handle(&self, key: &str) -> Option<SessionHandle> {
        self.sessions.get(key).map(|h| Arc::clone(h.value()))
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        self.handle(key).map(|h| lock(&h).clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Append a message, creating the session if needed, and evict from the
    /// front until the history fits `max_messages`.
    pub fn add_message(
        &self,
        key: &str,
        role: Role,
        content: impl Into<String>,
        metadata: Option<Value>,
    ) -> Message {
        let handle = self.get_or_create(key, CreateOptions::default());
        self.push(&handle, key, role, content.into(), metadata)
    }

    /// Like [`add_message`](Self::add_message) but never creates: returns
    /// `None` when the session does not exist, e.g. it was deleted while a
    /// chat run was still writing to it.
    pub fn append_existing(
        &self,
        key: &str,
        role: Role,
        content: impl Into<String>,
        metadata: Option<Value>,
    ) -> Option<Message> {
        let handle = self.handle(key)?;
        Some(self.push(&handle, key, role, content.into(), metadata))
    }

    fn push(
        &self,
        handle: &SessionHandle,
        key: &str,
        role: Role,
        content: String,
        metadata: Option<Value>,
    ) -> Message {
        let message = Message {
            role,
            content,
            timestamp: now_ms(),
            metadata,
        };

        let (channel, history_len) = {
            let mut session = lock(handle);
            session.messages.push_back(message.clone());
            while session.messages.len() > self.max_messages {
                session.messages.pop_front();
            }
            session.updated_at = message.timestamp;
            // Enqueued under the session lock so transcript order matches
            // history order.
            self.persist(PersistJob::Append {
                key: key.to_string(),
                message: message.clone(),
            });
            (session.channel.clone(), session.messages.len())
        };

        self.events.publish(HookEvent::MessageAdded(MessageAdded {
            key: key.to_string(),
            channel,
            role: role.as_str().to_string(),
            preview: message.content.chars().take(PREVIEW_CHARS).collect(),
            history_len,
        }));
        message
    }

    /// Messages in insertion order; with `limit`, only the most recent ones.
    pub fn history(&self, key: &str, limit: Option<usize>) -> Option<Vec<Message>> {
        let handle = self.handle(key)?;
        let session = lock(&handle);
        let skip = limit.map_or(0, |l| session.messages.len().saturating_sub(l));
        Some(session.messages.iter().skip(skip).cloned().collect())
    }

    /// Drop all messages but keep the session and its metadata.
    pub fn clear(&self, key: &str) -> bool {
        let Some(handle) = self.handle(key) else {
            return false;
        };
        let changed = {
            let mut session = lock(&handle);
            session.messages.clear();
            session.updated_at = now_ms();
            self.persist(PersistJob::Clear {
                key: key.to_string(),
            });
            session.changed()
        };
        self.events.publish(HookEvent::SessionCleared(changed));
        true
    }

    /// Remove a session and its transcript.
    pub fn delete(&self, key: &str) -> Option<Session> {
        let (_, handle) = self.sessions.remove(key)?;
        let session = lock(&handle).clone();
        self.persist(PersistJob::Remove {
            key: key.to_string(),
        });
        self.events
            .publish(HookEvent::SessionDeleted(session.changed()));
        Some(session)
    }

    /// Merge keys into a session's metadata.
    pub fn update_metadata(&self, key: &str, patch: Map<String, Value>) -> Option<SessionSummary> {
        let handle = self.handle(key)?;
        let mut session = lock(&handle);
        session.metadata.extend(patch);
        session.updated_at = now_ms();
        Some(session.summary())
    }

    /// Sessions ordered by creation time, optionally filtered by channel.
    pub fn list(&self, filter: &ListFilter) -> Vec<SessionSummary> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut summaries: Vec<SessionSummary> = handles
            .iter()
            .map(|h| lock(h).summary())
            .filter(|s| match &filter.channel {
                Some(channel) => s.channel.as_deref() == Some(channel.as_str()),
                None => true,
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit);
        }
        summaries
    }

    fn persist(&self, job: PersistJob) {
        if let Some(queue) = &self.persistence {
            queue.enqueue(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::{Result, SessionError},
            persist::PersistConfig,
        },
        async_trait::async_trait,
        std::sync::atomic::{AtomicUsize, Ordering},
        tradeclaw_common::HookEventKind,
    };

    fn store(max: usize) -> SessionStore {
        SessionStore::new(max, EventPublisher::detached())
    }

    #[test]
    fn history_is_bounded_to_most_recent() {
        let store = store(5);
        for i in 0..12 {
            store.add_message("s", Role::User, format!("m{i}"), None);
        }
        let history = store.history("s", None).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m7", "m8", "m9", "m10", "m11"]);
    }

    #[test]
    fn history_limit_returns_tail() {
        let store = store(50);
        for i in 0..4 {
            store.add_message("s", Role::Assistant, format!("m{i}"), None);
        }
        let tail = store.history("s", Some(2)).unwrap();
        assert_eq!(tail[0].content, "m2");
        assert_eq!(tail[1].content, "m3");
        assert_eq!(store.history("s", Some(10)).unwrap().len(), 4);
        assert!(store.history("missing", None).is_none());
    }

    #[test]
    fn concurrent_get_or_create_yields_one_instance() {
        let store = Arc::new(store(10));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.get_or_create("shared", CreateOptions::default()))
            })
            .collect();
        let sessions: Vec<SessionHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_writers_never_exceed_bound() {
        let store = Arc::new(store(20));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.add_message("s", Role::User, format!("{t}-{i}"), None);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(store.history("s", None).unwrap().len(), 20);
    }

    #[test]
    fn clear_keeps_session_and_metadata() {
        let store = store(10);
        let mut metadata = Map::new();
        metadata.insert("tier".into(), Value::from("pro"));
        store.get_or_create("s", CreateOptions {
            display_name: Some("Desk".into()),
            channel: Some("discord".into()),
            metadata,
        });
        store.add_message("s", Role::User, "hi", None);
        assert!(store.clear("s"));
        let session = store.get("s").unwrap();
        assert!(session.messages.is_empty());
        assert_eq!(session.display_name.as_deref(), Some("Desk"));
        assert_eq!(session.metadata["tier"], "pro");
        assert!(!store.clear("missing"));
    }

    #[test]
    fn list_filters_by_channel_and_limit() {
        let store = store(10);
        for (key, channel) in [("a", "telegram"), ("b", "discord"), ("c", "telegram")] {
            store.get_or_create(key, CreateOptions {
                channel: Some(channel.into()),
                ..Default::default()
            });
        }
        let telegram = store.list(&ListFilter {
            channel: Some("telegram".into()),
            limit: None,
        });
        assert_eq!(telegram.len(), 2);
        assert!(telegram.iter().all(|s| s.channel.as_deref() == Some("telegram")));
        assert_eq!(
            store
                .list(&ListFilter {
                    channel: None,
                    limit: Some(1)
                })
                .len(),
            1
        );
    }

    #[test]
    fn delete_removes_session() {
        let store = store(10);
        store.add_message("s", Role::User, "hi", None);
        assert!(store.delete("s").is_some());
        assert!(!store.contains("s"));
        assert!(store.delete("s").is_none());
    }

    #[test]
    fn append_after_delete_does_not_resurrect() {
        let store = store(10);
        store.add_message("s", Role::User, "hi", None);
        assert!(store.append_existing("s", Role::Assistant, "hello", None).is_some());
        assert_eq!(store.history("s", None).unwrap().len(), 2);

        store.delete("s");
        assert!(store.append_existing("s", Role::Assistant, "late", None).is_none());
        assert!(!store.contains("s"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let (events, mut rx) = EventPublisher::channel();
        let store = SessionStore::new(10, events);
        store.add_message("s", Role::User, "hello there", None);
        store.clear("s");
        store.delete("s");

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(kinds, [
            HookEventKind::SessionCreated,
            HookEventKind::MessageAdded,
            HookEventKind::SessionCleared,
            HookEventKind::SessionDeleted,
        ]);
    }

    struct FailingTranscripts {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl TranscriptStore for FailingTranscripts {
        async fn append(&self, _key: &str, _message: &Message) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::Task("disk on fire".into()))
        }

        async fn load(&self, _key: &str) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn clear(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn transcript_failures_never_reach_the_caller() {
        let transcripts = Arc::new(FailingTranscripts {
            attempts: AtomicUsize::new(0),
        });
        let (queue, _worker) = PersistenceQueue::spawn(
            Arc::clone(&transcripts) as Arc<dyn TranscriptStore>,
            PersistConfig {
                capacity: 8,
                max_retries: 2,
                retry_delay_ms: 1,
            },
        );
        let store = SessionStore::new(10, EventPublisher::detached())
            .with_persistence(queue.clone(), transcripts.clone());

        let message = store.add_message("s", Role::User, "still works", None);
        assert_eq!(message.content, "still works");
        queue.flush().await;
        assert_eq!(transcripts.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.history("s", None).unwrap().len(), 1);
    }

    struct CannedTranscripts(Vec<Message>);

    #[async_trait]
    impl TranscriptStore for CannedTranscripts {
        async fn append(&self, _key: &str, _message: &Message) -> Result<()> {
            Ok(())
        }

        async fn load(&self, _key: &str) -> Result<Vec<Message>> {
            Ok(self.0.clone())
        }

        async fn clear(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn restore_respects_bound() {
        let messages: Vec<Message> = (0..6)
            .map(|i| Message {
                role: Role::User,
                content: format!("old{i}"),
                timestamp: i,
                metadata: None,
            })
            .collect();
        let transcripts: Arc<dyn TranscriptStore> = Arc::new(CannedTranscripts(messages));
        let (queue, _worker) =
            PersistenceQueue::spawn(Arc::clone(&transcripts), PersistConfig::default());
        let store =
            SessionStore::new(4, EventPublisher::detached()).with_persistence(queue, transcripts);

        store.get_or_restore("s", CreateOptions::default()).await;
        let history = store.history("s", None).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "old2");
    }
}
