//! Append-only transcript persistence for session messages.

use std::{
    fs::{self, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use {async_trait::async_trait, tracing::warn};

use crate::{
    error::{Result, SessionError},
    store::{Message, Role},
};

/// Durable storage for session transcripts.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn append(&self, key: &str, message: &Message) -> Result<()>;
    /// Every persisted message of a session, oldest first.
    async fn load(&self, key: &str) -> Result<Vec<Message>>;
    async fn clear(&self, key: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

// ── JSONL files ──────────────────────────────────────────────────────────────

/// One `<key>.jsonl` file per session, one message per line, written under an
/// advisory file lock so other processes reading the directory never see a
/// torn line.
pub struct JsonlTranscriptStore {
    dir: PathBuf,
}

impl JsonlTranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", encode_key(key)))
    }
}

/// File-name-safe encoding: `[A-Za-z0-9_-]` kept, everything else `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut lock = fd_lock::RwLock::new(file);
    let mut guard = lock.write()?;
    guard.write_all(line.as_bytes())?;
    guard.write_all(b"\n")?;
    Ok(())
}

fn read_lines(path: &Path) -> io::Result<Vec<Message>> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let lock = fd_lock::RwLock::new(file);
    let guard = lock.read()?;
    let mut messages = Vec::new();
    for (n, line) in BufReader::new(&*guard).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(m) => messages.push(m),
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping corrupt transcript line"),
        }
    }
    Ok(messages)
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> io::Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SessionError::Task(e.to_string()))?
        .map_err(SessionError::from)
}

#[async_trait]
impl TranscriptStore for JsonlTranscriptStore {
    async fn append(&self, key: &str, message: &Message) -> Result<()> {
        let line = serde_json::to_string(message)?;
        let path = self.path_for(key);
        blocking(move || append_line(&path, &line)).await
    }

    async fn load(&self, key: &str) -> Result<Vec<Message>> {
        let path = self.path_for(key);
        blocking(move || read_lines(&path)).await
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        blocking(move || {
            if path.exists() {
                fs::File::create(&path)?;
            }
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        blocking(move || match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .await
    }
}

// ── SQLite ───────────────────────────────────────────────────────────────────

/// SQLite-backed transcript store.
pub struct SqliteTranscriptStore {
    pool: sqlx::SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    role: String,
    content: String,
    timestamp: i64,
    metadata: Option<String>,
}

impl TryFrom<MessageRow> for Message {
    type Error = SessionError;

    fn try_from(r: MessageRow) -> Result<Self> {
        let role = Role::parse(&r.role)
            .ok_or_else(|| SessionError::Task(format!("unknown role in transcript: {}", r.role)))?;
        let metadata = r.metadata.as_deref().map(serde_json::from_str).transpose()?;
        Ok(Self {
            role,
            content: r.content,
            timestamp: u64::try_from(r.timestamp).unwrap_or_default(),
            metadata,
        })
    }
}

impl SqliteTranscriptStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `session_messages` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS session_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_key TEXT NOT NULL,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                metadata    TEXT
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_messages_key ON session_messages(session_key)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Open (or create) a database file and initialise the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = sqlx::SqlitePool::connect(&url).await?;
        Self::init(&pool).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl TranscriptStore for SqliteTranscriptStore {
    async fn append(&self, key: &str, message: &Message) -> Result<()> {
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO session_messages (session_key, role, content, timestamp, metadata)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(i64::try_from(message.timestamp).unwrap_or(i64::MAX))
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT role, content, timestamp, metadata FROM session_messages
             WHERE session_key = ? ORDER BY id ASC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn clear(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_messages WHERE session_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.clear(key).await
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn msg(role: Role, content: &str, metadata: Option<serde_json::Value>) -> Message {
        Message {
            role,
            content: content.into(),
            timestamp: 1_700_000_000_000,
            metadata,
        }
    }

    #[test]
    fn keys_are_encoded_for_file_names() {
        assert_eq!(encode_key("agent:ops:main"), "agent%3Aops%3Amain");
        assert_eq!(encode_key("plain-key_1"), "plain-key_1");
        assert_ne!(encode_key("a:b"), encode_key("a_b"));
    }

    #[tokio::test]
    async fn jsonl_append_load_clear_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().join("sessions"));

        store.append("agent:ops:main", &msg(Role::User, "hi", None)).await.unwrap();
        store
            .append(
                "agent:ops:main",
                &msg(Role::Assistant, "hello", Some(json!({"model": "echo"}))),
            )
            .await
            .unwrap();

        let loaded = store.load("agent:ops:main").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].metadata, Some(json!({"model": "echo"})));

        store.clear("agent:ops:main").await.unwrap();
        assert!(store.load("agent:ops:main").await.unwrap().is_empty());
        assert!(store.path_for("agent:ops:main").exists());

        store.remove("agent:ops:main").await.unwrap();
        assert!(!store.path_for("agent:ops:main").exists());
        store.remove("agent:ops:main").await.unwrap();
    }

    #[tokio::test]
    async fn jsonl_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path());
        store.append("s", &msg(Role::User, "ok", None)).await.unwrap();
        OpenOptions::new()
            .append(true)
            .open(store.path_for("s"))
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        assert_eq!(store.load("s").await.unwrap().len(), 1);
        assert!(store.load("never-written").await.unwrap().is_empty());
    }

    async fn sqlite_store() -> SqliteTranscriptStore {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteTranscriptStore::init(&pool).await.unwrap();
        SqliteTranscriptStore::new(pool)
    }

    #[tokio::test]
    async fn sqlite_append_and_load_in_order() {
        let store = sqlite_store().await;
        store.append("s", &msg(Role::User, "one", None)).await.unwrap();
        store
            .append("s", &msg(Role::Tool, "two", Some(json!({"tool": "price"}))))
            .await
            .unwrap();
        store.append("other", &msg(Role::User, "x", None)).await.unwrap();

        let loaded = store.load("s").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "one");
        assert_eq!(loaded[1].role, Role::Tool);
        assert_eq!(loaded[1].metadata, Some(json!({"tool": "price"})));
    }

    #[tokio::test]
    async fn sqlite_timestamps_clamp_instead_of_wrapping() {
        let store = sqlite_store().await;
        let mut late = msg(Role::User, "late", None);
        late.timestamp = u64::MAX;
        store.append("s", &late).await.unwrap();
        sqlx::query(
            "INSERT INTO session_messages (session_key, role, content, timestamp)
             VALUES ('s', 'user', 'early', -5)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let loaded = store.load("s").await.unwrap();
        assert_eq!(loaded[0].timestamp, u64::try_from(i64::MAX).unwrap());
        assert_eq!(loaded[1].timestamp, 0);
    }

    #[tokio::test]
    async fn sqlite_clear_only_touches_one_session() {
        let store = sqlite_store().await;
        store.append("s", &msg(Role::User, "one", None)).await.unwrap();
        store.append("other", &msg(Role::User, "x", None)).await.unwrap();
        store.clear("s").await.unwrap();
        assert!(store.load("s").await.unwrap().is_empty());
        assert_eq!(store.load("other").await.unwrap().len(), 1);
    }
}
