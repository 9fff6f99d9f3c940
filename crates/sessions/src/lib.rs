//! Session storage and management.
//!
//! Sessions live in memory, keyed by session key, each with a bounded message
//! history. Transcripts are persisted in the background through a
//! [`persist::PersistenceQueue`] into a [`transcript::TranscriptStore`]
//! (JSONL files with advisory locking, or SQLite).

pub mod error;
pub mod key;
pub mod persist;
pub mod store;
pub mod transcript;

pub use {
    error::{Result, SessionError},
    key::SessionKey,
    persist::{PersistConfig, PersistenceQueue},
    store::{
        CreateOptions, ListFilter, Message, Role, Session, SessionHandle, SessionStore,
        SessionSummary,
    },
    transcript::{JsonlTranscriptStore, SqliteTranscriptStore, TranscriptStore},
};
