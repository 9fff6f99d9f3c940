//! Outgoing event streams.
//!
//! Each session key owns a stream: a sequence counter, the connections bound
//! to it, and a bounded buffer of the frames it sent so a reconnecting client
//! can replay what it missed. Sequence assignment, buffering and fan-out
//! happen under the stream's lock, so every connection sees its frames in
//! strictly increasing `seq` order.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    dashmap::DashMap,
    serde::Serialize,
    serde_json::Value,
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use tradeclaw_protocol::EventFrame;

/// Serialized frames headed for one connection's write loop.
pub type FrameSender = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct Stream {
    last_seq: u64,
    buffer: VecDeque<EventFrame>,
    subscribers: HashMap<String, FrameSender>,
}

/// Result of a replay request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Replay {
    pub events: Vec<EventFrame>,
    /// Events after `lastSeq` were dropped from the buffer (or the stream
    /// restarted), so the client must resynchronise from scratch.
    pub gap: bool,
    pub oldest_seq: Option<u64>,
}

pub struct EventStreams {
    streams: DashMap<String, Arc<Mutex<Stream>>>,
    capacity: usize,
    state_version: AtomicU64,
}

fn lock(stream: &Mutex<Stream>) -> MutexGuard<'_, Stream> {
    stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn send_frame(stream: &mut Stream, frame: &str) {
    stream
        .subscribers
        .retain(|conn_id, tx| match tx.send(frame.to_string()) {
            Ok(()) => true,
            Err(_) => {
                debug!(conn_id = %conn_id, "dropping closed subscriber");
                false
            },
        });
}

impl EventStreams {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: DashMap::new(),
            capacity: capacity.max(1),
            state_version: AtomicU64::new(0),
        }
    }

    fn stream(&self, key: &str) -> Arc<Mutex<Stream>> {
        Arc::clone(
            self.streams
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Stream::default())))
                .value(),
        )
    }

    pub fn state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    /// Note a state change; returns the new version.
    pub fn bump_state_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Emit `event` on the stream of `key`. Returns the assigned `seq`.
    pub fn publish(&self, key: &str, event: &str, payload: Value) -> u64 {
        let stream = self.stream(key);
        let mut stream = lock(&stream);
        stream.last_seq += 1;
        let frame = EventFrame::new(event, payload, stream.last_seq, self.state_version());
        match serde_json::to_string(&frame) {
            Ok(text) => send_frame(&mut stream, &text),
            Err(e) => warn!(event, error = %e, "failed to serialize event"),
        }
        stream.buffer.push_back(frame);
        while stream.buffer.len() > self.capacity {
            stream.buffer.pop_front();
        }
        stream.last_seq
    }

    /// Emit `event` on every stream that has a connected subscriber.
    pub fn broadcast(&self, event: &str, payload: Value) -> usize {
        let keys: Vec<String> = self
            .streams
            .iter()
            .filter(|entry| !lock(entry.value()).subscribers.is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        for key in &keys {
            self.publish(key, event, payload.clone());
        }
        keys.len()
    }

    /// Attach a connection to the stream of `key`.
    ///
    /// With `resume_from`, the buffered frames after that seq are written to
    /// `tx` before the connection starts receiving live events.
    pub fn subscribe(
        &self,
        key: &str,
        conn_id: &str,
        tx: FrameSender,
        resume_from: Option<u64>,
    ) -> Option<Replay> {
        let stream = self.stream(key);
        let mut stream = lock(&stream);
        let replay = resume_from.map(|last_seq| replay_locked(&stream, last_seq));
        if let Some(replay) = &replay {
            for frame in &replay.events {
                if let Ok(text) = serde_json::to_string(frame) {
                    let _ = tx.send(text);
                }
            }
        }
        stream.subscribers.insert(conn_id.to_string(), tx);
        replay
    }

    pub fn unsubscribe(&self, key: &str, conn_id: &str) {
        if let Some(stream) = self.streams.get(key) {
            lock(stream.value()).subscribers.remove(conn_id);
        }
    }

    /// Frames of `key` with `seq > last_seq`.
    pub fn replay(&self, key: &str, last_seq: u64) -> Replay {
        match self.streams.get(key) {
            Some(stream) => replay_locked(&lock(stream.value()), last_seq),
            None => Replay {
                events: Vec::new(),
                gap: last_seq > 0,
                oldest_seq: None,
            },
        }
    }

    pub fn last_seq(&self, key: &str) -> u64 {
        self.streams
            .get(key)
            .map(|s| lock(s.value()).last_seq)
            .unwrap_or(0)
    }

    /// Forget a stream (its session was deleted).
    pub fn remove(&self, key: &str) {
        self.streams.remove(key);
    }
}

fn replay_locked(stream: &Stream, last_seq: u64) -> Replay {
    let oldest_seq = stream.buffer.front().map(|f| f.seq);
    let gap = match oldest_seq {
        // Client is ahead of us: the stream restarted.
        _ if last_seq > stream.last_seq => true,
        Some(oldest) => last_seq + 1 < oldest,
        None => false,
    };
    Replay {
        events: stream
            .buffer
            .iter()
            .filter(|f| f.seq > last_seq)
            .cloned()
            .collect(),
        gap,
        oldest_seq,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn seq_is_strictly_increasing_per_stream() {
        let streams = EventStreams::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        streams.subscribe("s", "c1", tx, None);

        for i in 0..3 {
            streams.publish("s", "chat.chunk", json!({ "i": i }));
        }
        streams.publish("other", "chat.chunk", json!({}));

        let seqs: Vec<u64> = frames(&mut rx)
            .iter()
            .map(|f| f["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, [1, 2, 3]);
        assert_eq!(streams.last_seq("other"), 1);
    }

    #[test]
    fn replay_after_last_seq_and_gap_detection() {
        let streams = EventStreams::new(3);
        for i in 0..5 {
            streams.publish("s", "tick", json!({ "i": i }));
        }
        // Buffer holds seq 3..=5.
        let replay = streams.replay("s", 3);
        assert_eq!(replay.events.iter().map(|f| f.seq).collect::<Vec<_>>(), [4, 5]);
        assert!(!replay.gap);
        assert_eq!(replay.oldest_seq, Some(3));

        let replay = streams.replay("s", 1);
        assert!(replay.gap);
        assert_eq!(replay.events.len(), 3);

        assert!(streams.replay("s", 9).gap);
        assert!(!streams.replay("s", 5).gap);
        assert!(streams.replay("unknown", 2).gap);
        assert!(!streams.replay("unknown", 0).gap);
    }

    #[test]
    fn resume_replays_before_live_events() {
        let streams = EventStreams::new(16);
        streams.publish("s", "a", json!({}));
        streams.publish("s", "b", json!({}));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let replay = streams.subscribe("s", "c2", tx, Some(1)).unwrap();
        assert_eq!(replay.events.len(), 1);
        streams.publish("s", "c", json!({}));

        let names: Vec<String> = frames(&mut rx)
            .iter()
            .map(|f| f["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn broadcast_reaches_only_subscribed_streams() {
        let streams = EventStreams::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        streams.subscribe("s1", "c1", tx, None);
        streams.publish("s2", "x", json!({}));

        assert_eq!(streams.broadcast("tick", json!({})), 1);
        assert_eq!(frames(&mut rx).len(), 1);

        streams.bump_state_version();
        streams.publish("s1", "y", json!({}));
        assert_eq!(frames(&mut rx)[0]["stateVersion"], 1);

        streams.unsubscribe("s1", "c1");
        assert_eq!(streams.broadcast("tick", json!({})), 0);
    }
}
