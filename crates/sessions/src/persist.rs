//! Background transcript persistence with bounded retry.

use std::{sync::Arc, time::Duration};

use {
    tokio::{
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, error, warn},
};

use crate::{store::Message, transcript::TranscriptStore};

#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Jobs buffered before new ones are dropped.
    pub capacity: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Initial retry delay, doubled after each failure.
    pub retry_delay_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_retries: 3,
            retry_delay_ms: 250,
        }
    }
}

#[derive(Debug)]
pub enum PersistJob {
    Append { key: String, message: Message },
    Clear { key: String },
    Remove { key: String },
    Flush(oneshot::Sender<()>),
}

impl PersistJob {
    fn describe(&self) -> (&'static str, &str) {
        match self {
            Self::Append { key, .. } => ("append", key),
            Self::Clear { key } => ("clear", key),
            Self::Remove { key } => ("remove", key),
            Self::Flush(_) => ("flush", ""),
        }
    }
}

/// Producer side of the persistence worker.
///
/// Jobs are applied strictly in enqueue order by a single worker task.
#[derive(Debug, Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<PersistJob>,
}

impl PersistenceQueue {
    /// Start the worker. It exits once every queue handle is dropped.
    pub fn spawn(store: Arc<dyn TranscriptStore>, config: PersistConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let worker = tokio::spawn(run_worker(rx, store, config));
        (Self { tx }, worker)
    }

    /// Queue a job without waiting. Returns false when the job was dropped.
    pub fn enqueue(&self, job: PersistJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                let (op, key) = job.describe();
                warn!(op, key, "transcript queue full, dropping job");
                false
            },
            Err(mpsc::error::TrySendError::Closed(job)) => {
                let (op, key) = job.describe();
                warn!(op, key, "transcript worker stopped, dropping job");
                false
            },
        }
    }

    /// Wait until every job queued before this call has been handled.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PersistJob::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<PersistJob>,
    store: Arc<dyn TranscriptStore>,
    config: PersistConfig,
) {
    while let Some(job) = rx.recv().await {
        if let PersistJob::Flush(done) = job {
            let _ = done.send(());
            continue;
        }
        apply_with_retry(store.as_ref(), &job, &config).await;
    }
    debug!("transcript worker stopped");
}

async fn apply_with_retry(store: &dyn TranscriptStore, job: &PersistJob, config: &PersistConfig) {
    let (op, key) = job.describe();
    let mut attempt = 0;
    let mut delay = config.retry_delay_ms;

    loop {
        attempt += 1;
        let result = match job {
            PersistJob::Append { key, message } => store.append(key, message).await,
            PersistJob::Clear { key } => store.clear(key).await,
            PersistJob::Remove { key } => store.remove(key).await,
            PersistJob::Flush(_) => Ok(()),
        };

        match result {
            Ok(()) => return,
            Err(e) if attempt > config.max_retries => {
                error!(op, key, attempt, error = %e, "transcript write failed, giving up");
                return;
            },
            Err(e) => {
                warn!(op, key, attempt, delay_ms = delay, error = %e, "transcript write failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = delay.saturating_mul(2);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::{Result, SessionError},
            store::Role,
        },
        async_trait::async_trait,
        std::sync::Mutex,
    };

    /// Fails the first `failures` appends, then records.
    struct Flaky {
        failures: Mutex<u32>,
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TranscriptStore for Flaky {
        async fn append(&self, _key: &str, message: &Message) -> Result<()> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SessionError::Task("transient".into()));
                }
            }
            self.written.lock().unwrap().push(message.content.clone());
            Ok(())
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

    fn msg(content: &str) -> Message {
        Message {
            role: Role::User,
            content: content.into(),
            timestamp: 0,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_order() {
        let flaky = Arc::new(Flaky {
            failures: Mutex::new(2),
            written: Mutex::new(Vec::new()),
        });
        let (queue, _worker) = PersistenceQueue::spawn(flaky.clone(), PersistConfig {
            capacity: 8,
            max_retries: 3,
            retry_delay_ms: 1,
        });
        for c in ["a", "b", "c"] {
            assert!(queue.enqueue(PersistJob::Append {
                key: "s".into(),
                message: msg(c),
            }));
        }
        queue.flush().await;
        assert_eq!(*flaky.written.lock().unwrap(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let flaky = Arc::new(Flaky {
            failures: Mutex::new(10),
            written: Mutex::new(Vec::new()),
        });
        let (queue, _worker) = PersistenceQueue::spawn(flaky.clone(), PersistConfig {
            capacity: 8,
            max_retries: 1,
            retry_delay_ms: 1,
        });
        queue.enqueue(PersistJob::Append {
            key: "s".into(),
            message: msg("lost"),
        });
        queue.flush().await;
        assert!(flaky.written.lock().unwrap().is_empty());
        assert_eq!(*flaky.failures.lock().unwrap(), 8);
    }
}
