//! In-memory registry of running jobs and their scout processes

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use flowscout_common::RunningJob;

use crate::error::HintError;
use crate::protocol::HINT_PREFIX;

pub type HintWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Relay for user hints into a running scout's stdin.
///
/// Writes are serialized by an async mutex that teardown also takes, so a
/// hint never races the pipe being closed.
pub struct HintChannel {
    writer: tokio::sync::Mutex<Option<HintWriter>>,
    last_sent: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl HintChannel {
    pub fn new(writer: Option<HintWriter>, min_interval: Duration) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            last_sent: Mutex::new(None),
            min_interval,
        }
    }

    /// Write `HINT:<json>` as one line
    pub async fn send(&self, message: &str) -> Result<(), HintError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(HintError::Closed);
        };

        let last_sent = *self.last_sent.lock();
        if let Some(last) = last_sent {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                return Err(HintError::TooSoon {
                    interval_ms: self.min_interval.as_millis() as u64,
                    retry_after_ms: (self.min_interval - elapsed).as_millis() as u64,
                });
            }
        }

        let line = format!("{}{}\n", HINT_PREFIX, serde_json::json!({ "message": message }));
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        *self.last_sent.lock() = Some(Instant::now());
        Ok(())
    }

    /// Drop the writer; later hints fail with [`HintError::Closed`]
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Live process attached to a job
#[derive(Clone)]
pub struct ProcessEntry {
    pub pid: Option<u32>,
    pub hints: Arc<HintChannel>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, RunningJob>,
    processes: HashMap<String, ProcessEntry>,
}

/// Owned registry of running jobs; every operation is atomic under one lock
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job; `false` when the id is already tracked
    pub fn register(&self, job: RunningJob) -> bool {
        let mut inner = self.inner.write();
        if inner.jobs.contains_key(&job.id) {
            return false;
        }
        debug!("Registered running job {}", job.id);
        inner.jobs.insert(job.id.clone(), job);
        true
    }

    pub fn get(&self, id: &str) -> Option<RunningJob> {
        self.inner.read().jobs.get(id).cloned()
    }

    pub fn list(&self) -> Vec<RunningJob> {
        self.inner.read().jobs.values().cloned().collect()
    }

    /// Apply `f` to a tracked job; `false` when it is not tracked
    pub fn update(&self, id: &str, f: impl FnOnce(&mut RunningJob)) -> bool {
        match self.inner.write().jobs.get_mut(id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a job and any process still attached to it
    pub fn remove(&self, id: &str) -> Option<RunningJob> {
        let mut inner = self.inner.write();
        inner.processes.remove(id);
        inner.jobs.remove(id)
    }

    pub fn attach_process(&self, id: &str, entry: ProcessEntry) {
        self.inner.write().processes.insert(id.to_string(), entry);
    }

    pub fn detach_process(&self, id: &str) -> Option<ProcessEntry> {
        self.inner.write().processes.remove(id)
    }

    pub fn process(&self, id: &str) -> Option<ProcessEntry> {
        self.inner.read().processes.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscout_common::JobMode;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_register_update_remove() {
        let registry = JobRegistry::new();
        assert!(registry.register(RunningJob::new("j1", JobMode::Analysis, 1)));
        assert!(!registry.register(RunningJob::new("j1", JobMode::Batch, 3)));

        assert!(registry.update("j1", |job| job.push_log("started", 2)));
        assert!(!registry.update("missing", |_| {}));
        assert_eq!(registry.get("j1").unwrap().log.len(), 1);
        assert_eq!(registry.list().len(), 1);

        registry.attach_process(
            "j1",
            ProcessEntry {
                pid: Some(42),
                hints: Arc::new(HintChannel::new(None, Duration::ZERO)),
            },
        );
        assert_eq!(registry.process("j1").unwrap().pid, Some(42));

        assert!(registry.remove("j1").is_some());
        assert!(registry.get("j1").is_none());
        assert!(registry.process("j1").is_none());
    }

    #[tokio::test]
    async fn test_hint_rate_limit_and_close() {
        let (client, mut server) = tokio::io::duplex(1024);
        let channel = HintChannel::new(Some(Box::new(client)), Duration::from_secs(60));

        channel.send("try the login link").await.unwrap();
        assert!(matches!(
            channel.send("again").await,
            Err(HintError::TooSoon { interval_ms: 60000, .. })
        ));

        channel.close().await;
        assert!(matches!(channel.send("late").await, Err(HintError::Closed)));

        let mut received = String::new();
        server.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "HINT:{\"message\":\"try the login link\"}\n");
    }

    #[tokio::test]
    async fn test_hints_spaced_by_interval() {
        let (client, _server) = tokio::io::duplex(1024);
        let channel = HintChannel::new(Some(Box::new(client)), Duration::from_millis(20));
        channel.send("one").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        channel.send("two").await.unwrap();
    }
}
