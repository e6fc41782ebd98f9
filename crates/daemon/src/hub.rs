//! Progress hub: fan-out of job progress to live observers

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use flowscout_common::{JobReporter, ProgressMessage, ProgressSink};

use crate::registry::JobRegistry;

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcasts every [`ProgressMessage`] and mirrors it into the running
/// job's log buffer so observers that connect late can catch up.
pub struct ProgressHub {
    tx: broadcast::Sender<ProgressMessage>,
    registry: JobRegistry,
    log_cap: usize,
}

impl ProgressHub {
    pub fn new(registry: JobRegistry, log_cap: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            tx,
            registry,
            log_cap,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.tx.subscribe()
    }

    /// Reporter publishing into this hub for one job
    pub fn reporter(self: &Arc<Self>, job_id: &str) -> JobReporter {
        JobReporter::new(job_id, self.clone())
    }
}

impl ProgressSink for ProgressHub {
    fn publish(&self, message: ProgressMessage) {
        let line = serde_json::to_string(&message).unwrap_or_default();
        let cap = self.log_cap;
        self.registry.update(&message.job_id, |job| {
            if let flowscout_common::ProgressEvent::JobProgress { step, .. } = &message.event {
                job.step = Some(step.clone());
            }
            job.push_log(line, cap);
        });

        // No receivers is normal between observers
        if self.tx.send(message).is_err() {
            trace!("No progress observers connected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscout_common::{JobMode, ProgressEvent, RunningJob};

    #[tokio::test]
    async fn test_publish_updates_snapshot_and_subscribers() {
        let registry = JobRegistry::new();
        registry.register(RunningJob::new("j1", JobMode::Analysis, 1));
        let hub = ProgressHub::new(registry.clone(), 2);
        let mut rx = hub.subscribe();

        let reporter = hub.reporter("j1");
        for step in ["explore", "analysis", "flows"] {
            reporter.emit(ProgressEvent::JobProgress {
                step: step.to_string(),
                message: String::new(),
            });
        }

        let snapshot = registry.get("j1").unwrap();
        assert_eq!(snapshot.step.as_deref(), Some("flows"));
        assert_eq!(snapshot.log.len(), 2);
        assert!(snapshot.log[1].contains("\"step\":\"flows\""));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.job_id, "j1");
        assert_eq!(first.event.kind(), "job_progress");
    }

    #[test]
    fn test_publish_without_observers_or_job() {
        let hub = ProgressHub::new(JobRegistry::new(), 10);
        hub.reporter("gone").emit(ProgressEvent::JobCompleted { summary: None });
    }
}
