//! Concurrency slots for resource-heavy work
//!
//! One permit per resource kind: at most one analysis and one browser test
//! run at any time. Waiters are told they are queued and give up after the
//! configured wait or when the server shuts down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use flowscout_common::{JobReporter, ProgressEvent};

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Analysis,
    Browser,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Analysis => "analysis",
            Resource::Browser => "browser",
        }
    }
}

/// A held slot; released when dropped, including during unwinding
#[derive(Debug)]
pub struct Slot {
    resource: Resource,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub fn resource(&self) -> Resource {
        self.resource
    }
}

#[derive(Clone)]
pub struct SlotPool {
    analysis: Arc<Semaphore>,
    browser: Arc<Semaphore>,
    queue_wait: Duration,
    shutdown: CancellationToken,
}

impl SlotPool {
    pub fn new(queue_wait: Duration, shutdown: CancellationToken) -> Self {
        Self {
            analysis: Arc::new(Semaphore::new(1)),
            browser: Arc::new(Semaphore::new(1)),
            queue_wait,
            shutdown,
        }
    }

    fn semaphore(&self, resource: Resource) -> &Arc<Semaphore> {
        match resource {
            Resource::Analysis => &self.analysis,
            Resource::Browser => &self.browser,
        }
    }

    /// Wait for `resource`, publishing `job_queued` if it is busy
    pub async fn acquire(&self, resource: Resource, reporter: &JobReporter) -> Result<Slot, JobError> {
        let semaphore = self.semaphore(resource).clone();

        match semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                debug!("Acquired {} slot for {}", resource.as_str(), reporter.job_id());
                return Ok(Slot {
                    resource,
                    _permit: permit,
                });
            }
            Err(TryAcquireError::Closed) => return Err(JobError::ShutdownAbort),
            Err(TryAcquireError::NoPermits) => {}
        }
        if self.shutdown.is_cancelled() {
            return Err(JobError::ShutdownAbort);
        }

        info!("Job {} queued for {} slot", reporter.job_id(), resource.as_str());
        reporter.emit(ProgressEvent::JobQueued {
            resource: resource.as_str().to_string(),
        });

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(JobError::ShutdownAbort),
            acquired = tokio::time::timeout(self.queue_wait, semaphore.acquire_owned()) => match acquired {
                Ok(Ok(permit)) => Ok(Slot { resource, _permit: permit }),
                Ok(Err(_)) => Err(JobError::ShutdownAbort),
                Err(_) => Err(JobError::QueueTimeout {
                    resource: resource.as_str().to_string(),
                    waited_secs: self.queue_wait.as_secs(),
                }),
            },
        }
    }

    pub fn available(&self, resource: Resource) -> usize {
        self.semaphore(resource).available_permits()
    }

    /// Refuse all future acquisitions and wake every waiter
    pub fn close(&self) {
        self.shutdown.cancel();
        self.analysis.close();
        self.browser.close();
    }
}
