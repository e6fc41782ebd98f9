//! Progress events published while jobs run

use serde::{Deserialize, Serialize};

use crate::types::{FailureKind, JobMode};

/// Typed progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    JobQueued {
        resource: String,
    },
    JobStarted {
        mode: JobMode,
        total_units: usize,
    },
    JobProgress {
        step: String,
        message: String,
    },
    StepDetail {
        detail: serde_json::Value,
    },
    Reasoning {
        text: String,
    },
    ScreenshotAvailable {
        step: String,
        #[serde(default)]
        path: Option<String>,
    },
    HintAcknowledged {
        message: String,
    },
    JobCompleted {
        #[serde(default)]
        summary: Option<String>,
    },
    JobFailed {
        kind: FailureKind,
        reason: String,
        checkpoint_available: bool,
    },
}

impl ProgressEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::JobQueued { .. } => "job_queued",
            ProgressEvent::JobStarted { .. } => "job_started",
            ProgressEvent::JobProgress { .. } => "job_progress",
            ProgressEvent::StepDetail { .. } => "step_detail",
            ProgressEvent::Reasoning { .. } => "reasoning",
            ProgressEvent::ScreenshotAvailable { .. } => "screenshot_available",
            ProgressEvent::HintAcknowledged { .. } => "hint_acknowledged",
            ProgressEvent::JobCompleted { .. } => "job_completed",
            ProgressEvent::JobFailed { .. } => "job_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::JobCompleted { .. } | ProgressEvent::JobFailed { .. }
        )
    }
}

/// Event addressed to one job's observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub job_id: String,
    pub at: i64,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

impl ProgressMessage {
    pub fn new(job_id: impl Into<String>, event: ProgressEvent) -> Self {
        Self {
            job_id: job_id.into(),
            at: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}

/// Publish interface for progress events.
///
/// Publishing never blocks and never fails; a sink with no observers drops
/// the message.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, message: ProgressMessage);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _message: ProgressMessage) {}
}

/// A sink bound to one job id
#[derive(Clone)]
pub struct JobReporter {
    job_id: String,
    sink: std::sync::Arc<dyn ProgressSink>,
}

impl JobReporter {
    pub fn new(job_id: impl Into<String>, sink: std::sync::Arc<dyn ProgressSink>) -> Self {
        Self {
            job_id: job_id.into(),
            sink,
        }
    }

    /// Reporter that goes nowhere, for standalone runs
    pub fn detached() -> Self {
        Self::new("local", std::sync::Arc::new(NullSink))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn emit(&self, event: ProgressEvent) {
        self.sink.publish(ProgressMessage::new(self.job_id.clone(), event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let msg = ProgressMessage::new(
            "job-1",
            ProgressEvent::JobProgress {
                step: "explore".to_string(),
                message: "visiting /login".to_string(),
            },
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "job_progress");
        assert_eq!(json["job_id"], "job-1");
        assert_eq!(json["step"], "explore");

        let back: ProgressMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_terminal_events() {
        assert!(ProgressEvent::JobCompleted { summary: None }.is_terminal());
        assert!(!ProgressEvent::Reasoning { text: "x".into() }.is_terminal());
        assert_eq!(
            ProgressEvent::HintAcknowledged { message: "ok".into() }.kind(),
            "hint_acknowledged"
        );
    }
}
