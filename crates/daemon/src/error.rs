//! Job failure taxonomy

use thiserror::Error;

use flowscout_common::{FailureKind, JobFailure};

/// Terminal failure of a job.
///
/// Each variant maps to a persisted [`FailureKind`] so callers can tell
/// retryable conditions from terminal ones.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("timed out after {seconds}s")]
    Timeout {
        seconds: u64,
        last_step: Option<String>,
        log_tail: Vec<String>,
    },

    #[error("scout exited with {}", exit_text(.code))]
    ProcessExit {
        code: Option<i32>,
        last_step: Option<String>,
        log_tail: Vec<String>,
    },

    #[error("failed to start {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    #[error("scout finished without a JSON result")]
    NoResult { log_tail: Vec<String> },

    #[error("no {resource} slot became free within {waited_secs}s")]
    QueueTimeout { resource: String, waited_secs: u64 },

    #[error("server is shutting down")]
    ShutdownAbort,

    #[error("job panicked: {0}")]
    Panic(String),

    #[error("job {0} has no checkpoint to resume from")]
    NoCheckpoint(String),

    #[error("{0}")]
    AllDevicesFailed(String),

    #[error(transparent)]
    Common(#[from] flowscout_common::Error),
}

fn exit_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Timeout { .. } => FailureKind::Timeout,
            JobError::ProcessExit { .. } | JobError::Spawn { .. } | JobError::NoResult { .. } => {
                FailureKind::ProcessExit
            }
            JobError::QueueTimeout { .. } => FailureKind::QueueTimeout,
            JobError::ShutdownAbort => FailureKind::ShutdownAbort,
            JobError::Panic(_) => FailureKind::Panic,
            JobError::AllDevicesFailed(_) => FailureKind::AllDevicesFailed,
            JobError::NoCheckpoint(_) | JobError::Common(_) => FailureKind::Internal,
        }
    }

    /// Persistable failure record
    pub fn to_failure(&self) -> JobFailure {
        let (exit_code, last_step, log_tail) = match self {
            JobError::Timeout {
                last_step,
                log_tail,
                ..
            } => (None, last_step.clone(), log_tail.clone()),
            JobError::ProcessExit {
                code,
                last_step,
                log_tail,
            } => (*code, last_step.clone(), log_tail.clone()),
            JobError::NoResult { log_tail } => (Some(0), None, log_tail.clone()),
            _ => (None, None, Vec::new()),
        };
        JobFailure {
            kind: self.kind(),
            reason: self.to_string(),
            exit_code,
            last_step,
            log_tail,
        }
    }
}

/// Why a hint was not relayed
#[derive(Error, Debug)]
pub enum HintError {
    #[error("hints are limited to one every {interval_ms} ms; retry in {retry_after_ms} ms")]
    TooSoon { interval_ms: u64, retry_after_ms: u64 },

    #[error("job is not accepting hints")]
    Closed,

    #[error("failed to write hint: {0}")]
    Io(#[from] std::io::Error),
}
