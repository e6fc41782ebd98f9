//! Core types for FlowScout

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::{Error, Result};

/// Identity and timestamps shared by jobs and test plans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ResourceMeta {
    pub fn new(name: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// What a job does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// One scout run against one target
    Analysis,
    /// One scout run per device profile, sequentially
    Batch,
    /// Execute a test plan's flows and scenarios in the browser
    TestRun,
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobMode::Analysis => write!(f, "analysis"),
            JobMode::Batch => write!(f, "batch"),
            JobMode::TestRun => write!(f, "test_run"),
        }
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Running,
    Resuming,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Validate a lifecycle transition.
    ///
    /// `queued → running → (completed | failed)`, with `failed → resuming → running`.
    pub fn check_transition(self, to: JobState) -> Result<()> {
        use JobState::*;
        let ok = matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Resuming)
                | (Resuming, Running)
                | (Resuming, Failed)
        );
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Resuming => write!(f, "resuming"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Parameters of a scout analysis run.
///
/// Persisted verbatim with the job; a resume always rebuilds the scout
/// command line from this stored copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParams {
    /// Target application URL
    pub url: String,

    /// Let the scout drive the page with its own agent
    #[serde(default)]
    pub agent: bool,

    /// Exploration step budget
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Model override passed through to scout
    #[serde(default)]
    pub model: Option<String>,

    /// Analysis modules to enable (empty = scout defaults)
    #[serde(default)]
    pub modules: Vec<String>,

    /// Adaptive step budget
    #[serde(default)]
    pub adaptive: bool,

    /// Extended exploration mode
    #[serde(default)]
    pub extended: bool,

    /// Device profiles for batch runs
    #[serde(default)]
    pub devices: Vec<String>,

    /// Run the derived test plan right after a successful analysis
    #[serde(default)]
    pub auto_test: bool,
}

fn default_max_steps() -> u32 {
    30
}

impl AnalysisParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: false,
            max_steps: default_max_steps(),
            model: None,
            modules: Vec::new(),
            adaptive: false,
            extended: false,
            devices: Vec::new(),
            auto_test: false,
        }
    }

    /// Profile flags forwarded to every scout invocation of this job
    pub fn profile_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.agent {
            args.push("--agent".to_string());
        }
        args.extend(["--max-steps".to_string(), self.max_steps.to_string()]);
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if !self.modules.is_empty() {
            args.extend(["--modules".to_string(), self.modules.join(",")]);
        }
        if self.adaptive {
            args.push("--adaptive".to_string());
        }
        if self.extended {
            args.push("--extended".to_string());
        }
        args
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "url must be http(s): {}",
                self.url
            )));
        }
        if self.max_steps == 0 {
            return Err(Error::InvalidConfig("max_steps must be positive".to_string()));
        }
        Ok(())
    }
}

/// Parameters of a browser test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunParams {
    pub plan_id: String,
    /// Run only the deterministic flows, skip agent scenarios
    #[serde(default)]
    pub flows_only: bool,
}

/// Persisted job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum JobSpec {
    Analysis(AnalysisParams),
    Batch(AnalysisParams),
    TestRun(TestRunParams),
}

impl JobSpec {
    pub fn mode(&self) -> JobMode {
        match self {
            JobSpec::Analysis(_) => JobMode::Analysis,
            JobSpec::Batch(_) => JobMode::Batch,
            JobSpec::TestRun(_) => JobMode::TestRun,
        }
    }

    pub fn analysis_params(&self) -> Option<&AnalysisParams> {
        match self {
            JobSpec::Analysis(p) | JobSpec::Batch(p) => Some(p),
            JobSpec::TestRun(_) => None,
        }
    }
}

/// Why a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ProcessExit,
    QueueTimeout,
    ShutdownAbort,
    Panic,
    AllDevicesFailed,
    Internal,
}

impl FailureKind {
    /// Whether re-submitting (or resuming) the job can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::ProcessExit
                | FailureKind::QueueTimeout
                | FailureKind::ShutdownAbort
                | FailureKind::AllDevicesFailed
        )
    }
}

/// Terminal failure details, persisted so a failure can be diagnosed
/// without re-running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub reason: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub last_step: Option<String>,
    #[serde(default)]
    pub log_tail: Vec<String>,
}

/// Per-device result of a batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOutcome {
    pub device: String,
    pub completed: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Exit code, last step and stderr tail of a failed device run
    #[serde(default)]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub flows: usize,
}

/// Persisted job status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub checkpoint_available: bool,
    #[serde(default)]
    pub devices: Vec<DeviceOutcome>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

/// A job with its definition and status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub meta: ResourceMeta,
    pub spec: JobSpec,
    pub status: JobStatus,
}

/// Live view of an in-flight job, kept in memory only.
///
/// Observers that reconnect mid-run read this snapshot before subscribing
/// to the live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningJob {
    pub id: String,
    pub mode: JobMode,
    pub started_at: i64,
    pub total_units: usize,
    pub completed_units: Vec<String>,
    pub log: VecDeque<String>,
    pub state: JobState,
    #[serde(default)]
    pub step: Option<String>,
}

impl RunningJob {
    pub fn new(id: impl Into<String>, mode: JobMode, total_units: usize) -> Self {
        Self {
            id: id.into(),
            mode,
            started_at: chrono::Utc::now().timestamp(),
            total_units,
            completed_units: Vec::new(),
            log: VecDeque::new(),
            state: JobState::Queued,
            step: None,
        }
    }

    /// Append a log line, evicting the oldest beyond `cap`
    pub fn push_log(&mut self, line: impl Into<String>, cap: usize) {
        self.log.push_back(line.into());
        while self.log.len() > cap {
            self.log.pop_front();
        }
    }
}

/// Resumable snapshot of a scout run, written when the run fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    pub step: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// Step-level record of agent detail or screenshots reported by scout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub job_id: String,
    pub seq: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

// ============================================================================
// Scenarios and test plans
// ============================================================================

/// One step of a natural-language scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
}

/// A test scenario produced by analysis and consumed by the agent executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "startUrl")]
    pub start_url: Option<String>,
    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

/// Test plan derived from a completed analysis job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlanSpec {
    pub job_id: String,
    pub start_url: String,
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub meta: ResourceMeta,
    pub spec: TestPlanSpec,
}

/// Browser viewport dimensions in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}
