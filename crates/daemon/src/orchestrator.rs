//! Job orchestration
//!
//! Accepts analysis, batch and test-run jobs, runs each as a supervised
//! background task under the matching concurrency slot, and drives every
//! job to exactly one terminal state.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use flowscout_agent::{AgentConfig, ScenarioExecutor};
use flowscout_common::{
    AnalysisParams, Browser, Checkpoint, DeviceOutcome, Error, Job, JobMode, JobReporter,
    JobSpec, JobState, ModelClient, ProgressEvent, ProgressMessage, RunningJob, Scenario,
    TestPlan, TestRunParams,
};
use flowscout_flow::{order_flows, reconstruct, ExecutorConfig, FlowExecutor, GeneratedFlow};

use crate::checkpoint::{find_checkpoint, write_resume_payload};
use crate::config::DaemonConfig;
use crate::error::{HintError, JobError};
use crate::hub::ProgressHub;
use crate::protocol::ProgressUpdate;
use crate::registry::JobRegistry;
use crate::scout::{ProgressHandler, ScoutInvocation, ScoutRunner};
use crate::slots::{Resource, SlotPool};
use crate::state::StateManager;
use crate::supervisor::supervise;

/// Starts browsers for test runs
#[async_trait]
pub trait BrowserFactory: Send + Sync {
    async fn launch(&self) -> flowscout_common::Result<Arc<dyn Browser>>;
}

/// Work a job task performs
enum Work {
    Analysis {
        params: AnalysisParams,
        resume: Option<Checkpoint>,
    },
    Batch(AnalysisParams),
    TestRun(TestRunParams),
}

/// What an analysis run left behind
struct StoredOutputs {
    flows: Vec<String>,
    scenarios: Vec<Scenario>,
}

struct Inner {
    config: DaemonConfig,
    state: StateManager,
    registry: JobRegistry,
    hub: Arc<ProgressHub>,
    slots: SlotPool,
    scout: ScoutRunner,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    browsers: Arc<dyn BrowserFactory>,
    model: Arc<dyn ModelClient>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: DaemonConfig,
        state: StateManager,
        browsers: Arc<dyn BrowserFactory>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        let registry = JobRegistry::new();
        let hub = ProgressHub::new(registry.clone(), config.limits.log_buffer_lines);
        let shutdown = CancellationToken::new();
        let slots = SlotPool::new(config.limits.queue_wait(), shutdown.clone());
        let scout = ScoutRunner::new(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                registry,
                hub,
                slots,
                scout,
                shutdown,
                tasks: TaskTracker::new(),
                browsers,
                model,
            }),
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.inner.state
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.config
    }

    /// Snapshot of a job that is still in flight
    pub fn live(&self, job_id: &str) -> Option<RunningJob> {
        self.inner.registry.get(job_id)
    }

    pub fn running(&self) -> Vec<RunningJob> {
        self.inner.registry.list()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.inner.hub.subscribe()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    pub fn submit_analysis(&self, params: AnalysisParams) -> Result<Job, JobError> {
        self.accepting()?;
        params.validate()?;
        let job = self.inner.state.create_job(JobSpec::Analysis(params.clone()))?;
        info!("Submitted analysis job {} for {}", job.meta.id, params.url);
        self.spawn_job(&job.meta.id, JobMode::Analysis, 1, Work::Analysis { params, resume: None })?;
        Ok(job)
    }

    pub fn submit_batch(&self, params: AnalysisParams) -> Result<Job, JobError> {
        self.accepting()?;
        params.validate()?;
        if params.devices.is_empty() {
            return Err(Error::InvalidConfig("batch requires at least one device".to_string()).into());
        }
        let job = self.inner.state.create_job(JobSpec::Batch(params.clone()))?;
        info!(
            "Submitted batch job {} for {} on {} device(s)",
            job.meta.id,
            params.url,
            params.devices.len()
        );
        let devices = params.devices.len();
        self.spawn_job(&job.meta.id, JobMode::Batch, devices, Work::Batch(params))?;
        Ok(job)
    }

    pub fn submit_test_run(&self, plan_id: &str, flows_only: bool) -> Result<Job, JobError> {
        self.accepting()?;
        let plan = self.inner.state.get_test_plan(plan_id)?;
        let params = TestRunParams {
            plan_id: plan.meta.id.clone(),
            flows_only,
        };
        let job = self.inner.state.create_job(JobSpec::TestRun(params.clone()))?;
        info!("Submitted test run {} for plan {}", job.meta.id, plan.meta.id);
        let units = plan.spec.flows.len() + if flows_only { 0 } else { plan.spec.scenarios.len() };
        self.spawn_job(&job.meta.id, JobMode::TestRun, units, Work::TestRun(params))?;
        Ok(job)
    }

    /// Re-run a failed analysis from its stored checkpoint.
    ///
    /// Only the parameters persisted with the job are used.
    pub fn resume(&self, job_id: &str) -> Result<Job, JobError> {
        self.accepting()?;
        let state = &self.inner.state;
        let job = state.get_job(job_id)?;
        let params = match &job.spec {
            JobSpec::Analysis(params) => params.clone(),
            other => {
                return Err(Error::InvalidConfig(format!(
                    "{} jobs cannot be resumed",
                    other.mode()
                ))
                .into())
            }
        };
        job.status.state.check_transition(JobState::Resuming)?;
        let checkpoint = state
            .get_checkpoint(job_id)?
            .ok_or_else(|| JobError::NoCheckpoint(job_id.to_string()))?;

        let step = checkpoint.step.clone();
        let status = state.transition(job_id, JobState::Resuming, |s| {
            s.failure = None;
            s.finished_at = None;
            s.message = Some(format!("resuming from {}", step));
        })?;
        info!("Resuming job {} from {}", job_id, checkpoint.step);
        self.spawn_job(
            job_id,
            JobMode::Analysis,
            1,
            Work::Analysis {
                params,
                resume: Some(checkpoint),
            },
        )?;
        Ok(Job { status, ..job })
    }

    /// Relay a user hint to the job's running scout process
    pub async fn send_hint(&self, job_id: &str, message: &str) -> Result<(), HintError> {
        let entry = self.inner.registry.process(job_id).ok_or(HintError::Closed)?;
        entry.hints.send(message).await?;
        info!("Relayed hint to job {}", job_id);
        Ok(())
    }

    /// Stop accepting work, abort waiters and running scouts, and wait for
    /// every job task to record its terminal state
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.inner.slots.close();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Fail jobs a previous daemon left unfinished.
    ///
    /// Their scout processes died with that daemon. A job with a stored
    /// checkpoint stays resumable.
    pub fn recover_interrupted(&self) -> Result<usize, JobError> {
        let state = &self.inner.state;
        let mut recovered = 0;
        for job in state.list_jobs()? {
            let id = &job.meta.id;
            if job.status.state.is_terminal() || self.inner.registry.get(id).is_some() {
                continue;
            }
            let checkpoint_available = state.get_checkpoint(id)?.is_some();
            let failure = JobError::ShutdownAbort.to_failure();
            state.update_status(id, |s| {
                s.state = JobState::Failed;
                s.message = Some("interrupted by daemon restart".to_string());
                s.failure = Some(failure);
                s.checkpoint_available = checkpoint_available;
                s.finished_at = Some(chrono::Utc::now().timestamp());
            })?;
            warn!("Job {} was interrupted ({})", id, job.status.state);
            recovered += 1;
        }
        Ok(recovered)
    }

    // ========================================================================
    // Job tasks
    // ========================================================================

    fn accepting(&self) -> Result<(), JobError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::ShutdownAbort);
        }
        Ok(())
    }

    fn spawn_job(&self, job_id: &str, mode: JobMode, units: usize, work: Work) -> Result<(), JobError> {
        if !self.inner.registry.register(RunningJob::new(job_id, mode, units)) {
            return Err(Error::Internal(format!("job {} is already running", job_id)).into());
        }

        let this = self.clone();
        let job_id = job_id.to_string();
        self.inner.tasks.spawn(async move {
            let reporter = this.inner.hub.reporter(&job_id);
            let result = supervise(&job_id, this.run_work(&job_id, &reporter, work)).await;
            this.finish(&job_id, &reporter, result);
        });
        Ok(())
    }

    async fn run_work(&self, job_id: &str, reporter: &JobReporter, work: Work) -> Result<String, JobError> {
        match work {
            Work::Analysis { params, resume } => self.run_analysis(job_id, reporter, params, resume).await,
            Work::Batch(params) => self.run_batch(job_id, reporter, params).await,
            Work::TestRun(params) => self.run_test_plan(job_id, reporter, params).await,
        }
    }

    /// Record the terminal state and publish it; runs exactly once per task.
    ///
    /// The job leaves the registry before the terminal event goes out, so
    /// an observer reacting to it (a resume, say) never sees it as running.
    fn finish(&self, job_id: &str, reporter: &JobReporter, result: Result<String, JobError>) {
        let finished = chrono::Utc::now().timestamp();
        let result = result.and_then(|summary| {
            self.inner.state.clear_checkpoint(job_id)?;
            self.inner.state.transition(job_id, JobState::Completed, |s| {
                s.message = Some(summary.clone());
                s.failure = None;
                s.checkpoint_available = false;
                s.finished_at = Some(finished);
            })?;
            Ok(summary)
        });

        self.inner.registry.remove(job_id);

        match result {
            Ok(summary) => {
                info!("Job {} completed: {}", job_id, summary);
                reporter.emit(ProgressEvent::JobCompleted {
                    summary: Some(summary),
                });
            }
            Err(err) => {
                let failure = err.to_failure();
                let checkpoint_available = matches!(self.inner.state.get_checkpoint(job_id), Ok(Some(_)));
                // Forced: the job may have failed from any state
                let persisted = self.inner.state.update_status(job_id, |s| {
                    s.state = JobState::Failed;
                    s.message = Some(failure.reason.clone());
                    s.failure = Some(failure.clone());
                    s.checkpoint_available = checkpoint_available;
                    s.finished_at = Some(finished);
                });
                if let Err(e) = persisted {
                    error!("Failed to persist failure of job {}: {}", job_id, e);
                }
                error!("Job {} failed ({:?}): {}", job_id, failure.kind, failure.reason);
                reporter.emit(ProgressEvent::JobFailed {
                    kind: failure.kind,
                    reason: failure.reason,
                    checkpoint_available,
                });
            }
        }
    }

    fn mark_running(&self, job_id: &str, reporter: &JobReporter, mode: JobMode, units: usize) -> Result<(), JobError> {
        let now = chrono::Utc::now().timestamp();
        self.inner.state.transition(job_id, JobState::Running, |s| {
            s.started_at.get_or_insert(now);
        })?;
        self.inner.registry.update(job_id, |job| job.state = JobState::Running);
        reporter.emit(ProgressEvent::JobStarted {
            mode,
            total_units: units,
        });
        Ok(())
    }

    fn progress_handler(&self, job_id: &str, reporter: &JobReporter) -> JobProgressHandler {
        JobProgressHandler {
            job_id: job_id.to_string(),
            state: self.inner.state.clone(),
            reporter: reporter.clone(),
        }
    }

    async fn run_analysis(
        &self,
        job_id: &str,
        reporter: &JobReporter,
        params: AnalysisParams,
        resume: Option<Checkpoint>,
    ) -> Result<String, JobError> {
        let inner = &self.inner;
        let slot = inner.slots.acquire(Resource::Analysis, reporter).await?;
        self.mark_running(job_id, reporter, JobMode::Analysis, 1)?;

        let output_dir = inner.config.job_output_dir(job_id);
        let mut invocation = ScoutInvocation::new(&params, output_dir.clone());
        if let Some(checkpoint) = &resume {
            let payload = write_resume_payload(&output_dir, &checkpoint.step, &checkpoint.payload)
                .map_err(Error::from)?;
            invocation = invocation.with_resume(checkpoint.step.clone(), payload);
        }

        let handler = self.progress_handler(job_id, reporter);
        let deadline = inner.config.timeouts.deadline(&params);
        let run = match inner
            .scout
            .run(job_id, &invocation, deadline, &inner.shutdown, &inner.registry, &handler)
            .await
        {
            Ok(run) => run,
            Err(err) => {
                self.capture_checkpoint(job_id, &output_dir, &err);
                return Err(err);
            }
        };
        drop(slot);

        let stored = self.store_outputs(job_id, &run.result, None)?;
        let flows = stored.flows.len();
        inner.state.update_status(job_id, |s| s.result = Some(run.result.clone()))?;
        let (plan, _) = inner
            .state
            .ensure_test_plan(job_id, &params.url, stored.flows, stored.scenarios)?;
        inner.registry.update(job_id, |job| job.completed_units.push(params.url.clone()));

        if params.auto_test {
            self.auto_test(job_id, &plan);
        }
        Ok(format!("{} flow(s) stored, test plan {}", flows, plan.meta.id))
    }

    async fn run_batch(&self, job_id: &str, reporter: &JobReporter, params: AnalysisParams) -> Result<String, JobError> {
        let inner = &self.inner;
        let slot = inner.slots.acquire(Resource::Analysis, reporter).await?;
        let total = params.devices.len();
        self.mark_running(job_id, reporter, JobMode::Batch, total)?;

        let started = Instant::now();
        let budget = inner.config.timeouts.batch_deadline(&params);
        let per_device = inner.config.timeouts.deadline(&params);
        let handler = self.progress_handler(job_id, reporter);

        let mut outcomes: Vec<DeviceOutcome> = Vec::new();
        let mut results = serde_json::Map::new();
        let mut first_completed: Option<StoredOutputs> = None;

        for (i, device) in params.devices.iter().enumerate() {
            let remaining = budget.saturating_sub(started.elapsed());
            let outcome = if remaining.is_zero() {
                warn!("Job {} out of time before device {}", job_id, device);
                DeviceOutcome {
                    device: device.clone(),
                    completed: false,
                    error: Some("batch deadline exhausted".to_string()),
                    failure: None,
                    flows: 0,
                }
            } else {
                reporter.emit(ProgressEvent::JobProgress {
                    step: "device".to_string(),
                    message: format!("{} ({}/{})", device, i + 1, total),
                });
                let output_dir = inner.config.job_output_dir(job_id).join(device.replace('/', "_"));
                let invocation = ScoutInvocation::new(&params, output_dir).with_device(device);
                let run = inner
                    .scout
                    .run(
                        job_id,
                        &invocation,
                        per_device.min(remaining),
                        &inner.shutdown,
                        &inner.registry,
                        &handler,
                    )
                    .await;

                match run {
                    Ok(run) => {
                        let stored = self.store_outputs(job_id, &run.result, Some(device))?;
                        let flows = stored.flows.len();
                        results.insert(device.clone(), run.result);
                        first_completed.get_or_insert(stored);
                        inner.registry.update(job_id, |job| job.completed_units.push(device.clone()));
                        info!("Job {} device {} completed with {} flow(s)", job_id, device, flows);
                        DeviceOutcome {
                            device: device.clone(),
                            completed: true,
                            error: None,
                            failure: None,
                            flows,
                        }
                    }
                    Err(JobError::ShutdownAbort) => return Err(JobError::ShutdownAbort),
                    Err(err) => {
                        warn!("Job {} device {} failed: {}", job_id, device, err);
                        DeviceOutcome {
                            device: device.clone(),
                            completed: false,
                            error: Some(err.to_string()),
                            failure: Some(err.to_failure()),
                            flows: 0,
                        }
                    }
                }
            };

            outcomes.push(outcome);
            let devices = outcomes.clone();
            inner.state.update_status(job_id, |s| s.devices = devices)?;
        }
        drop(slot);

        let Some(stored) = first_completed else {
            let reasons: Vec<String> = outcomes
                .iter()
                .map(|o| format!("{}: {}", o.device, o.error.as_deref().unwrap_or("unknown error")))
                .collect();
            return Err(JobError::AllDevicesFailed(format!(
                "all {} device(s) failed: {}",
                outcomes.len(),
                reasons.join("; ")
            )));
        };

        let completed = outcomes.iter().filter(|o| o.completed).count();
        inner.state.update_status(job_id, |s| s.result = Some(Value::Object(results)))?;
        let (plan, _) = inner
            .state
            .ensure_test_plan(job_id, &params.url, stored.flows, stored.scenarios)?;

        if params.auto_test {
            self.auto_test(job_id, &plan);
        }
        Ok(format!(
            "{}/{} device(s) completed, test plan {}",
            completed,
            outcomes.len(),
            plan.meta.id
        ))
    }

    async fn run_test_plan(&self, job_id: &str, reporter: &JobReporter, params: TestRunParams) -> Result<String, JobError> {
        let inner = &self.inner;
        let plan = inner.state.get_test_plan(&params.plan_id)?;
        let slot = inner.slots.acquire(Resource::Browser, reporter).await?;
        let scenarios: &[Scenario] = if params.flows_only { &[] } else { &plan.spec.scenarios };
        self.mark_running(job_id, reporter, JobMode::TestRun, plan.spec.flows.len() + scenarios.len())?;

        let sources: Vec<(String, String)> = inner
            .state
            .list_flows(&plan.spec.job_id)?
            .into_iter()
            .filter(|(name, _)| plan.spec.flows.contains(name))
            .collect();

        let browser = inner.browsers.launch().await?;

        // Shutdown or the run deadline stops flows and scenarios alike
        let deadline = inner.config.timeouts.test_run_deadline();
        let started = Instant::now();
        let cancel = inner.shutdown.child_token();

        let flows = FlowExecutor::new(browser.clone(), inner.model.clone(), reporter.clone())
            .with_config(ExecutorConfig {
                deadline: Some(deadline),
                ..ExecutorConfig::default()
            })
            .with_cancel(cancel.clone())
            .execute_batch(sources)
            .await;

        let remaining = deadline.saturating_sub(started.elapsed());
        let timer = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(remaining).await;
                cancel.cancel();
            }
        });

        let agent = AgentConfig {
            max_iterations: inner.config.model.agent_budget,
            keep_images: inner.config.model.keep_images,
            ..AgentConfig::default()
        };
        let outcomes = ScenarioExecutor::new(browser, inner.model.clone(), reporter.clone())
            .with_config(agent)
            .execute_all(scenarios, &cancel)
            .await;
        timer.abort();
        drop(slot);

        let passed = outcomes.iter().filter(|o| o.passed).count();
        let summary = format!(
            "flows: {}; scenarios: {}/{} passed",
            flows.summary(),
            passed,
            outcomes.len()
        );
        let result = serde_json::json!({
            "plan_id": plan.meta.id,
            "flows": flows,
            "scenarios": outcomes,
        });
        inner.state.update_status(job_id, |s| s.result = Some(result))?;

        if inner.shutdown.is_cancelled() {
            return Err(JobError::ShutdownAbort);
        }
        if cancel.is_cancelled() || started.elapsed() >= deadline {
            warn!("Job {} test run hit its {}s deadline", job_id, deadline.as_secs());
            return Err(JobError::Timeout {
                seconds: deadline.as_secs(),
                last_step: Some("test_run".to_string()),
                log_tail: Vec::new(),
            });
        }
        Ok(summary)
    }

    /// Store the flows and collect the scenarios of one scout result
    fn store_outputs(&self, job_id: &str, result: &Value, device: Option<&str>) -> Result<StoredOutputs, JobError> {
        let generated: Vec<GeneratedFlow> = result
            .get("flows")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match serde_json::from_value(item.clone()) {
                        Ok(flow) => Some(flow),
                        Err(e) => {
                            warn!("Job {} produced an unreadable flow: {}", job_id, e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut flows = Vec::new();
        for flow in order_flows(generated, |f| f.name.as_str()) {
            let name = match device {
                Some(device) => format!("{}/{}", device, flow.name),
                None => flow.name.clone(),
            };
            match reconstruct(&flow) {
                Ok(text) => {
                    self.inner.state.store_flow(job_id, &name, &text)?;
                    flows.push(name);
                }
                Err(e) => warn!("Job {} flow {} skipped: {}", job_id, flow.name, e),
            }
        }

        let scenarios = result
            .get("scenarios")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<Scenario>(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(StoredOutputs { flows, scenarios })
    }

    /// Persist the most advanced checkpoint scout left behind.
    ///
    /// An earlier checkpoint is kept when this run produced none.
    fn capture_checkpoint(&self, job_id: &str, output_dir: &Path, err: &JobError) {
        if !matches!(
            err,
            JobError::Timeout { .. } | JobError::ProcessExit { .. } | JobError::NoResult { .. }
        ) {
            return;
        }
        let Some((step, payload)) = find_checkpoint(output_dir) else {
            return;
        };
        match self.inner.state.save_checkpoint(job_id, &step, payload) {
            Ok(()) => info!("Job {} checkpoint saved at {}", job_id, step),
            Err(e) => warn!("Failed to save checkpoint for job {}: {}", job_id, e),
        }
    }

    fn auto_test(&self, job_id: &str, plan: &TestPlan) {
        match self.submit_test_run(&plan.meta.id, false) {
            Ok(run) => info!("Job {} started test run {}", job_id, run.meta.id),
            Err(e) => warn!("Job {} could not start its test run: {}", job_id, e),
        }
    }
}

/// Persists and republishes scout progress for one job
struct JobProgressHandler {
    job_id: String,
    state: StateManager,
    reporter: JobReporter,
}

impl ProgressHandler for JobProgressHandler {
    fn handle(&self, update: ProgressUpdate) {
        if let ProgressUpdate::Step { step, message } = &update {
            let persisted = self.state.update_status(&self.job_id, |s| {
                s.step = Some(step.clone());
                s.message = Some(message.clone());
            });
            if let Err(e) = persisted {
                warn!("Failed to persist progress of job {}: {}", self.job_id, e);
            }
        }
        if let Some((kind, payload)) = update.record() {
            if let Err(e) = self.state.record_step(&self.job_id, kind, &payload) {
                warn!("Failed to record {} for job {}: {}", kind, self.job_id, e);
            }
        }
        self.reporter.emit(update.event());
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use flowscout_common::testing::{FakeBrowser, ScriptedModel};
    use flowscout_common::{ContentBlock, Database, FailureKind};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeLauncher(Arc<FakeBrowser>);

    #[async_trait]
    impl BrowserFactory for FakeLauncher {
        async fn launch(&self) -> flowscout_common::Result<Arc<dyn Browser>> {
            Ok(self.0.clone())
        }
    }

    struct PanickingLauncher;

    #[async_trait]
    impl BrowserFactory for PanickingLauncher {
        async fn launch(&self) -> flowscout_common::Result<Arc<dyn Browser>> {
            panic!("browser pool corrupted")
        }
    }

    struct Harness {
        dir: TempDir,
        orchestrator: Orchestrator,
        browser: Arc<FakeBrowser>,
        model: Arc<ScriptedModel>,
    }

    fn harness(scout_body: &str) -> Harness {
        harness_with(scout_body, None)
    }

    fn harness_with(scout_body: &str, browsers: Option<Arc<dyn BrowserFactory>>) -> Harness {
        harness_configured(scout_body, browsers, |_| {})
    }

    fn harness_configured(
        scout_body: &str,
        browsers: Option<Arc<dyn BrowserFactory>>,
        configure: impl FnOnce(&mut DaemonConfig),
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("scout.sh");
        let body = scout_body.replace("$LOG", &dir.path().join("args.log").to_string_lossy());
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = DaemonConfig::default();
        config.store_path = dir.path().join("store");
        config.scout.binary = script.to_string_lossy().to_string();
        config.limits.queue_wait_secs = 5;
        configure(&mut config);

        let state = StateManager::with_database(Database::open_memory().unwrap(), config.flows_dir());
        let browser = Arc::new(FakeBrowser::default());
        let model = Arc::new(ScriptedModel::new());
        let browsers = browsers.unwrap_or_else(|| Arc::new(FakeLauncher(browser.clone())));
        let orchestrator = Orchestrator::new(config, state, browsers, model.clone());
        Harness {
            dir,
            orchestrator,
            browser,
            model,
        }
    }

    async fn wait_terminal(rx: &mut broadcast::Receiver<ProgressMessage>, job_id: &str) -> ProgressEvent {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let message = rx.recv().await.unwrap();
                if message.job_id == job_id && message.event.is_terminal() {
                    return message.event;
                }
            }
        })
        .await
        .expect("job did not finish")
    }

    const FLOW_RESULT: &str = r#"echo '{"flows": [{"name": "login", "commands": ["back"]}, {"name": "setup", "commands": ["takeScreenshot"]}], "scenarios": [{"name": "checkout", "steps": []}]}'"#;

    #[tokio::test]
    async fn test_analysis_completes_and_derives_plan() {
        let h = harness(&format!("echo PROGRESS:explore:visiting >&2\n{}", FLOW_RESULT));
        let mut rx = h.orchestrator.subscribe();
        let job = h.orchestrator.submit_analysis(AnalysisParams::new("https://app.test")).unwrap();

        let event = wait_terminal(&mut rx, &job.meta.id).await;
        assert!(matches!(event, ProgressEvent::JobCompleted { .. }));

        let state = h.orchestrator.state();
        let stored = state.get_job(&job.meta.id).unwrap();
        assert_eq!(stored.status.state, JobState::Completed);
        assert_eq!(stored.status.step.as_deref(), Some("explore"));
        assert!(stored.status.result.is_some());
        assert!(h.orchestrator.live(&job.meta.id).is_none());

        let flows: Vec<String> = state.list_flows(&job.meta.id).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(flows, vec!["login", "setup"]);
        assert!(state.flow_path(&job.meta.id, "login").exists());

        let plan = state.db().find_test_plan_for_job(&job.meta.id).unwrap().unwrap();
        assert_eq!(plan.spec.flows, vec!["setup", "login"]);
        assert_eq!(plan.spec.scenarios.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_survives_one_failing_device() {
        let h = harness(&format!(
            r#"case "$*" in
  *"--device pixel"*) echo "PROGRESS:explore:home" >&2; echo "device lost" >&2; exit 1 ;;
esac
{}"#,
            FLOW_RESULT
        ));
        let mut rx = h.orchestrator.subscribe();
        let mut params = AnalysisParams::new("https://app.test");
        params.devices = vec!["desktop".into(), "pixel".into(), "iphone".into()];
        let job = h.orchestrator.submit_batch(params).unwrap();

        let event = wait_terminal(&mut rx, &job.meta.id).await;
        assert!(matches!(event, ProgressEvent::JobCompleted { .. }), "{:?}", event);

        let status = h.orchestrator.state().get_job(&job.meta.id).unwrap().status;
        let summary: Vec<(String, bool)> = status.devices.iter().map(|d| (d.device.clone(), d.completed)).collect();
        assert_eq!(
            summary,
            vec![
                ("desktop".to_string(), true),
                ("pixel".to_string(), false),
                ("iphone".to_string(), true)
            ]
        );
        assert!(status.devices[1].error.as_deref().unwrap().contains("code 1"));
        let failure = status.devices[1].failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::ProcessExit);
        assert_eq!(failure.exit_code, Some(1));
        assert_eq!(failure.last_step.as_deref(), Some("explore"));
        assert_eq!(failure.log_tail, vec!["device lost"]);
        assert!(status.devices[0].failure.is_none());

        let flows = h.orchestrator.state().list_flows(&job.meta.id).unwrap();
        assert_eq!(flows.len(), 4);
        assert!(flows.iter().any(|(n, _)| n == "iphone/login"));

        let plan = h.orchestrator.state().db().find_test_plan_for_job(&job.meta.id).unwrap().unwrap();
        assert_eq!(plan.spec.flows, vec!["desktop/setup", "desktop/login"]);
    }

    #[tokio::test]
    async fn test_batch_fails_when_every_device_fails() {
        let h = harness("echo broken >&2\nexit 2");
        let mut rx = h.orchestrator.subscribe();
        let mut params = AnalysisParams::new("https://app.test");
        params.devices = vec!["a".into(), "b".into()];
        let job = h.orchestrator.submit_batch(params).unwrap();

        match wait_terminal(&mut rx, &job.meta.id).await {
            ProgressEvent::JobFailed { kind, reason, .. } => {
                assert_eq!(kind, FailureKind::AllDevicesFailed);
                assert!(reason.contains("a: scout exited with code 2"));
                assert!(reason.contains("b: scout exited with code 2"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_reuses_persisted_flags() {
        let h = harness(
            r#"echo "$@" >> "$LOG"
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "--output" ]; then out="$a"; fi
  prev="$a"
done
case "$*" in
  *--resume-from*) echo '{"flows": []}' ;;
  *) echo '{"pages": 3}' > "$out/checkpoint_explore.json"
     echo '{"features": ["login"]}' > "$out/checkpoint_analysis.json"
     echo PROGRESS:analysis:crashing >&2
     exit 1 ;;
esac"#,
        );
        let mut rx = h.orchestrator.subscribe();
        let mut params = AnalysisParams::new("https://app.test");
        params.agent = true;
        params.max_steps = 12;
        params.model = Some("vision-large".into());
        params.modules = vec!["auth".into(), "search".into()];
        let job = h.orchestrator.submit_analysis(params).unwrap();
        let id = job.meta.id.clone();

        match wait_terminal(&mut rx, &id).await {
            ProgressEvent::JobFailed {
                kind,
                checkpoint_available,
                ..
            } => {
                assert_eq!(kind, FailureKind::ProcessExit);
                assert!(checkpoint_available);
            }
            other => panic!("unexpected: {:?}", other),
        }
        let failed = h.orchestrator.state().get_job(&id).unwrap();
        assert_eq!(failed.status.failure.as_ref().unwrap().last_step.as_deref(), Some("analysis"));

        let resumed = h.orchestrator.resume(&id).unwrap();
        assert_eq!(resumed.status.state, JobState::Resuming);
        assert!(matches!(wait_terminal(&mut rx, &id).await, ProgressEvent::JobCompleted { .. }));

        let log = std::fs::read_to_string(h.dir.path().join("args.log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        let out = h.orchestrator.config().job_output_dir(&id);
        assert_eq!(
            lines[1],
            format!(
                "{} --resume-from analysis --resume-data {}",
                lines[0],
                out.join("resume_analysis.json").display()
            )
        );
        assert!(lines[0].contains("--agent --max-steps 12 --model vision-large --modules auth,search"));

        let done = h.orchestrator.state().get_job(&id).unwrap();
        assert_eq!(done.status.state, JobState::Completed);
        assert!(!done.status.checkpoint_available);
        assert!(h.orchestrator.state().get_checkpoint(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_requires_checkpoint() {
        let h = harness("exit 1");
        let mut rx = h.orchestrator.subscribe();
        let job = h.orchestrator.submit_analysis(AnalysisParams::new("https://app.test")).unwrap();
        wait_terminal(&mut rx, &job.meta.id).await;

        assert!(matches!(h.orchestrator.resume(&job.meta.id), Err(JobError::NoCheckpoint(_))));
        assert!(matches!(
            h.orchestrator.resume("missing"),
            Err(JobError::Common(Error::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_test_run_executes_flows_and_scenarios() {
        let h = harness(FLOW_RESULT);
        let mut rx = h.orchestrator.subscribe();
        let job = h.orchestrator.submit_analysis(AnalysisParams::new("https://app.test")).unwrap();
        wait_terminal(&mut rx, &job.meta.id).await;
        let plan = h.orchestrator.state().db().find_test_plan_for_job(&job.meta.id).unwrap().unwrap();

        h.model.push_response(vec![ContentBlock::ToolUse {
            id: "t1".to_string(),
            name: "report_result".to_string(),
            input: serde_json::json!({"status": "passed", "reason": "cart works"}),
        }]);
        let run = h.orchestrator.submit_test_run(&plan.meta.id, false).unwrap();
        assert!(matches!(wait_terminal(&mut rx, &run.meta.id).await, ProgressEvent::JobCompleted { .. }));

        let status = h.orchestrator.state().get_job(&run.meta.id).unwrap().status;
        let result = status.result.unwrap();
        assert_eq!(result["flows"]["passed"], 2);
        assert_eq!(result["scenarios"][0]["passed"], true);
        assert!(h.browser.calls().contains(&"go_back".to_string()));
    }

    const WAITING_RESULT: &str = r#"echo '{"flows": [{"name": "dashboard", "commands": [{"extendedWaitUntil": {"visible": "Dashboard", "timeout": "600000"}}]}], "scenarios": []}'"#;

    async fn plan_for(h: &Harness, rx: &mut broadcast::Receiver<ProgressMessage>) -> TestPlan {
        let job = h.orchestrator.submit_analysis(AnalysisParams::new("https://app.test")).unwrap();
        wait_terminal(rx, &job.meta.id).await;
        h.orchestrator.state().db().find_test_plan_for_job(&job.meta.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_test_run_deadline_fails_job() {
        let h = harness_configured(WAITING_RESULT, None, |c| c.timeouts.test_run_secs = 1);
        h.model.set_vision_default("NO");
        let mut rx = h.orchestrator.subscribe();
        let plan = plan_for(&h, &mut rx).await;

        let started = Instant::now();
        let run = h.orchestrator.submit_test_run(&plan.meta.id, false).unwrap();
        match wait_terminal(&mut rx, &run.meta.id).await {
            ProgressEvent::JobFailed { kind, .. } => assert_eq!(kind, FailureKind::Timeout),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(10));

        let status = h.orchestrator.state().get_job(&run.meta.id).unwrap().status;
        let result = status.result.unwrap();
        assert_eq!(result["flows"]["failed"], 1);
        assert_eq!(result["flows"]["flows"][0]["error"], "Run deadline exceeded");
        assert_eq!(h.orchestrator.inner.slots.available(Resource::Browser), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_test_run() {
        let h = harness(WAITING_RESULT);
        h.model.set_vision_default("NO");
        let mut rx = h.orchestrator.subscribe();
        let plan = plan_for(&h, &mut rx).await;

        let started = Instant::now();
        let run = h.orchestrator.submit_test_run(&plan.meta.id, false).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.orchestrator.shutdown().await;

        match wait_terminal(&mut rx, &run.meta.id).await {
            ProgressEvent::JobFailed { kind, .. } => assert_eq!(kind, FailureKind::ShutdownAbort),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_panicking_job_fails_and_releases_slot() {
        let h = harness_with(FLOW_RESULT, Some(Arc::new(PanickingLauncher)));
        let mut rx = h.orchestrator.subscribe();
        let job = h.orchestrator.submit_analysis(AnalysisParams::new("https://app.test")).unwrap();
        wait_terminal(&mut rx, &job.meta.id).await;
        let plan = h.orchestrator.state().db().find_test_plan_for_job(&job.meta.id).unwrap().unwrap();

        let run = h.orchestrator.submit_test_run(&plan.meta.id, true).unwrap();
        match wait_terminal(&mut rx, &run.meta.id).await {
            ProgressEvent::JobFailed { kind, reason, .. } => {
                assert_eq!(kind, FailureKind::Panic);
                assert!(reason.contains("browser pool corrupted"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        let stored = h.orchestrator.state().get_job(&run.meta.id).unwrap();
        assert_eq!(stored.status.state, JobState::Failed);
        assert_eq!(h.orchestrator.inner.slots.available(Resource::Browser), 1);
        assert!(h.orchestrator.live(&run.meta.id).is_none());
    }

    #[tokio::test]
    async fn test_hint_without_process_is_refused() {
        let h = harness("exit 0");
        assert!(matches!(
            h.orchestrator.send_hint("nope", "hello").await,
            Err(HintError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_scout() {
        let h = harness("exec sleep 30");
        let mut rx = h.orchestrator.subscribe();
        let job = h.orchestrator.submit_analysis(AnalysisParams::new("https://app.test")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        h.orchestrator.shutdown().await;
        match wait_terminal(&mut rx, &job.meta.id).await {
            ProgressEvent::JobFailed { kind, .. } => assert_eq!(kind, FailureKind::ShutdownAbort),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            h.orchestrator.submit_analysis(AnalysisParams::new("https://app.test")),
            Err(JobError::ShutdownAbort)
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_jobs() {
        let h = harness("exit 0");
        let state = h.orchestrator.state();
        let stale = state
            .create_job(JobSpec::Analysis(AnalysisParams::new("https://app.test")))
            .unwrap();
        state.transition(&stale.meta.id, JobState::Running, |_| {}).unwrap();
        state
            .save_checkpoint(&stale.meta.id, "analysis", serde_json::json!({"pages": 3}))
            .unwrap();
        let queued = state
            .create_job(JobSpec::Analysis(AnalysisParams::new("https://other.test")))
            .unwrap();

        assert_eq!(h.orchestrator.recover_interrupted().unwrap(), 2);
        let stale = state.get_job(&stale.meta.id).unwrap();
        assert_eq!(stale.status.state, JobState::Failed);
        assert!(stale.status.checkpoint_available);
        assert_eq!(stale.status.failure.unwrap().kind, FailureKind::ShutdownAbort);
        assert!(!state.get_job(&queued.meta.id).unwrap().status.checkpoint_available);

        assert_eq!(h.orchestrator.recover_interrupted().unwrap(), 0);
    }
}
