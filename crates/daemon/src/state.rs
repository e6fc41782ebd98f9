//! State management for the daemon

use crate::config::DaemonConfig;
use flowscout_common::{
    db::Database, Checkpoint, Error, Job, JobSpec, JobState, JobStatus, ResourceMeta, Result,
    Scenario, StepRecord, TestPlan, TestPlanSpec,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Persistent job state, generated flows and test plans
#[derive(Clone)]
pub struct StateManager {
    db: Database,
    flows_dir: PathBuf,
    /// Serializes read-modify-write of job status
    status_lock: Arc<Mutex<()>>,
}

impl StateManager {
    /// Open the database under the configured store
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.store_path)?;
        let db = Database::open(config.db_path())?;
        Ok(Self::with_database(db, config.flows_dir()))
    }

    pub fn with_database(db: Database, flows_dir: PathBuf) -> Self {
        Self {
            db,
            flows_dir,
            status_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Persist a new job in the `queued` state
    pub fn create_job(&self, spec: JobSpec) -> Result<Job> {
        let name = match &spec {
            JobSpec::Analysis(p) | JobSpec::Batch(p) => p.url.clone(),
            JobSpec::TestRun(p) => format!("test-run {}", p.plan_id),
        };
        let job = Job {
            meta: ResourceMeta::new(name),
            spec,
            status: JobStatus::default(),
        };
        self.db.insert_job(&job)?;
        debug!("Created {} job {}", job.spec.mode(), job.meta.id);
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.db
            .get_job(id)?
            .ok_or_else(|| Error::not_found("job", id))
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.db.list_jobs()
    }

    /// Apply `f` to the stored status without changing state
    pub fn update_status(&self, id: &str, f: impl FnOnce(&mut JobStatus)) -> Result<JobStatus> {
        let _guard = self.status_lock.lock();
        let mut status = self.get_job(id)?.status;
        f(&mut status);
        self.db.update_job_status(id, &status)?;
        Ok(status)
    }

    /// Move a job to `to`, rejecting transitions the lifecycle forbids
    pub fn transition(
        &self,
        id: &str,
        to: JobState,
        f: impl FnOnce(&mut JobStatus),
    ) -> Result<JobStatus> {
        let _guard = self.status_lock.lock();
        let mut status = self.get_job(id)?.status;
        status.state.check_transition(to)?;
        status.state = to;
        f(&mut status);
        self.db.update_job_status(id, &status)?;
        debug!("Job {} -> {}", id, to);
        Ok(status)
    }

    // ========================================================================
    // Checkpoints and step records
    // ========================================================================

    pub fn save_checkpoint(&self, job_id: &str, step: &str, payload: serde_json::Value) -> Result<()> {
        self.db.save_checkpoint(&Checkpoint {
            job_id: job_id.to_string(),
            step: step.to_string(),
            payload,
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    pub fn get_checkpoint(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        self.db.get_checkpoint(job_id)
    }

    pub fn clear_checkpoint(&self, job_id: &str) -> Result<()> {
        self.db.clear_checkpoint(job_id)
    }

    pub fn record_step(&self, job_id: &str, kind: &str, payload: &serde_json::Value) -> Result<i64> {
        self.db.append_step_record(job_id, kind, payload)
    }

    pub fn list_steps(&self, job_id: &str) -> Result<Vec<StepRecord>> {
        self.db.list_step_records(job_id)
    }

    // ========================================================================
    // Flows
    // ========================================================================

    /// Store a generated flow in the database and as
    /// `<flows>/<job>/<name>.yaml`
    pub fn store_flow(&self, job_id: &str, name: &str, content: &str) -> Result<PathBuf> {
        self.db.save_flow(job_id, name, content)?;

        let path = self.flow_path(job_id, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        debug!("Stored flow {} for job {} at {:?}", name, job_id, path);
        Ok(path)
    }

    pub fn list_flows(&self, job_id: &str) -> Result<Vec<(String, String)>> {
        self.db.list_flows(job_id)
    }

    pub fn flow_path(&self, job_id: &str, name: &str) -> PathBuf {
        let mut path = self.flows_dir.join(sanitize_segment(job_id));
        let mut segments: Vec<String> = name
            .split('/')
            .filter(|s| !s.is_empty())
            .map(sanitize_segment)
            .collect();
        let file = segments.pop().unwrap_or_else(|| "flow".to_string());
        for segment in segments {
            path.push(segment);
        }
        path.push(format!("{}.yaml", file));
        path
    }

    pub fn flows_dir(&self) -> &Path {
        &self.flows_dir
    }

    // ========================================================================
    // Test plans
    // ========================================================================

    /// The job's test plan, created on first call.
    ///
    /// Returns `(plan, created)`; later calls return the existing plan
    /// unchanged.
    pub fn ensure_test_plan(
        &self,
        job_id: &str,
        start_url: &str,
        flows: Vec<String>,
        scenarios: Vec<Scenario>,
    ) -> Result<(TestPlan, bool)> {
        let _guard = self.status_lock.lock();
        if let Some(plan) = self.db.find_test_plan_for_job(job_id)? {
            debug!("Job {} already has test plan {}", job_id, plan.meta.id);
            return Ok((plan, false));
        }

        let plan = TestPlan {
            meta: ResourceMeta::new(format!("plan for {}", job_id)),
            spec: TestPlanSpec {
                job_id: job_id.to_string(),
                start_url: start_url.to_string(),
                flows,
                scenarios,
            },
        };
        self.db.insert_test_plan(&plan)?;
        info!(
            "Created test plan {} for job {} ({} flows, {} scenarios)",
            plan.meta.id,
            job_id,
            plan.spec.flows.len(),
            plan.spec.scenarios.len()
        );
        Ok((plan, true))
    }

    pub fn get_test_plan(&self, id: &str) -> Result<TestPlan> {
        self.db
            .get_test_plan(id)?
            .ok_or_else(|| Error::not_found("test_plan", id))
    }
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
