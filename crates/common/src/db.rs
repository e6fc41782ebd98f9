//! SQLite database for FlowScout state persistence

use crate::types::{
    Checkpoint, Job, JobSpec, JobStatus, ResourceMeta, StepRecord, TestPlan, TestPlanSpec,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Table holding analysis, batch and test-run jobs
pub const JOBS: &str = "jobs";
/// Table holding test plans derived from completed analyses
pub const TEST_PLANS: &str = "test_plans";

const RESOURCE_COLUMNS: &str = "id, name, spec, status, created_at, updated_at";

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL lets API readers proceed while a job writes its status
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Jobs table
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_name ON jobs(name);

            -- Test plans table
            CREATE TABLE IF NOT EXISTS test_plans (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_test_plans_job
                ON test_plans(json_extract(spec, '$.job_id'));

            -- Latest resumable checkpoint per job
            CREATE TABLE IF NOT EXISTS checkpoints (
                job_id TEXT PRIMARY KEY,
                step TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Generated flow documents
            CREATE TABLE IF NOT EXISTS flows (
                job_id TEXT NOT NULL,
                name TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (job_id, name)
            );

            -- Agent detail and screenshot records
            CREATE TABLE IF NOT EXISTS step_records (
                job_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (job_id, seq)
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Resource rows shared by jobs and test plans
    // ========================================================================

    fn insert<S: serde::Serialize, T: serde::Serialize>(
        &self,
        table: &str,
        meta: &ResourceMeta,
        spec: &S,
        status: &T,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                table, RESOURCE_COLUMNS
            ),
            params![
                meta.id,
                meta.name,
                serde_json::to_string(spec)?,
                serde_json::to_string(status)?,
                meta.created_at,
                meta.updated_at,
            ],
        )?;

        debug!("Inserted {} with id {}", table, meta.id);
        Ok(())
    }

    /// Replace a row's status; the spec is immutable once written
    fn set_status<T: serde::Serialize>(&self, table: &str, id: &str, status: &T) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let touched = conn.execute(
            &format!("UPDATE {} SET status = ?1, updated_at = ?2 WHERE id = ?3", table),
            params![serde_json::to_string(status)?, now, id],
        )?;
        if touched == 0 {
            return Err(Error::not_found(table, id));
        }
        Ok(())
    }

    fn get<S: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<ResourceRow<S, T>>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM {} WHERE id = ?1", RESOURCE_COLUMNS, table),
                params![id],
                RawRow::from_row,
            )
            .optional()?;

        row.map(RawRow::parse).transpose()
    }

    /// Every row of `table`, newest first
    fn list<S: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
    ) -> Result<Vec<ResourceRow<S, T>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY created_at DESC, rowid DESC",
            RESOURCE_COLUMNS, table
        ))?;
        let rows = stmt.query_map([], RawRow::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }

    // ========================================================================
    // Jobs and test plans
    // ========================================================================

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        self.insert(JOBS, &job.meta, &job.spec, &job.status)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row: Option<ResourceRow<JobSpec, JobStatus>> = self.get(JOBS, id)?;
        Ok(row.map(|r| Job {
            meta: r.meta,
            spec: r.spec,
            status: r.status,
        }))
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows: Vec<ResourceRow<JobSpec, JobStatus>> = self.list(JOBS)?;
        Ok(rows
            .into_iter()
            .map(|r| Job {
                meta: r.meta,
                spec: r.spec,
                status: r.status,
            })
            .collect())
    }

    pub fn update_job_status(&self, id: &str, status: &JobStatus) -> Result<()> {
        self.set_status(JOBS, id, status)
    }

    pub fn insert_test_plan(&self, plan: &TestPlan) -> Result<()> {
        self.insert(TEST_PLANS, &plan.meta, &plan.spec, &serde_json::Value::Null)
    }

    pub fn get_test_plan(&self, id: &str) -> Result<Option<TestPlan>> {
        let row: Option<ResourceRow<TestPlanSpec, serde_json::Value>> =
            self.get(TEST_PLANS, id)?;
        Ok(row.map(|r| TestPlan {
            meta: r.meta,
            spec: r.spec,
        }))
    }

    /// The test plan derived from `job_id`, if one exists
    pub fn find_test_plan_for_job(&self, job_id: &str) -> Result<Option<TestPlan>> {
        let id: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id FROM test_plans WHERE json_extract(spec, '$.job_id') = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
        };
        match id {
            Some(id) => self.get_test_plan(&id),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Store the job's checkpoint, replacing any earlier one
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints (job_id, step, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                checkpoint.job_id,
                checkpoint.step,
                serde_json::to_string(&checkpoint.payload)?,
                checkpoint.created_at,
            ],
        )?;
        debug!(
            "Saved checkpoint for job {} at step {}",
            checkpoint.job_id, checkpoint.step
        );
        Ok(())
    }

    pub fn get_checkpoint(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT job_id, step, payload, created_at FROM checkpoints WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((job_id, step, payload, created_at)) => Ok(Some(Checkpoint {
                job_id,
                step,
                payload: serde_json::from_str(&payload)?,
                created_at,
            })),
            None => Ok(None),
        }
    }

    pub fn clear_checkpoint(&self, job_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM checkpoints WHERE job_id = ?1", params![job_id])?;
        Ok(())
    }

    // ========================================================================
    // Flows
    // ========================================================================

    /// Store a flow document; re-saving the same name overwrites it
    pub fn save_flow(&self, job_id: &str, name: &str, content: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT OR REPLACE INTO flows (job_id, name, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![job_id, name, content, now],
        )?;
        Ok(())
    }

    /// Flow `(name, content)` pairs for a job, ordered by name
    pub fn list_flows(&self, job_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name, content FROM flows WHERE job_id = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![job_id], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut flows = Vec::new();
        for row in rows {
            flows.push(row?);
        }
        Ok(flows)
    }

    // ========================================================================
    // Step records
    // ========================================================================

    /// Append a step record, assigning the next sequence number
    pub fn append_step_record(
        &self,
        job_id: &str,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM step_records WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO step_records (job_id, seq, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                seq,
                kind,
                serde_json::to_string(payload)?,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(seq)
    }

    pub fn list_step_records(&self, job_id: &str) -> Result<Vec<StepRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT job_id, seq, kind, payload, created_at FROM step_records
             WHERE job_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (job_id, seq, kind, payload, created_at) = row?;
            records.push(StepRecord {
                job_id,
                seq,
                kind,
                payload: serde_json::from_str(&payload)?,
                created_at,
            });
        }
        Ok(records)
    }

}

/// Raw database row before parsing
struct RawRow {
    id: String,
    name: String,
    spec: String,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            id: row.get(0)?,
            name: row.get(1)?,
            spec: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn parse<S: serde::de::DeserializeOwned, T: serde::de::DeserializeOwned>(
        self,
    ) -> Result<ResourceRow<S, T>> {
        Ok(ResourceRow {
            meta: ResourceMeta {
                id: self.id,
                name: self.name,
                created_at: self.created_at,
                updated_at: self.updated_at,
            },
            spec: serde_json::from_str(&self.spec)?,
            status: serde_json::from_str(&self.status)?,
        })
    }
}

/// Parsed resource row
struct ResourceRow<S, T> {
    meta: ResourceMeta,
    spec: S,
    status: T,
}
