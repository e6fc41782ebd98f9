//! Scout subprocess driver
//!
//! Spawns scout, streams its stderr through the progress protocol, keeps a
//! bounded copy of stdout for the final JSON result and enforces the run
//! deadline.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowscout_common::AnalysisParams;

use crate::config::DaemonConfig;
use crate::error::JobError;
use crate::protocol::{last_json_object, parse_line, ProgressUpdate, ScoutLine};
use crate::registry::{HintChannel, HintWriter, JobRegistry, ProcessEntry};

/// Time scout gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// One scout command line
#[derive(Debug, Clone, PartialEq)]
pub struct ScoutInvocation {
    pub url: String,
    pub output_dir: PathBuf,
    pub profile_args: Vec<String>,
    pub device: Option<String>,
    /// Stage and payload file to resume from
    pub resume: Option<(String, PathBuf)>,
}

impl ScoutInvocation {
    pub fn new(params: &AnalysisParams, output_dir: PathBuf) -> Self {
        Self {
            url: params.url.clone(),
            output_dir,
            profile_args: params.profile_args(),
            device: None,
            resume: None,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_resume(mut self, step: impl Into<String>, payload: PathBuf) -> Self {
        self.resume = Some((step.into(), payload));
        self
    }

    pub fn args(&self, extra: &[String]) -> Vec<String> {
        let mut args: Vec<String> = extra.to_vec();
        args.extend([
            "--game".to_string(),
            self.url.clone(),
            "--json".to_string(),
            "--save-flows".to_string(),
            "--output".to_string(),
            self.output_dir.to_string_lossy().to_string(),
        ]);
        args.extend(self.profile_args.iter().cloned());
        if let Some(device) = &self.device {
            args.extend(["--device".to_string(), device.clone()]);
        }
        if let Some((step, payload)) = &self.resume {
            args.extend([
                "--resume-from".to_string(),
                step.clone(),
                "--resume-data".to_string(),
                payload.to_string_lossy().to_string(),
            ]);
        }
        args
    }
}

/// Receives decoded progress updates while scout runs
pub trait ProgressHandler: Send + Sync {
    fn handle(&self, update: ProgressUpdate);
}

/// Successful scout run
#[derive(Debug, Clone)]
pub struct ScoutRun {
    pub result: Value,
    pub last_step: Option<String>,
    pub stdout_truncated: bool,
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ScoutRunner {
    binary: String,
    extra_args: Vec<String>,
    stdout_cap: usize,
    stdout_drain: Duration,
    stderr_tail: usize,
    hint_interval: Duration,
}

impl ScoutRunner {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            binary: config.scout.binary.clone(),
            extra_args: config.scout.extra_args.clone(),
            stdout_cap: config.limits.stdout_cap_bytes,
            stdout_drain: config.limits.stdout_drain(),
            stderr_tail: config.limits.stderr_tail_lines,
            hint_interval: config.limits.hint_interval(),
        }
    }

    /// Run scout to completion, the deadline, or cancellation.
    ///
    /// The process is attached to `job_id` in the registry for the duration
    /// of the run so hints can reach its stdin.
    pub async fn run(
        &self,
        job_id: &str,
        invocation: &ScoutInvocation,
        deadline: Duration,
        cancel: &CancellationToken,
        registry: &JobRegistry,
        handler: &dyn ProgressHandler,
    ) -> Result<ScoutRun, JobError> {
        tokio::fs::create_dir_all(&invocation.output_dir)
            .await
            .map_err(flowscout_common::Error::from)?;

        let args = invocation.args(&self.extra_args);
        debug!("scout command: {} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::Spawn {
                binary: self.binary.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        info!("Job {} started scout (pid {:?}, deadline {}s)", job_id, pid, deadline.as_secs());

        let stdin = child.stdin.take().map(|s| Box::new(s) as HintWriter);
        let hints = Arc::new(HintChannel::new(stdin, self.hint_interval));
        registry.attach_process(
            job_id,
            ProcessEntry {
                pid,
                hints: hints.clone(),
            },
        );

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_capped(stdout, self.stdout_cap)));
        let stderr = child.stderr.take();

        let mut last_step = None;
        let mut tail = VecDeque::new();

        let ended = {
            let drive = async {
                if let Some(stderr) = stderr {
                    if let Err(e) = self
                        .pump_stderr(stderr, handler, &mut last_step, &mut tail)
                        .await
                    {
                        warn!("Reading scout stderr failed: {}", e);
                    }
                }
                child.wait().await
            };
            tokio::select! {
                status = drive => Ended::Exited(status),
                _ = tokio::time::sleep(deadline) => Ended::Deadline,
                _ = cancel.cancelled() => Ended::Cancelled,
            }
        };

        hints.close().await;
        registry.detach_process(job_id);

        let log_tail: Vec<String> = tail.into_iter().collect();
        let status = match ended {
            Ended::Exited(status) => status.map_err(flowscout_common::Error::from)?,
            Ended::Deadline => {
                warn!("Job {} hit its {}s deadline", job_id, deadline.as_secs());
                terminate(&mut child).await;
                abort(stdout_task);
                return Err(JobError::Timeout {
                    seconds: deadline.as_secs(),
                    last_step,
                    log_tail,
                });
            }
            Ended::Cancelled => {
                info!("Job {} cancelled, stopping scout", job_id);
                terminate(&mut child).await;
                abort(stdout_task);
                return Err(JobError::ShutdownAbort);
            }
        };

        if !status.success() {
            abort(stdout_task);
            return Err(JobError::ProcessExit {
                code: status.code(),
                last_step,
                log_tail,
            });
        }

        // A grandchild can inherit the pipe and keep it open past exit
        let (stdout, stdout_truncated) = match stdout_task {
            Some(mut task) => match tokio::time::timeout(self.stdout_drain, &mut task).await {
                Ok(joined) => joined
                    .map_err(|e| flowscout_common::Error::Internal(e.to_string()))?
                    .map_err(flowscout_common::Error::from)?,
                Err(_) => {
                    task.abort();
                    warn!(
                        "Job {} stdout still open {} ms after scout exited",
                        job_id,
                        self.stdout_drain.as_millis()
                    );
                    return Err(JobError::NoResult { log_tail });
                }
            },
            None => (String::new(), false),
        };
        if stdout_truncated {
            warn!("Job {} stdout exceeded {} bytes; overflow discarded", job_id, self.stdout_cap);
        }

        match last_json_object(&stdout) {
            Some(result) => Ok(ScoutRun {
                result,
                last_step,
                stdout_truncated,
            }),
            None => Err(JobError::NoResult { log_tail }),
        }
    }

    async fn pump_stderr(
        &self,
        stderr: impl AsyncRead + Unpin,
        handler: &dyn ProgressHandler,
        last_step: &mut Option<String>,
        tail: &mut VecDeque<String>,
    ) -> std::io::Result<()> {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                return Ok(());
            }
            match parse_line(&String::from_utf8_lossy(&buf)) {
                ScoutLine::Progress(update) => {
                    if let ProgressUpdate::Step { step, .. } = &update {
                        *last_step = Some(step.clone());
                    }
                    handler.handle(update);
                }
                ScoutLine::Plain(line) => {
                    tail.push_back(line);
                    while tail.len() > self.stderr_tail {
                        tail.pop_front();
                    }
                }
            }
        }
    }
}

/// Read a stream to the end, keeping at most `cap` bytes.
///
/// Overflow is drained and dropped so the writer never blocks on a full pipe.
pub async fn read_capped(
    mut reader: impl AsyncRead + Unpin,
    cap: usize,
) -> std::io::Result<(String, bool)> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((String::from_utf8_lossy(&kept).into_owned(), truncated))
}

/// SIGTERM, then SIGKILL if scout outlives the grace period
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
        info!("Force killing scout process {}", pid);
    }
    let _ = child.kill().await;
}

fn abort<T>(task: Option<tokio::task::JoinHandle<T>>) {
    if let Some(task) = task {
        task.abort();
    }
}
