//! Job commands

use anyhow::{bail, Result};
use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::Duration;

use flowscout_common::{AnalysisParams, Job, JobState, TestPlan};

use crate::client::{DaemonClient, FlowFile};
use crate::output::{
    print_error, print_item, print_list, print_success, print_value, print_warning, state_label,
    timestamp, OutputFormat, TableDisplay,
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Subcommand)]
pub enum JobCommands {
    /// List all jobs
    List,

    /// Get job details
    Get {
        /// Job ID
        id: String,

        /// Also list the job's stored flows
        #[arg(long)]
        flows: bool,

        /// Also list recorded agent steps and screenshots
        #[arg(long)]
        steps: bool,
    },

    /// Submit an analysis; with `--device` one run per device profile
    Analyze {
        /// Target application URL
        url: String,

        /// Let scout drive the page with its own agent
        #[arg(long)]
        agent: bool,

        /// Exploration step budget
        #[arg(long, default_value = "30")]
        max_steps: u32,

        /// Model override passed through to scout
        #[arg(long)]
        model: Option<String>,

        /// Analysis module to enable (repeatable)
        #[arg(long = "module")]
        modules: Vec<String>,

        /// Adaptive step budget
        #[arg(long)]
        adaptive: bool,

        /// Extended exploration
        #[arg(long)]
        extended: bool,

        /// Device profile (repeatable)
        #[arg(long = "device")]
        devices: Vec<String>,

        /// Run the derived test plan once the analysis completes
        #[arg(long)]
        auto_test: bool,

        /// Wait for the job to finish
        #[arg(short, long)]
        wait: bool,
    },

    /// Resume a failed analysis from its checkpoint
    Resume {
        /// Job ID
        id: String,

        /// Wait for the job to finish
        #[arg(short, long)]
        wait: bool,
    },

    /// Send a hint to a running analysis
    Hint {
        /// Job ID
        id: String,

        /// Hint text
        message: String,
    },

    /// Show a test plan
    Plan {
        /// Test plan ID
        id: String,
    },

    /// Execute a test plan in the browser
    RunPlan {
        /// Test plan ID
        id: String,

        /// Skip agent scenarios
        #[arg(long)]
        flows_only: bool,

        /// Wait for the run to finish
        #[arg(short, long)]
        wait: bool,
    },
}

/// Job display wrapper for serialization
#[derive(Serialize)]
pub struct JobDisplay {
    pub id: String,
    pub mode: String,
    pub target: String,
    pub state: JobState,
    pub step: String,
    pub message: String,
    pub created: String,
}

impl From<&Job> for JobDisplay {
    fn from(job: &Job) -> Self {
        Self {
            id: job.meta.id.clone(),
            mode: job.spec.mode().to_string(),
            target: job.meta.name.clone(),
            state: job.status.state,
            step: job.status.step.clone().unwrap_or_else(|| "-".to_string()),
            message: job.status.message.clone().unwrap_or_default(),
            created: timestamp(job.meta.created_at),
        }
    }
}

impl TableDisplay for JobDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Mode", "Target", "State", "Step", "Message", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.mode.clone(),
            self.target.clone(),
            state_label(self.state),
            self.step.clone(),
            self.message.clone(),
            self.created.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct FlowDisplay {
    pub name: String,
    pub path: String,
    pub lines: usize,
}

impl From<&FlowFile> for FlowDisplay {
    fn from(flow: &FlowFile) -> Self {
        Self {
            name: flow.name.clone(),
            path: flow.path.clone(),
            lines: flow.content.lines().count(),
        }
    }
}

impl TableDisplay for FlowDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Flow", "Path", "Lines"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.name.clone(), self.path.clone(), self.lines.to_string()]
    }
}

#[derive(Serialize)]
pub struct PlanDisplay {
    pub id: String,
    pub job_id: String,
    pub start_url: String,
    pub flows: String,
    pub scenarios: String,
}

impl From<&TestPlan> for PlanDisplay {
    fn from(plan: &TestPlan) -> Self {
        Self {
            id: plan.meta.id.clone(),
            job_id: plan.spec.job_id.clone(),
            start_url: plan.spec.start_url.clone(),
            flows: plan.spec.flows.join(", "),
            scenarios: plan
                .spec
                .scenarios
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl TableDisplay for PlanDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Job", "Start URL", "Flows", "Scenarios"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.job_id.clone(),
            self.start_url.clone(),
            self.flows.clone(),
            self.scenarios.clone(),
        ]
    }
}

pub async fn execute(cmd: JobCommands, client: DaemonClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::List => {
            let jobs = client.list_jobs().await?;
            let displays: Vec<JobDisplay> = jobs.iter().map(JobDisplay::from).collect();
            print_list(&displays, format);
        }

        JobCommands::Get { id, flows, steps } => {
            let job = client.get_job(&id).await?;
            print_job(&job, format);
            if flows {
                let flows = client.list_flows(&id).await?;
                let displays: Vec<FlowDisplay> = flows.iter().map(FlowDisplay::from).collect();
                print_list(&displays, format);
            }
            if steps {
                print_value(&client.list_steps(&id).await?, format);
            }
        }

        JobCommands::Analyze {
            url,
            agent,
            max_steps,
            model,
            modules,
            adaptive,
            extended,
            devices,
            auto_test,
            wait,
        } => {
            let params = AnalysisParams {
                agent,
                max_steps,
                model,
                modules,
                adaptive,
                extended,
                devices,
                auto_test,
                ..AnalysisParams::new(url)
            };
            let job = client.submit_analysis(&params).await?;
            print_success(&format!("Submitted {} job {}", job.spec.mode(), job.meta.id));
            finish(&client, job, wait, format).await?;
        }

        JobCommands::Resume { id, wait } => {
            let job = client.resume(&id).await?;
            print_success(&format!("Resuming job {}", job.meta.id));
            finish(&client, job, wait, format).await?;
        }

        JobCommands::Hint { id, message } => {
            client.send_hint(&id, &message).await?;
            print_success(&format!("Hint sent to job {}", id));
        }

        JobCommands::Plan { id } => {
            let plan = client.get_test_plan(&id).await?;
            print_item(&PlanDisplay::from(&plan), format);
        }

        JobCommands::RunPlan { id, flows_only, wait } => {
            let job = client.run_test_plan(&id, flows_only).await?;
            print_success(&format!("Started test run {}", job.meta.id));
            finish(&client, job, wait, format).await?;
        }
    }

    Ok(())
}

async fn finish(client: &DaemonClient, job: Job, wait: bool, format: OutputFormat) -> Result<()> {
    let job = if wait { wait_for(client, &job.meta.id).await? } else { job };
    print_job(&job, format);
    if job.status.state == JobState::Failed {
        bail!("job {} failed", job.meta.id);
    }
    Ok(())
}

/// Poll until the job reaches a terminal state
async fn wait_for(client: &DaemonClient, id: &str) -> Result<Job> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));

    let job = loop {
        let job = client.get_job(id).await?;
        if job.status.state.is_terminal() {
            break job;
        }
        let mut message = format!("{} {}", job.status.state, job.status.step.as_deref().unwrap_or(""));
        if let Some(live) = client.live_job(id).await? {
            if live.total_units > 1 {
                message.push_str(&format!(" ({}/{})", live.completed_units.len(), live.total_units));
            }
        }
        spinner.set_message(message);
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    spinner.finish_and_clear();
    Ok(job)
}

fn print_job(job: &Job, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Yaml => print_value(job, format),
        _ => {
            print_item(&JobDisplay::from(job), format);
            if let Some(failure) = &job.status.failure {
                print_error(&format!("{:?}: {}", failure.kind, failure.reason));
                if let Some(step) = &failure.last_step {
                    println!("  last step: {}", step);
                }
                for line in &failure.log_tail {
                    println!("  | {}", line);
                }
                if job.status.checkpoint_available {
                    print_warning(&format!("checkpoint saved; resume with `flowscout job resume {}`", job.meta.id));
                }
            }
            for device in &job.status.devices {
                println!("  {}: {}", device.device, device_text(device));
            }
        }
    }
}

fn device_text(device: &flowscout_common::DeviceOutcome) -> String {
    if device.completed {
        format!("completed, {} flow(s)", device.flows)
    } else {
        let mut text = format!("failed ({})", device.error.as_deref().unwrap_or("unknown error"));
        if let Some(step) = device.failure.as_ref().and_then(|f| f.last_step.as_deref()) {
            text.push_str(&format!(", last step {}", step));
        }
        text
    }
}
