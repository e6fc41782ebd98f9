//! Flow command executor
//!
//! Interprets parsed flows against a [`Browser`]. Deterministic commands go
//! straight to the browser; text-addressed taps, waits and assertions ask
//! the model about a screenshot. Commands within a flow run strictly in
//! order and the first failure ends the flow; a batch moves on to the next
//! flow until it is cancelled or runs past its deadline.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowscout_common::browser::tools;
use flowscout_common::{Browser, JobReporter, ModelClient, ProgressEvent};

use crate::context::FlowContext;
use crate::error::FlowError;
use crate::model::{Command, CommandArg, CommandKind, Flow};
use crate::parser::{flow_name, parse};
use crate::reconstruct::order_flows;
use crate::vision::{
    locate_prompt, parse_coordinates, parse_visibility, resolve_point, visibility_prompt,
};

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound for one screenshot capture
    pub screenshot_timeout: Duration,
    /// Pause after navigation so the page can settle
    pub settle_delay: Duration,
    pub wait_poll_interval: Duration,
    pub default_wait_timeout: Duration,
    /// Hard bound on nested `runFlow` depth
    pub max_depth: usize,
    pub default_erase_chars: u32,
    /// Bound on a whole batch, measured from executor construction
    pub deadline: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            screenshot_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(1500),
            wait_poll_interval: Duration::from_secs(1),
            default_wait_timeout: Duration::from_secs(10),
            max_depth: 16,
            default_erase_chars: 50,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// Result of one top-level command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub flow: String,
    pub index: usize,
    pub command: String,
    pub status: StepStatus,
    pub message: String,
    /// Base64 PNG taken after the command
    #[serde(default)]
    pub screenshot: Option<String>,
    /// Raw model answer for vision-assisted commands
    #[serde(default)]
    pub ai_reasoning: Option<String>,
    pub duration_ms: u64,
}

/// Result of running a single flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowOutcome {
    pub name: String,
    pub passed: bool,
    /// The flow could not be parsed and never ran
    #[serde(default)]
    pub malformed: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub error: Option<String>,
}

/// Result of running a batch of flows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub malformed: usize,
    pub duration_ms: u64,
    pub flows: Vec<FlowOutcome>,
}

impl BatchOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} failed, {} malformed ({} ms)",
            self.passed, self.failed, self.malformed, self.duration_ms
        )
    }
}

/// What a command produced
#[derive(Debug, Default)]
struct CommandOutput {
    text: String,
    screenshot: Option<String>,
    ai_reasoning: Option<String>,
    skipped: bool,
}

impl CommandOutput {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    fn skipped(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            skipped: true,
            ..Default::default()
        }
    }

    fn with_screenshot(mut self, screenshot: Option<String>) -> Self {
        self.screenshot = screenshot;
        self
    }
}

/// A command failure with whatever evidence was gathered
#[derive(Debug)]
struct Failure {
    error: FlowError,
    screenshot: Option<String>,
    ai_reasoning: Option<String>,
}

impl From<FlowError> for Failure {
    fn from(error: FlowError) -> Self {
        Self {
            error,
            screenshot: None,
            ai_reasoning: None,
        }
    }
}

impl From<flowscout_common::Error> for Failure {
    fn from(error: flowscout_common::Error) -> Self {
        FlowError::from(error).into()
    }
}

type CommandResult = Result<CommandOutput, Failure>;

/// The flow a command belongs to
struct Frame<'a> {
    flow: &'a str,
    start_url: Option<&'a str>,
}

/// Executes flows against one browser
pub struct FlowExecutor {
    browser: Arc<dyn Browser>,
    model: Arc<dyn ModelClient>,
    reporter: JobReporter,
    config: ExecutorConfig,
    cancel: CancellationToken,
    started: Instant,
}

impl FlowExecutor {
    pub fn new(browser: Arc<dyn Browser>, model: Arc<dyn ModelClient>, reporter: JobReporter) -> Self {
        Self {
            browser,
            model,
            reporter,
            config: ExecutorConfig::default(),
            cancel: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Stop at the next command, poll or model call once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Parse and run `(file name, text)` sources.
    ///
    /// Malformed sources are recorded and skipped; `setup` runs first.
    /// Once the run is interrupted the remaining flows are recorded as
    /// failed without running.
    pub async fn execute_batch(&self, sources: Vec<(String, String)>) -> BatchOutcome {
        let start = std::time::Instant::now();
        let mut flows = Vec::new();
        let mut rejected = Vec::new();

        for (file, text) in &sources {
            let name = flow_name(file);
            match parse(name, text) {
                Ok(flow) => flows.push(flow),
                Err(e) => {
                    warn!("Skipping malformed flow '{}': {}", name, e);
                    rejected.push(FlowOutcome {
                        name: name.to_string(),
                        passed: false,
                        malformed: true,
                        duration_ms: 0,
                        steps: vec![],
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let flows = order_flows(flows, |f| f.name.as_str());
        let mut ctx = FlowContext::new(flows.clone());
        let mut outcome = BatchOutcome {
            total: sources.len(),
            malformed: rejected.len(),
            ..Default::default()
        };

        info!("Running {} flow(s)...", flows.len());
        for (i, flow) in flows.iter().enumerate() {
            if let Err(e) = self.check_interrupted() {
                warn!("Flow {} not run: {}", flow.name, e);
                outcome.failed += 1;
                outcome.flows.push(FlowOutcome {
                    name: flow.name.clone(),
                    passed: false,
                    malformed: false,
                    duration_ms: 0,
                    steps: vec![],
                    error: Some(e.to_string()),
                });
                continue;
            }
            self.reporter.emit(ProgressEvent::JobProgress {
                step: "flows".to_string(),
                message: format!("Running flow {} ({}/{})", flow.name, i + 1, flows.len()),
            });

            let result = self.execute_flow(flow, &mut ctx).await;
            if result.passed {
                outcome.passed += 1;
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                outcome.failed += 1;
                error!(
                    "✗ {} - {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            outcome.flows.push(result);
        }

        outcome.flows.extend(rejected);
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        info!("Flow results: {}", outcome.summary());
        outcome
    }

    /// Run one flow, stopping at its first failing command
    pub async fn execute_flow(&self, flow: &Flow, ctx: &mut FlowContext) -> FlowOutcome {
        let start = std::time::Instant::now();
        debug!("Running flow: {}", flow.name);

        let mut steps = Vec::new();
        let mut error = None;

        if let Err(e) = ctx.enter(&flow.name) {
            return FlowOutcome {
                name: flow.name.clone(),
                passed: false,
                malformed: false,
                duration_ms: 0,
                steps,
                error: Some(e.to_string()),
            };
        }

        let frame = Frame {
            flow: &flow.name,
            start_url: flow.metadata.start_url.as_deref(),
        };

        if let Some(url) = frame.start_url {
            if let Err(f) = self.open(url).await {
                error = Some(format!("Failed to open start url {}: {}", url, f.error));
            }
        }

        if error.is_none() {
            for (index, command) in flow.commands.iter().enumerate() {
                let step = self.run_step(&frame, index, command, ctx).await;
                let failed = step.status == StepStatus::Failed;
                if failed {
                    error = Some(step.message.clone());
                }
                steps.push(step);
                if failed {
                    break;
                }
            }
        }

        ctx.leave(&flow.name);

        FlowOutcome {
            name: flow.name.clone(),
            passed: error.is_none(),
            malformed: false,
            duration_ms: start.elapsed().as_millis() as u64,
            steps,
            error,
        }
    }

    async fn run_step(
        &self,
        frame: &Frame<'_>,
        index: usize,
        command: &Command,
        ctx: &mut FlowContext,
    ) -> StepResult {
        let start = std::time::Instant::now();
        let depth = ctx.depth();
        let result = self.execute_command(frame, command, ctx, depth).await;

        let (status, message, screenshot, ai_reasoning) = match result {
            Ok(out) if out.skipped => (StepStatus::Skipped, out.text, out.screenshot, out.ai_reasoning),
            Ok(out) => (StepStatus::Passed, out.text, out.screenshot, out.ai_reasoning),
            Err(f) => (StepStatus::Failed, f.error.to_string(), f.screenshot, f.ai_reasoning),
        };

        let step = StepResult {
            flow: frame.flow.to_string(),
            index,
            command: command.label(),
            status,
            message,
            screenshot,
            ai_reasoning,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.report(&step);
        step
    }

    fn report(&self, step: &StepResult) {
        self.reporter.emit(ProgressEvent::StepDetail {
            detail: serde_json::json!({
                "flow": step.flow,
                "index": step.index,
                "command": step.command,
                "status": step.status,
                "message": step.message,
                "ai_reasoning": step.ai_reasoning,
                "duration_ms": step.duration_ms,
            }),
        });
        if step.screenshot.is_some() {
            self.reporter.emit(ProgressEvent::ScreenshotAvailable {
                step: format!("{}#{}", step.flow, step.index),
                path: None,
            });
        }
    }

    /// Dispatch one command. Boxed because `repeat` and `runFlow` recurse.
    fn execute_command<'a>(
        &'a self,
        frame: &'a Frame<'a>,
        command: &'a Command,
        ctx: &'a mut FlowContext,
        depth: usize,
    ) -> BoxFuture<'a, CommandResult> {
        async move {
            self.check_interrupted()?;
            debug!(flow = frame.flow, depth, "Executing {}", command.label());
            match command.kind() {
                CommandKind::Navigate => {
                    let url = required(command, "url")?;
                    let url = absolute_url(frame.start_url, url);
                    self.open(&url).await?;
                    Ok(CommandOutput::text(format!("Navigated to {}", url))
                        .with_screenshot(self.screenshot().await))
                }
                CommandKind::Tap => self.tap(command).await,
                CommandKind::InputText => {
                    let text = required(command, "text")?;
                    self.tool(tools::TYPE_TEXT, serde_json::json!({ "text": text }))
                        .await
                }
                CommandKind::Scroll => {
                    let direction = command.value("direction").unwrap_or("down");
                    self.tool(tools::SCROLL, serde_json::json!({ "direction": direction }))
                        .await
                }
                CommandKind::PressKey => {
                    let key = required(command, "key")?;
                    self.guarded(self.browser.press_key(key)).await??;
                    Ok(CommandOutput::text(format!("Pressed {}", key))
                        .with_screenshot(self.screenshot().await))
                }
                CommandKind::EraseText => {
                    let chars = command
                        .value("charactersToErase")
                        .and_then(|v| v.parse::<u32>().ok())
                        .unwrap_or(self.config.default_erase_chars);
                    self.tool(tools::ERASE_TEXT, serde_json::json!({ "chars": chars }))
                        .await
                }
                CommandKind::EvalScript => {
                    let script = required(command, "script")?;
                    let result = self.guarded(self.browser.eval_script(script)).await??;
                    Ok(CommandOutput::text(result).with_screenshot(self.screenshot().await))
                }
                CommandKind::Back => self.tool(tools::GO_BACK, serde_json::json!({})).await,
                CommandKind::Screenshot => {
                    let shot = self.capture().await?;
                    Ok(CommandOutput::text("Screenshot captured").with_screenshot(Some(shot)))
                }
                CommandKind::LaunchApp => {
                    match command.value("url").or(frame.start_url) {
                        Some(url) => {
                            self.open(url).await?;
                            Ok(CommandOutput::text(format!("Launched {}", url))
                                .with_screenshot(self.screenshot().await))
                        }
                        None => Ok(CommandOutput::skipped("launchApp without a url")),
                    }
                }
                CommandKind::WaitUntil => self.wait_until(command).await,
                CommandKind::WaitForAnimation => {
                    self.guarded(tokio::time::sleep(self.config.settle_delay)).await?;
                    Ok(CommandOutput::text("Waited for animation")
                        .with_screenshot(self.screenshot().await))
                }
                CommandKind::AssertVisible => self.assert_visibility(command, true).await,
                CommandKind::AssertNotVisible => self.assert_visibility(command, false).await,
                CommandKind::Repeat => {
                    let times = match command.value("times") {
                        Some(t) => t.trim().parse::<usize>().map_err(|_| {
                            FlowError::CommandFailed(format!("repeat times is not a number: {}", t))
                        })?,
                        None => 1,
                    };
                    let commands = nested_commands(command).ok_or_else(|| {
                        FlowError::CommandFailed("repeat requires a commands list".to_string())
                    })?;

                    let mut last = None;
                    for i in 1..=times {
                        for sub in commands {
                            match self.execute_command(frame, sub, &mut *ctx, depth).await {
                                Ok(out) => last = out.screenshot.or(last),
                                Err(mut f) => {
                                    f.error = in_iteration(f.error, i, times);
                                    return Err(f);
                                }
                            }
                        }
                    }
                    Ok(CommandOutput::text(format!(
                        "Repeated {} command(s) {} time(s)",
                        commands.len(),
                        times
                    ))
                    .with_screenshot(last))
                }
                CommandKind::RunFlow => {
                    let name = command
                        .value("file")
                        .or_else(|| command.value("name"))
                        .ok_or_else(|| {
                            FlowError::CommandFailed("runFlow requires a flow name".to_string())
                        })?;
                    if depth >= self.config.max_depth {
                        return Err(FlowError::RecursionDetected {
                            name: flow_name(name).to_string(),
                            depth,
                        }
                        .into());
                    }
                    let sub = ctx
                        .resolve(name)
                        .cloned()
                        .ok_or_else(|| FlowError::UnknownFlow(name.to_string()))?;

                    ctx.enter(&sub.name)?;
                    let result = self.run_nested(&sub, &mut *ctx, depth + 1).await;
                    ctx.leave(&sub.name);
                    result
                }
                CommandKind::Unknown => {
                    debug!("Skipping unsupported command '{}'", command.name());
                    Ok(CommandOutput::skipped(format!(
                        "Unsupported command '{}'",
                        command.name()
                    )))
                }
            }
        }
        .boxed()
    }

    /// Body of a nested flow; the caller owns the visiting mark
    fn run_nested<'a>(
        &'a self,
        flow: &'a Flow,
        ctx: &'a mut FlowContext,
        depth: usize,
    ) -> BoxFuture<'a, CommandResult> {
        async move {
            let frame = Frame {
                flow: &flow.name,
                start_url: flow.metadata.start_url.as_deref(),
            };
            if let Some(url) = frame.start_url {
                self.open(url).await?;
            }

            let mut last = None;
            for command in &flow.commands {
                let out = self.execute_command(&frame, command, &mut *ctx, depth).await?;
                last = out.screenshot.or(last);
            }
            Ok(CommandOutput::text(format!(
                "Ran flow {} ({} command(s))",
                flow.name,
                flow.commands.len()
            ))
            .with_screenshot(last))
        }
        .boxed()
    }

    // ========================================================================
    // Command implementations
    // ========================================================================

    async fn open(&self, url: &str) -> Result<(), Failure> {
        self.guarded(self.browser.navigate(url)).await??;
        self.guarded(tokio::time::sleep(self.config.settle_delay)).await?;
        Ok(())
    }

    async fn tool(&self, name: &str, args: serde_json::Value) -> CommandResult {
        let out = self.guarded(self.browser.execute(name, &args)).await??;
        let screenshot = match out.screenshot {
            Some(shot) => Some(shot),
            None => self.screenshot().await,
        };
        Ok(CommandOutput::text(out.text).with_screenshot(screenshot))
    }

    async fn tap(&self, command: &Command) -> CommandResult {
        let viewport = self.browser.viewport();
        let (x, y, reasoning) = match command.arg() {
            Some(CommandArg::Record(_)) if command.field("point").is_some() => {
                let point = required(command, "point")?;
                let (x, y) = resolve_point(point, viewport).ok_or_else(|| {
                    FlowError::CommandFailed(format!("Invalid point: {}", point))
                })?;
                (x, y, None)
            }
            Some(_) => {
                let target = command
                    .value("text")
                    .or_else(|| command.value("id"))
                    .ok_or_else(|| FlowError::CommandFailed("tapOn requires a target".to_string()))?;
                let (x, y, answer) = self.locate(target).await?;
                (x, y, Some(answer))
            }
            None => {
                return Err(FlowError::CommandFailed("tapOn requires a target".to_string()).into())
            }
        };

        let mut out = self
            .tool(tools::CLICK, serde_json::json!({ "x": x, "y": y }))
            .await?;
        out.ai_reasoning = reasoning;
        Ok(out)
    }

    /// Ask the model where `target` is on the current page
    async fn locate(&self, target: &str) -> Result<(i64, i64, String), Failure> {
        let shot = self.capture().await?;
        let answer = self
            .guarded(self.model.analyze_with_image(&locate_prompt(target), &shot))
            .await??;
        match parse_coordinates(&answer) {
            Some((x, y)) => Ok((x, y, answer)),
            None => Err(Failure {
                error: FlowError::CommandFailed(format!("Element '{}' not found", target)),
                screenshot: Some(shot),
                ai_reasoning: Some(answer),
            }),
        }
    }

    /// One visibility check: `(visible, answer, screenshot)`, `visible`
    /// being `None` when the answer is neither YES nor NO
    async fn check_visibility(&self, target: &str) -> Result<(Option<bool>, String, String), Failure> {
        let shot = self.capture().await?;
        let answer = self
            .guarded(self.model.analyze_with_image(&visibility_prompt(target), &shot))
            .await??;
        let visible = parse_visibility(&answer);
        if visible.is_none() {
            debug!("Unreadable visibility answer for '{}': {}", target, answer);
        }
        Ok((visible, answer, shot))
    }

    async fn wait_until(&self, command: &Command) -> CommandResult {
        let Some((target, desired)) = condition(command) else {
            return Ok(CommandOutput::skipped("extendedWaitUntil without a visibility condition"));
        };
        let timeout = command
            .field("timeout")
            .and_then(CommandArg::as_scalar)
            .and_then(|t| t.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_wait_timeout);

        let deadline = Instant::now() + timeout;
        loop {
            let (visible, answer, shot) = self.check_visibility(&target).await?;
            if visible == Some(desired) {
                return Ok(CommandOutput {
                    text: format!("'{}' {}", target, visibility_word(desired)),
                    screenshot: Some(shot),
                    ai_reasoning: Some(answer),
                    skipped: false,
                });
            }
            if Instant::now() + self.config.wait_poll_interval > deadline {
                return Err(Failure {
                    error: FlowError::Timeout {
                        what: format!("'{}' to be {}", target, visibility_word(desired)),
                        timeout_ms: timeout.as_millis() as u64,
                        last_response: Some(answer.clone()),
                    },
                    screenshot: Some(shot),
                    ai_reasoning: Some(answer),
                });
            }
            self.guarded(tokio::time::sleep(self.config.wait_poll_interval)).await?;
        }
    }

    async fn assert_visibility(&self, command: &Command, desired: bool) -> CommandResult {
        let target = required(command, "text")?;
        let (visible, answer, shot) = self.check_visibility(target).await?;
        let Some(visible) = visible else {
            return Err(Failure {
                error: FlowError::CommandFailed(format!(
                    "Could not tell whether '{}' is visible from the model answer",
                    target
                )),
                screenshot: Some(shot),
                ai_reasoning: Some(answer),
            });
        };
        if visible == desired {
            Ok(CommandOutput {
                text: format!("'{}' {}", target, visibility_word(desired)),
                screenshot: Some(shot),
                ai_reasoning: Some(answer),
                skipped: false,
            })
        } else {
            Err(Failure {
                error: FlowError::CommandFailed(format!(
                    "Expected '{}' to be {}",
                    target,
                    visibility_word(desired)
                )),
                screenshot: Some(shot),
                ai_reasoning: Some(answer),
            })
        }
    }

    /// Screenshot that must succeed
    async fn capture(&self) -> Result<String, Failure> {
        let timeout = self.config.screenshot_timeout;
        match tokio::time::timeout(timeout, self.browser.capture_screenshot(timeout)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(FlowError::Timeout {
                what: "screenshot".to_string(),
                timeout_ms: timeout.as_millis() as u64,
                last_response: None,
            }
            .into()),
        }
    }

    /// Best-effort screenshot after an action
    async fn screenshot(&self) -> Option<String> {
        match self.capture().await {
            Ok(shot) => Some(shot),
            Err(f) => {
                warn!("Screenshot failed: {}", f.error);
                None
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.deadline.map(|d| self.started + d)
    }

    fn check_interrupted(&self) -> Result<(), FlowError> {
        if self.deadline().is_some_and(|at| Instant::now() >= at) {
            return Err(FlowError::DeadlineExceeded);
        }
        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        Ok(())
    }

    /// Run `fut` unless the run is cancelled or its deadline passes first
    async fn guarded<T>(&self, fut: impl Future<Output = T>) -> Result<T, FlowError> {
        let deadline = self.deadline();
        let expired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = expired => Err(FlowError::DeadlineExceeded),
            _ = self.cancel.cancelled() => Err(FlowError::Cancelled),
            value = fut => Ok(value),
        }
    }
}

fn required<'a>(command: &'a Command, key: &str) -> Result<&'a str, FlowError> {
    command
        .value(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| FlowError::CommandFailed(format!("{} requires '{}'", command.name(), key)))
}

fn nested_commands(command: &Command) -> Option<&[Command]> {
    match command.arg()? {
        CommandArg::List(items) => Some(items),
        CommandArg::Record(_) => match command.field("commands")? {
            CommandArg::List(items) => Some(items),
            _ => None,
        },
        CommandArg::Scalar(_) => None,
    }
}

/// `(target, should be visible)` of a wait command
fn condition(command: &Command) -> Option<(String, bool)> {
    for (key, desired) in [("visible", true), ("notVisible", false)] {
        let Some(arg) = command.field(key) else {
            continue;
        };
        let target = match arg {
            CommandArg::Scalar(s) => Some(s.clone()),
            CommandArg::Record(map) => map
                .get("text")
                .or_else(|| map.get("id"))
                .and_then(CommandArg::as_scalar)
                .map(str::to_string),
            CommandArg::List(_) => None,
        };
        if let Some(target) = target {
            return Some((target, desired));
        }
    }
    None
}

fn visibility_word(visible: bool) -> &'static str {
    if visible {
        "visible"
    } else {
        "not visible"
    }
}

fn in_iteration(error: FlowError, i: usize, times: usize) -> FlowError {
    match error {
        FlowError::CommandFailed(msg) => {
            FlowError::CommandFailed(format!("iteration {}/{}: {}", i, times, msg))
        }
        FlowError::Browser(msg) => FlowError::Browser(format!("iteration {}/{}: {}", i, times, msg)),
        FlowError::Timeout {
            what,
            timeout_ms,
            last_response,
        } => FlowError::Timeout {
            what: format!("{} (iteration {}/{})", what, i, times),
            timeout_ms,
            last_response,
        },
        other => other,
    }
}

/// Resolve a root-relative path against the flow's start url
fn absolute_url(base: Option<&str>, url: &str) -> String {
    match base {
        Some(base) if url.starts_with('/') => {
            let origin_end = base
                .find("://")
                .and_then(|scheme| base[scheme + 3..].find('/').map(|p| p + scheme + 3))
                .unwrap_or(base.len());
            format!("{}{}", &base[..origin_end], url)
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscout_common::testing::{CollectingSink, FakeBrowser, ScriptedModel};

    struct Harness {
        browser: Arc<FakeBrowser>,
        model: Arc<ScriptedModel>,
        sink: Arc<CollectingSink>,
        executor: FlowExecutor,
    }

    fn harness() -> Harness {
        harness_with(None, CancellationToken::new())
    }

    fn harness_with(deadline: Option<Duration>, cancel: CancellationToken) -> Harness {
        let browser = Arc::new(FakeBrowser::default());
        let model = Arc::new(ScriptedModel::new());
        let sink = Arc::new(CollectingSink::default());
        let executor = FlowExecutor::new(
            browser.clone(),
            model.clone(),
            JobReporter::new("job-1", sink.clone()),
        )
        .with_config(ExecutorConfig {
            settle_delay: Duration::ZERO,
            wait_poll_interval: Duration::from_millis(5),
            default_wait_timeout: Duration::from_millis(50),
            deadline,
            ..Default::default()
        })
        .with_cancel(cancel);
        Harness {
            browser,
            model,
            sink,
            executor,
        }
    }

    async fn run(h: &Harness, name: &str, text: &str) -> FlowOutcome {
        let flow = parse(name, text).unwrap();
        let mut ctx = FlowContext::new(vec![flow.clone()]);
        h.executor.execute_flow(&flow, &mut ctx).await
    }

    #[tokio::test]
    async fn test_tap_by_text_uses_vision() {
        let h = harness();
        h.model.push_vision("(120, 45)");

        let outcome = run(&h, "login", "- tapOn: \"Sign in\"\n").await;

        assert!(outcome.passed, "{:?}", outcome.error);
        assert!(h.browser.calls().contains(&"click:120,45".to_string()));
        assert_eq!(outcome.steps[0].ai_reasoning.as_deref(), Some("(120, 45)"));
        assert!(outcome.steps[0].screenshot.is_some());
        assert!(h.model.prompts()[0].contains("Sign in"));
    }

    #[tokio::test]
    async fn test_not_found_fails_fast() {
        let h = harness();
        h.model.push_vision("NOT_FOUND");

        let outcome = run(&h, "login", "- tapOn: \"Missing\"\n- back\n").await;

        assert!(!outcome.passed);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.steps[0].status, StepStatus::Failed);
        assert!(outcome.steps[0].message.contains("Missing"));
        assert_eq!(outcome.steps[0].ai_reasoning.as_deref(), Some("NOT_FOUND"));
        assert!(!h.browser.calls().contains(&"go_back".to_string()));
    }

    #[tokio::test]
    async fn test_percentage_point() {
        let h = harness();
        let outcome = run(&h, "p", "- tapOn:\n    point: \"50%,50%\"\n").await;
        assert!(outcome.passed);
        assert_eq!(h.browser.calls(), vec!["click:640,360".to_string()]);
        assert!(h.model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_wait_polls_until_visible() {
        let h = harness();
        h.model.push_vision("NO").push_vision("No, still loading").push_vision("YES");

        let outcome = run(
            &h,
            "w",
            "- extendedWaitUntil:\n    visible: \"Dashboard\"\n    timeout: 5000\n",
        )
        .await;

        assert!(outcome.passed, "{:?}", outcome.error);
        assert_eq!(h.model.prompts().len(), 3);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_last_answer() {
        let h = harness();
        h.model.set_vision_default("NO");

        let outcome = run(
            &h,
            "w",
            "- extendedWaitUntil:\n    notVisible: \"Spinner\"\n    timeout: 30\n",
        )
        .await;

        assert!(outcome.passed, "{:?}", outcome.error);

        let h = harness();
        h.model.set_vision_default("YES");
        let outcome = run(
            &h,
            "w",
            "- extendedWaitUntil:\n    notVisible: \"Spinner\"\n    timeout: 30\n",
        )
        .await;
        assert!(!outcome.passed);
        let step = &outcome.steps[0];
        assert!(step.message.starts_with("Timeout"), "{}", step.message);
        assert_eq!(step.ai_reasoning.as_deref(), Some("YES"));
        assert!(step.screenshot.is_some());
        assert!(step.message.contains("30 ms"), "{}", step.message);
    }

    #[tokio::test]
    async fn test_wait_keeps_polling_on_unreadable_answer() {
        let h = harness();
        h.model.push_vision("I cannot tell, the screenshot is blank").push_vision("NO");

        let outcome = run(
            &h,
            "w",
            "- extendedWaitUntil:\n    notVisible: \"Spinner\"\n    timeout: 5000\n",
        )
        .await;

        assert!(outcome.passed, "{:?}", outcome.error);
        assert_eq!(h.model.prompts().len(), 2);
        assert_eq!(outcome.steps[0].ai_reasoning.as_deref(), Some("NO"));
    }

    #[tokio::test]
    async fn test_unreadable_answer_fails_negative_assertion() {
        let h = harness();
        h.model.push_vision("I cannot tell, the screenshot is blank");
        let outcome = run(&h, "a", "- assertNotVisible: \"Error banner\"\n").await;

        assert!(!outcome.passed);
        let step = &outcome.steps[0];
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.message.contains("Could not tell whether 'Error banner' is visible"), "{}", step.message);
        assert_eq!(
            step.ai_reasoning.as_deref(),
            Some("I cannot tell, the screenshot is blank")
        );
        assert!(step.screenshot.is_some());

        let h = harness();
        h.model.push_vision("Visible? No, it is gone.");
        let outcome = run(&h, "a", "- assertNotVisible: \"Error banner\"\n").await;
        assert!(outcome.passed, "{:?}", outcome.error);
    }

    #[tokio::test]
    async fn test_cancel_stops_batch() {
        let cancel = CancellationToken::new();
        let h = harness_with(None, cancel.clone());
        h.model.set_vision_default("NO");
        let started = std::time::Instant::now();

        let batch = h.executor.execute_batch(vec![
            ("home.yaml".to_string(), "- back\n".to_string()),
            (
                "dashboard.yaml".to_string(),
                "- extendedWaitUntil:\n    visible: \"Dashboard\"\n    timeout: 60000\n".to_string(),
            ),
            ("logout.yaml".to_string(), "- back\n".to_string()),
        ]);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (outcome, _) = tokio::join!(batch, stop);

        assert!(started.elapsed() < Duration::from_secs(10));
        let results: Vec<(&str, bool)> = outcome.flows.iter().map(|f| (f.name.as_str(), f.passed)).collect();
        assert_eq!(
            results,
            vec![("home", true), ("dashboard", false), ("logout", false)]
        );
        assert_eq!(outcome.flows[1].error.as_deref(), Some("Cancelled"));
        assert_eq!(outcome.flows[2].error.as_deref(), Some("Cancelled"));
        assert!(outcome.flows[2].steps.is_empty());
        assert_eq!(outcome.failed, 2);
        assert_eq!(h.browser.calls(), vec!["go_back".to_string()]);
    }

    #[tokio::test]
    async fn test_deadline_fails_remaining_flows() {
        let h = harness_with(Some(Duration::from_millis(100)), CancellationToken::new());
        h.model.set_vision_default("NO");

        let outcome = h
            .executor
            .execute_batch(vec![
                (
                    "wait.yaml".to_string(),
                    "- extendedWaitUntil:\n    visible: \"Done\"\n    timeout: 60000\n".to_string(),
                ),
                ("next.yaml".to_string(), "- back\n".to_string()),
            ])
            .await;

        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.flows[0].error.as_deref(), Some("Run deadline exceeded"));
        assert_eq!(outcome.flows[1].error.as_deref(), Some("Run deadline exceeded"));
        assert!(h.browser.calls().is_empty());
    }

    #[tokio::test]
    async fn test_assertion_is_single_check() {
        let h = harness();
        h.model.push_vision("NO");
        let outcome = run(&h, "a", "- assertVisible: \"Welcome\"\n").await;
        assert!(!outcome.passed);
        assert_eq!(h.model.prompts().len(), 1);
        assert!(outcome.error.unwrap().contains("Expected 'Welcome' to be visible"));
    }

    #[tokio::test]
    async fn test_repeat_annotates_iteration() {
        let h = harness();
        h.model.push_vision("1,1").push_vision("2,2");

        let outcome = run(
            &h,
            "r",
            "- repeat:\n    times: 3\n    commands:\n      - tapOn: \"Next\"\n",
        )
        .await;

        assert!(!outcome.passed);
        let error = outcome.error.unwrap();
        assert!(error.contains("iteration 3/3"), "{}", error);
        let clicks = h
            .browser
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("click:"))
            .count();
        assert_eq!(clicks, 2);
    }

    #[tokio::test]
    async fn test_unknown_command_is_skipped() {
        let h = harness();
        let outcome = run(&h, "u", "- hoverOver: \"Menu\"\n- back\n").await;
        assert!(outcome.passed);
        let statuses: Vec<StepStatus> = outcome.steps.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![StepStatus::Skipped, StepStatus::Passed]);
    }

    #[tokio::test]
    async fn test_run_flow_recursion_detected() {
        let h = harness();
        let a = parse("a", "- runFlow: b.yaml\n").unwrap();
        let b = parse("b", "- back\n- runFlow: a\n").unwrap();
        let mut ctx = FlowContext::new(vec![a.clone(), b]);

        let outcome = h.executor.execute_flow(&a, &mut ctx).await;

        assert!(!outcome.passed);
        assert!(outcome.error.unwrap().contains("Recursion detected"));
        assert_eq!(ctx.depth(), 0);

        let self_ref = parse("self", "- runFlow: self\n").unwrap();
        let mut ctx = FlowContext::new(vec![self_ref.clone()]);
        let outcome = h.executor.execute_flow(&self_ref, &mut ctx).await;
        assert!(outcome.error.unwrap().contains("Recursion detected"));
        assert_eq!(ctx.depth(), 0);
    }

    #[tokio::test]
    async fn test_run_flow_depth_is_bounded() {
        let h = harness();
        let flows: Vec<Flow> = (0..20)
            .map(|i| parse(&format!("f{}", i), &format!("- runFlow: f{}\n", i + 1)).unwrap())
            .collect();
        let first = flows[0].clone();
        let mut ctx = FlowContext::new(flows);

        let outcome = h.executor.execute_flow(&first, &mut ctx).await;

        let error = outcome.error.unwrap();
        assert!(error.contains("Recursion detected: flow 'f16'"), "{}", error);
        assert!(error.contains("depth 16"), "{}", error);
        assert_eq!(ctx.depth(), 0);
    }

    #[tokio::test]
    async fn test_run_flow_opens_start_url() {
        let h = harness();
        let sub = parse("sub", "url: https://s.test\n---\n- back\n").unwrap();
        let main = parse("main", "- runFlow:\n    file: sub.yaml\n").unwrap();
        let mut ctx = FlowContext::new(vec![sub, main.clone()]);

        let outcome = h.executor.execute_flow(&main, &mut ctx).await;

        assert!(outcome.passed, "{:?}", outcome.error);
        assert_eq!(
            h.browser.calls(),
            vec!["navigate:https://s.test".to_string(), "go_back".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_flow() {
        let h = harness();
        let outcome = run(&h, "m", "- runFlow: ghost\n").await;
        assert!(outcome.error.unwrap().contains("Unknown flow: ghost"));
    }

    #[tokio::test]
    async fn test_batch_orders_setup_and_skips_malformed() {
        let h = harness();
        h.model.push_vision("NOT_FOUND");

        let outcome = h
            .executor
            .execute_batch(
                vec![
                    ("login.yaml".to_string(), "- tapOn: \"Ghost\"\n".to_string()),
                    ("bad.yaml".to_string(), "- [unclosed".to_string()),
                    ("setup.yaml".to_string(), "- openLink: https://app.test/\n".to_string()),
                    ("logout.yaml".to_string(), "- back\n".to_string()),
                ],
            )
            .await;

        let names: Vec<&str> = outcome.flows.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["setup", "login", "logout", "bad"]);
        assert_eq!(outcome.total, 4);
        assert_eq!(outcome.passed, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.malformed, 1);
        assert!(outcome.flows[3].malformed);

        let kinds = h.sink.kinds();
        assert_eq!(kinds.iter().filter(|k| **k == "job_progress").count(), 3);
        assert!(kinds.contains(&"step_detail"));
        assert!(h.sink.messages().iter().all(|m| m.job_id == "job-1"));
    }

    #[test]
    fn test_absolute_url() {
        assert_eq!(
            absolute_url(Some("https://app.test/home"), "/cart"),
            "https://app.test/cart"
        );
        assert_eq!(absolute_url(Some("https://app.test"), "/cart"), "https://app.test/cart");
        assert_eq!(absolute_url(None, "/cart"), "/cart");
        assert_eq!(absolute_url(Some("https://a.test"), "https://b.test"), "https://b.test");
    }
}
