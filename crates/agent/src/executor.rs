//! Agent scenario executor
//!
//! `navigate → loop { model → tool calls → results } → verdict`. Every
//! iteration must carry at least one tool call and the loop never runs past
//! its budget, so each scenario ends in exactly one of passed or failed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowscout_common::{
    AgentMessage, Browser, ContentBlock, JobReporter, ModelClient, ModelResponse, ProgressEvent,
    Scenario, ToolCall, ToolDef,
};

use crate::error::{AgentError, AgentResult};
use crate::prompt::{scenario_prompt, SYSTEM_PROMPT};
use crate::tools::{is_browser_tool, tool_defs, Verdict, REPORT_RESULT};
use crate::transcript::Transcript;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model round-trips allowed per scenario
    pub max_iterations: usize,
    /// Screenshots kept as images in the transcript
    pub keep_images: usize,
    /// Extra attempts after a failed model call
    pub model_retries: u32,
    /// Backoff unit; attempt `n` waits `n * retry_backoff`
    pub retry_backoff: Duration,
    pub screenshot_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            keep_images: 3,
            model_retries: 2,
            retry_backoff: Duration::from_secs(2),
            screenshot_timeout: Duration::from_secs(10),
        }
    }
}

/// One executed tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub iteration: usize,
    pub tool: String,
    pub input: Value,
    pub output: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    pub reason: String,
    #[serde(default)]
    pub failed_step: Option<String>,
    /// Model round-trips used
    pub iterations: usize,
    pub step_log: Vec<AgentStep>,
}

/// Runs scenarios against one browser
pub struct ScenarioExecutor {
    browser: Arc<dyn Browser>,
    model: Arc<dyn ModelClient>,
    reporter: JobReporter,
    config: AgentConfig,
    tools: Vec<ToolDef>,
}

impl ScenarioExecutor {
    pub fn new(browser: Arc<dyn Browser>, model: Arc<dyn ModelClient>, reporter: JobReporter) -> Self {
        Self {
            browser,
            model,
            reporter,
            config: AgentConfig::default(),
            tools: tool_defs(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Run scenarios one after another; a failure never stops the rest
    pub async fn execute_all(&self, scenarios: &[Scenario], cancel: &CancellationToken) -> Vec<ScenarioOutcome> {
        let mut outcomes = Vec::with_capacity(scenarios.len());
        info!("Running {} scenario(s)...", scenarios.len());

        for (i, scenario) in scenarios.iter().enumerate() {
            self.reporter.emit(ProgressEvent::JobProgress {
                step: "scenarios".to_string(),
                message: format!("Running scenario {} ({}/{})", scenario.name, i + 1, scenarios.len()),
            });

            let outcome = self.execute_scenario(scenario, cancel).await;
            if outcome.passed {
                info!("✓ {} ({} iterations)", outcome.name, outcome.iterations);
            } else {
                error!("✗ {} - {}", outcome.name, outcome.reason);
            }
            outcomes.push(outcome);
        }

        outcomes
    }

    /// Drive one scenario to a verdict
    pub async fn execute_scenario(&self, scenario: &Scenario, cancel: &CancellationToken) -> ScenarioOutcome {
        let mut run = Run::new(scenario);

        if cancel.is_cancelled() {
            return run.fail(AgentError::Cancelled.to_string());
        }

        let mut opening = vec![ContentBlock::text(scenario_prompt(scenario))];
        if let Some(url) = &scenario.start_url {
            if let Err(e) = self.browser.navigate(url).await {
                return run.fail(format!("Failed to open start url {}: {}", url, e));
            }
        }
        match self.browser.capture_screenshot(self.config.screenshot_timeout).await {
            Ok(shot) => opening.push(ContentBlock::png(shot)),
            Err(e) => warn!("Initial screenshot for '{}' failed: {}", scenario.name, e),
        }

        let mut transcript = Transcript::new(self.config.keep_images);
        transcript.push(AgentMessage::user(opening));

        while run.iterations < self.config.max_iterations {
            if cancel.is_cancelled() {
                return run.fail(AgentError::Cancelled.to_string());
            }
            run.iterations += 1;

            let response = match self.call_model(&transcript, cancel).await {
                Ok(response) => response,
                Err(e) => return run.fail(e.to_string()),
            };

            let text = response.text();
            if !text.is_empty() {
                debug!("[{}] {}", scenario.name, text);
                self.reporter.emit(ProgressEvent::Reasoning { text });
            }

            let calls = response.tool_calls();
            transcript.push(AgentMessage::assistant(response.content));
            if calls.is_empty() {
                return run.fail("stopped without verdict".to_string());
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                if call.name == REPORT_RESULT {
                    match Verdict::from_input(&call.input) {
                        Ok(verdict) => return run.finish(verdict),
                        Err(message) => {
                            results.push(error_result(call, &message));
                            continue;
                        }
                    }
                }
                results.push(self.run_tool(&mut run, call).await);
            }

            transcript.push(AgentMessage::user(results));
            let removed = transcript.prune();
            if removed > 0 {
                debug!("Pruned {} screenshot(s) from '{}' transcript", removed, scenario.name);
            }
        }

        let reason = format!(
            "step budget of {} iterations exhausted without a verdict",
            self.config.max_iterations
        );
        run.fail(reason)
    }

    async fn call_model(&self, transcript: &Transcript, cancel: &CancellationToken) -> AgentResult<ModelResponse> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.model.call_with_tools(SYSTEM_PROMPT, transcript.messages(), &self.tools) => r,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.config.model_retries => {
                    attempt += 1;
                    warn!("Model call failed (attempt {}): {}", attempt, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_backoff * attempt) => {}
                    }
                }
                Err(e) => return Err(AgentError::Model(e.to_string())),
            }
        }
    }

    async fn run_tool(&self, run: &mut Run, call: &ToolCall) -> ContentBlock {
        let start = Instant::now();
        debug!("Tool: {}({})", call.name, call.input);

        let result = if is_browser_tool(&call.name) {
            self.browser
                .execute(&call.name, &call.input)
                .await
                .map_err(|e| AgentError::ToolExecution {
                    tool: call.name.clone(),
                    reason: e.to_string(),
                })
        } else {
            Err(AgentError::ToolExecution {
                tool: call.name.clone(),
                reason: "unknown tool".to_string(),
            })
        };

        let (text, screenshot, is_error) = match result {
            Ok(out) => {
                let shot = match out.screenshot {
                    Some(shot) => Some(shot),
                    None => self.browser.capture_screenshot(self.config.screenshot_timeout).await.ok(),
                };
                (out.text, shot, false)
            }
            Err(e) => (e.to_string(), None, true),
        };

        let step = AgentStep {
            iteration: run.iterations,
            tool: call.name.clone(),
            input: call.input.clone(),
            output: text.clone(),
            is_error,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.reporter.emit(ProgressEvent::StepDetail {
            detail: json!({
                "scenario": run.name,
                "iteration": step.iteration,
                "tool": step.tool,
                "input": step.input,
                "output": step.output,
                "is_error": step.is_error,
                "duration_ms": step.duration_ms,
            }),
        });
        if screenshot.is_some() {
            self.reporter.emit(ProgressEvent::ScreenshotAvailable {
                step: format!("{}#{}", run.name, run.iterations),
                path: None,
            });
        }
        run.step_log.push(step);

        let mut content = vec![ContentBlock::text(text)];
        if let Some(shot) = screenshot {
            content.push(ContentBlock::png(shot));
        }
        ContentBlock::ToolResult {
            tool_use_id: call.id.clone(),
            content,
            is_error,
        }
    }
}

fn error_result(call: &ToolCall, message: &str) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: call.id.clone(),
        content: vec![ContentBlock::text(message)],
        is_error: true,
    }
}

/// Bookkeeping for one scenario run
struct Run {
    name: String,
    iterations: usize,
    step_log: Vec<AgentStep>,
}

impl Run {
    fn new(scenario: &Scenario) -> Self {
        Self {
            name: scenario.name.clone(),
            iterations: 0,
            step_log: Vec::new(),
        }
    }

    fn finish(self, verdict: Verdict) -> ScenarioOutcome {
        ScenarioOutcome {
            name: self.name,
            passed: verdict.passed(),
            reason: verdict.reason,
            failed_step: verdict.failed_step,
            iterations: self.iterations,
            step_log: self.step_log,
        }
    }

    fn fail(self, reason: String) -> ScenarioOutcome {
        ScenarioOutcome {
            name: self.name,
            passed: false,
            reason,
            failed_step: None,
            iterations: self.iterations,
            step_log: self.step_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscout_common::testing::{CollectingSink, FakeBrowser, ScriptedModel};
    use flowscout_common::ScenarioStep;

    fn scenario() -> Scenario {
        Scenario {
            name: "add_to_cart".to_string(),
            description: "Add an item to the cart".to_string(),
            start_url: Some("https://shop.test".to_string()),
            steps: vec![ScenarioStep {
                action: "click".to_string(),
                target: "Add to cart".to_string(),
                value: None,
                expected: Some("cart badge shows 1".to_string()),
            }],
        }
    }

    fn tool_use(id: &str, name: &str, input: Value) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    struct Harness {
        browser: Arc<FakeBrowser>,
        model: Arc<ScriptedModel>,
        sink: Arc<CollectingSink>,
        executor: ScenarioExecutor,
    }

    fn harness(config: AgentConfig) -> Harness {
        let browser = Arc::new(FakeBrowser::default());
        let model = Arc::new(ScriptedModel::new());
        let sink = Arc::new(CollectingSink::default());
        let executor = ScenarioExecutor::new(
            browser.clone(),
            model.clone(),
            JobReporter::new("job-1", sink.clone()),
        )
        .with_config(config);
        Harness {
            browser,
            model,
            sink,
            executor,
        }
    }

    fn fast() -> AgentConfig {
        AgentConfig {
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scenario_passes_on_verdict() {
        let h = harness(fast());
        h.model
            .push_response(vec![
                ContentBlock::text("Clicking the add button"),
                tool_use("t1", "click", json!({"x": 10, "y": 20})),
            ])
            .push_response(vec![tool_use(
                "t2",
                REPORT_RESULT,
                json!({"status": "passed", "reason": "badge shows 1"}),
            )]);

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(outcome.passed);
        assert_eq!(outcome.reason, "badge shows 1");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.step_log.len(), 1);
        assert_eq!(outcome.step_log[0].tool, "click");

        let calls = h.browser.calls();
        assert_eq!(calls[0], "navigate:https://shop.test");
        assert!(calls.contains(&"click:10,20".to_string()));

        let kinds = h.sink.kinds();
        assert!(kinds.contains(&"reasoning"));
        assert!(kinds.contains(&"step_detail"));
        assert!(kinds.contains(&"screenshot_available"));

        // Second model call sees the click result with its screenshot
        let transcripts = h.model.transcripts();
        let last = transcripts[1].last().unwrap();
        match &last.content[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "t1");
                assert!(!is_error);
                assert!(content.iter().any(ContentBlock::is_image));
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_verdict_keeps_failed_step() {
        let h = harness(fast());
        h.model.push_response(vec![tool_use(
            "t1",
            REPORT_RESULT,
            json!({"status": "failed", "reason": "button missing", "failed_step": 1}),
        )]);

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.failed_step.as_deref(), Some("1"));
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn test_no_tool_call_fails() {
        let h = harness(fast());
        h.model.push_response(vec![ContentBlock::text("I think it works")]);

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.reason, "stopped without verdict");
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails() {
        let h = harness(AgentConfig {
            max_iterations: 3,
            ..fast()
        });
        for i in 0..5 {
            h.model.push_response(vec![tool_use(&format!("t{}", i), "scroll", json!({"direction": "down"}))]);
        }

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.iterations, 3);
        assert!(outcome.reason.contains("budget of 3"));
        assert_eq!(h.model.transcripts().len(), 3);
    }

    #[tokio::test]
    async fn test_tool_error_is_reported_to_model() {
        let h = harness(fast());
        h.browser.fail_tool("click");
        h.model
            .push_response(vec![tool_use("t1", "click", json!({"x": 1, "y": 1}))])
            .push_response(vec![tool_use("t2", "hover", json!({}))])
            .push_response(vec![tool_use(
                "t3",
                REPORT_RESULT,
                json!({"status": "failed", "reason": "cannot click"}),
            )]);

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.reason, "cannot click");
        assert!(outcome.step_log.iter().all(|s| s.is_error));

        let transcripts = h.model.transcripts();
        for (call, needle) in [(1, "click"), (2, "unknown tool")] {
            match &transcripts[call].last().unwrap().content[0] {
                ContentBlock::ToolResult { content, is_error, .. } => {
                    assert!(is_error);
                    assert!(matches!(&content[0], ContentBlock::Text { text } if text.contains(needle)));
                }
                other => panic!("unexpected block {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_verdict_is_retried() {
        let h = harness(fast());
        h.model
            .push_response(vec![tool_use("t1", REPORT_RESULT, json!({"status": "unsure"}))])
            .push_response(vec![tool_use(
                "t2",
                REPORT_RESULT,
                json!({"status": "passed", "reason": "done"}),
            )]);

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(outcome.passed);
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(fast());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.executor.execute_scenario(&scenario(), &cancel).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.reason, "cancelled");
        assert!(h.model.transcripts().is_empty());
        assert!(h.browser.calls().is_empty());
    }

    #[tokio::test]
    async fn test_model_retries_then_succeeds() {
        let h = harness(fast());
        h.model
            .push_error("overloaded")
            .push_error("overloaded")
            .push_response(vec![tool_use(
                "t1",
                REPORT_RESULT,
                json!({"status": "passed", "reason": "ok"}),
            )]);

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(outcome.passed);
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn test_model_failure_after_retries() {
        let h = harness(fast());
        for _ in 0..3 {
            h.model.push_error("overloaded");
        }

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("overloaded"));
        assert_eq!(h.model.transcripts().len(), 3);
    }

    #[tokio::test]
    async fn test_transcript_images_stay_bounded() {
        let h = harness(AgentConfig {
            keep_images: 2,
            ..fast()
        });
        for i in 0..5 {
            h.model.push_response(vec![tool_use(&format!("t{}", i), "click", json!({"x": i, "y": i}))]);
        }
        h.model.push_response(vec![tool_use(
            "done",
            REPORT_RESULT,
            json!({"status": "passed", "reason": "ok"}),
        )]);

        let outcome = h.executor.execute_scenario(&scenario(), &CancellationToken::new()).await;
        assert!(outcome.passed);

        let transcripts = h.model.transcripts();
        let images = |messages: &[AgentMessage]| {
            let mut t = Transcript::new(usize::MAX);
            for m in messages {
                t.push(m.clone());
            }
            t.image_count()
        };
        for seen in &transcripts[1..] {
            assert_eq!(images(seen), 2);
        }
    }

    #[tokio::test]
    async fn test_execute_all_continues_after_failure() {
        let h = harness(fast());
        h.model
            .push_response(vec![ContentBlock::text("no idea")])
            .push_response(vec![tool_use(
                "t1",
                REPORT_RESULT,
                json!({"status": "passed", "reason": "ok"}),
            )]);

        let mut second = scenario();
        second.name = "checkout".to_string();
        let outcomes = h
            .executor
            .execute_all(&[scenario(), second], &CancellationToken::new())
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].passed);
        assert!(outcomes[1].passed);
    }
}
