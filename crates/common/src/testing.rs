//! In-memory doubles for the browser, model and progress contracts.
//!
//! Enabled for dependents through the `test-util` feature.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::browser::{tools, Browser, ToolOutput};
use crate::model::{AgentMessage, ContentBlock, ModelClient, ModelResponse, ToolDef};
use crate::progress::{ProgressMessage, ProgressSink};
use crate::types::Viewport;
use crate::{Error, Result};

/// Browser that records every call and never touches a real page
pub struct FakeBrowser {
    viewport: Viewport,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    shots: Mutex<u64>,
}

impl Default for FakeBrowser {
    fn default() -> Self {
        Self::new(Viewport::default())
    }
}

impl FakeBrowser {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            shots: Mutex::new(0),
        }
    }

    /// Make `execute(tool, ..)` (or `navigate` for "navigate") fail
    pub fn fail_tool(&self, tool: &str) {
        self.failing.lock().insert(tool.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn next_shot(&self) -> String {
        let mut n = self.shots.lock();
        *n += 1;
        format!("c2hvdA{}", *n)
    }

    fn check(&self, tool: &str) -> Result<()> {
        if self.failing.lock().contains(tool) {
            return Err(Error::Browser(format!("{} failed", tool)));
        }
        Ok(())
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.record(format!("navigate:{}", url));
        self.check(tools::NAVIGATE)
    }

    async fn eval_script(&self, script: &str) -> Result<String> {
        self.record(format!("eval:{}", script));
        self.check(tools::EVALUATE)?;
        Ok("null".to_string())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.record(format!("press_key:{}", key));
        self.check(tools::PRESS_KEY)
    }

    async fn capture_screenshot(&self, _timeout: Duration) -> Result<String> {
        self.check(tools::SCREENSHOT)?;
        Ok(self.next_shot())
    }

    async fn execute(&self, tool: &str, args: &serde_json::Value) -> Result<ToolOutput> {
        let call = match tool {
            tools::CLICK => format!(
                "click:{},{}",
                args["x"].as_i64().unwrap_or(-1),
                args["y"].as_i64().unwrap_or(-1)
            ),
            tools::SCREENSHOT | tools::GO_BACK => tool.to_string(),
            _ => format!("{}:{}", tool, args),
        };
        self.record(call);
        self.check(tool)?;
        Ok(ToolOutput::text(format!("{} ok", tool)).with_screenshot(Some(self.next_shot())))
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }
}

/// Model that replays queued answers
#[derive(Default)]
pub struct ScriptedModel {
    vision: Mutex<VecDeque<String>>,
    vision_default: Mutex<Option<String>>,
    responses: Mutex<VecDeque<Result<ModelResponse>>>,
    prompts: Mutex<Vec<String>>,
    transcripts: Mutex<Vec<Vec<AgentMessage>>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_vision(&self, answer: impl Into<String>) -> &Self {
        self.vision.lock().push_back(answer.into());
        self
    }

    /// Answer used once the vision queue is drained
    pub fn set_vision_default(&self, answer: impl Into<String>) -> &Self {
        *self.vision_default.lock() = Some(answer.into());
        self
    }

    pub fn push_response(&self, content: Vec<ContentBlock>) -> &Self {
        self.responses.lock().push_back(Ok(ModelResponse {
            content,
            stop_reason: None,
        }));
        self
    }

    pub fn push_error(&self, message: impl Into<String>) -> &Self {
        self.responses
            .lock()
            .push_back(Err(Error::Model(message.into())));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Transcripts as they were passed to each `call_with_tools`
    pub fn transcripts(&self) -> Vec<Vec<AgentMessage>> {
        self.transcripts.lock().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn analyze_with_image(&self, prompt: &str, _image: &str) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        if let Some(answer) = self.vision.lock().pop_front() {
            return Ok(answer);
        }
        self.vision_default
            .lock()
            .clone()
            .ok_or_else(|| Error::Model("no scripted vision answer".to_string()))
    }

    async fn call_with_tools(
        &self,
        _system_prompt: &str,
        transcript: &[AgentMessage],
        _tools: &[ToolDef],
    ) -> Result<ModelResponse> {
        self.transcripts.lock().push(transcript.to_vec());
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(ModelResponse {
                content: vec![ContentBlock::text("nothing left to do")],
                stop_reason: Some("end_turn".to_string()),
            })
        })
    }
}

/// Sink that keeps every message
#[derive(Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<ProgressMessage>>,
}

impl CollectingSink {
    pub fn messages(&self) -> Vec<ProgressMessage> {
        self.messages.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.messages.lock().iter().map(|m| m.event.kind()).collect()
    }
}

impl ProgressSink for CollectingSink {
    fn publish(&self, message: ProgressMessage) {
        self.messages.lock().push(message);
    }
}
