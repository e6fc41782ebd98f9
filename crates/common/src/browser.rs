//! Browser contract shared by the flow executor and the agent executor

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::Viewport;
use crate::Result;

/// Tool names understood by [`Browser::execute`]
pub mod tools {
    pub const CLICK: &str = "click";
    pub const TYPE_TEXT: &str = "type_text";
    pub const PRESS_KEY: &str = "press_key";
    pub const SCROLL: &str = "scroll";
    pub const NAVIGATE: &str = "navigate";
    pub const GO_BACK: &str = "go_back";
    pub const SCREENSHOT: &str = "screenshot";
    pub const EVALUATE: &str = "evaluate";
    pub const ERASE_TEXT: &str = "erase_text";
    pub const WAIT: &str = "wait";
}

/// Result of a tool-style browser action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub text: String,
    /// Base64 PNG captured after the action, when available
    #[serde(default)]
    pub screenshot: Option<String>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            screenshot: None,
        }
    }

    pub fn with_screenshot(mut self, screenshot: Option<String>) -> Self {
        self.screenshot = screenshot;
        self
    }
}

/// A live browser page.
///
/// One instance is driven by exactly one executor at a time; callers
/// serialize access through the browser concurrency slot.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Evaluate a script in the page and return its result as text
    async fn eval_script(&self, script: &str) -> Result<String>;

    async fn press_key(&self, key: &str) -> Result<()>;

    /// Capture the viewport as base64 PNG, failing after `timeout`
    async fn capture_screenshot(&self, timeout: Duration) -> Result<String>;

    /// Run a named tool (see [`tools`]) with JSON arguments
    async fn execute(&self, tool: &str, args: &serde_json::Value) -> Result<ToolOutput>;

    fn viewport(&self) -> Viewport;
}
