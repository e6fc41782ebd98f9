//! Tool set offered to the model

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use flowscout_common::browser::tools;
use flowscout_common::ToolDef;

/// Terminal tool carrying the scenario verdict
pub const REPORT_RESULT: &str = "report_result";

/// Browser tools the agent may call, in the order they are offered
pub const BROWSER_TOOLS: [&str; 9] = [
    tools::CLICK,
    tools::TYPE_TEXT,
    tools::PRESS_KEY,
    tools::SCROLL,
    tools::NAVIGATE,
    tools::GO_BACK,
    tools::SCREENSHOT,
    tools::EVALUATE,
    tools::WAIT,
];

pub fn is_browser_tool(name: &str) -> bool {
    BROWSER_TOOLS.contains(&name)
}

fn def(name: &str, description: &str, input_schema: Value) -> ToolDef {
    ToolDef {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

fn no_args() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Definitions for every browser tool plus `report_result`
pub fn tool_defs() -> Vec<ToolDef> {
    vec![
        def(
            tools::CLICK,
            "Click at viewport pixel coordinates taken from the latest screenshot.",
            json!({
                "type": "object",
                "properties": {
                    "x": { "type": "integer" },
                    "y": { "type": "integer" }
                },
                "required": ["x", "y"]
            }),
        ),
        def(
            tools::TYPE_TEXT,
            "Type text into the focused element.",
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        ),
        def(
            tools::PRESS_KEY,
            "Press a key such as Enter, Tab, Escape or ArrowDown.",
            json!({
                "type": "object",
                "properties": { "key": { "type": "string" } },
                "required": ["key"]
            }),
        ),
        def(
            tools::SCROLL,
            "Scroll the page.",
            json!({
                "type": "object",
                "properties": {
                    "direction": { "type": "string", "enum": ["up", "down", "top", "bottom"] }
                },
                "required": ["direction"]
            }),
        ),
        def(
            tools::NAVIGATE,
            "Open a URL.",
            json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
        ),
        def(tools::GO_BACK, "Go back in browser history.", no_args()),
        def(tools::SCREENSHOT, "Capture the current viewport.", no_args()),
        def(
            tools::EVALUATE,
            "Run JavaScript in the page and return the result as text.",
            json!({
                "type": "object",
                "properties": { "script": { "type": "string" } },
                "required": ["script"]
            }),
        ),
        def(
            tools::WAIT,
            "Wait a number of milliseconds for the page to update.",
            json!({
                "type": "object",
                "properties": { "ms": { "type": "integer" } },
                "required": ["ms"]
            }),
        ),
        def(
            REPORT_RESULT,
            "Finish the scenario with a verdict. Call exactly once, when every step has been checked or one has clearly failed.",
            json!({
                "type": "object",
                "properties": {
                    "status": { "type": "string", "enum": ["passed", "failed"] },
                    "reason": { "type": "string" },
                    "failed_step": {
                        "type": "integer",
                        "description": "1-based index of the first failing step"
                    }
                },
                "required": ["status", "reason"]
            }),
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Passed,
    Failed,
}

/// Decoded `report_result` arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: VerdictStatus,
    pub reason: String,
    pub failed_step: Option<String>,
}

impl Verdict {
    /// Decode tool input; `Err` carries a message for the model
    pub fn from_input(input: &Value) -> Result<Self, String> {
        let status = match input["status"].as_str().map(str::to_ascii_lowercase).as_deref() {
            Some("passed") | Some("pass") => VerdictStatus::Passed,
            Some("failed") | Some("fail") => VerdictStatus::Failed,
            Some(other) => return Err(format!("status must be 'passed' or 'failed', got '{}'", other)),
            None => return Err("missing 'status'".to_string()),
        };
        let reason = input["reason"].as_str().unwrap_or_default().to_string();
        let failed_step = ["failed_step", "failedStep"]
            .iter()
            .find_map(|key| match &input[*key] {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        Ok(Self {
            status,
            reason,
            failed_step,
        })
    }

    pub fn passed(&self) -> bool {
        self.status == VerdictStatus::Passed
    }
}
