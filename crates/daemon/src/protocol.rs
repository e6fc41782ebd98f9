//! Scout's line protocol
//!
//! Scout reports progress on stderr as `PROGRESS:<step>:<message>` and
//! reads hints from stdin as `HINT:<json>`. Everything protocol-specific
//! stays in this module so the rest of the daemon only sees
//! [`ProgressUpdate`] values.

use serde_json::Value;

use flowscout_common::ProgressEvent;

pub const PROGRESS_PREFIX: &str = "PROGRESS:";
pub const HINT_PREFIX: &str = "HINT:";

/// Reserved step names with dedicated handling
pub mod steps {
    pub const AGENT_STEP: &str = "agent_step";
    pub const REASONING: &str = "reasoning";
    pub const SCREENSHOT: &str = "screenshot";
    pub const HINT_ACK: &str = "hint_ack";
}

/// One decoded stderr line
#[derive(Debug, Clone, PartialEq)]
pub enum ScoutLine {
    Progress(ProgressUpdate),
    /// Untagged output, kept only for diagnostics
    Plain(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    AgentStep(Value),
    Reasoning(String),
    /// Path of a screenshot scout saved
    Screenshot(String),
    HintAck(String),
    Step { step: String, message: String },
}

impl ProgressUpdate {
    /// Broadcast form of this update
    pub fn event(&self) -> ProgressEvent {
        match self {
            ProgressUpdate::AgentStep(detail) => ProgressEvent::StepDetail {
                detail: detail.clone(),
            },
            ProgressUpdate::Reasoning(text) => ProgressEvent::Reasoning { text: text.clone() },
            ProgressUpdate::Screenshot(path) => ProgressEvent::ScreenshotAvailable {
                step: steps::SCREENSHOT.to_string(),
                path: Some(path.clone()),
            },
            ProgressUpdate::HintAck(message) => ProgressEvent::HintAcknowledged {
                message: message.clone(),
            },
            ProgressUpdate::Step { step, message } => ProgressEvent::JobProgress {
                step: step.clone(),
                message: message.clone(),
            },
        }
    }

    /// Step-record kind and payload, for updates that are persisted per step
    pub fn record(&self) -> Option<(&'static str, Value)> {
        match self {
            ProgressUpdate::AgentStep(detail) => Some((steps::AGENT_STEP, detail.clone())),
            ProgressUpdate::Screenshot(path) => {
                Some((steps::SCREENSHOT, serde_json::json!({ "path": path })))
            }
            _ => None,
        }
    }
}

/// Decode one stderr line
pub fn parse_line(line: &str) -> ScoutLine {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) else {
        return ScoutLine::Plain(line.to_string());
    };
    let (step, message) = rest.split_once(':').unwrap_or((rest, ""));
    let step = step.trim();
    if step.is_empty() {
        return ScoutLine::Plain(line.to_string());
    }

    let update = match step {
        steps::AGENT_STEP => ProgressUpdate::AgentStep(
            serde_json::from_str(message)
                .unwrap_or_else(|_| serde_json::json!({ "text": message })),
        ),
        steps::REASONING => ProgressUpdate::Reasoning(message.to_string()),
        steps::SCREENSHOT => ProgressUpdate::Screenshot(message.trim().to_string()),
        steps::HINT_ACK => ProgressUpdate::HintAck(message.to_string()),
        _ => ProgressUpdate::Step {
            step: step.to_string(),
            message: message.trim().to_string(),
        },
    };
    ScoutLine::Progress(update)
}

/// The last top-level JSON object in scout's stdout.
///
/// Lines opening an object are tried in order; a parsed object swallows
/// every line it spans, so objects nested inside a pretty-printed result
/// are never candidates themselves. Noise between objects is skipped.
pub fn last_json_object(stdout: &str) -> Option<Value> {
    let mut starts = vec![0];
    starts.extend(stdout.match_indices('\n').map(|(i, _)| i + 1));

    let mut last = None;
    let mut consumed = 0;
    for start in starts {
        if start < consumed || !stdout[start..].starts_with('{') {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<Value>();
        if let Some(Ok(value @ Value::Object(_))) = stream.next() {
            consumed = start + stream.byte_offset();
            last = Some(value);
        }
    }
    last
}
