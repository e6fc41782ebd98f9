//! Parsed flow representation
//!
//! A flow is a metadata header plus an ordered command list. Commands are
//! an explicit tagged union so the executor's dispatch is exhaustive.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{FlowError, FlowResult};

/// Flow header fields
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowMetadata {
    pub start_url: Option<String>,
    pub tags: Vec<String>,
    pub app_id: Option<String>,
}

/// A parsed flow. Identity is the filename-derived name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flow {
    pub name: String,
    pub metadata: FlowMetadata,
    pub commands: Vec<Command>,
}

/// Argument of a parametrized command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandArg {
    Scalar(String),
    Record(BTreeMap<String, CommandArg>),
    List(Vec<Command>),
}

/// One flow command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Bare command such as `back`
    Simple(String),
    /// Command with a scalar, record or nested command list
    Parametrized(String, CommandArg),
}

/// Executor-level classification of a command name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandKind {
    Navigate,
    Tap,
    InputText,
    Scroll,
    PressKey,
    EraseText,
    EvalScript,
    Back,
    Screenshot,
    LaunchApp,
    WaitUntil,
    WaitForAnimation,
    AssertVisible,
    AssertNotVisible,
    Repeat,
    RunFlow,
    Unknown,
}

impl CommandKind {
    /// Classify a canonical or aliased command name
    pub fn from_name(name: &str) -> Self {
        match canonical_name(name) {
            "openLink" => CommandKind::Navigate,
            "tapOn" => CommandKind::Tap,
            "inputText" => CommandKind::InputText,
            "scroll" => CommandKind::Scroll,
            "pressKey" => CommandKind::PressKey,
            "eraseText" => CommandKind::EraseText,
            "evalScript" => CommandKind::EvalScript,
            "back" => CommandKind::Back,
            "takeScreenshot" => CommandKind::Screenshot,
            "launchApp" => CommandKind::LaunchApp,
            "extendedWaitUntil" => CommandKind::WaitUntil,
            "waitForAnimationToEnd" => CommandKind::WaitForAnimation,
            "assertVisible" => CommandKind::AssertVisible,
            "assertNotVisible" => CommandKind::AssertNotVisible,
            "repeat" => CommandKind::Repeat,
            "runFlow" => CommandKind::RunFlow,
            _ => CommandKind::Unknown,
        }
    }
}

/// Alias → canonical command name
pub const ALIASES: &[(&str, &str)] = &[
    ("tap", "tapOn"),
    ("click", "tapOn"),
    ("navigate", "openLink"),
    ("goto", "openLink"),
    ("openUrl", "openLink"),
    ("open", "openLink"),
    ("type", "inputText"),
    ("typeText", "inputText"),
    ("press", "pressKey"),
    ("screenshot", "takeScreenshot"),
    ("goBack", "back"),
    ("wait", "extendedWaitUntil"),
    ("waitUntil", "extendedWaitUntil"),
    ("waitFor", "extendedWaitUntil"),
    ("runScript", "evalScript"),
    ("evaluate", "evalScript"),
    ("erase", "eraseText"),
];

/// Single-argument commands whose `{key: value}` form flattens to `value`
pub const FLATTEN_KEYS: &[(&str, &str)] = &[
    ("openLink", "url"),
    ("inputText", "text"),
    ("pressKey", "key"),
    ("runFlow", "file"),
    ("evalScript", "script"),
    ("assertVisible", "text"),
    ("assertNotVisible", "text"),
];

/// Commands allowed to carry a visibility condition
pub const VISIBILITY_COMMANDS: &[&str] = &["extendedWaitUntil", "assertVisible", "assertNotVisible"];

pub fn canonical_name(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

pub fn flatten_key(command: &str) -> Option<&'static str> {
    FLATTEN_KEYS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, key)| *key)
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Simple(name) | Command::Parametrized(name, _) => name,
        }
    }

    pub fn arg(&self) -> Option<&CommandArg> {
        match self {
            Command::Simple(_) => None,
            Command::Parametrized(_, arg) => Some(arg),
        }
    }

    pub fn kind(&self) -> CommandKind {
        CommandKind::from_name(self.name())
    }

    /// The scalar argument, or `key` of a record argument
    pub fn value(&self, key: &str) -> Option<&str> {
        match self.arg()? {
            CommandArg::Scalar(s) => Some(s.as_str()),
            CommandArg::Record(map) => map.get(key).and_then(CommandArg::as_scalar),
            CommandArg::List(_) => None,
        }
    }

    /// A named field of a record argument
    pub fn field(&self, key: &str) -> Option<&CommandArg> {
        match self.arg()? {
            CommandArg::Record(map) => map.get(key),
            _ => None,
        }
    }

    /// Short human-readable form used in step results and logs
    pub fn label(&self) -> String {
        match self {
            Command::Simple(name) => name.clone(),
            Command::Parametrized(name, CommandArg::Scalar(s)) => format!("{}: {}", name, s),
            Command::Parametrized(name, CommandArg::Record(map)) => {
                let fields: Vec<String> = map
                    .iter()
                    .map(|(k, v)| match v {
                        CommandArg::Scalar(s) => format!("{}={}", k, s),
                        CommandArg::Record(_) => format!("{}={{..}}", k),
                        CommandArg::List(items) => format!("{}=[{} commands]", k, items.len()),
                    })
                    .collect();
                format!("{} {{{}}}", name, fields.join(", "))
            }
            Command::Parametrized(name, CommandArg::List(items)) => {
                format!("{} [{} commands]", name, items.len())
            }
        }
    }

    /// Decode one command list item
    pub fn from_yaml(value: &serde_yaml::Value) -> FlowResult<Self> {
        use serde_yaml::Value;
        match value {
            Value::String(name) => Ok(Command::Simple(name.trim().to_string())),
            Value::Mapping(map) if map.len() == 1 => {
                let (key, arg) = map.iter().next().ok_or_else(|| malformed("empty command"))?;
                let name = yaml_scalar(key).ok_or_else(|| malformed("command name must be a string"))?;
                if arg.is_null() {
                    return Ok(Command::Simple(name));
                }
                Ok(Command::Parametrized(name, CommandArg::from_yaml(arg)?))
            }
            Value::Mapping(map) => Err(malformed(&format!(
                "command item must have exactly one key, found {}",
                map.len()
            ))),
            other => Err(malformed(&format!("unexpected command item: {:?}", other))),
        }
    }

    /// Decode one command from analysis-stage JSON
    pub fn from_json(value: &serde_json::Value) -> FlowResult<Self> {
        let yaml = serde_yaml::to_value(value)
            .map_err(|e| malformed(&format!("command not representable: {}", e)))?;
        Self::from_yaml(&yaml)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Command::Simple(name) => serde_json::Value::String(name.clone()),
            Command::Parametrized(name, arg) => {
                let mut map = serde_json::Map::new();
                map.insert(name.clone(), arg.to_json());
                serde_json::Value::Object(map)
            }
        }
    }
}

impl Serialize for Command {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl CommandArg {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            CommandArg::Scalar(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn from_yaml(value: &serde_yaml::Value) -> FlowResult<Self> {
        use serde_yaml::Value;
        match value {
            Value::Sequence(items) => Ok(CommandArg::List(
                items.iter().map(Command::from_yaml).collect::<FlowResult<_>>()?,
            )),
            Value::Mapping(map) => {
                let mut record = BTreeMap::new();
                for (k, v) in map {
                    let key = yaml_scalar(k).ok_or_else(|| malformed("record key must be a scalar"))?;
                    let arg = if v.is_null() {
                        CommandArg::Scalar(String::new())
                    } else {
                        CommandArg::from_yaml(v)?
                    };
                    record.insert(key, arg);
                }
                Ok(CommandArg::Record(record))
            }
            Value::Tagged(tagged) => CommandArg::from_yaml(&tagged.value),
            scalar => yaml_scalar(scalar)
                .map(CommandArg::Scalar)
                .ok_or_else(|| malformed("unsupported argument value")),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CommandArg::Scalar(s) => serde_json::Value::String(s.clone()),
            CommandArg::Record(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            CommandArg::List(items) => {
                serde_json::Value::Array(items.iter().map(Command::to_json).collect())
            }
        }
    }
}

/// Render a YAML scalar as text; `None` for collections
pub(crate) fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn malformed(reason: &str) -> FlowError {
    FlowError::Malformed {
        name: String::new(),
        reason: reason.to_string(),
    }
}
