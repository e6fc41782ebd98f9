//! Serialize structured flow data back to flow text
//!
//! The analysis stage emits flows as JSON. Reconstruction applies the same
//! fixups as text normalization, then renders deterministically: string
//! scalars are double-quoted, record keys sorted.

use serde::{Deserialize, Serialize};

use crate::error::FlowResult;
use crate::model::{Command, CommandArg, Flow, FlowMetadata};
use crate::normalize::{fixup_commands, SEPARATOR};

/// A flow as produced by the analysis stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFlow {
    pub name: String,
    #[serde(default, alias = "appId")]
    pub app_id: Option<String>,
    #[serde(default, alias = "startUrl", alias = "startURL")]
    pub url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub commands: Vec<serde_json::Value>,
}

impl GeneratedFlow {
    /// Decode and fix up into an executable flow
    pub fn to_flow(&self) -> FlowResult<Flow> {
        let commands = self
            .commands
            .iter()
            .map(Command::from_json)
            .collect::<FlowResult<Vec<_>>>()
            .map_err(|e| e.for_flow(&self.name))?;

        Ok(Flow {
            name: self.name.clone(),
            metadata: FlowMetadata {
                start_url: self.url.clone(),
                tags: self.tags.clone(),
                app_id: self.app_id.clone(),
            },
            commands: fixup_commands(commands),
        })
    }
}

/// Render structured flow data as flow text
pub fn reconstruct(flow: &GeneratedFlow) -> FlowResult<String> {
    Ok(render(&flow.to_flow()?))
}

/// Render a flow as text that parses back to the same flow
pub fn render(flow: &Flow) -> String {
    let mut out = Vec::new();

    if let Some(app_id) = &flow.metadata.app_id {
        out.push(format!("appId: {}", scalar(app_id)));
    }
    if let Some(url) = &flow.metadata.start_url {
        out.push(format!("url: {}", scalar(url)));
    }
    if !flow.metadata.tags.is_empty() {
        out.push("tags:".to_string());
        for tag in &flow.metadata.tags {
            out.push(format!("  - {}", scalar(tag)));
        }
    }
    out.push(SEPARATOR.to_string());
    push_commands(&mut out, &flow.commands, 0);

    out.join("\n") + "\n"
}

/// Put a flow named `setup` first; everything else keeps its order
pub fn order_flows<T>(flows: Vec<T>, name: impl Fn(&T) -> &str) -> Vec<T> {
    let (setup, rest): (Vec<T>, Vec<T>) = flows.into_iter().partition(|f| name(f) == "setup");
    setup.into_iter().chain(rest).collect()
}

fn push_commands(out: &mut Vec<String>, commands: &[Command], indent: usize) {
    let pad = " ".repeat(indent);
    for command in commands {
        match command {
            Command::Simple(name) => out.push(format!("{}- {}", pad, name)),
            Command::Parametrized(name, CommandArg::Scalar(s)) => {
                out.push(format!("{}- {}: {}", pad, name, scalar(s)))
            }
            Command::Parametrized(name, arg) => {
                push_value(out, &format!("{}- {}", pad, name), arg, indent + 4)
            }
        }
    }
}

fn push_value(out: &mut Vec<String>, head: &str, arg: &CommandArg, indent: usize) {
    match arg {
        CommandArg::Scalar(s) => out.push(format!("{}: {}", head, scalar(s))),
        CommandArg::Record(map) if map.is_empty() => out.push(format!("{}: {{}}", head)),
        CommandArg::List(items) if items.is_empty() => out.push(format!("{}: []", head)),
        CommandArg::Record(map) => {
            out.push(format!("{}:", head));
            let pad = " ".repeat(indent);
            for (key, value) in map {
                push_value(out, &format!("{}{}", pad, key_text(key)), value, indent + 2);
            }
        }
        CommandArg::List(items) => {
            out.push(format!("{}:", head));
            push_commands(out, items, indent);
        }
    }
}

fn scalar(s: &str) -> String {
    match s.parse::<i64>() {
        Ok(n) if n.to_string() == s => s.to_string(),
        _ => serde_json::Value::String(s.to_string()).to_string(),
    }
}

fn key_text(key: &str) -> String {
    let plain = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        key.to_string()
    } else {
        scalar(key)
    }
}
