//! Flow text parser
//!
//! `parse` is total: every input yields a [`Flow`] or a
//! [`FlowError::Malformed`], never a panic.

use serde_yaml::Value;
use tracing::debug;

use crate::error::{FlowError, FlowResult};
use crate::model::{yaml_scalar, Command, CommandArg, CommandKind, Flow, FlowMetadata};
use crate::normalize::{fixup_commands, normalize, SEPARATOR};

const START_URL_KEYS: [&str; 3] = ["url", "startUrl", "startURL"];

/// Parse raw flow text into a flow named `name`
pub fn parse(name: &str, raw: &str) -> FlowResult<Flow> {
    parse_inner(name, raw).map_err(|e| e.for_flow(name))
}

fn parse_inner(name: &str, raw: &str) -> FlowResult<Flow> {
    let text = normalize(raw);
    let lines: Vec<&str> = text.lines().collect();

    let (metadata, mut commands) = match lines.iter().position(|l| *l == SEPARATOR) {
        Some(sep) => {
            let header = lines[..sep].join("\n");
            let body = lines[sep + 1..].join("\n");
            let (metadata, hoisted) = parse_header(&header)?;
            let mut commands = hoisted;
            commands.extend(parse_command_list(&body)?);
            (metadata, commands)
        }
        None => (FlowMetadata::default(), parse_command_list(&text)?),
    };

    commands = fixup_commands(commands);
    debug!("Parsed flow '{}' with {} command(s)", name, commands.len());

    Ok(Flow {
        name: name.to_string(),
        metadata,
        commands,
    })
}

/// Decode the header mapping; command-named keys are hoisted in order
fn parse_header(text: &str) -> FlowResult<(FlowMetadata, Vec<Command>)> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| malformed(format!("header: {}", e)))?;
    let map = match value {
        Value::Null => return Ok((FlowMetadata::default(), Vec::new())),
        Value::Mapping(map) => map,
        _ => return Err(malformed("header must be a mapping".to_string())),
    };

    let mut metadata = FlowMetadata::default();
    let mut hoisted = Vec::new();

    for (key, value) in &map {
        let Some(key) = key.as_str() else {
            continue;
        };
        match key {
            "appId" => metadata.app_id = yaml_scalar(value).filter(|s| !s.is_empty()),
            "tags" => metadata.tags = parse_tags(value),
            k if START_URL_KEYS.contains(&k) => {
                metadata.start_url = yaml_scalar(value).filter(|s| !s.is_empty())
            }
            k if CommandKind::from_name(k) != CommandKind::Unknown => {
                let command = if value.is_null() {
                    Command::Simple(k.to_string())
                } else {
                    Command::Parametrized(k.to_string(), CommandArg::from_yaml(value)?)
                };
                hoisted.push(command);
            }
            _ => {}
        }
    }

    Ok((metadata, hoisted))
}

fn parse_tags(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().filter_map(yaml_scalar).collect(),
        other => yaml_scalar(other)
            .map(|s| {
                s.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn parse_command_list(text: &str) -> FlowResult<Vec<Command>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_yaml::from_str(text).map_err(|e| malformed(format!("commands: {}", e)))?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items.iter().map(Command::from_yaml).collect(),
        _ => Err(malformed("command section must be a list".to_string())),
    }
}

fn malformed(reason: String) -> FlowError {
    FlowError::Malformed {
        name: String::new(),
        reason,
    }
}

/// Flow name from a file name: the stem without `.yaml`/`.yml`
pub fn flow_name(file_name: &str) -> &str {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    base.strip_suffix(".yaml")
        .or_else(|| base.strip_suffix(".yml"))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_command_hoisted() {
        let flow = parse("home", "openLink:\n  url: \"https://x\"\n---\n- takeScreenshot").unwrap();
        let kinds: Vec<CommandKind> = flow.commands.iter().map(Command::kind).collect();
        assert_eq!(kinds, vec![CommandKind::Navigate, CommandKind::Screenshot]);
        assert_eq!(flow.commands[0].value("url"), Some("https://x"));
    }

    #[test]
    fn test_metadata() {
        let flow = parse(
            "login",
            "appId: shop\nstartURL: https://shop.test/login\ntags: smoke, auth\n---\n- tapOn: \"Sign in\"\n",
        )
        .unwrap();
        assert_eq!(flow.metadata.app_id.as_deref(), Some("shop"));
        assert_eq!(flow.metadata.start_url.as_deref(), Some("https://shop.test/login"));
        assert_eq!(flow.metadata.tags, vec!["smoke", "auth"]);
        assert_eq!(flow.commands.len(), 1);
    }

    #[test]
    fn test_bare_command_list() {
        let flow = parse("bare", "- back\n- pressKey: Enter\n").unwrap();
        assert_eq!(flow.metadata, FlowMetadata::default());
        assert_eq!(flow.commands.len(), 2);
        assert_eq!(flow.commands[1].kind(), CommandKind::PressKey);
    }

    #[test]
    fn test_malformed_inputs() {
        for raw in [
            "just: a mapping",
            "- [unclosed",
            "appId: x\n---\nnot: a list",
            "- a: 1\n  b: 2",
            "[1, 2]\n---\n- back",
        ] {
            match parse("bad", raw) {
                Err(FlowError::Malformed { name, .. }) => assert_eq!(name, "bad"),
                other => panic!("expected malformed for {:?}, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn test_parse_is_total() {
        let inputs = [
            "",
            "---",
            "\u{0}\u{1}",
            "- - - -",
            "- *undefined",
            "- repeat:\n    times: x\n    commands: 3",
            ":\n:\n---\n:",
            "- !tag {x: y}",
        ];
        for raw in inputs {
            let _ = parse("fuzz", raw);
        }
        assert!(parse("empty", "").unwrap().commands.is_empty());
    }

    #[test]
    fn test_flow_name() {
        assert_eq!(flow_name("flows/setup.yaml"), "setup");
        assert_eq!(flow_name("login.yml"), "login");
        assert_eq!(flow_name("checkout"), "checkout");
    }
}
