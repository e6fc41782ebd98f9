//! Flow text normalization
//!
//! Repairs the malformed shapes generative authors tend to produce. Every
//! pass is a pure function of the text and re-entrant, so
//! `normalize(normalize(x)) == normalize(x)`.
//!
//! Pass order over the command section:
//! 1. strip blank lines
//! 2. rename command aliases
//! 3. move `visible`/`notVisible` off non-wait commands into a following
//!    `extendedWaitUntil`
//! 4. drop `extendedWaitUntil` blocks with a timeout but no condition
//! 5. flatten single-argument records (`openLink: {url: x}` → `openLink: x`)
//!
//! The header only gets pass 5, for top-level keys.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::model::{
    canonical_name, flatten_key, Command, CommandArg, VISIBILITY_COMMANDS,
};

/// Metadata/body separator line
pub const SEPARATOR: &str = "---";

const WAIT: &str = "extendedWaitUntil";
const CONDITION_KEYS: [&str; 2] = ["visible", "notVisible"];

/// Normalize raw flow text
pub fn normalize(text: &str) -> String {
    let lines: Vec<String> = text.lines().map(|l| l.trim_end().to_string()).collect();

    let mut out = Vec::with_capacity(lines.len());
    match lines.iter().position(|l| l == SEPARATOR) {
        Some(sep) => {
            let mut header = lines[..sep].to_vec();
            flatten(&mut header, ItemStyle::Key);
            out.extend(header);
            out.push(SEPARATOR.to_string());
            out.extend(normalize_commands(lines[sep + 1..].to_vec()));
        }
        None => out.extend(normalize_commands(lines)),
    }

    if out.is_empty() {
        String::new()
    } else {
        out.join("\n") + "\n"
    }
}

fn normalize_commands(lines: Vec<String>) -> Vec<String> {
    let mut lines: Vec<String> = lines.into_iter().filter(|l| !l.trim().is_empty()).collect();
    rename_aliases(&mut lines);
    extract_visibility(&mut lines);
    drop_invalid_waits(&mut lines);
    flatten(&mut lines, ItemStyle::Dash);
    lines
}

// ============================================================================
// Line model
// ============================================================================

#[derive(Clone, Copy)]
enum ItemStyle {
    /// `- name: ...` list item at any depth
    Dash,
    /// `name: ...` mapping key at column 0
    Key,
}

/// A command-position line
struct Item {
    indent: usize,
    prefix: String,
    name: String,
    rest: String,
}

impl Item {
    /// `name:` with its argument on the following lines
    fn is_record(&self) -> bool {
        self.rest.trim() == ":"
    }
}

fn dash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\s*-\s+)([A-Za-z][A-Za-z0-9_]*)(\s*:.*)?$").expect("valid regex")
    })
}

fn key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^()([A-Za-z][A-Za-z0-9_]*)(\s*:.*)$").expect("valid regex"))
}

fn child_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*:(.*)$").expect("valid regex"))
}

fn item_at(line: &str, style: ItemStyle) -> Option<Item> {
    let re = match style {
        ItemStyle::Dash => dash_re(),
        ItemStyle::Key => key_re(),
    };
    let caps = re.captures(line)?;
    let prefix = caps.get(1).map_or("", |m| m.as_str()).to_string();
    Some(Item {
        indent: indent_of(&prefix),
        prefix,
        name: caps[2].to_string(),
        rest: caps.get(3).map_or("", |m| m.as_str()).to_string(),
    })
}

/// `(key, value)` of a `key: value` line
fn child_key(line: &str) -> Option<(String, String)> {
    let caps = child_re().captures(line)?;
    Some((caps[1].to_string(), caps[2].trim().to_string()))
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// End (exclusive) of the block opened at `start`
fn block_end(lines: &[String], start: usize, indent: usize) -> usize {
    let mut end = start + 1;
    while end < lines.len() && !lines[end].trim().is_empty() && indent_of(&lines[end]) > indent {
        end += 1;
    }
    end
}

/// Direct children of `lines[start..end]` as `(line, block end)` pairs
fn direct_children(lines: &[String], start: usize, end: usize) -> Vec<(usize, usize)> {
    let Some(child_indent) = lines[start..end].iter().map(|l| indent_of(l)).min() else {
        return Vec::new();
    };
    let mut children = Vec::new();
    let mut k = start;
    while k < end {
        if indent_of(&lines[k]) == child_indent {
            let sub_end = block_end(lines, k, child_indent).min(end);
            children.push((k, sub_end));
            k = sub_end;
        } else {
            k += 1;
        }
    }
    children
}

fn reindent(line: &str, from: usize, to: usize) -> String {
    let current = indent_of(line);
    let target = (current + to).saturating_sub(from);
    format!("{}{}", " ".repeat(target), line.trim_start())
}

// ============================================================================
// Passes
// ============================================================================

fn rename_aliases(lines: &mut [String]) {
    for line in lines.iter_mut() {
        if let Some(item) = item_at(line, ItemStyle::Dash) {
            let canonical = canonical_name(&item.name);
            if canonical != item.name {
                *line = format!("{}{}{}", item.prefix, canonical, item.rest);
            }
        }
    }
}

fn extract_visibility(lines: &mut Vec<String>) {
    let mut i = 0;
    while i < lines.len() {
        let item = match item_at(&lines[i], ItemStyle::Dash) {
            Some(item) if item.is_record() && !VISIBILITY_COMMANDS.contains(&item.name.as_str()) => {
                item
            }
            _ => {
                i += 1;
                continue;
            }
        };

        let end = block_end(lines, i, item.indent);
        let moved: Vec<(usize, usize)> = direct_children(lines, i + 1, end)
            .into_iter()
            .filter(|(k, _)| {
                child_key(&lines[*k]).is_some_and(|(key, _)| CONDITION_KEYS.contains(&key.as_str()))
            })
            .collect();

        if !moved.is_empty() {
            let from = indent_of(&lines[moved[0].0]);
            let mut wait = vec![format!("{}- {}:", " ".repeat(item.indent), WAIT)];
            for &(k, sub_end) in &moved {
                for line in &lines[k..sub_end] {
                    wait.push(reindent(line, from, item.indent + 4));
                }
            }

            let mut new_end = end;
            for &(k, sub_end) in moved.iter().rev() {
                lines.drain(k..sub_end);
                new_end -= sub_end - k;
            }
            if new_end == i + 1 {
                lines[i] = format!("{}{}", item.prefix, item.name);
            }
            lines.splice(new_end..new_end, wait);
        }
        i += 1;
    }
}

fn drop_invalid_waits(lines: &mut Vec<String>) {
    let mut i = 0;
    while i < lines.len() {
        if let Some(item) = item_at(&lines[i], ItemStyle::Dash) {
            if item.name == WAIT && item.is_record() {
                let end = block_end(lines, i, item.indent);
                let keys: Vec<String> = direct_children(lines, i + 1, end)
                    .into_iter()
                    .filter_map(|(k, _)| child_key(&lines[k]).map(|(key, _)| key))
                    .collect();
                let has_condition = keys.iter().any(|k| CONDITION_KEYS.contains(&k.as_str()));
                if keys.iter().any(|k| k == "timeout") && !has_condition {
                    lines.drain(i..end);
                    continue;
                }
            }
        }
        i += 1;
    }
}

fn flatten(lines: &mut Vec<String>, style: ItemStyle) {
    let mut i = 0;
    while i < lines.len() {
        if let Some(item) = item_at(&lines[i], style) {
            if let Some(key) = flatten_key(canonical_name(&item.name)) {
                let end = block_end(lines, i, item.indent);
                if item.is_record() && end == i + 2 {
                    if let Some((k, v)) = child_key(&lines[i + 1]) {
                        if k == key && is_inline_scalar(&v) {
                            lines[i] = format!("{}{}: {}", item.prefix, item.name, v);
                            lines.remove(i + 1);
                        }
                    }
                }
            }
        }
        i += 1;
    }
}

fn is_inline_scalar(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('{')
        && !value.starts_with('[')
        && !value.starts_with('|')
        && !value.starts_with('>')
}

// ============================================================================
// Data-level fixups
// ============================================================================

/// Apply the alias, visibility, wait and flattening fixups to decoded
/// commands. Mirrors [`normalize`] for data that never was text.
pub fn fixup_commands(commands: Vec<Command>) -> Vec<Command> {
    let mut out = Vec::with_capacity(commands.len());
    for command in commands {
        let (name, arg) = match command {
            Command::Simple(name) => (canonical_name(&name).to_string(), None),
            Command::Parametrized(name, arg) => (canonical_name(&name).to_string(), Some(arg)),
        };

        match arg {
            None => out.push(Command::Simple(name)),
            Some(CommandArg::Scalar(s)) => out.push(Command::Parametrized(name, CommandArg::Scalar(s))),
            Some(CommandArg::List(items)) => {
                out.push(Command::Parametrized(name, CommandArg::List(fixup_commands(items))))
            }
            Some(CommandArg::Record(map)) => {
                let mut map = fixup_record(map);

                let mut wait = None;
                if !VISIBILITY_COMMANDS.contains(&name.as_str()) {
                    let condition: BTreeMap<String, CommandArg> = CONDITION_KEYS
                        .iter()
                        .filter_map(|k| map.remove(*k).map(|v| (k.to_string(), v)))
                        .collect();
                    if !condition.is_empty() {
                        wait = Some(Command::Parametrized(
                            WAIT.to_string(),
                            CommandArg::Record(condition),
                        ));
                    }
                }

                let has_condition = CONDITION_KEYS.iter().any(|k| map.contains_key(*k));
                if name == WAIT && map.contains_key("timeout") && !has_condition {
                    continue;
                }

                out.push(flatten_record(name, map));
                out.extend(wait);
            }
        }
    }
    out
}

fn fixup_record(map: BTreeMap<String, CommandArg>) -> BTreeMap<String, CommandArg> {
    map.into_iter()
        .map(|(k, v)| match v {
            CommandArg::List(items) => (k, CommandArg::List(fixup_commands(items))),
            other => (k, other),
        })
        .collect()
}

fn flatten_record(name: String, mut map: BTreeMap<String, CommandArg>) -> Command {
    if map.is_empty() {
        return Command::Simple(name);
    }
    if let Some(key) = flatten_key(&name) {
        if map.len() == 1 {
            if let Some(CommandArg::Scalar(value)) = map.remove(key) {
                return Command::Parametrized(name, CommandArg::Scalar(value));
            }
        }
    }
    Command::Parametrized(name, CommandArg::Record(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_idempotent(text: &str) -> String {
        let once = normalize(text);
        assert_eq!(normalize(&once), once, "not idempotent for:\n{}", text);
        once
    }

    #[test]
    fn test_header_flatten() {
        let out = assert_idempotent("openLink:\n  url: \"https://x\"\n---\n- takeScreenshot");
        assert_eq!(out, "openLink: \"https://x\"\n---\n- takeScreenshot\n");
    }

    #[test]
    fn test_strip_blank_lines_and_aliases() {
        let out = assert_idempotent("---\n- click: \"Login\"\n\n   \n- goBack\n- navigate: https://a.test\n");
        assert_eq!(
            out,
            "---\n- tapOn: \"Login\"\n- back\n- openLink: https://a.test\n"
        );
    }

    #[test]
    fn test_extract_visibility() {
        let text = "---\n- tapOn:\n    text: \"Submit\"\n    visible: \"Thanks\"\n- back\n";
        let out = assert_idempotent(text);
        assert_eq!(
            out,
            "---\n- tapOn:\n    text: \"Submit\"\n- extendedWaitUntil:\n    visible: \"Thanks\"\n- back\n"
        );
    }

    #[test]
    fn test_extract_nested_visibility_block() {
        let text = "- back:\n    notVisible:\n      text: \"Modal\"\n";
        let out = assert_idempotent(text);
        assert_eq!(
            out,
            "- back\n- extendedWaitUntil:\n    notVisible:\n      text: \"Modal\"\n"
        );
    }

    #[test]
    fn test_drop_timeout_only_wait() {
        let text = "- wait:\n    timeout: 3000\n- extendedWaitUntil:\n    visible: \"Home\"\n    timeout: 5000\n";
        let out = assert_idempotent(text);
        assert_eq!(
            out,
            "- extendedWaitUntil:\n    visible: \"Home\"\n    timeout: 5000\n"
        );
    }

    #[test]
    fn test_flatten_inside_repeat() {
        let text = "- repeat:\n    times: 2\n    commands:\n      - type:\n          text: \"abc\"\n      - pressKey:\n          key: Enter\n";
        let out = assert_idempotent(text);
        assert_eq!(
            out,
            "- repeat:\n    times: 2\n    commands:\n      - inputText: \"abc\"\n      - pressKey: Enter\n"
        );
    }

    #[test]
    fn test_idempotent_on_odd_inputs() {
        for text in [
            "",
            "---",
            "---\n---\n",
            "- tapOn:\n",
            "garbage: [unclosed\n- x",
            "- openLink:\n    url: a\n    visible: b\n    notVisible: c",
            "\n\n- back\n\n",
            "tags:\n  - smoke\n\n---\n\n- back",
        ] {
            assert_idempotent(text);
        }
    }

    #[test]
    fn test_fixup_commands() {
        let mut record = BTreeMap::new();
        record.insert("url".to_string(), CommandArg::Scalar("https://a".to_string()));
        record.insert("visible".to_string(), CommandArg::Scalar("Welcome".to_string()));
        let mut timeout_only = BTreeMap::new();
        timeout_only.insert("timeout".to_string(), CommandArg::Scalar("100".to_string()));

        let out = fixup_commands(vec![
            Command::Parametrized("navigate".to_string(), CommandArg::Record(record)),
            Command::Parametrized("wait".to_string(), CommandArg::Record(timeout_only)),
            Command::Simple("screenshot".to_string()),
        ]);

        assert_eq!(out.len(), 3);
        assert_eq!(
            out[0],
            Command::Parametrized("openLink".to_string(), CommandArg::Scalar("https://a".to_string()))
        );
        assert_eq!(out[1].name(), "extendedWaitUntil");
        assert_eq!(out[1].value("visible"), Some("Welcome"));
        assert_eq!(out[2], Command::Simple("takeScreenshot".to_string()));
        assert_eq!(fixup_commands(out.clone()), out);
    }
}
