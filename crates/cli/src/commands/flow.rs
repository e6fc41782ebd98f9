//! Local flow tooling; these commands never contact the daemon

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use flowscout_flow::{flow_name, normalize, order_flows, parse, reconstruct, Command, Flow, GeneratedFlow};

use crate::output::{print_item, print_list, print_success, print_value, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum FlowCommands {
    /// Parse a flow file and show its header and commands
    Parse {
        /// Flow file (.yaml)
        file: PathBuf,
    },

    /// Apply text repairs to a flow file
    Normalize {
        /// Flow file (.yaml)
        file: PathBuf,

        /// Rewrite the file in place instead of printing
        #[arg(short, long)]
        write: bool,
    },

    /// Render analysis JSON flows as flow text
    Reconstruct {
        /// JSON file: one flow, an array of flows, or an analysis result
        /// with a `flows` array
        file: PathBuf,

        /// Write `<name>.yaml` files here instead of printing
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

/// One command row of a parsed flow
#[derive(Serialize)]
pub struct CommandDisplay {
    pub index: usize,
    pub command: String,
    pub kind: String,
    pub argument: String,
}

impl CommandDisplay {
    fn from_command(index: usize, command: &Command) -> Self {
        let argument = command
            .arg()
            .and_then(|arg| serde_json::to_string(arg).ok())
            .unwrap_or_default();
        Self {
            index,
            command: command.name().to_string(),
            kind: format!("{:?}", command.kind()),
            argument,
        }
    }
}

impl TableDisplay for CommandDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Command", "Kind", "Argument"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.index.to_string(),
            self.command.clone(),
            self.kind.clone(),
            self.argument.clone(),
        ]
    }
}

/// Flow header summary
#[derive(Serialize)]
pub struct FlowSummary {
    pub name: String,
    pub start_url: String,
    pub tags: String,
    pub commands: usize,
}

impl From<&Flow> for FlowSummary {
    fn from(flow: &Flow) -> Self {
        Self {
            name: flow.name.clone(),
            start_url: flow.metadata.start_url.clone().unwrap_or_else(|| "-".to_string()),
            tags: flow.metadata.tags.join(", "),
            commands: flow.commands.len(),
        }
    }
}

impl TableDisplay for FlowSummary {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Start URL", "Tags", "Commands"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.start_url.clone(),
            self.tags.clone(),
            self.commands.to_string(),
        ]
    }
}

pub fn execute(cmd: FlowCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        FlowCommands::Parse { file } => {
            let flow = parse_file(&file)?;
            match format {
                OutputFormat::Table | OutputFormat::Plain => {
                    print_item(&FlowSummary::from(&flow), format);
                    let rows: Vec<CommandDisplay> = flow
                        .commands
                        .iter()
                        .enumerate()
                        .map(|(i, c)| CommandDisplay::from_command(i + 1, c))
                        .collect();
                    print_list(&rows, format);
                }
                _ => print_value(&flow, format),
            }
        }

        FlowCommands::Normalize { file, write } => {
            let raw = read(&file)?;
            let text = normalize(&raw);
            if write {
                if text == raw {
                    print_success(&format!("{} already normalized", file.display()));
                } else {
                    std::fs::write(&file, &text)
                        .with_context(|| format!("failed to write {}", file.display()))?;
                    print_success(&format!("Normalized {}", file.display()));
                }
            } else {
                print!("{}", text);
            }
        }

        FlowCommands::Reconstruct { file, output_dir } => {
            let rendered = reconstruct_file(&file)?;
            match output_dir {
                Some(dir) => {
                    for path in write_flows(&dir, &rendered)? {
                        print_success(&format!("Wrote {}", path.display()));
                    }
                }
                None => {
                    for (i, (name, text)) in rendered.iter().enumerate() {
                        if i > 0 {
                            println!();
                        }
                        println!("# {}", name);
                        print!("{}", text);
                    }
                }
            }
        }
    }

    Ok(())
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Parse a flow file, naming the flow after the file
pub fn parse_file(path: &Path) -> Result<Flow> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("not a file: {}", path.display()))?;
    Ok(parse(flow_name(&file_name), &read(path)?)?)
}

/// Render every flow in a JSON file as `(name, text)`, `setup` first
pub fn reconstruct_file(path: &Path) -> Result<Vec<(String, String)>> {
    let value: Value = serde_json::from_str(&read(path)?)
        .with_context(|| format!("{} is not JSON", path.display()))?;
    let flows: Vec<GeneratedFlow> = if value.is_array() {
        serde_json::from_value(value)?
    } else if let Some(flows) = value.get("flows") {
        serde_json::from_value(flows.clone())?
    } else {
        vec![serde_json::from_value(value)?]
    };

    order_flows(flows, |f| f.name.as_str())
        .iter()
        .map(|flow| Ok((flow.name.clone(), reconstruct(flow)?)))
        .collect()
}

fn write_flows(dir: &Path, rendered: &[(String, String)]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    rendered
        .iter()
        .map(|(name, text)| {
            let file: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
                .collect();
            let path = dir.join(format!("{}.yaml", file));
            std::fs::write(&path, text)?;
            Ok(path)
        })
        .collect()
}
