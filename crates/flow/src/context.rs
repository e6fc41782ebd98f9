//! Per-batch execution state

use std::collections::{HashMap, HashSet};

use crate::error::{FlowError, FlowResult};
use crate::model::Flow;
use crate::parser::flow_name;

/// Scratch state owned by one batch execution.
///
/// Holds the batch's parsed flows and the visiting set that guards nested
/// `runFlow` invocations. Never shared across concurrent runs.
#[derive(Debug, Default)]
pub struct FlowContext {
    flows: HashMap<String, Flow>,
    visiting: HashSet<String>,
}

impl FlowContext {
    pub fn new(flows: impl IntoIterator<Item = Flow>) -> Self {
        Self {
            flows: flows.into_iter().map(|f| (f.name.clone(), f)).collect(),
            visiting: HashSet::new(),
        }
    }

    /// Look up a flow by name or file name
    pub fn resolve(&self, name: &str) -> Option<&Flow> {
        self.flows.get(flow_name(name))
    }

    pub fn is_visiting(&self, name: &str) -> bool {
        self.visiting.contains(flow_name(name))
    }

    /// Mark `name` as running; fails if it already is
    pub fn enter(&mut self, name: &str) -> FlowResult<()> {
        let key = flow_name(name).to_string();
        if !self.visiting.insert(key.clone()) {
            return Err(FlowError::RecursionDetected {
                name: key,
                depth: self.visiting.len(),
            });
        }
        Ok(())
    }

    pub fn leave(&mut self, name: &str) {
        self.visiting.remove(flow_name(name));
    }

    pub fn depth(&self) -> usize {
        self.visiting.len()
    }
}
