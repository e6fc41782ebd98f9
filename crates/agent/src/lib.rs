//! FlowScout agent
//!
//! Turns a natural-language [`Scenario`](flowscout_common::Scenario) into
//! browser tool calls chosen by a tool-calling model, until the model
//! reports a verdict or the iteration budget runs out.

pub mod error;
pub mod executor;
pub mod prompt;
pub mod tools;
pub mod transcript;

pub use error::{AgentError, AgentResult};
pub use executor::{AgentConfig, AgentStep, ScenarioExecutor, ScenarioOutcome};
pub use tools::{tool_defs, Verdict, VerdictStatus};
pub use transcript::Transcript;
