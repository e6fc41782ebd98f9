//! FlowScout flow engine
//!
//! Parses the command-list flow format and executes flows against a live
//! browser.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Flow Engine                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  normalize(text) -> text          idempotent text repairs   │
//! │  parse(name, text) -> Flow        header + command list     │
//! │  reconstruct(GeneratedFlow)       JSON commands -> text     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  FlowExecutor                                               │
//! │    ├── execute_batch(sources) -> BatchOutcome               │
//! │    ├── execute_flow(flow, ctx) -> FlowOutcome               │
//! │    │     └── StepResult per command, fail-fast              │
//! │    └── vision lookups for text-addressed taps and waits     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod error;
pub mod executor;
pub mod model;
pub mod normalize;
pub mod parser;
pub mod reconstruct;
pub mod vision;

pub use context::FlowContext;
pub use error::{FlowError, FlowResult};
pub use executor::{BatchOutcome, ExecutorConfig, FlowExecutor, FlowOutcome, StepResult, StepStatus};
pub use model::{Command, CommandArg, CommandKind, Flow, FlowMetadata};
pub use normalize::normalize;
pub use parser::{flow_name, parse};
pub use reconstruct::{order_flows, reconstruct, render, GeneratedFlow};
