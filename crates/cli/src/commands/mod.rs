//! CLI command implementations

pub mod flow;
pub mod job;
