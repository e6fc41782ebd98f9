//! FlowScout CLI
//!
//! Command-line interface for the FlowScout daemon plus local flow
//! tooling.

pub mod client;
pub mod commands;
pub mod output;
