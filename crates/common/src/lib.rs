//! FlowScout Common Library
//!
//! Shared types, persistence, and the browser/model/progress contracts
//! used by the flow executor, the agent executor and the daemon.

pub mod browser;
pub mod db;
pub mod error;
pub mod model;
pub mod progress;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use browser::{Browser, ToolOutput};
pub use db::Database;
pub use error::{Error, Result};
pub use model::{AgentMessage, ContentBlock, ModelClient, ModelResponse, ToolCall, ToolDef};
pub use progress::{JobReporter, ProgressEvent, ProgressMessage, ProgressSink};
pub use types::*;

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".flowscout")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
