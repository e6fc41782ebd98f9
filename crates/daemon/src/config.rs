//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flowscout_common::Viewport;

use crate::timeout::TimeoutPolicy;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP listen address
    pub listen: String,

    pub scout: ScoutConfig,

    pub limits: LimitsConfig,

    pub timeouts: TimeoutPolicy,

    pub browser: BrowserConfig,

    pub model: ModelConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: flowscout_common::default_store_path(),
            listen: "127.0.0.1:8787".to_string(),
            scout: ScoutConfig::default(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutPolicy::default(),
            browser: BrowserConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

/// External analysis process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    /// Scout executable, resolved through PATH when not absolute
    pub binary: String,

    /// Arguments prepended to every invocation
    pub extra_args: Vec<String>,

    /// Root for per-job output directories (default: `<store>/runs`)
    pub output_root: Option<PathBuf>,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            binary: "scout".to_string(),
            extra_args: Vec::new(),
            output_root: None,
        }
    }
}

/// Bounds on queues, buffers and hint traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// How long a job may wait for a concurrency slot
    pub queue_wait_secs: u64,

    /// Scout stdout kept in memory; the rest is discarded
    pub stdout_cap_bytes: usize,

    /// How long stdout may stay open after scout exits
    pub stdout_drain_ms: u64,

    /// Untagged stderr lines kept for failure diagnostics
    pub stderr_tail_lines: usize,

    /// Minimum spacing between hints relayed to one job
    pub hint_interval_ms: u64,

    /// Progress lines kept per running job for reconnecting observers
    pub log_buffer_lines: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_wait_secs: 600,
            stdout_cap_bytes: 8 * 1024 * 1024,
            stdout_drain_ms: 5000,
            stderr_tail_lines: 200,
            hint_interval_ms: 2000,
            log_buffer_lines: 500,
        }
    }
}

impl LimitsConfig {
    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.queue_wait_secs)
    }

    pub fn hint_interval(&self) -> Duration {
        Duration::from_millis(self.hint_interval_ms)
    }

    pub fn stdout_drain(&self) -> Duration {
        Duration::from_millis(self.stdout_drain_ms)
    }
}

/// Browser used for test runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: Viewport,
    /// Chrome executable (auto-detected when unset)
    pub chrome_path: Option<PathBuf>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: Viewport::default(),
            chrome_path: None,
        }
    }
}

/// Tool-calling model used for vision lookups and agent scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Messages API endpoint
    pub endpoint: String,

    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    pub max_tokens: u32,

    /// Agent iterations per scenario
    pub agent_budget: usize,

    /// Screenshots kept in an agent transcript
    pub keep_images: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tokens: 4096,
            agent_budget: 30,
            keep_images: 3,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Directory holding stored flow files, one subdirectory per job
    pub fn flows_dir(&self) -> PathBuf {
        self.store_path.join("flows")
    }

    /// Working directory handed to scout for one job
    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.scout
            .output_root
            .clone()
            .unwrap_or_else(|| self.store_path.join("runs"))
            .join(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.limits.stderr_tail_lines, 200);
        assert_eq!(config.limits.stdout_cap_bytes, 8 * 1024 * 1024);
        assert_eq!(config.model.agent_budget, 30);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "store_path = \"/srv/flowscout\"\n\n[scout]\nbinary = \"/opt/scout\"\n\n[limits]\nqueue_wait_secs = 30\n",
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.scout.binary, "/opt/scout");
        assert_eq!(config.limits.queue_wait(), Duration::from_secs(30));
        assert_eq!(config.limits.hint_interval(), Duration::from_secs(2));
        assert_eq!(config.db_path(), PathBuf::from("/srv/flowscout/state.db"));
        assert_eq!(
            config.job_output_dir("j1"),
            PathBuf::from("/srv/flowscout/runs/j1")
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = DaemonConfig::default();
        config.listen = "0.0.0.0:9000".to_string();
        config.scout.output_root = Some(dir.path().join("out"));
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.listen, "0.0.0.0:9000");
        assert_eq!(loaded.job_output_dir("j2"), dir.path().join("out/j2"));
    }
}
