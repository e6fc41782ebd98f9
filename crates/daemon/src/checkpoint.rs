//! Checkpoint files left behind by a failed scout run

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pipeline stages that leave a checkpoint, worst to best
pub const CHECKPOINT_STAGES: [&str; 4] = ["explore", "analysis", "scenarios", "flows"];

pub fn checkpoint_file(dir: &Path, stage: &str) -> PathBuf {
    dir.join(format!("checkpoint_{}.json", stage))
}

/// Most advanced checkpoint in `dir` holding structured JSON.
///
/// Stages are tried best first; a file that is missing, unreadable or not
/// a JSON object/array is skipped in favour of the next earlier stage.
pub fn find_checkpoint(dir: &Path) -> Option<(String, Value)> {
    for stage in CHECKPOINT_STAGES.iter().rev() {
        let path = checkpoint_file(dir, stage);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => continue,
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(value) if value.is_object() || value.is_array() => {
                debug!("Found checkpoint {:?}", path);
                return Some((stage.to_string(), value));
            }
            _ => warn!("Ignoring unusable checkpoint {:?}", path),
        }
    }
    None
}

/// Write the payload a resumed run reads via `--resume-data`
pub fn write_resume_payload(dir: &Path, step: &str, payload: &Value) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("resume_{}.json", step));
    std::fs::write(&path, serde_json::to_vec_pretty(payload)?)?;
    Ok(path)
}
