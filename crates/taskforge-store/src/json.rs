//! Atomic JSON state files.
//!
//! All daemon state is mirrored to small JSON files so a crashed instance can
//! rehydrate. Writes go through a temp file + rename so readers never observe
//! a torn file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Read a JSON file, returning `None` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Tolerant read: a missing or malformed file yields the default. Malformed
/// state is logged and overwritten by the next persist, never fatal.
pub fn read_json_or<T: DeserializeOwned>(path: &Path, default: T) -> T {
    match read_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => default,
        Err(err) => {
            warn!("ignoring unreadable state file {}: {err:#}", path.display());
            default
        }
    }
}

/// Write JSON via temp-file + rename in the destination directory.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
