//! Post-run processing utilities.
//!
//! Handles exports after a batch completes or aborts.

use crate::model::BatchSummary;
use anyhow::{Context, Result};
use std::path::Path;

/// Write the summary as pretty-printed JSON.
pub fn export_json(path: &Path, summary: &BatchSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("serialize batch summary")?;
    crate::params::write_atomic(path, json.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Run the configured exports and return one status line per export.
pub fn process_batch_completion(
    summary: &BatchSummary,
    export_json_path: Option<&Path>,
) -> Vec<String> {
    let mut messages = Vec::new();
    if let Some(path) = export_json_path {
        match export_json(path, summary) {
            Ok(()) => messages.push(format!("Exported JSON: {}", path.display())),
            Err(e) => messages.push(format!("Export JSON failed: {e:#}")),
        }
    }
    messages
}
