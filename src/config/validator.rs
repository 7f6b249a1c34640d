use anyhow::Result;
use std::collections::HashSet;

use super::types::{ScriptsManifest, Settings};
use crate::error::HostqError;

const MAX_RETRIES_CAP: u32 = 20;

/// Reject settings that would make the engine misbehave.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.database.trim().is_empty() {
        return Err(HostqError::validation("settings.database must not be empty").into());
    }
    if settings.max_output_chars == 0 {
        return Err(HostqError::validation("settings.max_output_chars must be positive").into());
    }
    if settings.retry.max_retries > MAX_RETRIES_CAP {
        return Err(HostqError::validation(format!(
            "settings.retry.max_retries must be at most {}, got {}",
            MAX_RETRIES_CAP, settings.retry.max_retries
        ))
        .into());
    }
    Ok(())
}

/// Names in a manifest must be unique; file-level checks happen on load.
pub fn validate_manifest(manifest: &ScriptsManifest) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in &manifest.scripts {
        if !seen.insert(entry.name.as_str()) {
            return Err(HostqError::validation(format!(
                "script '{}' appears more than once in the manifest",
                entry.name
            ))
            .into());
        }
    }
    Ok(())
}
