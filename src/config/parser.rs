use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::types::{ScriptsManifest, Settings};
use super::validator;
use crate::state::models::{DesiredScript, ScriptScope};

/// Load settings from a YAML file.
///
/// A missing file is not an error: defaults apply. Whatever is loaded is
/// validated before being returned.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "No settings file, using defaults");
        return Ok(Settings::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    parse_settings(&content)
}

/// Parse YAML content into validated settings.
pub fn parse_settings(content: &str) -> Result<Settings> {
    // An empty document deserializes to unit, not a mapping.
    let settings: Settings = if content.trim().is_empty() {
        Settings::default()
    } else {
        serde_yaml::from_str(content).context("Failed to parse YAML settings")?
    };
    validator::validate_settings(&settings)?;
    Ok(settings)
}

/// Load a scripts manifest and read every referenced script body.
///
/// Script paths are resolved relative to the manifest's directory.
pub fn load_scripts_manifest(path: &Path) -> Result<(ScriptScope, Vec<DesiredScript>)> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scripts manifest: {}", path.display()))?;
    let manifest: ScriptsManifest =
        serde_yaml::from_str(&content).context("Failed to parse scripts manifest")?;
    validator::validate_manifest(&manifest)?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut desired = Vec::with_capacity(manifest.scripts.len());
    for entry in &manifest.scripts {
        let script_path = base.join(&entry.path);
        let contents = fs::read_to_string(&script_path).with_context(|| {
            format!(
                "Failed to read script '{}' from {}",
                entry.name,
                script_path.display()
            )
        })?;
        desired.push(DesiredScript {
            name: entry.name.clone(),
            contents,
        });
    }

    tracing::info!(
        manifest = %path.display(),
        scripts = desired.len(),
        "Loaded scripts manifest"
    );
    Ok((ScriptScope::from_team(manifest.team), desired))
}
