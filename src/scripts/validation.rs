use crate::error::HostqError;
use crate::state::models::Platform;

/// Upper bound for ad-hoc script bodies, in characters.
pub const MAX_INLINE_SCRIPT_CHARS: usize = 10_000;
/// Upper bound for saved script bodies, in characters.
pub const MAX_SAVED_SCRIPT_CHARS: usize = 500_000;

const ALLOWED_SHEBANGS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/usr/bin/env sh",
    "/usr/bin/env bash",
    "/usr/bin/env zsh",
];

/// Interpreter a saved script targets, from its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Shell,
    PowerShell,
}

impl ScriptKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".sh") {
            Some(ScriptKind::Shell)
        } else if lower.ends_with(".ps1") {
            Some(ScriptKind::PowerShell)
        } else {
            None
        }
    }

    pub fn runs_on(&self, platform: Platform) -> bool {
        match self {
            ScriptKind::Shell => platform.is_unix_like(),
            ScriptKind::PowerShell => platform == Platform::Windows,
        }
    }
}

pub fn validate_script_name(name: &str) -> Result<ScriptKind, HostqError> {
    if name.trim().is_empty() {
        return Err(HostqError::validation("script name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(HostqError::validation(format!(
            "script name '{}' must not contain path separators",
            name
        )));
    }
    ScriptKind::from_name(name).ok_or_else(|| {
        HostqError::validation(format!(
            "script name '{}' must end in .sh or .ps1",
            name
        ))
    })
}

/// Check a script body. `max_chars` depends on whether the script is saved.
pub fn validate_script_contents(contents: &str, max_chars: usize) -> Result<(), HostqError> {
    if contents.trim().is_empty() {
        return Err(HostqError::validation("script contents must not be empty"));
    }
    let chars = contents.chars().count();
    if chars > max_chars {
        return Err(HostqError::validation(format!(
            "script is too large: {} characters, limit is {}",
            chars, max_chars
        )));
    }
    if let Some(first) = contents.lines().next() {
        if let Some(interpreter) = first.strip_prefix("#!") {
            let interpreter = interpreter.trim();
            if !ALLOWED_SHEBANGS.contains(&interpreter) {
                return Err(HostqError::validation(format!(
                    "unsupported interpreter '{}'; use one of: {}",
                    interpreter,
                    ALLOWED_SHEBANGS.join(", ")
                )));
            }
        }
    }
    Ok(())
}
