use thiserror::Error;

/// Domain errors raised by the queue, script, device and batch layers.
///
/// Operations return `anyhow::Result` and wrap these with context as they
/// propagate; use [`classify`] to recover the variant from an error chain.
#[derive(Debug, Error)]
pub enum HostqError {
    /// Input rejected before any mutation happened.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A destructive mutation is blocked by an existing reference.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store contention that outlived the retry budget.
    #[error("transient store contention during {operation} after {attempts} attempts")]
    Transient { operation: String, attempts: u32 },
}

impl HostqError {
    pub fn validation(msg: impl Into<String>) -> Self {
        HostqError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        HostqError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        HostqError::Conflict(msg.into())
    }
}

/// Return the first [`HostqError`] found in an `anyhow` error chain.
pub fn classify(err: &anyhow::Error) -> Option<&HostqError> {
    // Context values are only reachable through anyhow's own downcast.
    err.downcast_ref::<HostqError>()
        .or_else(|| err.chain().find_map(|e| e.downcast_ref::<HostqError>()))
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(HostqError::NotFound { .. }))
}

pub fn is_validation(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(HostqError::Validation(_)))
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(HostqError::Conflict(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_sees_through_context() {
        let err: anyhow::Result<()> = Err(HostqError::not_found("Script", 42))
            .context("load script for batch run")
            .context("batch run");
        let err = err.unwrap_err();
        assert!(is_not_found(&err));
        assert!(!is_conflict(&err));
        assert_eq!(
            classify(&err).unwrap().to_string(),
            "Script not found: 42"
        );
    }

    #[test]
    fn plain_errors_are_unclassified() {
        let err = anyhow::anyhow!("disk on fire");
        assert!(classify(&err).is_none());
    }
}
