use anyhow::Result;
use rusqlite::ErrorCode;
use std::future::Future;
use std::time::Duration;

use crate::config::types::RetrySettings;
use crate::error::HostqError;

/// True when the error chain contains SQLite lock contention.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _)) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    })
}

/// Retry a store operation with exponential backoff while it fails with
/// transient contention. Any other error is returned immediately.
///
/// When the budget runs out the last error is returned, wrapped in
/// [`HostqError::Transient`].
pub async fn with_retry<F, Fut, T>(policy: &RetrySettings, operation_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt > policy.max_retries {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        "All retry attempts exhausted"
                    );
                    return Err(e.context(HostqError::Transient {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                    }));
                }

                let delay = Duration::from_millis(policy.base_delay_ms * 2u64.pow(attempt - 1));
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after store contention"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> anyhow::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        )
        .into()
    }

    fn policy(max_retries: u32) -> RetrySettings {
        RetrySettings {
            max_retries,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn retries_busy_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&policy(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(busy())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("constraint failed")) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!is_transient(&err));
    }

    #[tokio::test]
    async fn exhausted_budget_is_classified_transient() {
        let err = with_retry(&policy(2), "test", || async { Err::<(), _>(busy()) })
            .await
            .unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(HostqError::Transient { attempts: 3, .. })
        ));
        assert!(is_transient(&err));
    }
}
