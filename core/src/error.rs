//! Error taxonomy for the decision core.
//!
//! RULE: The orchestrator never crashes on a single event.
//! Every failure is classified into one of five kinds, and the kind —
//! not the call site — decides the retry policy:
//!   - Transient: retried up to 3× with 100/200/400 ms backoff
//!   - Conflict:  retried once, then surfaced as a risk
//!   - Unavailable / Invalid / Fatal: never retried

use std::future::Future;
use thiserror::Error;

/// Retry classification of a `CoreError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Conflict,
    Unavailable,
    Invalid,
    Fatal,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("transient failure in {port}: {message}")]
    Transient { port: &'static str, message: String },

    #[error("compare-and-set conflict on {entity} '{id}'")]
    Conflict { entity: &'static str, id: String },

    #[error("no resource available: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("invariant '{invariant}' violated: {detail}")]
    Fatal { invariant: &'static str, detail: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn transient(port: &'static str, message: impl Into<String>) -> Self {
        Self::Transient { port, message: message.into() }
    }

    pub fn conflict(entity: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict { entity, id: id.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Invalid(_) | Self::Serialization(_) => ErrorKind::Invalid,
            Self::Fatal { .. } | Self::Other(_) => ErrorKind::Fatal,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Exponential backoff schedule for transient retries, milliseconds.
const BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// Run `op` under the standard retry policy.
///
/// Transient errors are retried up to three times with exponential
/// backoff; a conflict is retried exactly once (the caller is expected
/// to have refreshed its snapshot inside `op`); everything else is
/// returned immediately.
pub async fn retrying<T, F, Fut>(op_name: &'static str, mut op: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut conflict_retried = false;
    let mut transient_attempts = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match err.kind() {
                ErrorKind::Transient if transient_attempts < BACKOFF_MS.len() => {
                    let delay = BACKOFF_MS[transient_attempts];
                    transient_attempts += 1;
                    log::warn!(
                        "{op_name}: transient failure (attempt {transient_attempts}), \
                         retrying in {delay} ms: {err}"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                ErrorKind::Conflict if !conflict_retried => {
                    conflict_retried = true;
                    log::warn!("{op_name}: CAS conflict, retrying once: {err}");
                }
                _ => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn transient_retries_three_times_then_fails() {
        let calls = AtomicUsize::new(0);
        let result: CoreResult<()> = retrying("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::transient("router", "timed out")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4); // initial + 3 retries
    }

    #[tokio::test]
    async fn conflict_retries_exactly_once() {
        let calls = AtomicUsize::new(0);
        let result: CoreResult<()> = retrying("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::conflict("order", "o1")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_never_retries() {
        let calls = AtomicUsize::new(0);
        let result: CoreResult<()> = retrying("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::Invalid("missing order id".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
