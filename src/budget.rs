//! Timeout and retry helpers shared by every network, browser and LLM call.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Elapsed budget marker returned by [`within`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

/// Run `fut` under `limit`.
pub async fn within<F, T>(limit: Duration, fut: F) -> Result<T, Elapsed>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut).await.map_err(|_| Elapsed)
}

/// Run `op` up to `attempts` times, returning the first success or the last error.
///
/// `attempts` below one is treated as one.
pub async fn retry<F, Fut, T, E>(attempts: u32, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(label, attempt, error = %e, "Attempt failed, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
