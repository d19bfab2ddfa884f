use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::time::timeout;

/// Raised when a deadline elapses inside [`timeout_with_context`], so callers can tell timeouts
/// apart from other I/O failures by downcasting.
#[derive(Debug, Error)]
#[error("timed out {context}")]
pub struct TimedOut {
    pub context: String,
}

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    match timeout(duration, future).await {
        Ok(result) => result.with_context(|| format!("failed while {context}")),
        Err(_) => Err(TimedOut { context }.into()),
    }
}
