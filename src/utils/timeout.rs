//! Async timeout helpers and default durations.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Bound on the TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for the Acknowledge after a Hello.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the CloseSecureChannel exchange at disconnect.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a fallible `fut`, mapping an elapsed timer to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_maps_to_timeout() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: Result<()> =
            with_timeout_error(async { Err(ProtocolError::QueueFull) }, Duration::from_secs(1))
                .await;
        assert!(matches!(result, Err(ProtocolError::QueueFull)));
    }
}
