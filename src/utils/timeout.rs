//! Default durations and async timeout helpers.

use crate::error::{MuxError, Result};
use std::future::Future;
use std::time::Duration;

/// How long an initiator waits for the responder's connection header
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long the reader waits for an Error frame to reach the wire before teardown
pub const ERROR_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a responder waits for its Shutdown frame to reach the wire
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `fut`, mapping an elapsed deadline to [`MuxError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(MuxError::Timeout),
    }
}
