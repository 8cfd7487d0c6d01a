//! Retry logic for transient sink reconnect errors (spec §4, C11).
//!
//! Gives a sink's `open()` a few chances to succeed across a flaky network
//! before the caller gives up, with exponential backoff between attempts.

use std::thread;
use std::time::Duration;

use crate::error::StreamResult;

/// Retry delays between attempts (exponential backoff).
const RETRY_DELAYS_MS: [u64; 3] = [200, 500, 1000];

/// Runs `operation`, retrying on [`crate::error::StreamError::is_transient`]
/// errors with exponential backoff (200ms, 500ms, 1000ms). Any non-transient
/// error returns immediately.
///
/// # Arguments
/// * `action` - name for logging (e.g. `"rtmp connect"`)
/// * `operation` - closure performing the fallible attempt
pub fn with_retry<F>(action: &str, mut operation: F) -> StreamResult<()>
where
    F: FnMut() -> StreamResult<()>,
{
    let mut last_error = None;
    for (attempt, &delay_ms) in std::iter::once(&0).chain(RETRY_DELAYS_MS.iter()).enumerate() {
        if attempt > 0 {
            log::info!(
                "retrying {action} (attempt {}/{}) after {delay_ms}ms",
                attempt + 1,
                RETRY_DELAYS_MS.len() + 1,
            );
            thread::sleep(Duration::from_millis(delay_ms));
        }

        match operation() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                log::warn!("{action} transient error: {e}");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.expect("retry loop should have set last_error"))
}
