//! Retry wrapper for bus operations.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use setl_core::backoff::Backoff;
use setl_core::bus::BusError;

const BUS_RETRY_BASE: Duration = Duration::from_millis(100);
const BUS_RETRY_MAX: Duration = Duration::from_secs(5);
const BUS_RETRY_ATTEMPTS: u32 = 8;

/// Run a bus operation through the bounded backoff schedule. Exhaustion (or
/// cancellation mid-retry) means the bus is persistently unavailable; the
/// caller stops the pipeline.
pub(crate) async fn bus_retry<T, F, Fut>(
    what: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BusError>>,
{
    let mut backoff = Backoff::new(BUS_RETRY_BASE, BUS_RETRY_MAX, BUS_RETRY_ATTEMPTS);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => match backoff.next_delay() {
                Some(delay) if !cancel.is_cancelled() => {
                    warn!("{what}: bus operation failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(e).with_context(|| format!("{what}: message bus unavailable")),
            },
        }
    }
}
