use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::session::{ConnectAttempt, SessionHandle};
use crate::error::ReconnectError;
use crate::scanner::{ScanMode, ScanOptions, Scanner};

/// Scans for the session's device and reconnects once it advertises.
///
/// Runs a de-duplicated, duty-cycled scan. The first advertisement whose
/// address or name (ignoring ASCII case) matches the session's device stops
/// the scan and triggers [`SessionHandle::connect`]. Bound the search with
/// `cancel`.
///
/// # Errors
///
/// Returns an error when the scan fails or ends first, the session has ended,
/// or `cancel` fires. The scanner is stopped in every case; a failure to stop
/// it is logged and only reported when the search itself succeeded.
#[instrument(skip_all, level = "info", fields(address = %session.device().address()))]
pub async fn reconnect_by_scan(
    scanner: &mut Scanner,
    session: &SessionHandle,
    mode: ScanMode,
    cancel: &CancellationToken,
) -> Result<ConnectAttempt, ReconnectError> {
    let device = session.device().clone();
    let mut results = scanner.start(ScanOptions::builder().mode(mode).build())?;

    let found = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => None,
            next = results.next() => Some(next),
        };
        match next {
            None => break Err(ReconnectError::Cancelled),
            Some(None) => {
                break Err(ReconnectError::ScanEnded {
                    address: device.address().clone(),
                });
            }
            Some(Some(Err(error))) => break Err(error.into()),
            Some(Some(Ok(entry))) => {
                if device.matches(entry.device()) {
                    info!(rssi = ?entry.rssi(), "device is advertising again");
                    break Ok(());
                }
                debug!(seen = %entry.device().address(), "ignoring other device");
            }
        }
    };

    let stopped = scanner.stop().await;
    if let Err(error) = &stopped {
        warn!(%error, "failed to stop scan");
    }
    found?;
    stopped?;
    Ok(session.connect().await?)
}
