use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bon::Builder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace};
use uuid::Uuid;

use crate::error::ScanError;
use crate::hw::{Advertisement, DeviceAddress, ScanEntry, ScanTransport};

/// Default scan window of a duty-cycled scan.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(30);
/// Default pause between duty-cycled scan windows.
pub const DEFAULT_SCAN_SLEEP: Duration = Duration::from_secs(30);

/// How the radio is driven while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Scan until stopped.
    #[default]
    Continuous,
    /// Alternate scan windows with idle periods.
    DutyCycled { window: Duration, sleep: Duration },
}

impl ScanMode {
    /// Duty cycle with the default 30 s window and 30 s sleep.
    #[must_use]
    pub fn low_power() -> Self {
        Self::DutyCycled {
            window: DEFAULT_SCAN_WINDOW,
            sleep: DEFAULT_SCAN_SLEEP,
        }
    }
}

/// Advertisement filter. An empty filter accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    name_contains: Option<String>,
    services: Vec<Uuid>,
}

impl ScanFilter {
    /// Accepts only advertisements whose name contains `fragment`.
    ///
    /// Advertisements without a name never match a name filter.
    #[must_use]
    pub fn name_contains(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    /// Accepts only advertisements listing `service`. Repeatable; any listed
    /// service matches.
    #[must_use]
    pub fn service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Returns the service UUIDs passed to the transport.
    #[must_use]
    pub fn services(&self) -> &[Uuid] {
        &self.services
    }

    /// Returns whether `advertisement` passes the filter.
    #[must_use]
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if let Some(fragment) = &self.name_contains {
            let named = advertisement
                .name
                .as_deref()
                .is_some_and(|name| name.contains(fragment.as_str()));
            if !named {
                return false;
            }
        }
        self.services.is_empty()
            || advertisement
                .services
                .iter()
                .any(|service| self.services.contains(service))
    }
}

/// Options for one scan.
#[derive(Debug, Clone, Builder)]
pub struct ScanOptions {
    #[builder(default)]
    filter: ScanFilter,
    /// Report each device once per scan when set.
    #[builder(default = true)]
    dedupe: bool,
    #[builder(default)]
    mode: ScanMode,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ScanOptions {
    /// Returns the advertisement filter.
    #[must_use]
    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    /// Returns whether each device is reported once per scan.
    #[must_use]
    pub fn dedupe(&self) -> bool {
        self.dedupe
    }

    /// Returns the scan cadence.
    #[must_use]
    pub fn mode(&self) -> ScanMode {
        self.mode
    }
}

/// Scanner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Scanning(ScanMode),
}

/// Results of a running scan.
///
/// Ends when the scan stops or the transport's advertisement stream ends.
#[derive(Debug)]
pub struct ScanResults {
    inner: UnboundedReceiverStream<Result<ScanEntry, ScanError>>,
}

impl Stream for ScanResults {
    type Item = Result<ScanEntry, ScanError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[derive(Debug, Default)]
struct SeenDevices {
    entries: HashMap<DeviceAddress, ScanEntry>,
}

impl SeenDevices {
    /// Records a sighting; returns the entry and whether it was the first.
    fn record(&mut self, advertisement: &Advertisement) -> (ScanEntry, bool) {
        let now = Instant::now();
        match self.entries.get_mut(&advertisement.address) {
            Some(entry) => {
                entry.record_sighting(advertisement, now);
                (entry.clone(), false)
            }
            None => {
                let entry = ScanEntry::first_sighting(advertisement, now);
                self.entries
                    .insert(advertisement.address.clone(), entry.clone());
                (entry, true)
            }
        }
    }
}

#[derive(Debug)]
struct ActiveScan {
    mode: ScanMode,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Advertisement scanner with filtering, de-duplication and duty cycling.
#[derive(Debug)]
pub struct Scanner {
    transport: Arc<dyn ScanTransport>,
    seen: Arc<Mutex<SeenDevices>>,
    active: Option<ActiveScan>,
}

impl Scanner {
    /// Creates an idle scanner.
    #[must_use]
    pub fn new(transport: Arc<dyn ScanTransport>) -> Self {
        Self {
            transport,
            seen: Arc::default(),
            active: None,
        }
    }

    /// Returns the scanner state.
    #[must_use]
    pub fn state(&self) -> ScannerState {
        match &self.active {
            Some(active) if !active.task.is_finished() => ScannerState::Scanning(active.mode),
            _ => ScannerState::Idle,
        }
    }

    /// Starts scanning. The de-duplication table starts empty.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::AlreadyScanning`] while a scan is running.
    #[instrument(skip(self), level = "info")]
    pub fn start(&mut self, options: ScanOptions) -> Result<ScanResults, ScanError> {
        if let ScannerState::Scanning(_) = self.state() {
            return Err(ScanError::AlreadyScanning);
        }
        self.lock_seen().entries.clear();

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mode = options.mode;
        let task = tokio::spawn(
            run_scan(
                Arc::clone(&self.transport),
                options,
                Arc::clone(&self.seen),
                results_tx,
                cancel.clone(),
            )
            .instrument(info_span!("scan")),
        );
        self.active = Some(ActiveScan { mode, cancel, task });
        info!("scan started");

        Ok(ScanResults {
            inner: UnboundedReceiverStream::new(results_rx),
        })
    }

    /// Stops scanning and clears the de-duplication table. A no-op when idle.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport fails to stop the scan.
    #[instrument(skip(self), level = "info")]
    pub async fn stop(&mut self) -> Result<(), ScanError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        active.cancel.cancel();
        if let Err(error) = active.task.await {
            debug!(?error, "scan task did not finish cleanly");
        }
        self.lock_seen().entries.clear();
        self.transport.stop_scan().await?;
        info!("scan stopped");
        Ok(())
    }

    /// Returns the devices seen during the current scan, by address.
    #[must_use]
    pub fn entries(&self) -> Vec<ScanEntry> {
        let mut entries: Vec<ScanEntry> = self.lock_seen().entries.values().cloned().collect();
        entries.sort_by(|left, right| left.device().address().cmp(right.device().address()));
        entries
    }

    /// Forgets a device so its next advertisement is reported again.
    pub fn forget(&self, address: &DeviceAddress) -> bool {
        self.lock_seen().entries.remove(address).is_some()
    }

    fn lock_seen(&self) -> std::sync::MutexGuard<'_, SeenDevices> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

async fn run_scan(
    transport: Arc<dyn ScanTransport>,
    options: ScanOptions,
    seen: Arc<Mutex<SeenDevices>>,
    results: mpsc::UnboundedSender<Result<ScanEntry, ScanError>>,
    cancel: CancellationToken,
) {
    loop {
        let mut advertisements = match transport.start_scan(options.filter.services()).await {
            Ok(advertisements) => advertisements,
            Err(error) => {
                let _ = results.send(Err(error.into()));
                return;
            }
        };
        let window = async {
            match options.mode {
                ScanMode::Continuous => std::future::pending::<()>().await,
                ScanMode::DutyCycled { window, .. } => sleep(window).await,
            }
        };
        tokio::pin!(window);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = &mut window => break,
                advertisement = advertisements.next() => {
                    let Some(advertisement) = advertisement else {
                        debug!("advertisement stream ended");
                        return;
                    };
                    if let Some(entry) = observe(&seen, &options, &advertisement)
                        && results.send(Ok(entry)).is_err()
                    {
                        debug!("scan results dropped; stopping scan");
                        return;
                    }
                }
            }
        }

        let ScanMode::DutyCycled { sleep: rest, .. } = options.mode else {
            return;
        };
        trace!(?rest, "scan window closed");
        if let Err(error) = transport.stop_scan().await {
            debug!(?error, "failed to pause scan");
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = sleep(rest) => {}
        }
    }
}

fn observe(
    seen: &Mutex<SeenDevices>,
    options: &ScanOptions,
    advertisement: &Advertisement,
) -> Option<ScanEntry> {
    if !options.filter.matches(advertisement) {
        trace!(address = %advertisement.address, "advertisement filtered out");
        return None;
    }
    let (entry, first) = seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .record(advertisement);
    (first || !options.dedupe).then_some(entry)
}
