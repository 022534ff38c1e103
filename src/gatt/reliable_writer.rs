use std::future::Future;
use std::time::Duration;

use bon::Builder;
use serde::Serialize;
use strum_macros::Display as StrumDisplay;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::capability::Capability;
use super::framer::{ChunkedPayload, DEFAULT_CHUNK_SIZE};
use super::session::SessionHandle;
use crate::error::{OperationError, ReliableWriteError, SessionError};

/// Read-back attempts per chunk before it is rewritten.
pub const DEFAULT_MAX_VERIFY_READS: u32 = 3;
/// Default wait for a write acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default spacing between read-back attempts.
pub const DEFAULT_VERIFY_INTERVAL: Duration = Duration::from_millis(1000);

/// How a payload is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, StrumDisplay, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Each chunk is read back and compared before moving on.
    #[default]
    Verified,
    /// Each chunk is considered delivered once acknowledged.
    Fast,
}

/// Reliable writer tuning.
#[derive(Debug, Clone, Builder)]
pub struct ReliableWriteConfig {
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[builder(default = DEFAULT_ACK_TIMEOUT)]
    ack_timeout: Duration,
    #[builder(default = DEFAULT_VERIFY_INTERVAL)]
    verify_interval: Duration,
    #[builder(default = DEFAULT_MAX_VERIFY_READS)]
    max_verify_reads: u32,
    /// Gives up on a chunk after this many writes. Unbounded when unset.
    max_write_attempts: Option<u32>,
}

impl Default for ReliableWriteConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Summary of a completed reliable write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    /// Chunks delivered.
    pub chunks: usize,
    /// Payload bytes delivered.
    pub bytes: usize,
    /// Chunks written again after read-back never matched.
    pub rewrites: u32,
    /// Read-back attempts issued.
    pub verify_reads: u32,
    /// Writes whose acknowledgement never arrived.
    pub unacknowledged_writes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkStep {
    Write { attempt: u32 },
    Verify { attempt: u32, reads: u32 },
}

/// Delivers payloads chunk by chunk through a session, confirming each chunk
/// by reading the characteristic back.
#[derive(Debug, Clone)]
pub struct ReliableWriter {
    session: SessionHandle,
    config: ReliableWriteConfig,
}

impl ReliableWriter {
    /// Creates a writer over a session.
    #[must_use]
    pub fn new(session: SessionHandle, config: ReliableWriteConfig) -> Self {
        Self { session, config }
    }

    /// Writes `payload` to `characteristic`.
    ///
    /// # Errors
    ///
    /// Returns an error when the session rejects an operation, the link drops,
    /// a chunk exhausts its write attempts, or `cancel` fires.
    pub async fn write(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        strategy: WriteStrategy,
        cancel: &CancellationToken,
    ) -> Result<WriteReceipt, ReliableWriteError> {
        self.write_with_progress(characteristic, payload, strategy, cancel, |_sent| {})
            .await
    }

    /// Writes `payload`, calling `on_progress` with the bytes delivered so far
    /// after every chunk.
    ///
    /// # Errors
    ///
    /// As for [`ReliableWriter::write`].
    #[instrument(
        skip(self, payload, cancel, on_progress),
        level = "info",
        fields(%characteristic, len = payload.len(), ?strategy)
    )]
    pub async fn write_with_progress<F>(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        strategy: WriteStrategy,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<WriteReceipt, ReliableWriteError>
    where
        F: FnMut(usize) + Send,
    {
        if strategy == WriteStrategy::Verified
            && let Some(capabilities) = self.session.capabilities_of(characteristic)
            && !capabilities.contains(Capability::Read)
        {
            return Err(SessionError::MissingCapability {
                uuid: characteristic,
                capability: Capability::Read,
            }
            .into());
        }

        let mut chunks = ChunkedPayload::new(payload, self.chunk_size());
        let mut receipt = WriteReceipt::default();
        while let Some(chunk) = chunks.current() {
            self.deliver_chunk(characteristic, chunks.index(), chunk, strategy, cancel, &mut receipt)
                .await?;
            chunks.acknowledge();
            receipt.chunks += 1;
            receipt.bytes = chunks.bytes_acknowledged();
            on_progress(receipt.bytes);
        }
        debug!(?receipt, "payload delivered");
        Ok(receipt)
    }

    /// Chunks never exceed the session's own write size, so each one lands in
    /// a single transport write and can be read back whole.
    fn chunk_size(&self) -> usize {
        let session_limit = self.session.chunk_size();
        if self.config.chunk_size > session_limit {
            debug!(
                requested = self.config.chunk_size,
                session_limit, "clamping chunk size to the session's write size"
            );
        }
        self.config.chunk_size.min(session_limit)
    }

    async fn deliver_chunk(
        &self,
        characteristic: Uuid,
        index: usize,
        chunk: &[u8],
        strategy: WriteStrategy,
        cancel: &CancellationToken,
        receipt: &mut WriteReceipt,
    ) -> Result<(), ReliableWriteError> {
        let mut step = ChunkStep::Write { attempt: 1 };
        let mut ticks = interval(self.config.verify_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            step = match step {
                ChunkStep::Write { attempt } => {
                    self.write_once(characteristic, chunk, cancel, receipt)
                        .await?;
                    if strategy == WriteStrategy::Fast {
                        return Ok(());
                    }
                    ticks.reset_immediately();
                    ChunkStep::Verify { attempt, reads: 0 }
                }
                ChunkStep::Verify { attempt, reads } if reads >= self.config.max_verify_reads => {
                    if self
                        .config
                        .max_write_attempts
                        .is_some_and(|limit| attempt >= limit)
                    {
                        return Err(ReliableWriteError::VerifyExhausted {
                            chunk: index,
                            attempts: attempt,
                        });
                    }
                    warn!(chunk = index, attempt, "read-back never matched; rewriting chunk");
                    receipt.rewrites += 1;
                    ChunkStep::Write {
                        attempt: attempt + 1,
                    }
                }
                ChunkStep::Verify { attempt, reads } => {
                    until_cancelled(cancel, ticks.tick()).await?;
                    receipt.verify_reads += 1;
                    match self.read_back(characteristic, cancel).await? {
                        Some(value) if value == chunk => return Ok(()),
                        Some(value) => {
                            debug!(chunk = index, read = reads + 1, ?value, "read-back mismatch");
                        }
                        None => debug!(chunk = index, read = reads + 1, "read-back unanswered"),
                    }
                    ChunkStep::Verify {
                        attempt,
                        reads: reads + 1,
                    }
                }
            };
        }
    }

    async fn write_once(
        &self,
        characteristic: Uuid,
        chunk: &[u8],
        cancel: &CancellationToken,
        receipt: &mut WriteReceipt,
    ) -> Result<(), ReliableWriteError> {
        let ticket = self
            .session
            .write_within(characteristic, chunk.to_vec(), self.config.ack_timeout)
            .await?;
        match until_cancelled(cancel, ticket.completion()).await? {
            Ok(()) => Ok(()),
            Err(OperationError::TimedOut { timeout }) => {
                warn!(?timeout, "write acknowledgement timed out; assuming delivered");
                receipt.unacknowledged_writes += 1;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Reads the characteristic back; `None` when the read went unanswered.
    async fn read_back(
        &self,
        characteristic: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, ReliableWriteError> {
        let ticket = self
            .session
            .read_within(characteristic, self.config.verify_interval)
            .await?;
        match until_cancelled(cancel, ticket.completion()).await? {
            Ok(value) => Ok(Some(value)),
            Err(OperationError::TimedOut { .. }) => Ok(None),
            Err(OperationError::Transport { message }) => {
                debug!(%message, "read-back failed");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }
}

async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    future: F,
) -> Result<F::Output, ReliableWriteError> {
    tokio::select! {
        () = cancel.cancelled() => Err(ReliableWriteError::Cancelled),
        output = future => Ok(output),
    }
}
