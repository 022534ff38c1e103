use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;

use super::capability::{Capability, CapabilityRegistry};
use super::framer::ByteFramer;
use crate::error::{OperationError, SessionError};
use crate::hw::CharacteristicHandle;

/// A logical GATT request submitted to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Read { characteristic: Uuid },
    Write { characteristic: Uuid, value: Vec<u8> },
    SetNotify { characteristic: Uuid, enabled: bool },
    ReadRssi,
}

/// Successful result of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Value(Vec<u8>),
    Written,
    NotifySet(bool),
    Rssi(i16),
}

pub(crate) type Completion = oneshot::Sender<Result<OperationOutput, OperationError>>;

/// Who queued an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Caller,
    NotificationSetup,
}

/// Unit of work actually sent to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Read(Uuid),
    WriteChunk(Uuid),
    SetNotify(Uuid, bool),
    ReadRssi,
}

impl Step {
    pub(crate) fn characteristic(self) -> Option<Uuid> {
        match self {
            Self::Read(uuid) | Self::WriteChunk(uuid) | Self::SetNotify(uuid, _) => Some(uuid),
            Self::ReadRssi => None,
        }
    }
}

/// Transport call for the operation at the head of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportRequest {
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Vec<u8>),
    SetNotify(CharacteristicHandle, bool),
    ReadRssi,
}

#[derive(Debug)]
pub(crate) struct Dispatch {
    pub(crate) id: u64,
    pub(crate) request: TransportRequest,
    pub(crate) timeout: Option<Duration>,
}

#[derive(Debug)]
struct QueuedOperation {
    id: u64,
    step: Step,
    origin: Origin,
    batch: Option<u64>,
    timeout: Option<Duration>,
    completion: Option<Completion>,
}

/// What finished when the in-flight operation completed.
#[derive(Debug)]
pub(crate) struct Finished {
    pub(crate) step: Step,
    pub(crate) origin: Origin,
    pub(crate) outcome: Result<FinishedOutput, OperationError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FinishedOutput {
    Value(Vec<u8>),
    Written { len: usize },
    NotifySet(bool),
    Rssi(i16),
}

/// FIFO of pending GATT operations with at most one in flight.
///
/// Write payloads are framed into chunks at enqueue time; the chunk bytes live
/// in the characteristic's pending queue in the registry and each chunk is a
/// separate queue entry. The caller's completion rides on the last chunk.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    pending: VecDeque<QueuedOperation>,
    in_flight: Option<u64>,
    next_id: u64,
    next_batch: u64,
}

impl OperationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// Validates and queues a caller operation.
    ///
    /// Returns the dispatch for the transport when the queue was idle.
    pub(crate) fn enqueue(
        &mut self,
        registry: &mut CapabilityRegistry,
        operation: Operation,
        framer: ByteFramer,
        timeout: Option<Duration>,
        completion: Completion,
    ) -> Result<Option<Dispatch>, SessionError> {
        match operation {
            Operation::Read { characteristic } => {
                check(registry, characteristic, Capability::Read)?;
                self.push(Step::Read(characteristic), Origin::Caller, None, timeout, Some(completion));
            }
            Operation::Write {
                characteristic,
                value,
            } => {
                check(registry, characteristic, Capability::Write)?;
                let chunks = framer.split(&value);
                let Some(last) = chunks.len().checked_sub(1) else {
                    let _ = completion.send(Ok(OperationOutput::Written));
                    return Ok(None);
                };
                let batch = self.next_batch;
                self.next_batch += 1;
                trace!(%characteristic, chunks = chunks.len(), batch, "queueing chunked write");
                let steps = chunks.len();
                registry.push_chunks(characteristic, chunks);
                let mut completion = Some(completion);
                for position in 0..steps {
                    let reply = if position == last {
                        completion.take()
                    } else {
                        None
                    };
                    self.push(
                        Step::WriteChunk(characteristic),
                        Origin::Caller,
                        Some(batch),
                        timeout,
                        reply,
                    );
                }
            }
            Operation::SetNotify {
                characteristic,
                enabled,
            } => {
                check(registry, characteristic, Capability::Notify)?;
                self.push(
                    Step::SetNotify(characteristic, enabled),
                    Origin::Caller,
                    None,
                    timeout,
                    Some(completion),
                );
            }
            Operation::ReadRssi => {
                self.push(Step::ReadRssi, Origin::Caller, None, timeout, Some(completion));
            }
        }
        Ok(self.next_dispatch(registry))
    }

    /// Queues the notification enable issued while bringing a link up.
    pub(crate) fn enqueue_notification_setup(
        &mut self,
        registry: &CapabilityRegistry,
        characteristic: Uuid,
        timeout: Option<Duration>,
    ) -> Option<Dispatch> {
        self.push(
            Step::SetNotify(characteristic, true),
            Origin::NotificationSetup,
            None,
            timeout,
            None,
        );
        self.next_dispatch(registry)
    }

    fn push(
        &mut self,
        step: Step,
        origin: Origin,
        batch: Option<u64>,
        timeout: Option<Duration>,
        completion: Option<Completion>,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back(QueuedOperation {
            id,
            step,
            origin,
            batch,
            timeout,
            completion,
        });
    }

    /// Builds the transport call for the queue head when nothing is in flight.
    pub(crate) fn next_dispatch(&mut self, registry: &CapabilityRegistry) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }
        let head = self.pending.front()?;
        let handle = |uuid: Uuid| {
            registry
                .get(uuid)
                .and_then(|characteristic| characteristic.handle().cloned())
        };
        let request = match head.step {
            Step::Read(uuid) => TransportRequest::Read(handle(uuid)?),
            Step::WriteChunk(uuid) => TransportRequest::Write(
                handle(uuid)?,
                registry.front_chunk(uuid).map(<[u8]>::to_vec)?,
            ),
            Step::SetNotify(uuid, enabled) => TransportRequest::SetNotify(handle(uuid)?, enabled),
            Step::ReadRssi => TransportRequest::ReadRssi,
        };
        self.in_flight = Some(head.id);
        Some(Dispatch {
            id: head.id,
            request,
            timeout: head.timeout,
        })
    }

    /// Retires the in-flight operation and replies to its caller.
    ///
    /// Returns `None` when `id` is not the operation in flight. A failed chunk
    /// discards the rest of its write.
    pub(crate) fn complete(
        &mut self,
        registry: &mut CapabilityRegistry,
        id: u64,
        result: Result<OperationOutput, OperationError>,
    ) -> Option<Finished> {
        if self.in_flight != Some(id) {
            trace!(id, "ignoring completion for an operation that is not in flight");
            return None;
        }
        self.in_flight = None;
        let mut head = self.pending.pop_front()?;

        let outcome = match (head.step, result) {
            (Step::WriteChunk(uuid), Ok(_written)) => {
                let len = registry.pop_chunk(uuid).map_or(0, |chunk| chunk.len());
                Ok(FinishedOutput::Written { len })
            }
            (Step::WriteChunk(uuid), Err(error)) => {
                registry.pop_chunk(uuid);
                if let Some(batch) = head.batch {
                    while self
                        .pending
                        .front()
                        .is_some_and(|next| next.batch == Some(batch))
                    {
                        if let Some(mut dropped) = self.pending.pop_front() {
                            registry.pop_chunk(uuid);
                            if dropped.completion.is_some() {
                                head.completion = dropped.completion.take();
                            }
                        }
                    }
                }
                Err(error)
            }
            (_, Ok(OperationOutput::Value(value))) => Ok(FinishedOutput::Value(value)),
            (_, Ok(OperationOutput::NotifySet(enabled))) => Ok(FinishedOutput::NotifySet(enabled)),
            (_, Ok(OperationOutput::Rssi(rssi))) => Ok(FinishedOutput::Rssi(rssi)),
            (_, Ok(OperationOutput::Written)) => Ok(FinishedOutput::Written { len: 0 }),
            (_, Err(error)) => Err(error),
        };

        if let Some(completion) = head.completion.take() {
            let reply = match &outcome {
                Ok(FinishedOutput::Value(value)) => Ok(OperationOutput::Value(value.clone())),
                Ok(FinishedOutput::Written { .. }) => Ok(OperationOutput::Written),
                Ok(FinishedOutput::NotifySet(enabled)) => Ok(OperationOutput::NotifySet(*enabled)),
                Ok(FinishedOutput::Rssi(rssi)) => Ok(OperationOutput::Rssi(*rssi)),
                Err(error) => Err(error.clone()),
            };
            let _ = completion.send(reply);
        }

        Some(Finished {
            step: head.step,
            origin: head.origin,
            outcome,
        })
    }

    /// Fails every queued operation and forgets the in-flight one.
    pub(crate) fn clear(&mut self, error: &OperationError) {
        self.in_flight = None;
        for mut operation in self.pending.drain(..) {
            if let Some(completion) = operation.completion.take() {
                let _ = completion.send(Err(error.clone()));
            }
        }
    }
}

fn check(
    registry: &CapabilityRegistry,
    uuid: Uuid,
    capability: Capability,
) -> Result<(), SessionError> {
    let characteristic = registry
        .get(uuid)
        .ok_or(SessionError::CharacteristicNotFound { uuid })?;
    let capabilities = characteristic.capabilities();
    let supported = match capability {
        Capability::Notify | Capability::Indicate => capabilities.is_notifiable(),
        other => capabilities.contains(other),
    };
    if !supported {
        return Err(match capability {
            Capability::Write => SessionError::NotWritable { uuid },
            other => SessionError::MissingCapability {
                uuid,
                capability: other,
            },
        });
    }
    if characteristic.handle().is_none() {
        return Err(SessionError::CharacteristicUnavailable { uuid });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::gatt::capability::ServiceSpec;
    use crate::hw::DiscoveredService;

    const SERVICE: Uuid = Uuid::from_u128(0xa0);
    const TX: Uuid = Uuid::from_u128(0xa1);
    const RX: Uuid = Uuid::from_u128(0xa2);
    const MISSING: Uuid = Uuid::from_u128(0xa3);

    fn resolved_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new().with_service(
            ServiceSpec::new(SERVICE)
                .with_characteristic(TX, [Capability::Read, Capability::Write])
                .with_characteristic(RX, [Capability::Notify])
                .with_characteristic(MISSING, [Capability::Read]),
        );
        registry.reconcile(&[DiscoveredService::new(
            SERVICE,
            vec![
                CharacteristicHandle::new(
                    SERVICE,
                    TX,
                    [Capability::Read, Capability::Write].into_iter().collect(),
                ),
                CharacteristicHandle::new(SERVICE, RX, [Capability::Notify].into_iter().collect()),
            ],
        )]);
        registry
    }

    fn ticket() -> (
        Completion,
        oneshot::Receiver<Result<OperationOutput, OperationError>>,
    ) {
        oneshot::channel()
    }

    fn enqueue(
        queue: &mut OperationQueue,
        registry: &mut CapabilityRegistry,
        operation: Operation,
    ) -> (
        Result<Option<Dispatch>, SessionError>,
        oneshot::Receiver<Result<OperationOutput, OperationError>>,
    ) {
        let (completion, receiver) = ticket();
        let result = queue.enqueue(registry, operation, ByteFramer::new(4), None, completion);
        (result, receiver)
    }

    #[test]
    fn only_the_head_is_dispatched_until_it_completes() {
        let mut registry = resolved_registry();
        let mut queue = OperationQueue::new();

        let (first, _first_rx) = enqueue(
            &mut queue,
            &mut registry,
            Operation::Read { characteristic: TX },
        );
        let (second, _second_rx) = enqueue(&mut queue, &mut registry, Operation::ReadRssi);

        let first = first.expect("read is valid").expect("idle queue dispatches");
        assert_matches!(first.request, TransportRequest::Read(_));
        assert!(second.expect("rssi is valid").is_none());
        assert_eq!(None, queue.next_dispatch(&registry).map(|d| d.id));

        queue.complete(&mut registry, first.id, Ok(OperationOutput::Value(vec![1])));
        let next = queue
            .next_dispatch(&registry)
            .expect("second operation is dispatched after the first completes");
        assert_eq!(TransportRequest::ReadRssi, next.request);
    }

    #[test]
    fn write_is_split_into_chunk_entries_with_one_reply() {
        let mut registry = resolved_registry();
        let mut queue = OperationQueue::new();

        let (dispatch, mut receiver) = enqueue(
            &mut queue,
            &mut registry,
            Operation::Write {
                characteristic: TX,
                value: (0..10).collect(),
            },
        );

        assert_eq!(3, queue.len());
        assert_eq!(3, registry.get(TX).map_or(0, |c| c.pending_chunks()));
        let mut dispatch = dispatch.expect("write is valid");
        let mut written = Vec::new();
        while let Some(current) = dispatch {
            let TransportRequest::Write(_, chunk) = current.request else {
                panic!("expected a chunk write");
            };
            assert!(receiver.try_recv().is_err());
            written.push(chunk);
            queue.complete(&mut registry, current.id, Ok(OperationOutput::Written));
            dispatch = queue.next_dispatch(&registry);
        }

        assert_eq!(vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]], written);
        assert_eq!(Ok(Ok(OperationOutput::Written)), receiver.try_recv());
        assert_eq!(0, registry.get(TX).map_or(1, |c| c.pending_chunks()));
    }

    #[test]
    fn failed_chunk_discards_rest_of_write() {
        let mut registry = resolved_registry();
        let mut queue = OperationQueue::new();
        let (dispatch, mut receiver) = enqueue(
            &mut queue,
            &mut registry,
            Operation::Write {
                characteristic: TX,
                value: vec![0; 12],
            },
        );
        let (_rssi, _rssi_rx) = enqueue(&mut queue, &mut registry, Operation::ReadRssi);
        let dispatch = dispatch.expect("valid").expect("dispatched");

        let finished = queue
            .complete(
                &mut registry,
                dispatch.id,
                Err(OperationError::Transport {
                    message: "gatt error".into(),
                }),
            )
            .expect("in-flight operation completes");

        assert_matches!(finished.outcome, Err(OperationError::Transport { .. }));
        assert_matches!(receiver.try_recv(), Ok(Err(OperationError::Transport { .. })));
        assert_eq!(1, queue.len());
        assert_eq!(0, registry.get(TX).map_or(1, |c| c.pending_chunks()));
    }

    #[test]
    fn empty_write_completes_without_queueing() {
        let mut registry = resolved_registry();
        let mut queue = OperationQueue::new();

        let (dispatch, mut receiver) = enqueue(
            &mut queue,
            &mut registry,
            Operation::Write {
                characteristic: TX,
                value: Vec::new(),
            },
        );

        assert!(dispatch.expect("valid").is_none());
        assert!(queue.is_empty());
        assert_eq!(Ok(Ok(OperationOutput::Written)), receiver.try_recv());
    }

    #[test]
    fn invalid_operations_are_rejected_before_queueing() {
        let mut registry = resolved_registry();
        let mut queue = OperationQueue::new();

        let cases = [
            (
                Operation::Read {
                    characteristic: Uuid::nil(),
                },
                SessionError::CharacteristicNotFound { uuid: Uuid::nil() },
            ),
            (
                Operation::Write {
                    characteristic: RX,
                    value: vec![1],
                },
                SessionError::NotWritable { uuid: RX },
            ),
            (
                Operation::SetNotify {
                    characteristic: TX,
                    enabled: true,
                },
                SessionError::MissingCapability {
                    uuid: TX,
                    capability: Capability::Notify,
                },
            ),
            (
                Operation::Read {
                    characteristic: MISSING,
                },
                SessionError::CharacteristicUnavailable { uuid: MISSING },
            ),
        ];

        for (operation, expected) in cases {
            let (result, _receiver) = enqueue(&mut queue, &mut registry, operation);
            assert_eq!(Some(expected), result.err());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut registry = resolved_registry();
        let mut queue = OperationQueue::new();
        let (dispatch, _receiver) = enqueue(&mut queue, &mut registry, Operation::ReadRssi);
        let dispatch = dispatch.expect("valid").expect("dispatched");

        assert!(
            queue
                .complete(&mut registry, dispatch.id + 1, Ok(OperationOutput::Rssi(-40)))
                .is_none()
        );
        assert_eq!(Some(dispatch.id), queue.in_flight());
    }

    #[test]
    fn clear_fails_every_waiting_caller() {
        let mut registry = resolved_registry();
        let mut queue = OperationQueue::new();
        let (_first, mut first_rx) = enqueue(&mut queue, &mut registry, Operation::ReadRssi);
        let (_second, mut second_rx) = enqueue(
            &mut queue,
            &mut registry,
            Operation::Read { characteristic: TX },
        );

        queue.clear(&OperationError::Disconnected);

        assert!(queue.is_empty());
        assert_eq!(None, queue.in_flight());
        assert_eq!(Ok(Err(OperationError::Disconnected)), first_rx.try_recv());
        assert_eq!(Ok(Err(OperationError::Disconnected)), second_rx.try_recv());
    }
}
