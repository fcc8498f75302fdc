//! Call tables of a peer.
//!
//! The outbound table tracks calls this peer made and routes replies and invalidation pushes
//! back to them. The inbound table tracks calls this peer serves, so duplicates resent after a
//! reconnect are answered instead of executed twice, and compute results stay alive until
//! their invalidation is pushed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::message::{CallError, CallId, Message, Payload};
use crate::computed::ComputedCell;
use crate::error::{ComputeError, TransportError};
use crate::key::FastMap;
use crate::version::Version;

pub(crate) type CallResult = Result<Payload, ComputeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundStage {
    /// Sent, or waiting to be sent once connected.
    Pending,
    /// Sent over a connection that dropped. Fails at `deadline` unless reconnected.
    AwaitingRecovery { deadline: Instant },
    /// Compute call answered, waiting for its invalidation push.
    ResultReady,
}

struct OutboundCall {
    message: Message,
    stage: OutboundStage,
    result: Option<oneshot::Sender<CallResult>>,
    invalidated: Option<oneshot::Sender<()>>,
}

impl OutboundCall {
    fn fail(mut self, error: TransportError) {
        if let Some(result) = self.result.take() {
            let _ = result.send(Err(error.into()));
        }
    }
}

/// Receiving side of a registered outbound call.
pub(crate) struct OutboundHandle {
    pub(crate) call_id: CallId,
    pub(crate) result: oneshot::Receiver<CallResult>,
    /// Completes (or closes) when the result of a compute call is invalidated.
    pub(crate) invalidated: Option<oneshot::Receiver<()>>,
}

#[derive(Default)]
pub(crate) struct OutboundCalls {
    next_id: AtomicU64,
    calls: Mutex<FastMap<CallId, OutboundCall>>,
}

impl OutboundCalls {
    /// Add a call in the `Pending` stage and return it with the message to send.
    pub(crate) fn register(
        &self,
        service: Arc<str>,
        method: Arc<str>,
        args: Payload,
        compute: bool,
    ) -> (OutboundHandle, Message) {
        let call_id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let message = Message::Call {
            call_id,
            service,
            method,
            args,
            compute,
        };
        let (result_tx, result_rx) = oneshot::channel();
        let (invalidated_tx, invalidated_rx) = if compute {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.calls.lock().insert(
            call_id,
            OutboundCall {
                message: message.clone(),
                stage: OutboundStage::Pending,
                result: Some(result_tx),
                invalidated: invalidated_tx,
            },
        );
        let handle = OutboundHandle {
            call_id,
            result: result_rx,
            invalidated: invalidated_rx,
        };
        (handle, message)
    }

    /// Deliver a reply. Returns false if the call is unknown or already answered.
    pub(crate) fn complete(&self, call_id: CallId, result: Result<Payload, CallError>) -> bool {
        let mut calls = self.calls.lock();
        let Some(call) = calls.get_mut(&call_id) else {
            return false;
        };
        if call.stage == OutboundStage::ResultReady {
            return false;
        }
        let keep = call.invalidated.is_some() && !matches!(result, Err(CallError::Transport(_)));
        let result = result.map_err(CallError::into_compute_error);
        if keep {
            call.stage = OutboundStage::ResultReady;
            if let Some(sender) = call.result.take() {
                let _ = sender.send(result);
            }
        } else if let Some(mut call) = calls.remove(&call_id) {
            if let Some(sender) = call.result.take() {
                let _ = sender.send(result);
            }
        }
        true
    }

    /// Handle an invalidation push. Returns false if the call is unknown.
    pub(crate) fn invalidate(&self, call_id: CallId) -> bool {
        let Some(mut call) = self.calls.lock().remove(&call_id) else {
            return false;
        };
        if let Some(invalidated) = call.invalidated.take() {
            let _ = invalidated.send(());
        }
        true
    }

    /// Forget a call. Its receivers observe a closed channel.
    pub(crate) fn remove(&self, call_id: CallId) -> bool {
        self.calls.lock().remove(&call_id).is_some()
    }

    /// The connection dropped: unanswered calls wait for recovery until `now + window`.
    ///
    /// With a zero window they fail right away.
    pub(crate) fn on_disconnected(&self, window: Duration, now: Instant) {
        let mut calls = self.calls.lock();
        if window.is_zero() {
            let failed: Vec<CallId> = calls
                .iter()
                .filter(|(_, call)| call.stage == OutboundStage::Pending)
                .map(|(id, _)| *id)
                .collect();
            for call_id in failed {
                if let Some(call) = calls.remove(&call_id) {
                    call.fail(TransportError::ConnectionClosed);
                }
            }
            return;
        }
        let deadline = now + window;
        for call in calls.values_mut() {
            if call.stage == OutboundStage::Pending {
                call.stage = OutboundStage::AwaitingRecovery { deadline };
            }
        }
    }

    /// Fail calls whose recovery deadline passed. Returns how many failed.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        self.fail_where(TransportError::ConnectionClosed, |stage| {
            matches!(stage, OutboundStage::AwaitingRecovery { deadline } if deadline <= now)
        })
    }

    /// Fail calls awaiting recovery. Used when the remote side turned out to be a new process.
    pub(crate) fn fail_recovering(&self, error: TransportError) -> usize {
        self.fail_where(error, |stage| {
            matches!(stage, OutboundStage::AwaitingRecovery { .. })
        })
    }

    /// Fail every unanswered call.
    pub(crate) fn fail_unanswered(&self, error: TransportError) -> usize {
        self.fail_where(error, |stage| stage != OutboundStage::ResultReady)
    }

    fn fail_where(&self, error: TransportError, filter: impl Fn(OutboundStage) -> bool) -> usize {
        let failed: Vec<OutboundCall> = {
            let mut calls = self.calls.lock();
            let ids: Vec<CallId> = calls
                .iter()
                .filter(|(_, call)| filter(call.stage))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| calls.remove(&id)).collect()
        };
        let count = failed.len();
        for call in failed {
            call.fail(error.clone());
        }
        count
    }

    /// Invalidate every answered compute call. Returns how many were invalidated.
    pub(crate) fn invalidate_ready(&self) -> usize {
        let ready: Vec<OutboundCall> = {
            let mut calls = self.calls.lock();
            let ids: Vec<CallId> = calls
                .iter()
                .filter(|(_, call)| call.stage == OutboundStage::ResultReady)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| calls.remove(&id)).collect()
        };
        let count = ready.len();
        for mut call in ready {
            if let Some(invalidated) = call.invalidated.take() {
                let _ = invalidated.send(());
            }
        }
        count
    }

    /// Move unanswered calls back to `Pending` and return their messages in call order.
    pub(crate) fn take_for_resend(&self) -> Vec<Message> {
        let mut calls = self.calls.lock();
        let mut resend: Vec<(CallId, Message)> = calls
            .iter_mut()
            .filter(|(_, call)| call.stage != OutboundStage::ResultReady)
            .map(|(id, call)| {
                call.stage = OutboundStage::Pending;
                (*id, call.message.clone())
            })
            .collect();
        resend.sort_by_key(|(id, _)| *id);
        resend.into_iter().map(|(_, message)| message).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

enum InboundStage {
    Running,
    /// A plain call that was answered; kept so a resent duplicate gets the same answer.
    Completed { reply: Message, completed_at: Instant },
    /// A compute call that was answered; the computed stays alive until it is invalidated.
    AwaitingInvalidation {
        reply: Message,
        keeper: Arc<ComputedCell>,
        delivered: bool,
    },
}

/// What to do with an incoming call.
pub(crate) enum InboundStart {
    /// Execute it.
    Run,
    /// Already running; its reply will follow.
    InProgress,
    /// Already answered; send this reply again.
    Replay(Message),
}

#[derive(Default)]
pub(crate) struct InboundCalls {
    calls: Mutex<FastMap<CallId, InboundStage>>,
}

impl InboundCalls {
    /// Register an incoming call. Answered plain calls older than `retention` are forgotten.
    pub(crate) fn start(&self, call_id: CallId, now: Instant, retention: Duration) -> InboundStart {
        let mut calls = self.calls.lock();
        Self::prune(&mut calls, now, retention);
        match calls.get(&call_id) {
            None => {
                calls.insert(call_id, InboundStage::Running);
                InboundStart::Run
            }
            Some(InboundStage::Running) => InboundStart::InProgress,
            Some(InboundStage::Completed { reply, .. })
            | Some(InboundStage::AwaitingInvalidation { reply, .. }) => {
                InboundStart::Replay(reply.clone())
            }
        }
    }

    fn prune(calls: &mut FastMap<CallId, InboundStage>, now: Instant, retention: Duration) {
        calls.retain(|_, stage| match stage {
            InboundStage::Completed { completed_at, .. } => {
                now.saturating_duration_since(*completed_at) < retention
            }
            _ => true,
        });
    }

    /// Record the reply of a plain call.
    pub(crate) fn complete(&self, call_id: CallId, reply: Message, now: Instant) {
        self.calls.lock().insert(
            call_id,
            InboundStage::Completed {
                reply,
                completed_at: now,
            },
        );
    }

    /// Record the reply of a compute call and keep `keeper` alive until it is invalidated.
    pub(crate) fn await_invalidation(
        &self,
        call_id: CallId,
        reply: Message,
        keeper: Arc<ComputedCell>,
        delivered: bool,
    ) {
        self.calls.lock().insert(
            call_id,
            InboundStage::AwaitingInvalidation {
                reply,
                keeper,
                delivered,
            },
        );
    }

    /// The computed behind a compute call was invalidated. Returns false if the entry is gone
    /// or now holds another version.
    pub(crate) fn invalidated(&self, call_id: CallId, version: Version) -> bool {
        let mut calls = self.calls.lock();
        match calls.get(&call_id) {
            Some(InboundStage::AwaitingInvalidation { keeper, .. })
                if keeper.version() == version =>
            {
                calls.remove(&call_id);
                true
            }
            _ => false,
        }
    }

    /// Forget a call that failed without an answer to remember.
    pub(crate) fn remove(&self, call_id: CallId) {
        self.calls.lock().remove(&call_id);
    }

    /// The connection came back and buffered replies were flushed.
    ///
    /// Compute results delivered over the previous connection are dropped: the caller
    /// invalidates them on reconnect.
    pub(crate) fn on_reconnected(&self, now: Instant, retention: Duration) {
        let mut calls = self.calls.lock();
        Self::prune(&mut calls, now, retention);
        calls.retain(|_, stage| {
            !matches!(
                stage,
                InboundStage::AwaitingInvalidation {
                    delivered: true,
                    ..
                }
            )
        });
        for stage in calls.values_mut() {
            if let InboundStage::AwaitingInvalidation { delivered, .. } = stage {
                *delivered = true;
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}
