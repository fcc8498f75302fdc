use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::calls::{InboundCalls, InboundStart, OutboundCalls, OutboundHandle};
use super::hub::{HubInner, Reply};
use super::message::{CallError, CallId, Message, Payload};
use super::transport::Channel;
use super::RpcOptions;
use crate::error::{ComputeError, TransportError};
use crate::signal::CancelToken;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// No connection.
    Disconnected,
    /// Resolving, connecting or exchanging handshakes.
    Connecting,
    /// Ready to exchange messages.
    Connected,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// This hub connects out and reconnects after failures.
    Client,
    /// The remote hub connected to this one.
    Server,
}

struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    closed: CancelToken,
    epoch: u64,
}

/// Outcome of an outbound call.
pub(crate) struct RemoteReply {
    pub(crate) call_id: CallId,
    pub(crate) result: Result<Payload, ComputeError>,
    /// Present when the result stays subject to an invalidation push.
    pub(crate) invalidated: Option<oneshot::Receiver<()>>,
}

pub(crate) struct PeerInner {
    peer_ref: String,
    role: PeerRole,
    id: Uuid,
    hub: Weak<HubInner>,
    options: RpcOptions,
    state: watch::Sender<PeerState>,
    connection: Mutex<Option<Connection>>,
    epoch: AtomicU64,
    pub(crate) outbound: OutboundCalls,
    inbound: InboundCalls,
    undelivered: Mutex<Vec<Message>>,
    remote_hub_id: Mutex<Option<Uuid>>,
    stop: CancelToken,
}

impl PeerInner {
    pub(crate) fn new(hub: &Arc<HubInner>, peer_ref: String, role: PeerRole, id: Uuid) -> Arc<Self> {
        let (state, _) = watch::channel(PeerState::Disconnected);
        Arc::new(Self {
            peer_ref,
            role,
            id,
            hub: Arc::downgrade(hub),
            options: hub.options.clone(),
            state,
            connection: Mutex::new(None),
            epoch: AtomicU64::new(0),
            outbound: OutboundCalls::default(),
            inbound: InboundCalls::default(),
            undelivered: Mutex::new(Vec::new()),
            remote_hub_id: Mutex::new(None),
            stop: hub.stop.clone(),
        })
    }

    fn set_state(&self, state: PeerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Send a reply or an invalidation push. Buffered while disconnected.
    ///
    /// Returns true if it went out over a live connection.
    fn send_reply(&self, message: Message) -> bool {
        let connection = self.connection.lock();
        let message = match connection.as_ref() {
            Some(conn) if !conn.closed.is_cancelled() => match conn.tx.send(message) {
                Ok(()) => return true,
                Err(err) => err.0,
            },
            _ => message,
        };
        self.undelivered.lock().push(message);
        false
    }

    /// Call a remote method, waiting for a connection if needed.
    pub(crate) async fn call(
        &self,
        service: Arc<str>,
        method: Arc<str>,
        args: Payload,
        compute: bool,
    ) -> RemoteReply {
        if self.stop.is_cancelled() {
            return RemoteReply {
                call_id: CallId(0),
                result: Err(TransportError::Stopped.into()),
                invalidated: None,
            };
        }
        let OutboundHandle {
            call_id,
            result,
            invalidated,
        } = {
            let connection = self.connection.lock();
            let (handle, message) = self.outbound.register(service, method, args, compute);
            if let Some(conn) = connection.as_ref() {
                // A failed send is resent on reconnect.
                let _ = conn.tx.send(message);
            }
            handle
        };

        let timeout = self.options.call_timeout;
        let result = match tokio::time::timeout(timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed.into()),
            Err(_) => {
                self.outbound.remove(call_id);
                tracing::debug!(peer = %self.peer_ref, %call_id, "call timed out");
                Err(TransportError::Timeout(timeout).into())
            }
        };
        let invalidated = match &result {
            Err(ComputeError::Transport(_)) => None,
            _ => invalidated,
        };
        RemoteReply {
            call_id,
            result,
            invalidated,
        }
    }

    fn handle(self: &Arc<Self>, message: Message) {
        match message {
            Message::Handshake { .. } => {
                tracing::warn!(peer = %self.peer_ref, "unexpected handshake");
            }
            Message::Call {
                call_id,
                service,
                method,
                args,
                compute,
            } => self.serve_call(call_id, service, method, args, compute),
            Message::Ok { call_id, result } => {
                if !self.outbound.complete(call_id, Ok(result)) {
                    tracing::trace!(peer = %self.peer_ref, %call_id, "reply to unknown call");
                }
            }
            Message::Error { call_id, error } => {
                if !self.outbound.complete(call_id, Err(error)) {
                    tracing::trace!(peer = %self.peer_ref, %call_id, "reply to unknown call");
                }
            }
            Message::Invalidate { related_call_id } => {
                self.outbound.invalidate(related_call_id);
            }
        }
    }

    fn serve_call(
        self: &Arc<Self>,
        call_id: CallId,
        service: Arc<str>,
        method: Arc<str>,
        args: Payload,
        compute: bool,
    ) {
        match self
            .inbound
            .start(call_id, Instant::now(), self.options.recovery_window)
        {
            InboundStart::Run => {}
            InboundStart::InProgress => return,
            InboundStart::Replay(reply) => {
                tracing::debug!(peer = %self.peer_ref, %call_id, "answering resent call");
                self.send_reply(reply);
                return;
            }
        }

        let handler = self
            .hub
            .upgrade()
            .and_then(|hub| hub.handler(&service, &method));
        let Some(handler) = handler else {
            self.inbound.remove(call_id);
            self.send_reply(Message::Error {
                call_id,
                error: CallError::Transport(TransportError::NoMethod {
                    service: service.to_string(),
                    method: method.to_string(),
                }),
            });
            return;
        };
        let peer = self.clone();
        tokio::spawn(async move {
            let reply = handler(args).await;
            peer.finish_call(call_id, compute, reply);
        });
    }

    fn finish_call(self: &Arc<Self>, call_id: CallId, compute: bool, reply: Reply) {
        let message = match reply.output {
            Ok(result) => Message::Ok { call_id, result },
            Err(error) => Message::Error { call_id, error },
        };
        let Some(cell) = reply.computed.filter(|_| compute) else {
            self.send_reply(message.clone());
            self.inbound.complete(call_id, message, Instant::now());
            return;
        };

        let delivered = self.send_reply(message.clone());
        let version = cell.version();
        self.inbound
            .await_invalidation(call_id, message, cell.clone(), delivered);
        let peer = Arc::downgrade(self);
        cell.on_invalidated(Box::new(move || {
            let Some(peer) = peer.upgrade() else {
                return;
            };
            if peer.inbound.invalidated(call_id, version) {
                tracing::trace!(peer = %peer.peer_ref, %call_id, "pushing invalidation");
                peer.send_reply(Message::Invalidate {
                    related_call_id: call_id,
                });
            }
        }));
    }

    /// Run a connection until it closes. Returns true if it ended because of a reroute.
    pub(crate) async fn serve(
        self: &Arc<Self>,
        channel: Channel,
        remote_hub_id: Uuid,
        reroute: Option<CancelToken>,
    ) -> bool {
        let Channel {
            tx,
            mut rx,
            closed,
        } = channel;

        let peer_changed = {
            let mut last = self.remote_hub_id.lock();
            let changed = last.is_some_and(|id| id != remote_hub_id);
            *last = Some(remote_hub_id);
            changed
        };
        if peer_changed {
            let failed = self.outbound.fail_recovering(TransportError::PeerChanged);
            self.inbound.clear();
            self.undelivered.lock().clear();
            tracing::warn!(peer = %self.peer_ref, failed, "remote peer changed");
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let invalidated = self.outbound.invalidate_ready();
        let (resent, flushed) = {
            let mut connection = self.connection.lock();
            let resend = self.outbound.take_for_resend();
            let undelivered = std::mem::take(&mut *self.undelivered.lock());
            let counts = (resend.len(), undelivered.len());
            for message in resend.into_iter().chain(undelivered) {
                let _ = tx.send(message);
            }
            self.inbound
                .on_reconnected(Instant::now(), self.options.recovery_window);
            let previous = connection.replace(Connection {
                tx,
                closed: closed.clone(),
                epoch,
            });
            if let Some(previous) = previous {
                previous.closed.cancel();
            }
            counts
        };
        self.set_state(PeerState::Connected);
        tracing::info!(
            peer = %self.peer_ref,
            epoch,
            resent,
            flushed,
            invalidated,
            "peer connected"
        );

        let rerouted = async {
            match &reroute {
                Some(reroute) => reroute.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(rerouted);
        let was_rerouted = loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break false,
                },
                _ = closed.cancelled() => break false,
                _ = self.stop.cancelled() => break false,
                _ = &mut rerouted => break true,
            }
        };
        closed.cancel();
        if was_rerouted {
            self.on_rerouted();
        }
        self.on_disconnected(epoch);
        was_rerouted
    }

    fn on_rerouted(&self) {
        let failed = self
            .outbound
            .fail_unanswered(TransportError::Rerouted(self.peer_ref.clone()));
        let invalidated = self.outbound.invalidate_ready();
        *self.remote_hub_id.lock() = None;
        tracing::info!(peer = %self.peer_ref, failed, invalidated, "peer rerouted");
    }

    fn on_disconnected(self: &Arc<Self>, epoch: u64) {
        {
            let mut connection = self.connection.lock();
            if connection.as_ref().map(|conn| conn.epoch) != Some(epoch) {
                return;
            }
            *connection = None;
        }
        self.set_state(PeerState::Disconnected);
        tracing::info!(peer = %self.peer_ref, epoch, "peer disconnected");

        if self.stop.is_cancelled() {
            return;
        }
        let window = self.options.recovery_window;
        self.outbound.on_disconnected(window, Instant::now());
        let peer = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(peer) = peer.upgrade() else {
                return;
            };
            let expired = peer.outbound.expire(Instant::now());
            let still_down =
                peer.epoch.load(Ordering::SeqCst) == epoch && peer.connection.lock().is_none();
            if !still_down {
                return;
            }
            peer.inbound.clear();
            peer.undelivered.lock().clear();
            tracing::debug!(peer = %peer.peer_ref, expired, "recovery window elapsed");
            if peer.role == PeerRole::Server {
                if let Some(hub) = peer.hub.upgrade() {
                    hub.remove_server_peer(&peer);
                }
            }
        });
    }

    /// Fail everything in flight and drop the connection.
    pub(crate) fn shut_down(&self) {
        self.outbound.fail_unanswered(TransportError::Stopped);
        self.outbound.invalidate_ready();
        if let Some(connection) = self.connection.lock().as_ref() {
            connection.closed.cancel();
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }
}

/// Connect, exchange handshakes and serve connections to the address `peer_ref` resolves to,
/// reconnecting until the hub stops.
pub(crate) fn spawn_client(peer: &Arc<PeerInner>) {
    let weak = Arc::downgrade(peer);
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            let Some(peer) = weak.upgrade() else {
                break;
            };
            let Some(hub) = peer.hub.upgrade() else {
                break;
            };
            if peer.stop.is_cancelled() {
                break;
            }
            peer.set_state(PeerState::Connecting);
            // Taken before resolving, so a reassignment in between still fires it.
            let reroute = hub.topology.reroute_token(&peer.peer_ref);
            let address = hub.topology.resolve(&peer.peer_ref);
            let timeout = peer.options.handshake_timeout;
            let connected = tokio::select! {
                result = tokio::time::timeout(timeout, connect(&hub, &peer, &address)) => {
                    result.unwrap_or(Err(TransportError::Timeout(timeout)))
                }
                _ = peer.stop.cancelled() => break,
            };
            drop(hub);

            let rerouted = match connected {
                Ok((channel, remote_hub_id)) => {
                    failures = 0;
                    peer.serve(channel, remote_hub_id, Some(reroute.clone()))
                        .await
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    peer.set_state(PeerState::Disconnected);
                    tracing::warn!(
                        peer = %peer.peer_ref,
                        %address,
                        error = %err,
                        failures,
                        "connection failed"
                    );
                    false
                }
            };
            if rerouted {
                continue;
            }
            let delay = peer.options.reconnect_delays.get(failures);
            let stop = peer.stop.clone();
            drop(peer);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = reroute.cancelled() => {}
                _ = stop.cancelled() => break,
            }
        }
        tracing::trace!("client peer loop stopped");
    });
}

async fn connect(
    hub: &HubInner,
    peer: &PeerInner,
    address: &str,
) -> Result<(Channel, Uuid), TransportError> {
    let mut channel = hub.connector.connect(address).await?;
    channel
        .tx
        .send(Message::Handshake {
            peer_id: peer.id,
            hub_id: hub.id,
        })
        .map_err(|_| TransportError::ConnectionClosed)?;
    let reply = tokio::select! {
        message = channel.rx.recv() => message,
        _ = channel.closed.cancelled() => None,
    };
    match reply {
        Some(Message::Handshake { hub_id, .. }) => Ok((channel, hub_id)),
        _ => {
            channel.close();
            Err(TransportError::ConnectionClosed)
        }
    }
}

/// A connection to another hub, identified by a logical reference.
///
/// Client peers are created by [`RpcHub::peer`](super::RpcHub::peer) and keep reconnecting
/// until the hub stops. Server peers are created when another hub connects.
#[derive(Clone)]
pub struct Peer {
    pub(crate) inner: Arc<PeerInner>,
}

impl Peer {
    /// The logical reference of this peer.
    pub fn peer_ref(&self) -> &str {
        &self.inner.peer_ref
    }

    /// Stable id of the client side of the connection.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Which side opened the connection.
    pub fn role(&self) -> PeerRole {
        self.inner.role
    }

    /// The current connection state.
    pub fn state(&self) -> PeerState {
        *self.inner.state.borrow()
    }

    /// Returns true while connected.
    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Wait until the peer is connected.
    pub async fn when_connected(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state == PeerState::Connected).await;
    }

    /// Id of the remote hub as of the last handshake.
    pub fn remote_hub_id(&self) -> Option<Uuid> {
        *self.inner.remote_hub_id.lock()
    }

    /// Number of calls made by this side that are not finished yet.
    pub fn outbound_call_count(&self) -> usize {
        self.inner.outbound.len()
    }

    /// Number of calls served by this side that are still tracked.
    pub fn inbound_call_count(&self) -> usize {
        self.inner.inbound.len()
    }

    /// Drop the current connection. A client peer reconnects.
    pub fn disconnect(&self) {
        if let Some(connection) = self.inner.connection.lock().as_ref() {
            connection.closed.cancel();
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("peer_ref", &self.inner.peer_ref)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}
