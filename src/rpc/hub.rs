use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::message::{CallError, Message, Payload};
use super::peer::{self, Peer, PeerInner, PeerRole};
use super::remote;
use super::topology::{StaticTopology, Topology};
use super::transport::{Channel, Connector, NoConnector};
use super::RpcOptions;
use crate::computed::ComputedCell;
use crate::context::ComputeContext;
use crate::error::{ComputeError, TransportError};
use crate::function::{ComputeFunction, ComputedOptions};
use crate::key::{Cachable, FastMap, OwnerId};
use crate::registry::Registry;
use crate::signal::CancelToken;

/// What a served method produced.
pub(crate) struct Reply {
    pub(crate) output: Result<Payload, CallError>,
    /// The computed behind the output of a compute method.
    pub(crate) computed: Option<Arc<ComputedCell>>,
}

pub(crate) type Handler = Arc<dyn Fn(Payload) -> BoxFuture<'static, Reply> + Send + Sync>;

type MethodRef = (Arc<str>, Arc<str>);

pub(crate) struct HubInner {
    pub(crate) id: Uuid,
    pub(crate) registry: Registry,
    pub(crate) options: RpcOptions,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) topology: Arc<dyn Topology>,
    pub(crate) stop: CancelToken,
    handlers: RwLock<FastMap<MethodRef, Handler>>,
    client_peers: Mutex<FastMap<String, Peer>>,
    server_peers: Mutex<FastMap<Uuid, Peer>>,
    owners: Mutex<FastMap<String, OwnerId>>,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl HubInner {
    pub(crate) fn handler(&self, service: &Arc<str>, method: &Arc<str>) -> Option<Handler> {
        self.handlers
            .read()
            .get(&(service.clone(), method.clone()))
            .cloned()
    }

    pub(crate) fn client_peer(self: &Arc<Self>, peer_ref: &str) -> Arc<PeerInner> {
        let mut peers = self.client_peers.lock();
        if let Some(peer) = peers.get(peer_ref) {
            return peer.inner.clone();
        }
        let inner = PeerInner::new(self, peer_ref.to_string(), PeerRole::Client, Uuid::new_v4());
        peers.insert(
            peer_ref.to_string(),
            Peer {
                inner: inner.clone(),
            },
        );
        drop(peers);
        tracing::debug!(%peer_ref, "client peer created");
        if !self.stop.is_cancelled() {
            peer::spawn_client(&inner);
        }
        inner
    }

    fn server_peer(self: &Arc<Self>, client_peer_id: Uuid) -> Arc<PeerInner> {
        self.server_peers
            .lock()
            .entry(client_peer_id)
            .or_insert_with(|| Peer {
                inner: PeerInner::new(
                    self,
                    format!("client:{client_peer_id}"),
                    PeerRole::Server,
                    client_peer_id,
                ),
            })
            .inner
            .clone()
    }

    /// Forget a server peer whose client did not come back in time.
    pub(crate) fn remove_server_peer(&self, peer: &Arc<PeerInner>) {
        let mut peers = self.server_peers.lock();
        let same = peers
            .get(&peer.id())
            .is_some_and(|existing| Arc::ptr_eq(&existing.inner, peer));
        if same {
            peers.remove(&peer.id());
        }
    }

    fn owner(&self, peer_ref: &str) -> OwnerId {
        *self
            .owners
            .lock()
            .entry(peer_ref.to_string())
            .or_insert_with(OwnerId::next)
    }
}

/// Serve an incoming connection: wait for the client's handshake, answer it and run the
/// connection on the server peer of that client.
pub(crate) fn accept(hub: &Arc<HubInner>, channel: Channel) {
    let hub = hub.clone();
    tokio::spawn(async move {
        let mut channel = channel;
        let handshake = tokio::time::timeout(hub.options.handshake_timeout, async {
            tokio::select! {
                message = channel.rx.recv() => message,
                _ = channel.closed.cancelled() => None,
            }
        })
        .await;
        let Ok(Some(Message::Handshake { peer_id, hub_id })) = handshake else {
            tracing::debug!(hub_id = %hub.id, "rejecting connection without handshake");
            channel.close();
            return;
        };
        let peer = hub.server_peer(peer_id);
        let reply = Message::Handshake {
            peer_id,
            hub_id: hub.id,
        };
        if channel.tx.send(reply).is_err() {
            return;
        }
        drop(hub);
        peer.serve(channel, hub_id, None).await;
    });
}

/// Builder for [`RpcHub`].
pub struct RpcHubBuilder {
    registry: Option<Registry>,
    options: RpcOptions,
    connector: Option<Arc<dyn Connector>>,
    topology: Option<Arc<dyn Topology>>,
}

impl RpcHubBuilder {
    /// Cache computeds in `registry`. A new registry is used by default.
    pub fn registry(mut self, registry: &Registry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// Set timeouts and retry policy.
    pub fn options(mut self, options: RpcOptions) -> Self {
        self.options = options;
        self
    }

    /// Open client connections through `connector`.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Resolve peer references through `topology`.
    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Build the hub.
    pub fn build(self) -> RpcHub {
        let inner = Arc::new(HubInner {
            id: Uuid::new_v4(),
            registry: self.registry.unwrap_or_default(),
            options: self.options,
            connector: self.connector.unwrap_or_else(|| Arc::new(NoConnector)),
            topology: self
                .topology
                .unwrap_or_else(|| Arc::new(StaticTopology::new())),
            stop: CancelToken::new(),
            handlers: RwLock::new(FastMap::default()),
            client_peers: Mutex::new(FastMap::default()),
            server_peers: Mutex::new(FastMap::default()),
            owners: Mutex::new(FastMap::default()),
        });
        tracing::debug!(hub_id = %inner.id, "rpc hub created");
        RpcHub { inner }
    }
}

/// Serves methods to other hubs and calls theirs.
///
/// Cheap to clone. Stopping the hub (or dropping its last handle) stops every peer.
///
/// ```ignore
/// let network = MemoryNetwork::new();
/// let server = RpcHub::builder().registry(&registry).build();
/// server.add_compute_method("counters", "get", get_count);
/// network.add_host("server", &server);
///
/// let client = RpcHub::builder().connector(network.clone()).build();
/// let get_count = client.remote_compute::<String, u64>("server", "counters", "get");
/// let count = get_count.call("x".into(), &ComputeContext::none()).await?;
/// ```
#[derive(Clone)]
pub struct RpcHub {
    inner: Arc<HubInner>,
}

impl RpcHub {
    /// Start building a hub.
    pub fn builder() -> RpcHubBuilder {
        RpcHubBuilder {
            registry: None,
            options: RpcOptions::default(),
            connector: None,
            topology: None,
        }
    }

    /// Random id of this hub, exchanged in handshakes.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The registry remote computeds are cached in.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Timeouts and retry policy.
    pub fn options(&self) -> &RpcOptions {
        &self.inner.options
    }

    pub(crate) fn downgrade(&self) -> Weak<HubInner> {
        Arc::downgrade(&self.inner)
    }

    /// Serve `function` as `service.method`. Callers get invalidation pushes for its results.
    pub fn add_compute_method<A: Cachable, T: Send + Sync + 'static>(
        &self,
        service: impl Into<Arc<str>>,
        method: impl Into<Arc<str>>,
        function: ComputeFunction<A, T>,
    ) {
        let handler: Handler = Arc::new(move |args: Payload| {
            let function = function.clone();
            async move {
                let Some(args) = args.downcast_ref::<A>().cloned() else {
                    return Reply {
                        output: Err(CallError::Transport(TransportError::PayloadType(
                            type_name::<A>(),
                        ))),
                        computed: None,
                    };
                };
                match function.invoke(args, &ComputeContext::none()).await {
                    Ok(computed) => Reply {
                        output: computed
                            .value()
                            .map(|value| value as Payload)
                            .map_err(|err| CallError::from_compute_error(&err)),
                        computed: Some(computed.cell().clone()),
                    },
                    Err(err) => Reply {
                        output: Err(CallError::from_compute_error(&err)),
                        computed: None,
                    },
                }
            }
            .boxed()
        });
        self.add_handler(service.into(), method.into(), handler);
    }

    /// Serve a plain async method as `service.method`.
    pub fn add_method<A, R, F, Fut>(
        &self,
        service: impl Into<Arc<str>>,
        method: impl Into<Arc<str>>,
        handler: F,
    ) where
        A: Clone + Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let handler: Handler = Arc::new(move |args: Payload| {
            let handler = handler.clone();
            async move {
                let Some(args) = args.downcast_ref::<A>().cloned() else {
                    return Reply {
                        output: Err(CallError::Transport(TransportError::PayloadType(
                            type_name::<A>(),
                        ))),
                        computed: None,
                    };
                };
                let output = match handler(args).await {
                    Ok(value) => Ok(Arc::new(value) as Payload),
                    Err(err) => Err(CallError::from_compute_error(&ComputeError::from(err))),
                };
                Reply {
                    output,
                    computed: None,
                }
            }
            .boxed()
        });
        self.add_handler(service.into(), method.into(), handler);
    }

    fn add_handler(&self, service: Arc<str>, method: Arc<str>, handler: Handler) {
        tracing::debug!(%service, %method, "method added");
        self.inner.handlers.write().insert((service, method), handler);
    }

    /// The client peer for `peer_ref`, created and connected on first use.
    pub fn peer(&self, peer_ref: &str) -> Peer {
        Peer {
            inner: self.inner.client_peer(peer_ref),
        }
    }

    /// Peers of hubs that connected to this one.
    pub fn server_peers(&self) -> Vec<Peer> {
        self.inner.server_peers.lock().values().cloned().collect()
    }

    /// Serve a connection opened by another hub.
    pub fn accept(&self, channel: Channel) {
        accept(&self.inner, channel);
    }

    /// Call a plain remote method.
    pub async fn call<A, R>(
        &self,
        peer_ref: &str,
        service: &str,
        method: &str,
        args: A,
    ) -> Result<Arc<R>, ComputeError>
    where
        A: Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        let peer = self.inner.client_peer(peer_ref);
        let reply = peer
            .call(service.into(), method.into(), Arc::new(args), false)
            .await;
        reply
            .result?
            .downcast::<R>()
            .map_err(|_| TransportError::PayloadType(type_name::<R>()).into())
    }

    /// A compute function whose body runs on `peer_ref` as `service.method`.
    ///
    /// Results are cached locally under a key that only depends on `peer_ref`, the method and
    /// the arguments, and are invalidated when the remote result is invalidated, when the
    /// connection is re-established, or when `peer_ref` is moved to another address.
    pub fn remote_compute<A: Cachable, T: Send + Sync + 'static>(
        &self,
        peer_ref: &str,
        service: &str,
        method: &str,
    ) -> ComputeFunction<A, T> {
        self.remote_compute_with(peer_ref, service, method, ComputedOptions::default())
    }

    /// Like [`RpcHub::remote_compute`], with explicit caching options.
    pub fn remote_compute_with<A: Cachable, T: Send + Sync + 'static>(
        &self,
        peer_ref: &str,
        service: &str,
        method: &str,
        options: ComputedOptions,
    ) -> ComputeFunction<A, T> {
        let service: Arc<str> = service.into();
        let method: Arc<str> = method.into();
        ComputeFunction::builder(&self.inner.registry, format!("{service}.{method}"))
            .owner(self.inner.owner(peer_ref))
            .options(options)
            .build_shared(remote::body(
                self.downgrade(),
                peer_ref.into(),
                service,
                method,
            ))
    }

    /// Stop every peer and fail calls in flight. Irreversible.
    pub fn stop(&self) {
        if self.inner.stop.is_cancelled() {
            return;
        }
        self.inner.stop.cancel();
        let peers: Vec<Peer> = {
            let clients = self.inner.client_peers.lock();
            let servers = self.inner.server_peers.lock();
            clients.values().chain(servers.values()).cloned().collect()
        };
        for peer in &peers {
            peer.inner.shut_down();
        }
        tracing::info!(hub_id = %self.inner.id, peers = peers.len(), "rpc hub stopped");
    }

    /// Returns true once [`RpcHub::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }
}

impl fmt::Debug for RpcHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcHub")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
