//! Connections between peers.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::hub::{self, HubInner, RpcHub};
use super::message::Message;
use crate::error::TransportError;
use crate::key::FastMap;
use crate::signal::CancelToken;

/// One end of an ordered, reliable-while-open, bidirectional message channel.
pub struct Channel {
    pub(crate) tx: mpsc::UnboundedSender<Message>,
    pub(crate) rx: mpsc::UnboundedReceiver<Message>,
    pub(crate) closed: CancelToken,
}

impl Channel {
    /// Create two connected ends. Closing either end closes both.
    pub fn pair() -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = CancelToken::new();
        (
            Channel {
                tx: a_tx,
                rx: b_rx,
                closed: closed.clone(),
            },
            Channel {
                tx: b_tx,
                rx: a_rx,
                closed,
            },
        )
    }

    /// Token cancelled when the channel closes.
    pub fn closed(&self) -> &CancelToken {
        &self.closed
    }

    /// Close both ends.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// Opens client connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `address`.
    async fn connect(&self, address: &str) -> Result<Channel, TransportError>;
}

/// Connector of a hub that never calls out.
pub(crate) struct NoConnector;

#[async_trait]
impl Connector for NoConnector {
    async fn connect(&self, address: &str) -> Result<Channel, TransportError> {
        Err(TransportError::Unreachable(address.to_string()))
    }
}

struct Host {
    hub: Weak<HubInner>,
    online: bool,
    connections: Vec<CancelToken>,
}

/// An in-process network: hubs listen on string addresses and connect to each other over
/// channels.
///
/// Connections can be dropped and hosts taken offline, which makes it handy for exercising
/// disconnect and reroute handling.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hosts: Arc<Mutex<FastMap<String, Host>>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `hub` at `address`, replacing whatever was there.
    pub fn add_host(&self, address: impl Into<String>, hub: &RpcHub) {
        let address = address.into();
        tracing::debug!(%address, hub_id = %hub.id(), "memory host added");
        let replaced = self.hosts.lock().insert(
            address,
            Host {
                hub: hub.downgrade(),
                online: true,
                connections: Vec::new(),
            },
        );
        if let Some(host) = replaced {
            close_all(host.connections);
        }
    }

    /// Drop every open connection to `address`. Clients may reconnect right away.
    pub fn disconnect(&self, address: &str) {
        let connections = match self.hosts.lock().get_mut(address) {
            Some(host) => std::mem::take(&mut host.connections),
            None => return,
        };
        tracing::debug!(%address, count = connections.len(), "dropping memory connections");
        close_all(connections);
    }

    /// Take `address` offline (dropping its connections and refusing new ones) or back online.
    pub fn set_online(&self, address: &str, online: bool) {
        let connections = match self.hosts.lock().get_mut(address) {
            Some(host) => {
                host.online = online;
                if online {
                    return;
                }
                std::mem::take(&mut host.connections)
            }
            None => return,
        };
        close_all(connections);
    }
}

fn close_all(connections: Vec<CancelToken>) {
    for closed in connections {
        closed.cancel();
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, address: &str) -> Result<Channel, TransportError> {
        let unreachable = || TransportError::Unreachable(address.to_string());
        let (client, server, hub) = {
            let mut hosts = self.hosts.lock();
            let host = hosts.get_mut(address).ok_or_else(unreachable)?;
            if !host.online {
                return Err(unreachable());
            }
            let hub = host.hub.upgrade().ok_or_else(unreachable)?;
            let (client, server) = Channel::pair();
            host.connections.retain(|closed| !closed.is_cancelled());
            host.connections.push(client.closed.clone());
            (client, server, hub)
        };
        hub::accept(&hub, server);
        Ok(client)
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts = self.hosts.lock();
        f.debug_struct("MemoryNetwork")
            .field("hosts", &hosts.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::CallId;

    #[tokio::test]
    async fn channel_pair_is_connected_both_ways() {
        let (mut a, mut b) = Channel::pair();
        a.tx.send(Message::Invalidate {
            related_call_id: CallId(1),
        })
        .unwrap();
        assert!(matches!(b.rx.recv().await, Some(Message::Invalidate { .. })));
        b.tx.send(Message::Invalidate {
            related_call_id: CallId(2),
        })
        .unwrap();
        assert!(a.rx.recv().await.is_some());

        a.close();
        assert!(b.closed().is_cancelled());
    }

    #[tokio::test]
    async fn unknown_or_offline_hosts_are_unreachable() {
        let network = MemoryNetwork::new();
        assert!(matches!(
            network.connect("nowhere").await,
            Err(TransportError::Unreachable(_))
        ));

        let hub = RpcHub::builder().build();
        network.add_host("server", &hub);
        network.set_online("server", false);
        assert!(network.connect("server").await.is_err());
        network.set_online("server", true);
        let channel = network.connect("server").await.unwrap();

        network.disconnect("server");
        assert!(channel.closed().is_cancelled());
    }
}
