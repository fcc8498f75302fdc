//! Client side of remote compute methods.

use std::any::type_name;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::sync::oneshot;

use super::hub::HubInner;
use super::message::{CallId, Payload};
use super::peer::PeerInner;
use crate::computed::ComputedCell;
use crate::context::ComputeContext;
use crate::error::{ComputeError, TransportError};
use crate::function::Body;
use crate::key::Cachable;
use crate::signal::CancelToken;

/// Body of a compute function that calls `service.method` on `peer_ref`.
///
/// The produced computed is invalidated when the server pushes an invalidation for the call,
/// when the reply is dropped by a reconnect, and when `peer_ref` gets rerouted.
pub(crate) fn body<A: Cachable, T: Send + Sync + 'static>(
    hub: Weak<HubInner>,
    peer_ref: Arc<str>,
    service: Arc<str>,
    method: Arc<str>,
) -> Box<Body<A, T>> {
    Box::new(move |args: A, ctx: ComputeContext| {
        call::<T>(
            hub.clone(),
            peer_ref.clone(),
            service.clone(),
            method.clone(),
            Arc::new(args),
            ctx,
        )
        .boxed()
    })
}

async fn call<T: Send + Sync + 'static>(
    hub: Weak<HubInner>,
    peer_ref: Arc<str>,
    service: Arc<str>,
    method: Arc<str>,
    args: Payload,
    ctx: ComputeContext,
) -> anyhow::Result<Arc<T>> {
    let Some(hub) = hub.upgrade() else {
        return Err(ComputeError::from(TransportError::Stopped).into());
    };
    let mut reroutes = 0;
    let (peer, reroute, reply) = loop {
        // Taken before resolving, so a move racing with the call is not missed.
        let reroute = hub.topology.reroute_token(&peer_ref);
        let peer = hub.client_peer(&peer_ref);
        let reply = peer
            .call(service.clone(), method.clone(), args.clone(), true)
            .await;
        let rerouted = matches!(
            reply.result,
            Err(ComputeError::Transport(TransportError::Rerouted(_)))
        );
        if !rerouted || reroutes >= hub.options.reroute_retry_limit {
            break (peer, reroute, reply);
        }
        reroutes += 1;
        tracing::debug!(%peer_ref, %service, %method, reroutes, "retrying rerouted call");
        tokio::time::sleep(hub.options.reroute_delay).await;
    };
    drop(hub);

    if let (Some(invalidated), Some(cell)) = (reply.invalidated, ctx.computed()) {
        watch_invalidation(&peer, reply.call_id, cell, invalidated, reroute);
    }
    let value = reply.result?;
    value
        .downcast::<T>()
        .map_err(|_| ComputeError::from(TransportError::PayloadType(type_name::<T>())).into())
}

fn watch_invalidation(
    peer: &Arc<PeerInner>,
    call_id: CallId,
    cell: &Arc<ComputedCell>,
    invalidated: oneshot::Receiver<()>,
    reroute: CancelToken,
) {
    let peer = Arc::downgrade(peer);
    cell.on_invalidated(Box::new(move || {
        if let Some(peer) = peer.upgrade() {
            peer.outbound.remove(call_id);
        }
    }));

    let cell: Weak<ComputedCell> = Arc::downgrade(cell);
    tokio::spawn(async move {
        tokio::select! {
            // A dropped sender means the result can no longer be tracked.
            _ = invalidated => {}
            _ = reroute.cancelled() => {}
        }
        if let Some(cell) = cell.upgrade() {
            tracing::trace!(key = ?cell.key(), "remote result invalidated");
            cell.invalidate();
        }
    });
}
