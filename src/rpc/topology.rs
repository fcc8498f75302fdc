//! Resolution of logical peer references to physical addresses.

use std::fmt;

use parking_lot::Mutex;

use crate::key::FastMap;
use crate::signal::CancelToken;

/// Maps logical peer references to addresses.
pub trait Topology: Send + Sync + 'static {
    /// The address `peer_ref` currently resolves to.
    fn resolve(&self, peer_ref: &str) -> String;

    /// A token cancelled once `peer_ref` resolves to a different address than it does now.
    fn reroute_token(&self, peer_ref: &str) -> CancelToken;
}

struct Route {
    address: String,
    reroute: CancelToken,
}

/// A topology with explicit assignments. Unassigned references resolve to themselves.
#[derive(Default)]
pub struct StaticTopology {
    routes: Mutex<FastMap<String, Route>>,
}

impl StaticTopology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `peer_ref` at `address`.
    ///
    /// Returns true if the address changed, in which case the previous reroute token is
    /// cancelled.
    pub fn assign(&self, peer_ref: impl Into<String>, address: impl Into<String>) -> bool {
        let peer_ref = peer_ref.into();
        let address = address.into();
        let previous = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&peer_ref) {
                Some(route) if route.address == address => return false,
                Some(route) => {
                    route.address = address.clone();
                    Some(std::mem::take(&mut route.reroute))
                }
                None => {
                    routes.insert(
                        peer_ref.clone(),
                        Route {
                            address: address.clone(),
                            reroute: CancelToken::new(),
                        },
                    );
                    None
                }
            }
        };
        tracing::info!(%peer_ref, %address, "peer reference assigned");
        if let Some(reroute) = previous {
            reroute.cancel();
        }
        true
    }

    /// The assigned address of `peer_ref`, if any.
    pub fn address(&self, peer_ref: &str) -> Option<String> {
        self.routes
            .lock()
            .get(peer_ref)
            .map(|route| route.address.clone())
    }
}

impl Topology for StaticTopology {
    fn resolve(&self, peer_ref: &str) -> String {
        self.address(peer_ref)
            .unwrap_or_else(|| peer_ref.to_string())
    }

    fn reroute_token(&self, peer_ref: &str) -> CancelToken {
        self.routes
            .lock()
            .entry(peer_ref.to_string())
            .or_insert_with(|| Route {
                address: peer_ref.to_string(),
                reroute: CancelToken::new(),
            })
            .reroute
            .clone()
    }
}

impl fmt::Debug for StaticTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self.routes.lock();
        f.debug_map()
            .entries(routes.iter().map(|(peer_ref, route)| (peer_ref, &route.address)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_refs_resolve_to_themselves() {
        let topology = StaticTopology::new();
        assert_eq!(topology.resolve("server"), "server");
        assert!(topology.address("server").is_none());
    }

    #[test]
    fn reassignment_fires_the_reroute_token() {
        let topology = StaticTopology::new();
        assert!(topology.assign("h0", "p0"));
        let token = topology.reroute_token("h0");
        assert!(!topology.assign("h0", "p0"));
        assert!(!token.is_cancelled());

        assert!(topology.assign("h0", "p1"));
        assert!(token.is_cancelled());
        assert_eq!(topology.resolve("h0"), "p1");
        assert!(!topology.reroute_token("h0").is_cancelled());
    }

    #[test]
    fn token_taken_before_assignment_fires_on_first_move() {
        let topology = StaticTopology::new();
        let token = topology.reroute_token("h0");
        assert_eq!(topology.resolve("h0"), "h0");
        assert!(topology.assign("h0", "p0"));
        assert!(token.is_cancelled());
    }
}
