#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use computed_flow::rpc::MemoryNetwork;
use computed_flow::{
    ComputeContext, ComputeFunction, MutableState, Registry, RetryDelays, RpcHub, RpcOptions,
};
use parking_lot::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Per-key counters of one server.
#[derive(Clone)]
pub struct Counters {
    registry: Registry,
    states: Arc<Mutex<HashMap<String, MutableState<u64>>>>,
    pub computes: Arc<AtomicU32>,
}

impl Counters {
    pub fn new(registry: &Registry) -> Self {
        Self {
            registry: registry.clone(),
            states: Default::default(),
            computes: Default::default(),
        }
    }

    pub fn state(&self, key: &str) -> MutableState<u64> {
        self.states
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| MutableState::new(&self.registry, 0))
            .clone()
    }

    pub fn compute_count(&self) -> u32 {
        self.computes.load(Ordering::SeqCst)
    }
}

/// A hub serving `counters.get` (compute), `counters.set`, `counters.slow_set` and
/// `counters.fail` at `address`.
pub fn counter_server(network: &MemoryNetwork, address: &str, get_delay: Duration) -> (RpcHub, Counters) {
    let registry = Registry::new();
    let counters = Counters::new(&registry);
    let hub = RpcHub::builder().registry(&registry).build();

    let get = ComputeFunction::new(&registry, "get", {
        let counters = counters.clone();
        move |key: String, ctx: ComputeContext| {
            counters.computes.fetch_add(1, Ordering::SeqCst);
            let value = counters.state(&key).use_in(&ctx);
            async move {
                if !get_delay.is_zero() {
                    tokio::time::sleep(get_delay).await;
                }
                Ok(*value?)
            }
        }
    });
    hub.add_compute_method("counters", "get", get);
    hub.add_method("counters", "set", {
        let counters = counters.clone();
        move |(key, value): (String, u64)| {
            let counters = counters.clone();
            async move {
                counters.state(&key).set(value);
                Ok(())
            }
        }
    });
    hub.add_method("counters", "slow_set", {
        let counters = counters.clone();
        move |(key, value, delay): (String, u64, Duration)| {
            let counters = counters.clone();
            async move {
                tokio::time::sleep(delay).await;
                counters.state(&key).set(value);
                Ok(value)
            }
        }
    });
    hub.add_method("counters", "fail", |message: String| async move {
        Err::<(), _>(anyhow::anyhow!(message))
    });
    network.add_host(address, &hub);
    (hub, counters)
}

pub fn client_options() -> RpcOptions {
    RpcOptions {
        call_timeout: Duration::from_secs(5),
        reconnect_delays: RetryDelays::fixed(Duration::from_millis(20)),
        reroute_delay: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn client(network: &MemoryNetwork, options: RpcOptions) -> RpcHub {
    RpcHub::builder()
        .connector(network.clone())
        .options(options)
        .build()
}

pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
