//! Tests for mutable and computed states.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use computed_flow::{
    ComputeContext, ComputeFunction, ComputedState, ComputedStateOptions, FixedDelayer,
    MutableState, Registry, UiActionTracker, UiUpdateDelayer,
};
use tokio::time::Instant;

fn doubled_state(
    registry: &Registry,
    source: &MutableState<i64>,
    options: ComputedStateOptions<i64>,
    runs: &Arc<AtomicU32>,
) -> ComputedState<i64> {
    let source = source.clone();
    let runs = runs.clone();
    ComputedState::new(registry, options, move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        let value = source.use_in(&ctx);
        async move { Ok(*value? * 2) }
    })
}

#[tokio::test(start_paused = true)]
async fn test_computed_state_follows_its_source_after_the_delay() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicU32::new(0));
    let source = MutableState::new(&registry, 10);
    let options = ComputedStateOptions::default()
        .with_delayer(FixedDelayer::new(Duration::from_millis(100)));
    let doubled = doubled_state(&registry, &source, options, &runs);

    doubled.initialize().await.unwrap();
    assert_eq!(*doubled.value().unwrap(), 20);

    let start = Instant::now();
    source.set(50);
    // The stale value stays readable until the update lands.
    assert!(!doubled.computed().is_consistent());
    assert_eq!(*doubled.value().unwrap(), 20);

    doubled.when_update_index(2).await;
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(*doubled.value().unwrap(), 100);
    assert!(doubled.computed().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn test_invalidations_within_one_delay_coalesce() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicU32::new(0));
    let source = MutableState::new(&registry, 1);
    let options = ComputedStateOptions::default()
        .with_delayer(FixedDelayer::new(Duration::from_millis(100)));
    let doubled = doubled_state(&registry, &source, options, &runs);
    doubled.initialize().await.unwrap();

    source.set(2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    source.set(3);
    tokio::time::sleep(Duration::from_millis(10)).await;
    source.set(4);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*doubled.value().unwrap(), 8);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(doubled.update_index(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_user_actions_cut_the_delay_short() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicU32::new(0));
    let source = MutableState::new(&registry, 1);
    let tracker = UiActionTracker::new(Duration::from_millis(300));
    let options = ComputedStateOptions::default().with_delayer(UiUpdateDelayer::new(
        tracker.clone(),
        Duration::from_secs(5),
    ));
    let doubled = doubled_state(&registry, &source, options, &runs);
    doubled.initialize().await.unwrap();

    // An action in flight: the update is instant.
    let start = Instant::now();
    let action = tracker.start_action();
    source.set(2);
    doubled.when_updated().await;
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(*doubled.value().unwrap(), 4);
    drop(action);

    // Past the instant update period an idle update waits, until an action starts.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let start = Instant::now();
    source.set(3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*doubled.value().unwrap(), 4);
    let _action = tracker.start_action();
    doubled.when_updated().await;
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(*doubled.value().unwrap(), 6);
}

#[tokio::test]
async fn test_mutable_state_events() {
    let registry = Registry::new();
    let state = MutableState::new(&registry, "a".to_string());
    let updates = Arc::new(AtomicU32::new(0));
    let invalidations = Arc::new(AtomicU32::new(0));

    let updated_key = state.on_updated({
        let updates = updates.clone();
        move |_| {
            updates.fetch_add(1, Ordering::SeqCst);
        }
    });
    state.on_invalidated({
        let invalidations = invalidations.clone();
        move |_| {
            invalidations.fetch_add(1, Ordering::SeqCst);
        }
    });

    state.set("b".to_string());
    state.set("c".to_string());
    assert_eq!(updates.load(Ordering::SeqCst), 2);
    assert_eq!(invalidations.load(Ordering::SeqCst), 2);
    assert_eq!(state.update_index(), 3);

    assert!(state.remove_updated_handler(updated_key));
    state.set("d".to_string());
    assert_eq!(updates.load(Ordering::SeqCst), 2);
    assert_eq!(*state.value().unwrap(), "d");
}

#[tokio::test]
async fn test_mutable_state_errors() {
    let registry = Registry::new();
    let state = MutableState::new(&registry, 1u32);
    state.set_error(anyhow::anyhow!("broken"));

    assert!(state.value().is_err());
    assert_eq!(state.last_non_error_value().as_deref(), Some(&1));
    assert_eq!(state.snapshot().error_count, 1);

    state.set(2);
    assert_eq!(state.snapshot().error_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_compute_method_reads_a_computed_state() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicU32::new(0));
    let source = MutableState::new(&registry, 1);
    let options =
        ComputedStateOptions::default().with_delayer(FixedDelayer::new(Duration::from_secs(10)));
    let doubled = doubled_state(&registry, &source, options, &runs);
    doubled.initialize().await.unwrap();

    let plus_one = ComputeFunction::new(&registry, "plus_one", {
        let doubled = doubled.clone();
        move |(): (), ctx: ComputeContext| {
            let doubled = doubled.clone();
            async move { Ok(*doubled.use_in(&ctx).await? + 1) }
        }
    });
    let ctx = ComputeContext::none();
    assert_eq!(*plus_one.call((), &ctx).await.unwrap(), 3);

    // Reading a stale state from a computation refreshes it without waiting for the delay.
    source.set(5);
    assert_eq!(*plus_one.call((), &ctx).await.unwrap(), 11);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
