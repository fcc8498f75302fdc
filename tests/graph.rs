//! Tests for dependency capture and invalidation cascades.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use computed_flow::{
    ComputeContext, ComputeFunction, ConsistencyState, LogTracer, MutableState, Registry,
};
use futures::StreamExt;

struct Chain {
    source: MutableState<i64>,
    doubled: ComputeFunction<(), i64>,
    plus_one: ComputeFunction<(), i64>,
    doubled_runs: Arc<AtomicU32>,
}

fn chain(registry: &Registry) -> Chain {
    let source = MutableState::new(registry, 10);
    let doubled_runs = Arc::new(AtomicU32::new(0));
    let doubled = ComputeFunction::new(registry, "doubled", {
        let source = source.clone();
        let runs = doubled_runs.clone();
        move |(): (), ctx: ComputeContext| {
            runs.fetch_add(1, Ordering::SeqCst);
            let value = source.use_in(&ctx);
            async move { Ok(*value? * 2) }
        }
    });
    let plus_one = ComputeFunction::new(registry, "plus_one", {
        let doubled = doubled.clone();
        move |(): (), ctx: ComputeContext| {
            let doubled = doubled.clone();
            async move { Ok(*doubled.call((), &ctx).await? + 1) }
        }
    });
    Chain {
        source,
        doubled,
        plus_one,
        doubled_runs,
    }
}

#[tokio::test]
async fn test_dependencies_are_captured() {
    let registry = Registry::new();
    let chain = chain(&registry);

    let top = chain.plus_one.invoke((), &ComputeContext::none()).await.unwrap();
    assert_eq!(*top.value().unwrap(), 21);

    let doubled = chain.doubled.existing(&()).unwrap();
    assert_eq!(top.dependencies(), vec![doubled.key().clone()]);
    assert_eq!(doubled.dependencies(), vec![chain.source.computed().key().clone()]);

    let dependants = doubled.dependants();
    assert_eq!(dependants.len(), 1);
    assert_eq!(&dependants[0].key, top.key());
    assert!(dependants[0].points_to(top.version()));
}

#[tokio::test]
async fn test_setting_a_state_cascades() {
    let registry = Registry::with_tracer(LogTracer);
    let chain = chain(&registry);
    let ctx = ComputeContext::none();

    let top = chain.plus_one.invoke((), &ctx).await.unwrap();
    let doubled = chain.doubled.existing(&()).unwrap();
    chain.source.set(50);

    assert_eq!(doubled.state(), ConsistencyState::Invalidated);
    assert_eq!(top.state(), ConsistencyState::Invalidated);
    // Invalidated computeds keep their output.
    assert_eq!(*top.value().unwrap(), 21);

    assert_eq!(*chain.plus_one.call((), &ctx).await.unwrap(), 101);
    assert_eq!(chain.doubled_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidating_the_middle_leaves_the_source_alone() {
    let registry = Registry::new();
    let chain = chain(&registry);
    let ctx = ComputeContext::none();

    let top = chain.plus_one.invoke((), &ctx).await.unwrap();
    let source = chain.source.computed();
    chain.doubled.invalidate(&());

    assert!(!top.is_consistent());
    assert!(source.is_consistent());
    assert_eq!(chain.source.update_index(), 1);
}

#[tokio::test]
async fn test_reused_dependency_keeps_one_edge_per_dependant() {
    let registry = Registry::new();
    let chain = chain(&registry);
    let ctx = ComputeContext::none();

    chain.plus_one.invoke((), &ctx).await.unwrap();
    let doubled = chain.doubled.existing(&()).unwrap();
    chain.plus_one.invalidate(&());

    // Recompute the top only: it reuses the still consistent middle.
    let new_top = chain.plus_one.invoke((), &ctx).await.unwrap();
    assert_eq!(chain.doubled_runs.load(Ordering::SeqCst), 1);
    let dependants = doubled.dependants();
    assert_eq!(dependants.len(), 1);
    assert!(dependants[0].points_to(new_top.version()));

    doubled.invalidate();
    assert_eq!(new_top.state(), ConsistencyState::Invalidated);
}

#[tokio::test]
async fn test_stale_edges_do_not_invalidate_newer_versions() {
    let registry = Registry::new();
    let use_left = MutableState::new(&registry, true);
    let left = MutableState::new(&registry, "left");
    let right = MutableState::new(&registry, "right");
    let pick = ComputeFunction::new(&registry, "pick", {
        let (use_left, left, right) = (use_left.clone(), left.clone(), right.clone());
        move |(): (), ctx: ComputeContext| {
            let value = match use_left.use_in(&ctx) {
                Ok(flag) if *flag => left.use_in(&ctx),
                Ok(_) => right.use_in(&ctx),
                Err(err) => Err(err),
            };
            async move { Ok(*value?) }
        }
    });
    let ctx = ComputeContext::none();

    let first = pick.invoke((), &ctx).await.unwrap();
    assert_eq!(*first.value().unwrap(), "left");

    use_left.set(false);
    let second = pick.invoke((), &ctx).await.unwrap();
    assert_eq!(*second.value().unwrap(), "right");

    // `left` still holds an edge to the first generation of `pick`.
    let stale = left.computed().dependants();
    assert_eq!(stale.len(), 1);
    assert!(stale[0].points_to(first.version()));

    left.set("LEFT");
    assert!(second.is_consistent());
    right.set("RIGHT");
    assert!(!second.is_consistent());
}

#[tokio::test]
async fn test_reading_through_a_plain_context_captures_nothing() {
    let registry = Registry::new();
    let chain = chain(&registry);

    chain.doubled.invoke((), &ComputeContext::none()).await.unwrap();
    let source = chain.source.computed();
    assert_eq!(source.dependants().len(), 1);

    chain.source.value().unwrap();
    chain.source.use_in(&ComputeContext::none()).unwrap();
    assert_eq!(source.dependants().len(), 1);
}

#[tokio::test]
async fn test_invalidate_all() {
    let registry = Registry::new();
    let chain = chain(&registry);
    let top = chain.plus_one.invoke((), &ComputeContext::none()).await.unwrap();

    registry.invalidate_all();
    assert!(!top.is_consistent());
    assert!(!chain.source.computed().is_consistent());

    // A state invalidated from outside reads its value again on next use.
    let top = chain.plus_one.invoke((), &ComputeContext::none()).await.unwrap();
    assert_eq!(*top.value().unwrap(), 21);
    assert!(chain.source.computed().is_consistent());
}

#[tokio::test]
async fn test_when_follows_updates_until_the_predicate_holds() {
    let registry = Registry::new();
    let chain = chain(&registry);
    let computed = chain
        .doubled
        .invoke((), &ComputeContext::none())
        .await
        .unwrap();

    let reached = tokio::spawn({
        let computed = computed.clone();
        async move {
            computed
                .when(|value| matches!(value, Ok(v) if **v >= 100))
                .await
        }
    });
    chain.source.set(20);
    tokio::task::yield_now().await;
    chain.source.set(50);

    let reached = tokio::time::timeout(Duration::from_secs(5), reached)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(*reached.value().unwrap(), 100);
    assert!(reached.is_consistent());
}

#[tokio::test]
async fn test_changes_yield_each_recomputation() {
    let registry = Registry::new();
    let chain = chain(&registry);
    let computed = chain
        .doubled
        .invoke((), &ComputeContext::none())
        .await
        .unwrap();
    let mut changes = Box::pin(computed.changes());

    let first = changes.next().await.unwrap().unwrap();
    assert_eq!(first.version(), computed.version());
    assert_eq!(*first.value().unwrap(), 20);

    chain.source.set(7);
    let second = changes.next().await.unwrap().unwrap();
    assert_eq!(*second.value().unwrap(), 14);
    assert!(second.version() > first.version());
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_after_a_delay() {
    let registry = Registry::new();
    let chain = chain(&registry);
    let computed = chain
        .plus_one
        .invoke((), &ComputeContext::none())
        .await
        .unwrap();

    computed.invalidate_after(Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(computed.is_consistent());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(computed.state(), ConsistencyState::Invalidated);
    // The dependency it used is untouched.
    assert!(chain.doubled.existing(&()).unwrap().is_consistent());
}
