//! Tests for memoized compute methods.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use computed_flow::{
    ComputeContext, ComputeError, ComputeFunction, ComputeResultExt, ComputedOptions,
    ConsistencyState, OwnerId, Registry, TransportError,
};
use futures::future::join_all;

fn counting_function(registry: &Registry, calls: &Arc<AtomicU32>) -> ComputeFunction<String, String> {
    let calls = calls.clone();
    ComputeFunction::new(registry, "get_value", move |name: String, _ctx: ComputeContext| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("value of {name}"))
        }
    })
}

#[tokio::test]
async fn test_repeated_call_is_served_from_cache() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let get_value = counting_function(&registry, &calls);
    let ctx = ComputeContext::none();

    let first = get_value.invoke("hello".to_string(), &ctx).await.unwrap();
    let second = get_value.invoke("hello".to_string(), &ctx).await.unwrap();

    assert_eq!(*second.value().unwrap(), "value of hello");
    assert_eq!(first.version(), second.version());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    get_value.call("world".to_string(), &ctx).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidate_forces_recompute() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let get_value = counting_function(&registry, &calls);
    let ctx = ComputeContext::none();

    let first = get_value.invoke("a".to_string(), &ctx).await.unwrap();
    assert!(get_value.invalidate(&"a".to_string()));
    assert_eq!(first.state(), ConsistencyState::Invalidated);
    assert!(!get_value.invalidate(&"b".to_string()));

    let second = get_value.invoke("a".to_string(), &ctx).await.unwrap();
    assert!(second.version() > first.version());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalidation_scope_never_computes() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let get_value = counting_function(&registry, &calls);

    let cached = get_value
        .invoke("a".to_string(), &ComputeContext::none())
        .await
        .unwrap();
    let invalidating = ComputeContext::begin_invalidation();
    let returned = get_value.invoke("a".to_string(), &invalidating).await.unwrap();
    assert_eq!(returned.version(), cached.version());
    assert!(!cached.is_consistent());

    // Nothing cached: a detached invalidated computed without output.
    let missing = get_value.invoke("b".to_string(), &invalidating).await.unwrap();
    assert_eq!(missing.state(), ConsistencyState::Invalidated);
    assert!(missing.output().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_share_one_computation() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let slow = ComputeFunction::new(&registry, "slow", {
        let calls = calls.clone();
        move |n: u32, _ctx: ComputeContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(n * 2)
            }
        }
    });

    let ctx = ComputeContext::none();
    let computeds: Vec<_> = join_all([4, 4, 5, 4].map(|n| slow.invoke(n, &ctx)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(computeds[0].version(), computeds[1].version());
    assert_eq!(computeds[0].version(), computeds[3].version());
    assert_eq!(*computeds[0].value().unwrap(), 8);
    assert_eq!(*computeds[2].value().unwrap(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[derive(Debug, thiserror::Error)]
#[error("user {0} not found")]
struct NotFound(u32);

#[tokio::test]
async fn test_user_errors_are_cached() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let find_user = ComputeFunction::new(&registry, "find_user", {
        let calls = calls.clone();
        move |id: u32, _ctx: ComputeContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if id == 0 {
                    return Err(NotFound(id).into());
                }
                Ok(format!("user {id}"))
            }
        }
    });
    let ctx = ComputeContext::none();

    let first = find_user.invoke(0, &ctx).await.unwrap();
    let second = find_user.invoke(0, &ctx).await.unwrap();
    assert!(first.is_consistent());
    assert_eq!(first.version(), second.version());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    match find_user.call(0, &ctx).await.downcast_err::<NotFound>().unwrap() {
        Ok(_) => panic!("expected NotFound"),
        Err(not_found) => assert_eq!(not_found.0, 0),
    }
    assert!(matches!(
        find_user.call(0, &ctx).await,
        Err(ComputeError::User(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_expire_on_their_own() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = ComputedOptions {
        transient_error_invalidation_delay: Duration::from_secs(1),
        ..Default::default()
    };
    let flaky = ComputeFunction::builder(&registry, "flaky")
        .options(options)
        .build({
            let calls = calls.clone();
            move |(): (), _ctx: ComputeContext| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(ComputeError::from(TransportError::ConnectionClosed).into())
                }
            }
        });

    let computed = flaky.invoke((), &ComputeContext::none()).await.unwrap();
    assert!(matches!(
        computed.value(),
        Err(ComputeError::Transport(TransportError::ConnectionClosed))
    ));
    assert!(computed.is_consistent());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(!computed.is_consistent());
}

#[tokio::test]
async fn test_self_call_is_a_cycle() {
    let registry = Registry::new();
    let slot: Arc<OnceLock<ComputeFunction<u32, u32>>> = Arc::new(OnceLock::new());
    let recursive = ComputeFunction::new(&registry, "recursive", {
        let slot = slot.clone();
        move |n: u32, ctx: ComputeContext| {
            let slot = slot.clone();
            async move {
                let Some(this) = slot.get() else {
                    return Ok(0);
                };
                Ok(*this.call(n, &ctx).await? + 1)
            }
        }
    });
    slot.set(recursive.clone()).unwrap();

    let result = recursive.call(1, &ComputeContext::none()).await;
    match result {
        Err(ComputeError::Cycle { path }) => assert_eq!(path.first(), path.last()),
        other => panic!("expected a cycle, got {other:?}"),
    }
    // Nothing is left behind for the failed computation.
    assert!(recursive.existing(&1).is_none());
}

#[tokio::test]
async fn test_owner_separates_cache_entries() {
    let registry = Registry::new();
    let owner = OwnerId::next();
    let build = |value: u32| {
        ComputeFunction::builder(&registry, "value")
            .owner(owner)
            .build(move |(): (), _ctx: ComputeContext| async move { Ok(value) })
    };
    let first = build(1);
    let same_owner = build(2);
    let other_owner = ComputeFunction::new(&registry, "value", |(): (), _ctx: ComputeContext| async {
        Ok(3u32)
    });

    let ctx = ComputeContext::none();
    assert_eq!(*first.call((), &ctx).await.unwrap(), 1);
    // Same owner, method and arguments: the cached computed is shared.
    assert_eq!(*same_owner.call((), &ctx).await.unwrap(), 1);
    assert_eq!(*other_owner.call((), &ctx).await.unwrap(), 3);
    assert_eq!(first.key(&()), same_owner.key(&()));
}

#[tokio::test]
async fn test_update_recomputes_through_the_function() {
    let registry = Registry::new();
    let calls = Arc::new(AtomicU32::new(0));
    let get_value = counting_function(&registry, &calls);

    let computed = get_value
        .invoke("x".to_string(), &ComputeContext::none())
        .await
        .unwrap();
    assert_eq!(computed.update().await.unwrap().version(), computed.version());

    computed.invalidate();
    let updated = computed.update().await.unwrap();
    assert!(updated.is_consistent());
    assert!(updated.version() > computed.version());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

fn slow_counting(registry: &Registry, runs: &Arc<AtomicU32>) -> ComputeFunction<u32, u32> {
    let runs = runs.clone();
    ComputeFunction::new(registry, "slow_counting", move |_n: u32, _ctx: ComputeContext| {
        let runs = runs.clone();
        async move {
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(run)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_dropped_computation_is_evicted_and_retried() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicU32::new(0));
    let slow = slow_counting(&registry, &runs);
    let ctx = ComputeContext::none();

    let abandoned = tokio::time::timeout(Duration::from_millis(50), slow.invoke(1, &ctx)).await;
    assert!(abandoned.is_err());
    assert!(slow.existing(&1).is_none());

    assert_eq!(*slow.call(1, &ctx).await.unwrap(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_recomputes_after_the_computing_call_is_aborted() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicU32::new(0));
    let slow = slow_counting(&registry, &runs);

    let first = tokio::spawn({
        let slow = slow.clone();
        async move { slow.call(1, &ComputeContext::none()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = tokio::spawn({
        let slow = slow.clone();
        async move { slow.call(1, &ComputeContext::none()).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    assert_eq!(*second.await.unwrap().unwrap(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
