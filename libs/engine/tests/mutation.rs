//! Mutation actor behavior: ordering, one-shot, strict mode, effects.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use quarry_engine::{
    Client, ClientConfig, EngineError, FetchError, Marker, MutationStatus, OperationKind, Reply,
};
use quarry_testing::{init_tracing, CounterQuery, FakeBackend, SetCounter};

fn client() -> Client<FakeBackend> {
    init_tracing();
    Client::new(FakeBackend::new(), ClientConfig::default())
}

#[tokio::test]
async fn test_mutate_returns_data_and_records_success() {
    let client = client();
    let handle = client
        .get_mutation(SetCounter::new("set-counter", "counter"), Marker::none())
        .unwrap();

    let result = handle.mutate(5).await.unwrap();

    assert_eq!(result, Some(5));
    assert_eq!(client.receiver().value("counter"), 5);
    let state = handle.state();
    assert_eq!(state.status, MutationStatus::Success);
    assert_eq!(state.reply, Reply::Some(5));
    assert_eq!(state.mutated_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_mutations_run_one_at_a_time_in_order() {
    let client = client();
    let backend = Arc::clone(client.receiver());
    backend.set_latency(Duration::from_millis(10));

    let handle = client
        .get_mutation(SetCounter::new("set-counter", "counter"), Marker::none())
        .unwrap();
    let results = join_all((0..5).map(|v| handle.mutate(v))).await;

    let values: Vec<Option<i64>> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    assert_eq!(backend.max_in_flight(), 1);
    assert_eq!(backend.value("counter"), 4);
    assert_eq!(handle.state().mutated_count, 5);
}

#[tokio::test]
async fn test_one_shot_drops_repeat_calls_until_reset() {
    let client = client();
    let handle = client
        .get_mutation(SetCounter::new("accept-invite", "invite").one_shot(), Marker::none())
        .unwrap();

    assert_eq!(handle.mutate(1).await.unwrap(), Some(1));
    assert_eq!(handle.mutate(2).await.unwrap(), None);
    assert_eq!(client.receiver().calls("invite"), 1);

    handle.reset().await.unwrap();
    handle.join().await;
    assert_eq!(handle.state().status, MutationStatus::Idle);
    assert!(!handle.state().is_mutated());

    assert_eq!(handle.mutate(3).await.unwrap(), Some(3));
    assert_eq!(client.receiver().value("invite"), 3);
}

#[tokio::test]
async fn test_strict_mode_drops_outdated_revision() {
    let client = client();
    let handle = client
        .get_mutation(SetCounter::new("set-counter", "counter").strict(), Marker::none())
        .unwrap();

    let observed = handle.revision();
    assert_eq!(handle.mutate(1).await.unwrap(), Some(1));

    let dropped = handle.mutate_with_revision(2, observed).await.unwrap();
    assert_eq!(dropped, None);
    assert_eq!(client.receiver().value("counter"), 1);
}

#[tokio::test]
async fn test_failure_is_returned_recorded_and_relayed() {
    let client = client();
    let mut errors = client.errors();
    client
        .receiver()
        .fail_next("counter", FetchError::transient("conflict"));

    let handle = client
        .get_mutation(SetCounter::new("set-counter", "counter"), Marker::none())
        .unwrap();
    let err = handle.mutate(1).await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::Operation(FetchError::Transient(ref msg)) if msg == "conflict"
    ));
    let state = handle.state();
    assert_eq!(state.status, MutationStatus::Failure);
    assert_eq!(state.reply, Reply::None);

    let record = errors.try_recv().unwrap();
    assert_eq!(record.kind, OperationKind::Mutation);
    assert_eq!(record.key, "set-counter");
}

#[tokio::test]
async fn test_cache_update_hook_patches_query() {
    let client = client();
    let query = client
        .get_query(
            CounterQuery::new("counter").stale_time(Duration::from_secs(3_600)),
            Marker::none(),
        )
        .unwrap();
    query.resume().await.unwrap();
    query.join().await;
    assert_eq!(query.state().reply, Reply::Some(0));

    let mutation = client
        .get_mutation(
            SetCounter::new("set-counter", "counter")
                .patch_target()
                .sync_effects(),
            Marker::none(),
        )
        .unwrap();
    mutation.mutate(9).await.unwrap();
    query.join().await;

    assert_eq!(query.state().reply, Reply::Some(9));
    // One read and one write; the patch did not refetch
    assert_eq!(client.receiver().calls("counter"), 2);
}

#[tokio::test]
async fn test_invalidate_hook_refetches_observed_query() {
    let client = client();
    let query = client
        .get_query(
            CounterQuery::new("counter").stale_time(Duration::from_secs(3_600)),
            Marker::none(),
        )
        .unwrap();
    let _observer = query.subscribe();
    query.resume().await.unwrap();
    query.join().await;

    let mutation = client
        .get_mutation(
            SetCounter::new("set-counter", "counter")
                .invalidates("counter")
                .sync_effects(),
            Marker::none(),
        )
        .unwrap();
    mutation.mutate(3).await.unwrap();
    query.join().await;

    assert_eq!(query.state().reply, Reply::Some(3));
    assert_eq!(client.receiver().calls("counter"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_detached_effects_run_after_success() {
    let client = client();
    let key = SetCounter::new("set-counter", "counter").effect_delay(Duration::from_millis(50));
    let effects = Arc::clone(&key.effects);
    let handle = client.get_mutation(key, Marker::none()).unwrap();

    handle.mutate(1).await.unwrap();
    assert_eq!(handle.state().status, MutationStatus::Success);
    assert_eq!(effects.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(effects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_synchronous_effects_finish_before_success() {
    let client = client();
    let key = SetCounter::new("set-counter", "counter")
        .effect_delay(Duration::from_millis(50))
        .sync_effects();
    let effects = Arc::clone(&key.effects);
    let handle = client.get_mutation(key, Marker::none()).unwrap();

    handle.mutate(1).await.unwrap();
    assert_eq!(effects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_cancels_mutation_and_restores_state() {
    let client = client();
    let backend = Arc::clone(client.receiver());
    backend.hold();

    let handle = client
        .get_mutation(SetCounter::new("set-counter", "counter"), Marker::none())
        .unwrap();
    let mut rx = handle.subscribe();

    let task = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.mutate(1).await })
    };
    rx.wait_for(|s| s.status == MutationStatus::Pending)
        .await
        .unwrap();

    handle.close();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    rx.wait_for(|s| s.status == MutationStatus::Idle)
        .await
        .unwrap();
    assert_eq!(handle.state().error, None);
}
