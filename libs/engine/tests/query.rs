//! Query actor behavior through the public client API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use quarry_engine::{
    Client, ClientConfig, EngineError, FetchError, FetchStatus, Marker, OperationKind, Reply,
    RetryPolicy, Revisioned, Status,
};
use quarry_testing::{fixed_retry, init_tracing, CounterQuery, FakeBackend, LabelQuery, NumberPages};
use rstest::rstest;

const HOUR: Duration = Duration::from_secs(3_600);

fn client() -> Client<FakeBackend> {
    init_tracing();
    Client::new(FakeBackend::new(), ClientConfig::default())
}

#[tokio::test]
async fn test_concurrent_resumes_fetch_once() {
    let client = client();
    let backend = Arc::clone(client.receiver());
    backend.set("users/1", 42);
    backend.hold();

    let handle = client
        .get_query(CounterQuery::new("users/1"), Marker::none())
        .unwrap();
    let handles: Vec<_> = (0..10).map(|_| handle.clone()).collect();

    let results = join_all(handles.iter().map(|h| h.resume())).await;
    assert!(results.iter().all(Result::is_ok));

    backend.release();
    handle.join().await;

    assert_eq!(backend.calls("users/1"), 1);
    let state = handle.state();
    assert_eq!(state.status, Status::Success);
    assert_eq!(state.reply, Reply::Some(42));
}

#[tokio::test]
async fn test_same_key_shares_one_actor() {
    let client = client();
    client.receiver().set("users/1", 7);

    let a = client
        .get_query(CounterQuery::new("users/1"), Marker::new("a"))
        .unwrap();
    let b = client
        .get_query(CounterQuery::new("users/1"), Marker::new("b"))
        .unwrap();
    assert_eq!(client.store().ref_count(OperationKind::Query, "users/1"), Some(2));

    a.resume().await.unwrap();
    a.join().await;
    assert_eq!(b.state().reply, Reply::Some(7));

    drop(a);
    assert_eq!(client.store().ref_count(OperationKind::Query, "users/1"), Some(1));
}

#[rstest]
#[case::fresh(HOUR, 1)]
#[case::stale(Duration::ZERO, 2)]
#[tokio::test]
async fn test_resume_refetches_only_stale_data(#[case] stale_time: Duration, #[case] calls: u32) {
    let client = client();
    let handle = client
        .get_query(CounterQuery::new("todos").stale_time(stale_time), Marker::none())
        .unwrap();

    handle.resume().await.unwrap();
    handle.join().await;
    handle.resume().await.unwrap();
    handle.join().await;

    assert_eq!(client.receiver().calls("todos"), calls);
}

#[tokio::test]
async fn test_content_equal_refetch_keeps_revision() {
    let client = client();
    client.receiver().set("todos", 3);
    let handle = client
        .get_query(CounterQuery::new("todos").compare_content(), Marker::none())
        .unwrap();

    handle.fetch().await.unwrap();
    handle.join().await;
    let first = handle.state();

    handle.fetch().await.unwrap();
    handle.join().await;
    let second = handle.state();

    assert_eq!(client.receiver().calls("todos"), 2);
    assert_eq!(first.revision(), second.revision());
    assert!(second.fetched_at > first.fetched_at);
}

#[tokio::test]
async fn test_changed_content_moves_revision() {
    let client = client();
    let handle = client
        .get_query(CounterQuery::new("todos").compare_content(), Marker::none())
        .unwrap();

    handle.fetch().await.unwrap();
    handle.join().await;
    let before = handle.revision();

    client.receiver().set("todos", 1);
    handle.fetch().await.unwrap();
    handle.join().await;

    assert_ne!(handle.revision(), before);
    assert_eq!(handle.state().reply, Reply::Some(1));
}

#[tokio::test]
async fn test_failure_keeps_reply_then_recovers() {
    let client = client();
    let backend = Arc::clone(client.receiver());
    backend.set("todos", 5);
    let handle = client
        .get_query(CounterQuery::new("todos"), Marker::none())
        .unwrap();

    handle.resume().await.unwrap();
    handle.join().await;

    backend.fail_next("todos", FetchError::transient("503"));
    handle.fetch().await.unwrap();
    handle.join().await;

    let failed = handle.state();
    assert_eq!(failed.status, Status::Failure);
    assert_eq!(failed.error, Some(FetchError::transient("503")));
    assert_eq!(failed.reply, Reply::Some(5));

    handle.resume().await.unwrap();
    handle.join().await;

    let recovered = handle.state();
    assert_eq!(recovered.status, Status::Success);
    assert_eq!(recovered.error, None);
    assert!(recovered.error_updated_at > failed.error_updated_at);
}

#[tokio::test(start_paused = true)]
async fn test_retry_backs_off_then_fails() {
    let client = client();
    let backend = Arc::clone(client.receiver());
    for _ in 0..4 {
        backend.fail_next("flaky", FetchError::transient("timeout"));
    }

    let delays = Arc::new(Mutex::new(Vec::new()));
    let retry = RetryPolicy {
        observer: Some({
            let delays = Arc::clone(&delays);
            Arc::new(move |_: &FetchError, _: u32, delay: Duration| {
                delays.lock().unwrap().push(delay);
            })
        }),
        ..fixed_retry(3, Duration::from_millis(100), 2.0)
    };

    let handle = client
        .get_query(CounterQuery::new("flaky").retry(retry), Marker::none())
        .unwrap();

    let start = tokio::time::Instant::now();
    handle.resume().await.unwrap();
    handle.join().await;

    assert_eq!(backend.calls("flaky"), 4);
    let delays: Vec<u128> = delays.lock().unwrap().iter().map(|d| d.as_millis()).collect();
    assert_eq!(delays.len(), 3);
    for (delay, expected) in delays.iter().zip([100, 200, 400]) {
        assert!(delay.abs_diff(expected) <= 1, "delay {delay}ms, expected {expected}ms");
    }
    assert!(start.elapsed() >= Duration::from_millis(699));
    assert_eq!(handle.state().status, Status::Failure);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_is_not_retried() {
    let client = client();
    let backend = Arc::clone(client.receiver());
    backend.fail_next("missing", FetchError::permanent("404"));

    let handle = client
        .get_query(
            CounterQuery::new("missing").retry(fixed_retry(3, Duration::from_millis(100), 2.0)),
            Marker::none(),
        )
        .unwrap();
    handle.resume().await.unwrap();
    handle.join().await;

    assert_eq!(backend.calls("missing"), 1);
    assert_eq!(handle.state().error, Some(FetchError::permanent("404")));
}

#[rstest]
#[case::strict(true, 1)]
#[case::lenient(false, 2)]
#[tokio::test]
async fn test_fetch_with_outdated_revision(#[case] strict: bool, #[case] calls: u32) {
    let client = client();
    let key = CounterQuery::new("todos");
    let key = if strict { key.strict() } else { key };
    let handle = client.get_query(key, Marker::none()).unwrap();

    let outdated = handle.revision();
    handle.resume().await.unwrap();
    handle.join().await;

    handle.fetch_with_revision(outdated).await.unwrap();
    handle.join().await;

    assert_eq!(client.receiver().calls("todos"), calls);
}

#[tokio::test]
async fn test_invalidate_refetches_only_when_observed() {
    let client = client();
    let handle = client
        .get_query(CounterQuery::new("todos").stale_time(HOUR), Marker::none())
        .unwrap();
    handle.resume().await.unwrap();
    handle.join().await;

    handle.invalidate().await.unwrap();
    handle.join().await;
    assert_eq!(client.receiver().calls("todos"), 1);
    assert!(handle.state().is_invalidated);

    let _observer = handle.subscribe();
    handle.invalidate().await.unwrap();
    handle.join().await;
    assert_eq!(client.receiver().calls("todos"), 2);
    assert!(!handle.state().is_invalidated);
}

#[tokio::test]
async fn test_invalidated_query_fetches_on_next_resume() {
    let client = client();
    let handle = client
        .get_query(CounterQuery::new("todos").stale_time(HOUR), Marker::none())
        .unwrap();
    handle.resume().await.unwrap();
    handle.join().await;

    handle.invalidate().await.unwrap();
    handle.resume().await.unwrap();
    handle.join().await;

    assert_eq!(client.receiver().calls("todos"), 2);
}

#[tokio::test]
async fn test_close_cancels_fetch_without_failure() {
    let client = client();
    let backend = Arc::clone(client.receiver());
    backend.hold();

    let handle = client
        .get_query(CounterQuery::new("slow"), Marker::none())
        .unwrap();
    let mut rx = handle.subscribe();

    handle.resume().await.unwrap();
    rx.wait_for(|s| s.is_fetching()).await.unwrap();

    handle.close();
    let state = rx.wait_for(|s| !s.is_fetching()).await.unwrap().clone();

    assert!(handle.is_closed());
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.status, Status::Pending);
    assert_eq!(state.error, None);
    assert!(matches!(
        handle.resume().await,
        Err(EngineError::ActorStopped)
    ));
}

#[tokio::test]
async fn test_closed_query_restarts_on_next_acquire() {
    let client = client();
    let first = client
        .get_query(CounterQuery::new("todos"), Marker::none())
        .unwrap();
    first.close();
    drop(first);

    let second = client
        .get_query(CounterQuery::new("todos"), Marker::none())
        .unwrap();
    assert!(!second.is_closed());

    second.resume().await.unwrap();
    second.join().await;
    assert_eq!(second.state().status, Status::Success);
}

#[tokio::test]
async fn test_same_id_with_other_type_is_rejected() {
    let client = client();
    let _counter = client
        .get_query(CounterQuery::new("users/1"), Marker::none())
        .unwrap();

    let err = client
        .get_query(LabelQuery::new("users/1"), Marker::none())
        .unwrap_err();
    assert!(matches!(err, EngineError::TypeMismatch { key } if key == "users/1"));
}

#[tokio::test]
async fn test_initial_data_is_shown_then_replaced() {
    let client = client();
    client.receiver().set("todos", 9);
    let handle = client
        .get_query(CounterQuery::new("todos").initial(1).stale_time(HOUR), Marker::none())
        .unwrap();

    assert_eq!(handle.state().reply, Reply::Some(1));
    assert_eq!(handle.state().status, Status::Success);

    handle.resume().await.unwrap();
    handle.join().await;

    assert_eq!(client.receiver().calls("todos"), 1);
    assert_eq!(handle.state().reply, Reply::Some(9));
}

#[tokio::test]
async fn test_update_replaces_reply() {
    let client = client();
    let handle = client
        .get_query(CounterQuery::new("todos"), Marker::none())
        .unwrap();
    handle.resume().await.unwrap();

    let before = handle.revision();
    handle
        .update(|reply: &Reply<i64>| reply.as_ref().map(|v| v + 10))
        .await
        .unwrap();
    handle.join().await;

    assert_eq!(handle.state().reply, Reply::Some(10));
    assert_ne!(handle.revision(), before);
}

#[tokio::test]
async fn test_load_more_appends_pages_until_exhausted() {
    let client = client();
    let handle = client
        .get_infinite_query(NumberPages::new("feed", 2, 3), Marker::none())
        .unwrap();

    handle.resume().await.unwrap();
    handle.join().await;
    let pages = handle.state().reply.into_option().unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].data, vec![0, 1]);

    handle.load_more().await.unwrap();
    handle.join().await;
    handle.load_more().await.unwrap();
    handle.join().await;

    let pages = handle.state().reply.into_option().unwrap();
    let params: Vec<u32> = pages.iter().map(|p| p.param).collect();
    assert_eq!(params, vec![0, 1, 2]);
    assert_eq!(pages[2].data, vec![4, 5]);

    let revision = handle.revision();
    handle.load_more().await.unwrap();
    handle.join().await;

    assert_eq!(client.receiver().calls("feed"), 3);
    assert_eq!(handle.revision(), revision);
    assert!(!handle.state().is_fetching());
}

#[tokio::test]
async fn test_refetch_reloads_every_loaded_page() {
    let client = client();
    let handle = client
        .get_infinite_query(NumberPages::new("feed", 2, 5), Marker::none())
        .unwrap();

    handle.resume().await.unwrap();
    handle.join().await;
    handle.load_more().await.unwrap();
    handle.join().await;
    assert_eq!(client.receiver().calls("feed"), 2);

    handle.fetch().await.unwrap();
    handle.join().await;

    assert_eq!(client.receiver().calls("feed"), 4);
    assert_eq!(handle.state().reply.into_option().map(|p| p.len()), Some(2));
}

#[tokio::test]
async fn test_failure_is_relayed() {
    let client = client();
    let mut errors = client.errors();
    client
        .receiver()
        .fail_next("todos", FetchError::permanent("gone"));

    let handle = client
        .get_query(CounterQuery::new("todos"), Marker::new("list-screen"))
        .unwrap();
    handle.resume().await.unwrap();
    handle.join().await;

    let record = errors.try_recv().unwrap();
    assert_eq!(record.kind, OperationKind::Query);
    assert_eq!(record.key, "todos");
    assert_eq!(record.marker.label(), Some("list-screen"));
    assert_eq!(record.error, FetchError::permanent("gone"));
}
