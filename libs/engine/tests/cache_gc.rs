//! Cache store reference counting, GC sweeps and pattern invalidation.

use std::time::Duration;

use quarry_engine::{Client, ClientConfig, KeyPattern, Marker, OperationKind};
use quarry_testing::{init_tracing, CounterQuery, FakeBackend};
use rstest::rstest;
use tokio::sync::watch;

const HOUR: Duration = Duration::from_secs(3_600);

fn client() -> Client<FakeBackend> {
    init_tracing();
    Client::new(FakeBackend::new(), ClientConfig::default())
}

fn query(key: &str) -> CounterQuery {
    CounterQuery::new(key).gc_time(Some(Duration::from_secs(300)))
}

#[tokio::test(start_paused = true)]
async fn test_released_entry_evicted_after_gc_time() {
    let client = client();
    let handle = client.get_query(query("todos"), Marker::none()).unwrap();
    drop(handle);

    assert_eq!(client.gc(), 0);
    tokio::time::advance(Duration::from_secs(299)).await;
    assert_eq!(client.gc(), 0);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(client.gc(), 1);

    assert!(!client.store().contains(OperationKind::Query, "todos"));
    assert_eq!(client.store().stats().2, 1);
}

#[tokio::test(start_paused = true)]
async fn test_referenced_entry_is_never_evicted() {
    let client = client();
    let _handle = client.get_query(query("todos"), Marker::none()).unwrap();

    tokio::time::advance(HOUR).await;

    assert_eq!(client.gc(), 0);
    assert!(client.store().contains(OperationKind::Query, "todos"));
}

#[tokio::test(start_paused = true)]
async fn test_no_gc_time_keeps_entry_forever() {
    let client = client();
    let handle = client
        .get_query(CounterQuery::new("todos").gc_time(None), Marker::none())
        .unwrap();
    drop(handle);

    tokio::time::advance(HOUR * 24).await;

    assert_eq!(client.gc(), 0);
    assert!(client.store().contains(OperationKind::Query, "todos"));
}

#[tokio::test(start_paused = true)]
async fn test_reacquire_restarts_idle_clock() {
    let client = client();
    drop(client.get_query(query("todos"), Marker::none()).unwrap());

    tokio::time::advance(Duration::from_secs(200)).await;
    drop(client.get_query(query("todos"), Marker::none()).unwrap());

    tokio::time::advance(Duration::from_secs(200)).await;
    assert_eq!(client.gc(), 0);

    tokio::time::advance(Duration::from_secs(100)).await;
    assert_eq!(client.gc(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_entry_is_closed_and_rebuilt() {
    let client = client();
    let handle = client.get_query(query("todos"), Marker::none()).unwrap();
    handle.resume().await.unwrap();
    handle.join().await;
    let stale_copy = handle.clone();
    drop(handle);
    drop(stale_copy);

    tokio::time::advance(Duration::from_secs(300)).await;
    assert_eq!(client.gc(), 1);

    let fresh = client.get_query(query("todos"), Marker::none()).unwrap();
    assert!(!fresh.is_closed());
    assert_eq!(fresh.state().reply.into_option(), None);
}

#[rstest]
#[case(1, 1)]
#[case(3, 1)]
#[case(3, 3)]
#[case(4, 2)]
#[tokio::test]
async fn test_ref_count_follows_leases(#[case] acquired: usize, #[case] released: usize) {
    let client = client();
    let mut handles: Vec<_> = (0..acquired)
        .map(|_| client.get_query(query("todos"), Marker::none()).unwrap())
        .collect();
    handles.truncate(acquired - released);

    assert_eq!(
        client.store().ref_count(OperationKind::Query, "todos"),
        Some((acquired - released) as u32)
    );
}

#[tokio::test(start_paused = true)]
async fn test_background_gc_loop_evicts_idle_entries() {
    init_tracing();
    let config = ClientConfig {
        gc_interval: Duration::from_secs(10),
        gc_time: Some(Duration::from_secs(60)),
        ..ClientConfig::default()
    };
    let client = Client::new(FakeBackend::new(), config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gc = {
        let client = client.clone();
        tokio::spawn(async move { client.run_gc(shutdown_rx).await })
    };

    drop(client.get_query(CounterQuery::new("todos"), Marker::none()).unwrap());
    assert!(client.store().contains(OperationKind::Query, "todos"));

    tokio::time::sleep(Duration::from_secs(75)).await;
    assert!(!client.store().contains(OperationKind::Query, "todos"));

    shutdown_tx.send_replace(true);
    gc.await.unwrap();
}

#[tokio::test]
async fn test_invalidate_queries_by_pattern() {
    let client = client();
    let keys = ["users/1", "users/1/posts", "users/2", "posts/1"];
    let handles: Vec<_> = keys
        .iter()
        .map(|key| {
            client
                .get_query(CounterQuery::new(key).stale_time(HOUR), Marker::none())
                .unwrap()
        })
        .collect();
    for handle in &handles {
        handle.resume().await.unwrap();
        handle.join().await;
    }

    let pattern = KeyPattern::parse("users/*").unwrap();
    assert_eq!(client.invalidate_queries(&pattern).await, 3);
    for handle in &handles {
        handle.join().await;
    }

    let invalidated: Vec<bool> = handles.iter().map(|h| h.state().is_invalidated).collect();
    assert_eq!(invalidated, vec![true, true, true, false]);
    assert_eq!(client.store().len(), 4);
}

#[tokio::test]
async fn test_resume_observed_queries_skips_unobserved() {
    let client = client();
    let watched = client
        .get_query(CounterQuery::new("watched"), Marker::none())
        .unwrap();
    let idle = client
        .get_query(CounterQuery::new("idle"), Marker::none())
        .unwrap();
    let _observer = watched.subscribe();

    assert_eq!(client.resume_observed_queries().await, 1);
    watched.join().await;
    idle.join().await;

    assert_eq!(client.receiver().calls("watched"), 1);
    assert_eq!(client.receiver().calls("idle"), 0);
}

#[tokio::test]
async fn test_close_drops_every_entry() {
    let client = client();
    let handle = client.get_query(query("todos"), Marker::none()).unwrap();

    client.close();

    assert!(client.store().is_empty());
    assert!(handle.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_handles_from_before_close_do_not_release_new_entries() {
    let client = client();
    let old = client.get_query(query("todos"), Marker::none()).unwrap();
    client.close();

    let fresh = client.get_query(query("todos"), Marker::none()).unwrap();
    drop(old);
    assert_eq!(client.store().ref_count(OperationKind::Query, "todos"), Some(1));

    tokio::time::advance(HOUR).await;
    assert_eq!(client.gc(), 0);
    assert!(!fresh.is_closed());

    fresh.resume().await.unwrap();
    fresh.join().await;
    assert_eq!(client.receiver().calls("todos"), 1);
}
