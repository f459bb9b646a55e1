//! Reconnect bridge wired to a client.

use std::sync::Arc;
use std::time::Duration;

use quarry_engine::{Client, ClientConfig, ManualConnectivity, Marker, NetworkStatus};
use quarry_testing::{init_tracing, CounterQuery, FakeBackend};
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_observed_queries_once() {
    init_tracing();
    let client = Client::new(FakeBackend::new(), ClientConfig::default());
    let network = Arc::new(ManualConnectivity::new(NetworkStatus::Available));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watched = client
        .get_query(CounterQuery::new("watched"), Marker::none())
        .unwrap();
    let unwatched = client
        .get_query(CounterQuery::new("unwatched"), Marker::none())
        .unwrap();
    let _observer = watched.subscribe();
    watched.resume().await.unwrap();
    watched.join().await;

    let bridge = {
        let client = client.clone();
        let network = Arc::clone(&network);
        tokio::spawn(async move {
            client
                .run_network_resume(network.as_ref(), shutdown_rx)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    network.set(NetworkStatus::Lost);
    tokio::time::sleep(Duration::from_millis(10)).await;
    network.set(NetworkStatus::Available);
    tokio::time::sleep(Duration::from_millis(10)).await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(client.receiver().calls("watched"), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    watched.join().await;
    assert_eq!(client.receiver().calls("watched"), 2);
    assert_eq!(client.receiver().calls("unwatched"), 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(client.receiver().calls("watched"), 2);

    shutdown_tx.send_replace(true);
    bridge.await.unwrap();
    drop(unwatched);
}

#[tokio::test(start_paused = true)]
async fn test_flapping_network_resumes_after_final_settle() {
    init_tracing();
    let client = Client::new(FakeBackend::new(), ClientConfig::default());
    let network = Arc::new(ManualConnectivity::new(NetworkStatus::Lost));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let watched = client
        .get_query(CounterQuery::new("watched"), Marker::none())
        .unwrap();
    let _observer = watched.subscribe();

    {
        let client = client.clone();
        let network = Arc::clone(&network);
        tokio::spawn(async move {
            client
                .run_network_resume(network.as_ref(), shutdown_rx)
                .await
        });
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    for _ in 0..3 {
        network.set(NetworkStatus::Available);
        tokio::time::sleep(Duration::from_millis(500)).await;
        network.set(NetworkStatus::Lost);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.receiver().calls("watched"), 0);

    network.set(NetworkStatus::Available);
    tokio::time::sleep(Duration::from_secs(3)).await;
    watched.join().await;
    assert_eq!(client.receiver().calls("watched"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_flap_still_resumes() {
    init_tracing();
    let client = Client::new(FakeBackend::new(), ClientConfig::default());
    let network = Arc::new(ManualConnectivity::new(NetworkStatus::Available));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let watched = client
        .get_query(CounterQuery::new("watched"), Marker::none())
        .unwrap();
    let _observer = watched.subscribe();
    watched.resume().await.unwrap();
    watched.join().await;

    {
        let client = client.clone();
        let network = Arc::clone(&network);
        tokio::spawn(async move {
            client
                .run_network_resume(network.as_ref(), shutdown_rx)
                .await
        });
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    network.set(NetworkStatus::Lost);
    network.set(NetworkStatus::Available);

    tokio::time::sleep(Duration::from_secs(5)).await;
    watched.join().await;
    assert_eq!(client.receiver().calls("watched"), 2);
}
