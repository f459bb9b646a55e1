//! Network connectivity bridge.
//!
//! Turns connectivity changes into "resume observed queries" calls: after a
//! `Lost -> Available` edge the bridge waits a settle delay, gives up if the
//! network drops again in the meantime, then fires exactly once.
//!
//! Status changes travel over a `watch` channel, which only keeps the latest
//! value. Each published state therefore carries a count of drops so far, and
//! a reconnect is recognized even when the intermediate `Lost` was never seen.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

/// Reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStatus {
    Available,
    Lost,
}

/// Current reachability plus the number of times it went `Lost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkState {
    pub status: NetworkStatus,
    pub drops: u64,
}

impl NetworkState {
    pub fn new(status: NetworkStatus) -> Self {
        Self { status, drops: 0 }
    }
}

/// Source of connectivity changes.
pub trait NetworkConnectivity: Send + Sync {
    /// Receiver holding the current state and every later change.
    fn state(&self) -> watch::Receiver<NetworkState>;
}

/// Connectivity driven by the embedder, e.g. from OS reachability callbacks.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<NetworkState>,
}

impl ManualConnectivity {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(NetworkState::new(initial));
        Self { tx }
    }

    /// Publish `status`. Repeating the current status is a no-op.
    pub fn set(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|state| {
            if state.status == status {
                return false;
            }
            debug!(from = ?state.status, to = ?status, "Network status changed");
            if status == NetworkStatus::Lost {
                state.drops += 1;
            }
            state.status = status;
            true
        });
    }

    pub fn current(&self) -> NetworkStatus {
        self.tx.borrow().status
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(NetworkStatus::Available)
    }
}

impl NetworkConnectivity for ManualConnectivity {
    fn state(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

/// Recognizes `Lost -> Available` edges in a sequence of states.
#[derive(Debug, Clone)]
pub struct ReconnectDetector {
    last: NetworkState,
}

impl ReconnectDetector {
    pub fn new(initial: NetworkState) -> Self {
        Self { last: initial }
    }

    /// Record `state`; returns true if it completes a reconnect edge. An
    /// `Available` state with more drops than the last one seen counts too.
    pub fn observe(&mut self, state: NetworkState) -> bool {
        let reconnected = state.status == NetworkStatus::Available
            && (self.last.status == NetworkStatus::Lost || state.drops > self.last.drops);
        self.last = state;
        reconnected
    }

    fn drops(&self) -> u64 {
        self.last.drops
    }
}

/// Run until `shutdown`, calling `on_reconnect` once per settled reconnect.
pub async fn watch_reconnects<F, Fut>(
    mut state: watch::Receiver<NetworkState>,
    settle_delay: Duration,
    mut on_reconnect: F,
    mut shutdown: watch::Receiver<bool>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let initial = *state.borrow_and_update();
    let mut detector = ReconnectDetector::new(initial);

    info!(
        status = ?initial.status,
        settle_delay_ms = settle_delay.as_millis(),
        "Watching network status"
    );

    'watch: loop {
        tokio::select! {
            biased;

            _ = stopped(&mut shutdown) => break,

            changed = state.changed() => {
                if changed.is_err() {
                    debug!("Network status source closed");
                    break;
                }

                let current = *state.borrow_and_update();
                if !detector.observe(current) {
                    continue;
                }
            }
        }

        debug!("Network reconnected, waiting for it to settle");
        loop {
            let drops = detector.drops();
            tokio::select! {
                biased;

                _ = stopped(&mut shutdown) => break 'watch,

                _ = dropped_since(&mut state, drops) => {
                    let current = *state.borrow_and_update();
                    if detector.observe(current) {
                        debug!("Network dropped and came back while settling");
                        continue;
                    }
                    debug!("Network lost again before settling");
                    break;
                }

                _ = tokio::time::sleep(settle_delay) => {
                    info!("Network settled, resuming");
                    on_reconnect().await;
                    break;
                }
            }
        }
    }

    debug!("Network watcher stopped");
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Resolves once the network is `Lost` or has dropped since `drops`. Never
/// resolves if the source closed.
async fn dropped_since(state: &mut watch::Receiver<NetworkState>, drops: u64) {
    if state
        .wait_for(|s| s.status == NetworkStatus::Lost || s.drops != drops)
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use NetworkStatus::{Available, Lost};

    fn state(status: NetworkStatus, drops: u64) -> NetworkState {
        NetworkState { status, drops }
    }

    #[rstest]
    #[case(state(Lost, 1), state(Available, 1), true)]
    #[case(state(Available, 0), state(Available, 0), false)]
    #[case(state(Available, 0), state(Lost, 1), false)]
    #[case(state(Lost, 1), state(Lost, 1), false)]
    #[case(state(Available, 0), state(Available, 1), true)]
    #[case(state(Available, 2), state(Available, 4), true)]
    fn test_reconnect_edges(
        #[case] from: NetworkState,
        #[case] to: NetworkState,
        #[case] expected: bool,
    ) {
        let mut detector = ReconnectDetector::new(from);
        assert_eq!(detector.observe(to), expected);
    }

    #[test]
    fn test_manual_connectivity_counts_drops() {
        let network = ManualConnectivity::new(Available);
        let rx = network.state();

        network.set(Lost);
        network.set(Lost);
        network.set(Available);
        network.set(Lost);
        network.set(Available);

        assert_eq!(*rx.borrow(), state(Available, 2));
        assert_eq!(network.current(), Available);
    }

    fn spawn_watcher(
        network: &ManualConnectivity,
        delay: Duration,
    ) -> (Arc<AtomicU32>, watch::Sender<bool>) {
        let fired = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counter = Arc::clone(&fired);
        tokio::spawn(watch_reconnects(
            network.state(),
            delay,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
            shutdown_rx,
        ));
        (fired, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_settle_delay() {
        let network = ManualConnectivity::new(Available);
        let (fired, _shutdown) = spawn_watcher(&network, Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(10)).await;

        network.set(Lost);
        tokio::time::sleep(Duration::from_millis(10)).await;
        network.set(Available);
        tokio::time::sleep(Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_millis(1_800)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_during_settle_abandons() {
        let network = ManualConnectivity::new(Lost);
        let (fired, _shutdown) = spawn_watcher(&network, Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(10)).await;

        network.set(Available);
        tokio::time::sleep(Duration::from_secs(1)).await;
        network.set(Lost);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        network.set(Available);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flap_without_yield_still_fires() {
        let network = ManualConnectivity::new(Available);
        let (fired, _shutdown) = spawn_watcher(&network, Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The watcher only ever sees the final Available
        network.set(Lost);
        network.set(Available);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flap_while_settling_restarts_settle() {
        let network = ManualConnectivity::new(Lost);
        let (fired, _shutdown) = spawn_watcher(&network, Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(10)).await;

        network.set(Available);
        tokio::time::sleep(Duration::from_secs(1)).await;
        network.set(Lost);
        network.set(Available);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
