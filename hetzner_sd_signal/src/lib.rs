//! One-shot shutdown signal for prometheus-hetzner-sd.
//!
//! The daemon runs two long lived tasks, the discovery loop and the web
//! server, and both must stop when the process is asked to terminate. This
//! crate provides the mechanism: a single [`Broadcaster`] and any number of
//! [`Watcher`] instances. The signal is sent exactly once.
//!
//! Every live `Watcher` is a peer of the `Broadcaster`. A call to
//! [`Broadcaster::signal_and_wait`] does not return until every peer has been
//! dropped, which is what the `Watcher` does once it has observed the signal
//! in [`Watcher::recv`]. Any `Watcher` that is held but never consumed will
//! therefore keep `signal_and_wait` blocked; drop unused instances early.

use tokio::sync::watch;
use tracing::{debug, info};

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

/// Mechanism to notify one or more `Watcher` instances that shutdown has been
/// requested.
#[derive(Debug)]
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal to every `Watcher`.
    ///
    /// Function will NOT block until the peers have observed the signal.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal to every `Watcher`.
    ///
    /// Function WILL block until every peer has been dropped.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);

        let peers = self.sender.receiver_count();
        if peers > 0 {
            info!("Waiting for {peers} peers");
        }
        self.sender.closed().await;
        debug!("all peers dropped");
    }
}

/// Mechanism to watch for the shutdown signal.
///
/// Cloning a `Watcher` creates a new peer that `Broadcaster::signal_and_wait`
/// waits on.
#[derive(Debug, Clone)]
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the signal, consuming this `Watcher`.
    ///
    /// Returns immediately if the signal has already been sent. A dropped
    /// `Broadcaster` counts as a signal.
    pub async fn recv(mut self) {
        // An error means the Broadcaster is gone, which is as final as a
        // signal.
        let _ = self.receiver.wait_for(|signaled| *signaled).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::signal;

    #[tokio::test]
    async fn signal_and_wait_returns_once_watchers_receive() {
        let (watcher, broadcaster) = signal();
        let other = watcher.clone();

        let first = tokio::spawn(watcher.recv());
        let second = tokio::spawn(other.recv());

        timeout(Duration::from_secs(5), broadcaster.signal_and_wait())
            .await
            .expect("broadcaster did not observe peers dropping");
        first.await.expect("first watcher panicked");
        second.await.expect("second watcher panicked");
    }

    #[tokio::test]
    async fn signal_and_wait_without_peers_returns() {
        let (watcher, broadcaster) = signal();
        drop(watcher);

        timeout(Duration::from_secs(5), broadcaster.signal_and_wait())
            .await
            .expect("broadcaster blocked without peers");
    }

    #[tokio::test]
    async fn recv_after_signal_returns_immediately() {
        let (watcher, broadcaster) = signal();
        broadcaster.signal();

        timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("watcher did not see an earlier signal");
    }

    #[tokio::test]
    async fn dropped_broadcaster_counts_as_signal() {
        let (watcher, broadcaster) = signal();
        drop(broadcaster);

        timeout(Duration::from_secs(5), watcher.recv())
            .await
            .expect("watcher blocked after broadcaster dropped");
    }
}
