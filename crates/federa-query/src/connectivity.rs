//! Network reachability signal shared by all datasources

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Online/offline flag that wakes subscribers on every report
///
/// Reporting "online" while already online still notifies subscribers, so a
/// pending login retry fires on the next reachability report.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.is_online();
        self.tx.send_modify(|value| *value = online);
        if previous != online {
            info!("Connectivity changed: online={}", online);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve on the next report of the network being available
    pub async fn restored(&self) {
        let mut rx = self.subscribe();
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            if *rx.borrow_and_update() {
                return;
            }
        }
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connectivity")
            .field("online", &self.is_online())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_restored_fires_on_repeated_online() {
        let connectivity = Connectivity::new(true);
        let waiter = {
            let connectivity = connectivity.clone();
            tokio::spawn(async move { connectivity.restored().await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        connectivity.set_online(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("restored should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_offline_does_not_resolve() {
        let connectivity = Connectivity::new(true);
        let waiter = {
            let connectivity = connectivity.clone();
            tokio::spawn(async move { connectivity.restored().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        connectivity.set_online(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(!connectivity.is_online());

        connectivity.set_online(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("restored should resolve")
            .unwrap();
    }
}
