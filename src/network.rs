//! Network observer.
//!
//! Tracks two orthogonal signals: whether the device has a network link, and
//! whether the POS server is reachable over it (which may be unknown). The
//! observer holds no durable state; it only publishes the latest snapshot on
//! a watch channel and logs every transition. Flapping is not debounced here,
//! the sync engine's reconnect handler settles it.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::ReachabilityProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub has_link: bool,
    /// `None` until a probe has answered.
    pub internet_reachable: Option<bool>,
}

impl NetworkStatus {
    pub const ONLINE: NetworkStatus = NetworkStatus {
        has_link: true,
        internet_reachable: None,
    };

    pub const OFFLINE: NetworkStatus = NetworkStatus {
        has_link: false,
        internet_reachable: None,
    };

    /// Link present and reachability not explicitly false.
    pub fn is_effectively_online(&self) -> bool {
        self.has_link && self.internet_reachable != Some(false)
    }
}

pub struct NetworkObserver {
    tx: watch::Sender<NetworkStatus>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    check_timeout: Duration,
}

impl NetworkObserver {
    pub fn new(
        initial: NetworkStatus,
        probe: Option<Arc<dyn ReachabilityProbe>>,
        check_timeout: Duration,
    ) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx,
            probe,
            check_timeout,
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn is_effectively_online(&self) -> bool {
        self.status().is_effectively_online()
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    pub fn set_link(&self, has_link: bool) {
        self.update(|s| {
            s.has_link = has_link;
            if !has_link {
                s.internet_reachable = None;
            }
        });
    }

    pub fn set_reachable(&self, reachable: Option<bool>) {
        self.update(|s| s.internet_reachable = reachable);
    }

    /// Apply `f` and notify subscribers only if the status actually changed.
    pub fn update(&self, f: impl FnOnce(&mut NetworkStatus)) {
        self.tx.send_if_modified(|status| {
            let before = *status;
            f(status);
            if *status == before {
                return false;
            }
            let was_online = before.is_effectively_online();
            let now_online = status.is_effectively_online();
            if was_online != now_online {
                if now_online {
                    info!(
                        has_link = status.has_link,
                        reachable = ?status.internet_reachable,
                        "Network restored"
                    );
                } else {
                    info!(
                        has_link = status.has_link,
                        reachable = ?status.internet_reachable,
                        "Network lost; working offline"
                    );
                }
            } else {
                debug!(
                    has_link = status.has_link,
                    reachable = ?status.internet_reachable,
                    "Network status changed"
                );
            }
            true
        });
    }

    /// Probe reachability now, bounded by the check timeout, and publish the
    /// result. Returns whether the device is effectively online afterwards.
    pub async fn check_now(&self) -> bool {
        let Some(probe) = self.probe.clone() else {
            return self.is_effectively_online();
        };
        if !self.status().has_link {
            return false;
        }
        let reachable = tokio::time::timeout(self.check_timeout, probe.probe())
            .await
            .unwrap_or(false);
        self.set_reachable(Some(reachable));
        self.is_effectively_online()
    }

    /// Run `check_now` every `interval` until cancelled.
    pub fn spawn_monitor(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Network monitor started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                self.check_now().await;
            }
            info!("Network monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for FlagProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl ReachabilityProbe for HangingProbe {
        async fn probe(&self) -> bool {
            std::future::pending::<()>().await;
            true
        }
    }

    #[test]
    fn unknown_reachability_counts_as_online() {
        assert!(NetworkStatus::ONLINE.is_effectively_online());
        assert!(!NetworkStatus::OFFLINE.is_effectively_online());
        let blocked = NetworkStatus {
            has_link: true,
            internet_reachable: Some(false),
        };
        assert!(!blocked.is_effectively_online());
    }

    #[tokio::test]
    async fn transitions_notify_subscribers_once() {
        let observer = NetworkObserver::new(NetworkStatus::ONLINE, None, Duration::from_secs(5));
        let mut rx = observer.subscribe();

        observer.set_link(true);
        assert!(!rx.has_changed().unwrap());

        observer.set_link(false);
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().is_effectively_online());
    }

    #[tokio::test]
    async fn check_now_publishes_probe_result() {
        let probe = Arc::new(FlagProbe(AtomicBool::new(false)));
        let observer = NetworkObserver::new(
            NetworkStatus::ONLINE,
            Some(probe.clone()),
            Duration::from_secs(5),
        );

        assert!(!observer.check_now().await);
        assert_eq!(observer.status().internet_reachable, Some(false));

        probe.0.store(true, Ordering::SeqCst);
        assert!(observer.check_now().await);
    }

    #[tokio::test(start_paused = true)]
    async fn check_now_times_out() {
        let observer = NetworkObserver::new(
            NetworkStatus::ONLINE,
            Some(Arc::new(HangingProbe)),
            Duration::from_secs(5),
        );
        assert!(!observer.check_now().await);
        assert_eq!(observer.status().internet_reachable, Some(false));
    }
}
