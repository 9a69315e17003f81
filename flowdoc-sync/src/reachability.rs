//! Network reachability tracking.
//!
//! `set_online` is the single signal source. Consumers either read the
//! current value or subscribe to transitions. A transition to online drains
//! the sync queue exactly once, after a settle window that absorbs flapping.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::queue::SyncQueue;

#[derive(Debug, Clone)]
pub struct ReachabilityConfig {
    /// Quiet period after coming online before reacting (default: 1.5s).
    pub settle: Duration,
    /// Health check interval, when a check is configured (default: 30s).
    pub check_interval: Duration,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(1500),
            check_interval: Duration::from_secs(30),
        }
    }
}

impl ReachabilityConfig {
    pub fn for_testing() -> Self {
        Self {
            settle: Duration::from_millis(50),
            check_interval: Duration::from_millis(100),
        }
    }
}

/// Cheap to clone; all clones share one state.
#[derive(Debug, Clone)]
pub struct ReachabilityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ReachabilityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the platform's current reachability. Returns `true` if this
    /// was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            log::info!("network is {}", if online { "online" } else { "offline" });
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Run `action` once per offline-to-online transition, after the state
    /// has stayed unchanged for `settle`. A flap inside the window restarts
    /// it; ending the window offline cancels the run.
    pub fn spawn_on_reconnect<F, Fut>(&self, settle: Duration, action: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            let mut was_online = *rx.borrow_and_update();
            loop {
                if rx.changed().await.is_err() {
                    return;
                }
                let online = *rx.borrow_and_update();
                if !online {
                    was_online = false;
                    continue;
                }
                if was_online {
                    continue;
                }

                let settled_online = loop {
                    match tokio::time::timeout(settle, rx.changed()).await {
                        Ok(Ok(())) => {
                            rx.borrow_and_update();
                        }
                        Ok(Err(_)) => return,
                        Err(_) => break *rx.borrow_and_update(),
                    }
                };

                was_online = settled_online;
                if settled_online {
                    action().await;
                }
            }
        })
    }

    /// Drain `queue` once per reconnect.
    pub fn spawn_drain_on_reconnect(&self, queue: Arc<SyncQueue>, settle: Duration) -> JoinHandle<()> {
        self.spawn_on_reconnect(settle, move || {
            let queue = Arc::clone(&queue);
            async move {
                log::info!("back online, draining {} pending item(s)", queue.len());
                queue.drain().await;
            }
        })
    }

    /// Feed `set_online` from a periodic health check.
    pub fn spawn_health_check(&self, check: Arc<dyn HealthCheck>, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let healthy = check.check().await;
                monitor.set_online(healthy);
            }
        })
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// `true` when the sync server answers.
    async fn check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counting_action(counter: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[test]
    fn test_set_online_reports_transitions() {
        let monitor = ReachabilityMonitor::new(false);
        assert!(!monitor.is_online());
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_fires_once_after_settle() {
        let monitor = ReachabilityMonitor::new(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let _task = monitor.spawn_on_reconnect(Duration::from_millis(1500), counting_action(&fired));
        tokio::task::yield_now().await;

        monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_is_absorbed() {
        let monitor = ReachabilityMonitor::new(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let _task = monitor.spawn_on_reconnect(Duration::from_millis(1500), counting_action(&fired));
        tokio::task::yield_now().await;

        for _ in 0..5 {
            monitor.set_online(true);
            tokio::time::sleep(Duration::from_millis(200)).await;
            monitor.set_online(false);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        monitor.set_online(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        monitor.set_online(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.set_online(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    struct Flag(AtomicBool);

    #[async_trait]
    impl HealthCheck for Flag {
        async fn check(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_drives_state() {
        let monitor = ReachabilityMonitor::new(true);
        let check = Arc::new(Flag(AtomicBool::new(false)));
        let _task = monitor.spawn_health_check(check.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!monitor.is_online());

        check.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(monitor.is_online());
    }
}
