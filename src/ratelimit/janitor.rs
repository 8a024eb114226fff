//! Background eviction of expired records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::record::duration_millis;
use super::store::WindowStore;
use crate::clock::Clock;
use crate::error::{FloodgateError, Result};

/// Default sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Handle to the periodic sweep task.
///
/// The task only holds a weak reference to the store and ends on its own once
/// the store is dropped. Dropping the handle aborts the task; call
/// [`Janitor::shutdown`] to stop it and wait for it to finish.
#[derive(Debug)]
pub struct Janitor {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Janitor {
    /// Spawn a janitor sweeping `store` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        store: &Arc<WindowStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(FloodgateError::Config(
                "janitor interval must be greater than zero".to_string(),
            ));
        }

        let store = Arc::downgrade(store);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; there is nothing to sweep yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        let evicted = store.sweep(clock.now_millis());
                        if evicted > 0 {
                            info!(evicted, remaining = store.len(), "Evicted expired rate limit records");
                        } else {
                            trace!(remaining = store.len(), "Janitor sweep found nothing to evict");
                        }
                    }
                }
            }

            debug!("Janitor stopped");
        });

        debug!(interval_ms = duration_millis(interval), "Janitor started");

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Whether the sweep task is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sweep task and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const WINDOW: Duration = Duration::from_millis(1000);

    fn seeded_store() -> Arc<WindowStore> {
        let store = Arc::new(WindowStore::new());
        let policy: Arc<str> = Arc::from("global");
        store.with_record(&policy, "idle", WINDOW, 0, |r| r.increment());
        store
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let store = seeded_store();
        let result = Janitor::spawn(&store, Arc::new(ManualClock::new(0)), Duration::ZERO);
        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_evicts_expired_records() {
        let store = seeded_store();
        let clock = ManualClock::new(0);
        let janitor =
            Janitor::spawn(&store, Arc::new(clock.clone()), Duration::from_secs(60)).unwrap();

        clock.set(5_000);
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(store.is_empty());
        janitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_keeps_live_records() {
        let store = seeded_store();
        let janitor =
            Janitor::spawn(&store, Arc::new(ManualClock::new(500)), Duration::from_secs(60))
                .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(store.len(), 1);
        janitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_exits_when_store_dropped() {
        let store = seeded_store();
        let janitor =
            Janitor::spawn(&store, Arc::new(ManualClock::new(0)), Duration::from_secs(60))
                .unwrap();
        assert!(janitor.is_running());

        drop(store);
        tokio::time::sleep(Duration::from_secs(121)).await;

        assert!(!janitor.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let store = seeded_store();
        let janitor =
            Janitor::spawn(&store, Arc::new(ManualClock::new(0)), Duration::from_secs(60))
                .unwrap();

        tokio::time::timeout(Duration::from_secs(1), janitor.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
