// In-process watchdog over the scheduler. A stalled heartbeat gets the
// task cancelled cooperatively, then respawned, under a restart budget.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::MonitorSettings;
use crate::state::SharedState;

// Grace period for a cancelled scheduler to unwind before abort.
const STOP_GRACE: Duration = Duration::from_secs(10);
// A healthy hour clears the restart budget.
const RESTART_WINDOW: Duration = Duration::from_secs(3600);

pub struct HealthMonitor {
    config: MonitorSettings,
    state: Arc<SharedState>,
}

impl HealthMonitor {
    pub fn new(config: MonitorSettings, state: Arc<SharedState>) -> Self {
        Self { config, state }
    }

    /// Watches the cycle heartbeat until `shutdown` flips. `spawn_fn`
    /// creates a fresh scheduler task wired to the cancel channel it is
    /// given; the monitor owns the current generation's handle.
    pub async fn run<F>(&self, spawn_fn: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn(watch::Receiver<bool>) -> JoinHandle<()>,
    {
        let (mut cancel_tx, cancel_rx) = watch::channel(false);
        let mut handle = spawn_fn(cancel_rx);
        let mut restarts: u32 = 0;
        let mut last_restart: Option<Instant> = None;

        let mut ticker = interval(Duration::from_secs(self.config.check_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick is immediate

        info!(
            "health monitor started: checking every {}s, stale after {}s",
            self.config.check_interval_secs, self.config.staleness_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    let _ = cancel_tx.send(true);
                    stop_task(&mut handle).await;
                    info!("health monitor stopped");
                    return;
                }
            }

            let age = self.state.seconds_since_update().await;
            match age {
                Some(age) if age > self.config.staleness_secs as i64 => {
                    warn!(
                        "heartbeat stale: last cycle update {}s ago (limit {}s)",
                        age, self.config.staleness_secs
                    );

                    if restarts >= self.config.max_restarts {
                        error!(
                            "restart budget of {} exhausted, leaving scheduler alone",
                            self.config.max_restarts
                        );
                        return;
                    }
                    restarts += 1;
                    info!(
                        "restarting scheduler ({}/{})",
                        restarts, self.config.max_restarts
                    );

                    let _ = cancel_tx.send(true);
                    stop_task(&mut handle).await;

                    let (tx, rx) = watch::channel(false);
                    cancel_tx = tx;
                    handle = spawn_fn(rx);
                    last_restart = Some(Instant::now());
                }
                Some(age) => {
                    debug!("heartbeat healthy, {}s since last cycle", age);
                    if restarts > 0 {
                        if let Some(at) = last_restart {
                            if at.elapsed() >= RESTART_WINDOW {
                                info!("an hour without trouble, clearing restart counter");
                                restarts = 0;
                                last_restart = None;
                            }
                        }
                    }
                }
                None => {
                    // Startup: no cycle has completed yet.
                    debug!("no heartbeat recorded yet");
                }
            }
        }
    }
}

/// Bounded wait for a cancelled task; abort if it ignores the signal.
async fn stop_task(handle: &mut JoinHandle<()>) {
    if timeout(STOP_GRACE, &mut *handle).await.is_err() {
        warn!("scheduler ignored cancel for {:?}, aborting", STOP_GRACE);
        handle.abort();
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(max_restarts: u32) -> MonitorSettings {
        MonitorSettings {
            check_interval_secs: 60,
            staleness_secs: 300,
            max_restarts,
        }
    }

    fn cooperative_task(mut cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _ = cancel.changed().await;
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_heartbeat_triggers_restart() {
        let state = Arc::new(SharedState::new());
        state
            .force_last_update(Utc::now() - ChronoDuration::seconds(400))
            .await;

        let spawns = Arc::new(AtomicU32::new(0));
        let spawns_clone = spawns.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = HealthMonitor::new(settings(5), state.clone());
        let monitor_task = tokio::spawn(async move {
            monitor
                .run(
                    move |cancel| {
                        spawns_clone.fetch_add(1, Ordering::SeqCst);
                        cooperative_task(cancel)
                    },
                    shutdown_rx,
                )
                .await;
        });

        // One check interval passes, the stale heartbeat forces a respawn.
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(spawns.load(Ordering::SeqCst) >= 2);

        let _ = shutdown_tx.send(true);
        let _ = monitor_task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_budget_stops_monitoring() {
        let state = Arc::new(SharedState::new());
        state
            .force_last_update(Utc::now() - ChronoDuration::seconds(400))
            .await;

        let spawns = Arc::new(AtomicU32::new(0));
        let spawns_clone = spawns.clone();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = HealthMonitor::new(settings(1), state.clone());
        let monitor_task = tokio::spawn(async move {
            monitor
                .run(
                    move |cancel| {
                        spawns_clone.fetch_add(1, Ordering::SeqCst);
                        cooperative_task(cancel)
                    },
                    shutdown_rx,
                )
                .await;
        });

        // The heartbeat stays stale; after one restart the budget is
        // spent and the monitor exits on the next stale check.
        tokio::time::sleep(Duration::from_secs(180)).await;
        monitor_task.await.unwrap();
        assert_eq!(spawns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_heartbeat_spawns_once() {
        let state = Arc::new(SharedState::new());
        state.touch().await;

        let spawns = Arc::new(AtomicU32::new(0));
        let spawns_clone = spawns.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = HealthMonitor::new(settings(5), state.clone());
        let monitor_task = tokio::spawn(async move {
            monitor
                .run(
                    move |cancel| {
                        spawns_clone.fetch_add(1, Ordering::SeqCst);
                        cooperative_task(cancel)
                    },
                    shutdown_rx,
                )
                .await;
        });

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(spawns.load(Ordering::SeqCst), 1);

        let _ = shutdown_tx.send(true);
        let _ = monitor_task.await;
    }
}
