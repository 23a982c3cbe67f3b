//! Background sync driver: timer ticks, offline-to-online transitions and
//! push retries coming due.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{ReconciliationEngine, SyncOutcome, SyncTrigger};
use crate::error::Error;

/// Handle to the background sync task
pub struct SyncScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the task; `interval = None` disables timer-driven cycles
    pub fn spawn(engine: ReconciliationEngine, interval: Option<Duration>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(drive(engine, interval, shutdown_rx));
        Self { shutdown, handle }
    }

    /// Stop the task and wait for the cycle in progress, if any
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.handle.await {
            tracing::warn!(%error, "Sync scheduler task ended abnormally");
        }
    }
}

async fn drive(
    engine: ReconciliationEngine,
    interval: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut online = engine.connectivity().subscribe();
    let mut was_online = *online.borrow_and_update();
    let schedule_changed = engine.schedule_changed();
    // Disarmed after a cycle that did not run, until some flight ends
    let mut retry_armed = true;
    tracing::info!(?interval, "Sync scheduler started");

    loop {
        let retry_at = if retry_armed {
            next_retry_deadline(&engine).await
        } else {
            None
        };
        let trigger = tokio::select! {
            _ = shutdown.changed() => break,
            () = next_tick(&mut ticker) => SyncTrigger::Timer,
            () = sleep_until(retry_at) => SyncTrigger::Retry,
            () = schedule_changed.notified() => {
                retry_armed = true;
                continue;
            }
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_online = *online.borrow_and_update();
                let reconnected = is_online && !was_online;
                was_online = is_online;
                if !reconnected {
                    continue;
                }
                SyncTrigger::Reconnect
            }
        };

        let outcome = engine.run(trigger).await;
        retry_armed = matches!(outcome, Ok(SyncOutcome::Completed(_)));
        match outcome {
            Ok(SyncOutcome::Completed(report)) => {
                tracing::debug!(%trigger, pushed = report.pushed, pulled = report.pulled, "Background sync done");
            }
            Ok(SyncOutcome::Coalesced | SyncOutcome::SkippedOffline) => {}
            Err(Error::NoTenant) => tracing::debug!(%trigger, "No workspace selected; sync skipped"),
            Err(error) => tracing::error!(%trigger, %error, "Background sync failed"),
        }
    }
    tracing::info!("Sync scheduler stopped");
}

async fn next_retry_deadline(engine: &ReconciliationEngine) -> Option<Instant> {
    match engine.next_retry_at().await {
        Ok(Some(at)) => {
            let wait = at.saturating_sub(chrono::Utc::now().timestamp_millis());
            let wait = u64::try_from(wait).unwrap_or_default();
            Some(Instant::now() + Duration::from_millis(wait))
        }
        Ok(None) | Err(Error::NoTenant) => None,
        Err(error) => {
            tracing::warn!(%error, "Could not read the retry schedule");
            None
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
