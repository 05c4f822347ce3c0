//! Stale-connection reaper.
//!
//! Scans `active_rooms` every tick and issues conditional leaves for
//! connections whose last heartbeat is older than the lookback. The
//! staleness guard re-runs inside the store's atomic unit, so the reaper
//! can never erase a connection that came back between scan and leave, and
//! two reapers on two nodes produce at most one departure.

use std::sync::Arc;
use std::time::Duration;

use presmesh_core::time::now_ms;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::store::{keys, Store};

use super::{PresenceOptions, PresenceService};

pub struct Reaper {
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    pub fn start(
        service: Arc<PresenceService>,
        store: Arc<dyn Store>,
        opts: &PresenceOptions,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let interval = Duration::from_millis(opts.reaper_interval_ms);
        let lookback = opts.reaper_lookback_ms;

        let stop = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Overruns skip the next tick rather than queueing.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.notified() => return,
                    _ = ticker.tick() => {}
                }
                sweep(&service, store.as_ref(), lookback).await;
            }
        });

        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the timer and wait for an in-progress sweep to finish.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// One pass over every active room. Errors are logged and confined to the
/// room they occurred in; the next tick retries.
async fn sweep(service: &PresenceService, store: &dyn Store, lookback_ms: i64) {
    let rooms = match store.set_members(&keys::active_rooms()).await {
        Ok(rooms) => rooms,
        Err(e) => {
            tracing::warn!(err = %e, "reaper: active room scan failed");
            return;
        }
    };

    for room_id in rooms {
        let cutoff = now_ms() - lookback_ms;
        let stale = match store
            .sorted_range_below(&keys::room_last_seen(&room_id), cutoff)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(err = %e, room = %room_id, "reaper: last-seen scan failed");
                continue;
            }
        };

        for conn_id in stale {
            match service.reap(&room_id, &conn_id, cutoff).await {
                Ok(true) => {
                    tracing::debug!(room = %room_id, conn = %conn_id, "reaped stale connection");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(err = %e, room = %room_id, conn = %conn_id, "reaper: leave failed");
                }
            }
        }

        // A burst of stale rooms must not monopolize the scheduler.
        tokio::task::yield_now().await;
    }
}
