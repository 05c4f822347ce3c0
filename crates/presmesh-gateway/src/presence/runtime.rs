//! Lifecycle owner for the presence fabric.
//!
//! init (allocate, subscribe, start timer) -> running -> dispose (stop
//! timer, unsubscribe, quiesce). No module-level mutable state: everything
//! is constructed here and handed out as `Arc`s, so tests can build and tear
//! down a full fabric per case.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use presmesh_core::Result;

use crate::obs::PresenceMetrics;
use crate::realtime::RoomEgress;
use crate::store::Store;

use super::{EventBridge, HandlerSet, PresenceOptions, PresenceService, Reaper};

/// Grace period for in-flight service calls during dispose.
const DISPOSE_GRACE: Duration = Duration::from_secs(5);

pub struct PresenceRuntime {
    service: Arc<PresenceService>,
    bridge: EventBridge,
    reaper: Reaper,
    disposed: AtomicBool,
}

impl PresenceRuntime {
    pub async fn start(
        store: Arc<dyn Store>,
        egress: Arc<RoomEgress>,
        opts: PresenceOptions,
        metrics: Arc<PresenceMetrics>,
    ) -> Result<Self> {
        let service = Arc::new(PresenceService::new(
            Arc::clone(&store),
            opts.clone(),
            Arc::clone(&metrics),
        ));
        let bridge = EventBridge::start(
            Arc::clone(&store),
            egress,
            opts.event_name.clone(),
            metrics,
        )
        .await?;
        let reaper = Reaper::start(Arc::clone(&service), store, &opts);

        Ok(Self {
            service,
            bridge,
            reaper,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn service(&self) -> &Arc<PresenceService> {
        &self.service
    }

    pub fn handlers(&self) -> &Arc<HandlerSet> {
        self.bridge.handlers()
    }

    /// Canonical shutdown: stop the reaper timer, unsubscribe the bridge,
    /// then wait for in-flight service calls up to the grace period. Safe to
    /// call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reaper.stop().await;
        self.bridge.stop().await;
        self.service.quiesce(DISPOSE_GRACE).await;
        tracing::info!("presence runtime disposed");
    }
}
