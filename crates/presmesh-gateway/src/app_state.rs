//! Shared application state for the presmesh gateway.
//!
//! Everything is `Arc`-friendly and cloneable; construction wires the store,
//! the presence runtime, and the dispatcher in dependency order.

use std::sync::Arc;

use presmesh_core::Result;

use crate::config::{GatewayConfig, StoreBackend};
use crate::dispatch::Dispatcher;
use crate::obs::PresenceMetrics;
use crate::presence::{PresenceRuntime, PresenceService};
use crate::realtime::{RoomEgress, RoomRoster, SessionRegistry};
use crate::services::presence::PresenceSocketService;
use crate::store::{memory::MemoryStore, redis::RedisStore, Store};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: GatewayConfig,
    metrics: Arc<PresenceMetrics>,
    sessions: Arc<SessionRegistry>,
    roster: Arc<RoomRoster>,
    dispatcher: Arc<Dispatcher>,
    runtime: Arc<PresenceRuntime>,
}

impl AppState {
    pub async fn build(cfg: GatewayConfig) -> Result<Self> {
        let metrics = Arc::new(PresenceMetrics::default());
        let sessions = Arc::new(SessionRegistry::new());
        let roster = Arc::new(RoomRoster::new());
        let egress = Arc::new(RoomEgress::new(
            Arc::clone(&sessions),
            Arc::clone(&roster),
            Arc::clone(&metrics),
        ));

        let store: Arc<dyn Store> = match cfg.store.backend {
            StoreBackend::Redis => {
                // validate() guarantees a url for the redis backend.
                let url = cfg.store.url.as_deref().unwrap_or_default();
                Arc::new(RedisStore::connect(url).await?)
            }
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };

        let runtime = Arc::new(
            PresenceRuntime::start(store, egress, cfg.presence_options(), Arc::clone(&metrics))
                .await?,
        );

        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(Arc::new(PresenceSocketService::new(Arc::clone(
            runtime.service(),
        ))));

        Ok(Self {
            inner: Arc::new(AppStateInner {
                cfg,
                metrics,
                sessions,
                roster,
                dispatcher,
                runtime,
            }),
        })
    }

    pub fn cfg(&self) -> &GatewayConfig {
        &self.inner.cfg
    }

    pub fn metrics(&self) -> &Arc<PresenceMetrics> {
        &self.inner.metrics
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn roster(&self) -> &Arc<RoomRoster> {
        &self.inner.roster
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    pub fn runtime(&self) -> &Arc<PresenceRuntime> {
        &self.inner.runtime
    }

    pub fn presence(&self) -> &Arc<PresenceService> {
        self.inner.runtime.service()
    }
}
