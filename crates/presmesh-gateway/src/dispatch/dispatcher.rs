use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use presmesh_core::protocol::envelope::Envelope;
use presmesh_core::{PresmeshError, Result};
use serde_json::Value;

use crate::realtime::SessionCtx;

/// A service addressable by envelope `svc`.
///
/// `handle` returns the ack body; the socket loop wraps it (or the error)
/// into the ack envelope, so every request is acknowledged exactly once.
#[async_trait]
pub trait SocketService: Send + Sync {
    fn svc(&self) -> &'static str;
    async fn handle(&self, ctx: SessionCtx, env: Envelope) -> Result<Value>;
}

/// Registry and dispatcher for socket services.
#[derive(Default)]
pub struct Dispatcher {
    services: DashMap<&'static str, Arc<dyn SocketService>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    pub fn register(&self, svc: Arc<dyn SocketService>) {
        self.services.insert(svc.svc(), svc);
    }

    pub fn registered_svcs(&self) -> Vec<&'static str> {
        self.services.iter().map(|e| *e.key()).collect()
    }

    pub async fn dispatch(&self, ctx: SessionCtx, env: Envelope) -> Result<Value> {
        let svc = env.svc.as_str();
        let handler = self
            .services
            .get(svc)
            .ok_or_else(|| PresmeshError::InvalidArgument(format!("unknown svc: {svc}")))?
            .value()
            .clone();
        handler.handle(ctx, env).await
    }
}
