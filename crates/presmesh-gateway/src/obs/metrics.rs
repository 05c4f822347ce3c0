//! Minimal metrics registry for the gateway.
//!
//! Dependency-free counters and gauges rendered in Prometheus text
//! exposition format at `/metrics`. The presence fabric's series are a
//! closed set, so plain atomics are enough; no labeled vectors, no
//! histograms.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(out, "{name} {}", self.get());
    }
}

#[derive(Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {name} gauge");
        let _ = writeln!(out, "{name} {}", self.get());
    }
}

#[derive(Default)]
pub struct PresenceMetrics {
    pub joins_total: Counter,
    pub heartbeats_total: Counter,
    pub leaves_total: Counter,
    pub reaped_total: Counter,
    pub publish_failures_total: Counter,
    pub events_received_total: Counter,
    pub handler_errors_total: Counter,
    pub fanout_drops_total: Counter,
    pub decode_errors_total: Counter,
    pub sessions_active: Gauge,
}

impl PresenceMetrics {
    /// Render all registered metrics.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.joins_total.render("presmesh_joins_total", &mut out);
        self.heartbeats_total.render("presmesh_heartbeats_total", &mut out);
        self.leaves_total.render("presmesh_leaves_total", &mut out);
        self.reaped_total.render("presmesh_reaped_total", &mut out);
        self.publish_failures_total
            .render("presmesh_publish_failures_total", &mut out);
        self.events_received_total
            .render("presmesh_events_received_total", &mut out);
        self.handler_errors_total
            .render("presmesh_handler_errors_total", &mut out);
        self.fanout_drops_total
            .render("presmesh_fanout_drops_total", &mut out);
        self.decode_errors_total
            .render("presmesh_decode_errors_total", &mut out);
        self.sessions_active.render("presmesh_sessions_active", &mut out);
        out
    }
}
