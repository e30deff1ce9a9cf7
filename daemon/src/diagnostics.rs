//! Read-only status snapshot of a running engine

use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::{
    classifier::ClassifierStats, closed::ClosedBufferStats, engine::Engine,
    registry::RegistryStats, tls::TlsStats,
};

/// Counters and gauges from every component
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Diagnostics {
    /// RFC 3339 collection time
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub events_processed: u64,
    pub decode_errors: u64,
    pub kernel_lost_events: u64,
    /// Byte samples that arrived after their connection closed
    pub late_samples: u64,
    /// Socket resolutions for connections that had already closed
    pub late_resolutions: u64,
    pub registry: RegistryStats,
    pub closed: ClosedBufferStats,
    pub classifier: ClassifierStats,
    pub tls: TlsStats,
    pub nat_translations: u64,
    pub nat_rewrites: u64,
    pub port_bindings: u64,
}

impl Diagnostics {
    pub fn collect(engine: &Engine) -> Self {
        let counters = engine.counters();
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: engine.uptime_secs(),
            events_processed: counters.events.load(Ordering::Relaxed),
            decode_errors: counters.decode_errors.load(Ordering::Relaxed),
            kernel_lost_events: counters.kernel_lost_events.load(Ordering::Relaxed),
            late_samples: counters.late_samples.load(Ordering::Relaxed),
            late_resolutions: counters.late_resolutions.load(Ordering::Relaxed),
            registry: engine.registry().stats(),
            closed: engine.closed_buffer().stats(),
            classifier: engine.classifier().stats(),
            tls: engine.tls().stats(),
            nat_translations: engine.nat().len() as u64,
            nat_rewrites: engine.nat().rewrites(),
            port_bindings: engine.ports().len() as u64,
        }
    }

    /// One-line summary for periodic status logs
    pub fn summary(&self) -> String {
        format!(
            "active={} closed={} buffered={} dropped={} classified={} pending_tls={} anomalies={}",
            self.registry.active,
            self.registry.closed,
            self.closed.buffered,
            self.closed.dropped,
            self.classifier.terminal,
            self.tls.pending_records + self.tls.pending_joins,
            self.registry.stale_events
                + self.registry.duplicate_closes
                + self.registry.counter_regressions,
        )
    }
}
