//! Periodic maintenance
//!
//! Idle connections are closed, stuck classifications flushed, TLS
//! correlations expired and the closed-connection buffer compacted. Each
//! step takes short per-shard locks only, so ingestion keeps running.

use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::classifier::ProtocolClassifier;
use crate::closed::ClosedBuffer;
use crate::config::EngineConfig;
use crate::registry::ConnectionRegistry;
use crate::tls::TlsCorrelator;

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idle_closed: usize,
    pub classifier_flushed: usize,
    pub classifier_pruned: usize,
    pub tls_expired_records: usize,
    pub tls_expired_joins: usize,
    pub compacted: usize,
    pub tombstones_pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct Sweeper {
    registry: Arc<ConnectionRegistry>,
    classifier: Arc<ProtocolClassifier>,
    tls: Arc<TlsCorrelator>,
    closed: Arc<ClosedBuffer>,
    idle_timeout: Duration,
    classifier_deadline: Duration,
    tombstone_ttl: Duration,
    orphan_tombstone_ttl: Duration,
    period: Duration,
}

impl Sweeper {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        classifier: Arc<ProtocolClassifier>,
        tls: Arc<TlsCorrelator>,
        closed: Arc<ClosedBuffer>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            classifier,
            tls,
            closed,
            idle_timeout: config.idle_timeout,
            classifier_deadline: config.classifier_deadline,
            tombstone_ttl: config.tombstone_ttl,
            orphan_tombstone_ttl: config.orphan_tombstone_ttl,
            period: config.sweep_interval,
        }
    }

    pub fn sweep_once(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        report.idle_closed = self.registry.close_idle(now, self.idle_timeout);

        let flushed = self.classifier.flush_expired(now, self.classifier_deadline);
        report.classifier_flushed = flushed.len();
        for (key, protocol) in flushed {
            self.registry.set_protocol(&key, protocol);
        }
        report.classifier_pruned =
            self.classifier
                .prune_terminal(now, self.classifier_deadline, |key| self.registry.contains(key));

        let expiry = self.tls.expire(now);
        report.tls_expired_records = expiry.records;
        report.tls_expired_joins = expiry.joins;

        report.compacted = self.closed.compact();
        report.tombstones_pruned =
            self.registry
                .prune_tombstones(now, self.tombstone_ttl, self.orphan_tombstone_ttl);
        report
    }

    /// Run `sweep_once` every period until `shutdown` flips
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!("Sweeper running every {:?}", self.period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep_once(Instant::now());
                        if !report.is_empty() {
                            debug!("Sweep: {:?}", report);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Sweeper stopped");
        })
    }
}
