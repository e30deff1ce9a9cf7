//! Tracking engine
//!
//! Owns every component and routes decoded kernel events to them. One
//! engine is constructed per running tracker and shared by reference with
//! the ingestion tasks, the sweeper and the clients.

use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    classifier::ProtocolClassifier,
    closed::{ClosedBuffer, ClosedSlot},
    config::EngineConfig,
    diagnostics::Diagnostics,
    error::ConfigError,
    events::{decode, ConnEventKind, ConnectionEvent, KernelEvent, RecordKind},
    nat::NatResolver,
    ports::PortBindings,
    registry::{Applied, ConnectionRegistry},
    sweeper::{SweepReport, Sweeper},
    tls::{TlsCorrelator, TlsJoin},
    types::{CloseReason, ConnectionKey, ConnectionSnapshot, Direction, StatsDelta, Tuple},
};

/// Everything a client has not seen yet
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    /// Active connections touched since the previous poll
    pub active: Vec<ConnectionSnapshot>,
    /// Connections closed since the previous poll
    pub closed: Vec<Arc<ClosedSlot>>,
    /// Closed connections evicted before this client read them
    pub dropped: u64,
}

#[derive(Default)]
pub(crate) struct EngineCounters {
    pub(crate) events: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) kernel_lost_events: AtomicU64,
    pub(crate) late_samples: AtomicU64,
    pub(crate) late_resolutions: AtomicU64,
}

pub struct Engine {
    config: EngineConfig,
    nat: NatResolver,
    ports: PortBindings,
    classifier: Arc<ProtocolClassifier>,
    tls: Arc<TlsCorrelator>,
    closed: Arc<ClosedBuffer>,
    registry: Arc<ConnectionRegistry>,
    counters: EngineCounters,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let classifier = Arc::new(ProtocolClassifier::new(
            config.classifier_buffer_bytes,
            config.classifier_max_samples,
        ));
        let tls = Arc::new(TlsCorrelator::new(
            config.tls_join_timeout,
            config.tls_max_pending,
        ));
        let closed = Arc::new(ClosedBuffer::new(config.closed_buffer_capacity));
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&classifier),
            Arc::clone(&tls),
            Arc::clone(&closed),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            nat: NatResolver::new(),
            ports: PortBindings::new(),
            classifier,
            tls,
            closed,
            registry,
            counters: EngineCounters::default(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn nat(&self) -> &NatResolver {
        &self.nat
    }

    pub fn ports(&self) -> &PortBindings {
        &self.ports
    }

    pub fn classifier(&self) -> &ProtocolClassifier {
        &self.classifier
    }

    pub fn tls(&self) -> &TlsCorrelator {
        &self.tls
    }

    pub fn closed_buffer(&self) -> &ClosedBuffer {
        &self.closed
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Decode and apply one raw perf record
    pub fn handle_record(&self, kind: RecordKind, bytes: &[u8]) {
        match decode(kind, bytes) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping {} record: {}", kind.map_name(), e);
            }
        }
    }

    pub fn record_lost_events(&self, count: u64) {
        self.counters
            .kernel_lost_events
            .fetch_add(count, Ordering::Relaxed);
        debug!("Kernel reported {} lost events", count);
    }

    pub fn handle_event(&self, event: KernelEvent) {
        self.handle_event_at(event, Instant::now());
    }

    /// Apply one event as if it arrived at `now`
    pub fn handle_event_at(&self, event: KernelEvent, now: Instant) {
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        match event {
            KernelEvent::Connection(conn) => self.handle_connection(conn, now),
            KernelEvent::PortBinding {
                netns,
                port,
                transport,
                bound,
            } => self.ports.apply(netns, port, transport, bound),
            KernelEvent::ByteSample {
                tuple,
                cookie,
                direction,
                data,
            } => {
                let key = self.canonical_key(&tuple, cookie);
                if self.registry.is_tombstoned(&key) {
                    self.counters.late_samples.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let direction = self.resolve_direction(&tuple, direction);
                if let Some(protocol) = self.classifier.observe(&key, direction, &data, now) {
                    self.registry.set_protocol(&key, protocol);
                }
            }
            KernelEvent::TlsPlaintext {
                pid,
                fd,
                library,
                info,
            } => {
                if let Some(join) = self.tls.record_plaintext_event(pid, fd, library, info, now) {
                    self.apply_join(&join, now);
                }
            }
            KernelEvent::SocketResolved {
                pid,
                fd,
                tuple,
                cookie,
            } => {
                let key = self.canonical_key(&tuple, cookie);
                if self.registry.is_tombstoned(&key) {
                    self.counters.late_resolutions.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                if let Some(join) = self.tls.resolve_tuple(pid, fd, key, now) {
                    self.apply_join(&join, now);
                }
            }
            KernelEvent::NatMapping {
                original,
                translated,
                added,
            } => {
                if added {
                    self.nat.add_translation(original, translated);
                } else {
                    self.nat.remove_translation(&original);
                }
            }
        }
    }

    /// Merge a join; a connection that closed meanwhile drops its bindings
    fn apply_join(&self, join: &TlsJoin, now: Instant) {
        if self.registry.apply_tls(join, now) == Applied::Stale {
            self.tls.forget_connection(&join.key);
        }
    }

    fn canonical_key(&self, tuple: &Tuple, cookie: u64) -> ConnectionKey {
        ConnectionKey::new(self.nat.canonicalize(tuple), cookie)
    }

    fn resolve_direction(&self, observed: &Tuple, direction: Direction) -> Direction {
        match direction {
            Direction::Unknown => self.ports.infer_direction(observed),
            known => known,
        }
    }

    fn handle_connection(&self, conn: ConnectionEvent, now: Instant) {
        let key = self.canonical_key(&conn.tuple, conn.cookie);
        let direction = self.resolve_direction(&conn.tuple, conn.direction);
        match conn.kind {
            ConnEventKind::Open | ConnEventKind::Update => {
                self.registry
                    .upsert(&key, &conn.delta, direction, conn.timestamp_ns, now);
            }
            ConnEventKind::Close => {
                self.registry.close(
                    &key,
                    &conn.delta,
                    direction,
                    CloseReason::Kernel,
                    conn.timestamp_ns,
                    now,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    /// Register a client; it sees closures from this point on
    pub fn register_client(&self, id: &str) -> u64 {
        let cursor = self.closed.register_client(id);
        info!("Client '{}' registered", id);
        cursor
    }

    pub fn unregister_client(&self, id: &str) -> bool {
        let removed = self.closed.unregister_client(id);
        if removed {
            info!("Client '{}' unregistered", id);
        }
        removed
    }

    /// Every connection touched since the client's previous poll
    ///
    /// Returns `None` for an unknown client.
    pub fn poll_since(&self, id: &str) -> Option<PollResult> {
        let (batch, mut active) = self
            .closed
            .poll(id, |mark| self.registry.touched_since(mark))?;

        // A connection closed while the poll ran is reported once, as closed.
        if !batch.closed.is_empty() && !active.is_empty() {
            let closed: HashSet<ConnectionKey> =
                batch.closed.iter().map(|slot| slot.snapshot.key).collect();
            active.retain(|snapshot| !closed.contains(&snapshot.key));
        }

        Some(PollResult {
            active,
            closed: batch.closed,
            dropped: batch.dropped,
        })
    }

    pub fn snapshot_active(&self) -> Vec<ConnectionSnapshot> {
        self.registry.snapshot_active()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.classifier),
            Arc::clone(&self.tls),
            Arc::clone(&self.closed),
            &self.config,
        )
    }

    pub fn sweep_once(&self, now: Instant) -> SweepReport {
        self.sweeper().sweep_once(now)
    }

    /// Spawn the periodic sweeper; it stops on shutdown
    pub fn start_sweeper(&self) {
        let handle = self.sweeper().spawn(self.shutdown_signal());
        self.track_task(handle);
    }

    /// Receiver that changes to `true` once shutdown begins
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Keep a task handle so shutdown can wait for it
    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Stop ingestion and the sweeper, close what is still active, release state
    ///
    /// Connections still active are closed with reason `shutdown` so that
    /// registered clients can drain them with a final poll.
    pub async fn shutdown(&self) {
        info!("Shutting down tracking engine...");
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Task ended abnormally during shutdown: {}", e);
            }
        }

        let now = Instant::now();
        let keys = self.registry.active_keys();
        for key in &keys {
            self.registry.close(
                key,
                &StatsDelta::default(),
                Direction::Unknown,
                CloseReason::Shutdown,
                0,
                now,
            );
        }
        info!("Closed {} active connections at shutdown", keys.len());

        self.registry.clear();
        self.classifier.clear();
        self.tls.clear();
        self.nat.clear();
        self.ports.clear();
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::collect(self)
    }

    pub(crate) fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
