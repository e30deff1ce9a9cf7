//! Connection registry
//!
//! The canonical state table: one entry per active flow, keyed by the
//! canonical tuple plus socket cookie. Entries live in a sharded map so
//! ingestion for distinct flows does not serialize, and all mutation of a
//! single entry happens under its shard lock.
//!
//! Closed keys leave a tombstone behind so that late or duplicated kernel
//! events cannot resurrect them. A key closed by the kernel keeps its
//! tombstone for a short TTL. A key closed by the sweeper still has a live
//! socket, so its tombstone stays until the kernel close arrives or a much
//! longer orphan TTL runs out.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::classifier::ProtocolClassifier;
use crate::closed::ClosedBuffer;
use crate::tls::{TlsCorrelator, TlsJoin};
use crate::types::{
    CloseReason, ConnectionKey, ConnectionSnapshot, Direction, Lifecycle, Protocol, RttSample,
    StatsDelta, TcpState, TlsStats,
};

/// Outcome of applying an event to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    /// The key was closed recently; the event was discarded
    Stale,
}

/// Outcome of a close request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// Snapshot buffered under this sequence number
    Buffered(u64),
    /// The key was already closed; nothing changed
    Duplicate,
}

struct ConnectionEntry {
    direction: Direction,
    sent_bytes: u64,
    recv_bytes: u64,
    sent_packets: u64,
    recv_packets: u64,
    retransmits: u64,
    rtt: RttSample,
    tcp_state: Option<TcpState>,
    tcp_state_transitions: u16,
    protocol: Option<Protocol>,
    tls: Option<TlsStats>,
    tags: Vec<&'static str>,
    lifecycle: Lifecycle,
    first_seen_ns: u64,
    last_seen_ns: u64,
    last_activity: Instant,
    touched: u64,
}

impl ConnectionEntry {
    fn new(direction: Direction, protocol: Option<Protocol>, ts_ns: u64, now: Instant) -> Self {
        Self {
            direction,
            sent_bytes: 0,
            recv_bytes: 0,
            sent_packets: 0,
            recv_packets: 0,
            retransmits: 0,
            rtt: RttSample::default(),
            tcp_state: None,
            tcp_state_transitions: 0,
            protocol,
            tls: None,
            tags: Vec::new(),
            lifecycle: Lifecycle::Active,
            first_seen_ns: ts_ns,
            last_seen_ns: ts_ns,
            last_activity: now,
            touched: 0,
        }
    }

    /// Apply an already clamped delta
    fn apply(&mut self, delta: &StatsDelta) {
        self.sent_bytes = self.sent_bytes.saturating_add(delta.sent_bytes as u64);
        self.recv_bytes = self.recv_bytes.saturating_add(delta.recv_bytes as u64);
        self.sent_packets = self.sent_packets.saturating_add(delta.sent_packets as u64);
        self.recv_packets = self.recv_packets.saturating_add(delta.recv_packets as u64);
        self.retransmits = self.retransmits.saturating_add(delta.retransmits as u64);
        if let Some(rtt) = delta.rtt {
            self.rtt = rtt;
        }
        if let Some(state) = delta.tcp_state {
            self.tcp_state = Some(state);
            self.tcp_state_transitions |= state.bit();
        }
    }

    fn touch(&mut self, direction: Direction, ts_ns: u64, now: Instant, seq: u64) {
        if self.direction == Direction::Unknown {
            self.direction = direction;
        }
        self.last_seen_ns = self.last_seen_ns.max(ts_ns);
        self.last_activity = now;
        self.touched = seq;
    }

    fn merge_tls(&mut self, join: &TlsJoin) {
        let stats = self.tls.get_or_insert_with(|| TlsStats::new(join.library));
        stats.merge(&join.info);
        let tag = join.library.tag();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    fn snapshot(&self, key: &ConnectionKey, close_reason: Option<CloseReason>) -> ConnectionSnapshot {
        ConnectionSnapshot {
            key: *key,
            direction: self.direction,
            sent_bytes: self.sent_bytes,
            recv_bytes: self.recv_bytes,
            sent_packets: self.sent_packets,
            recv_packets: self.recv_packets,
            retransmits: self.retransmits,
            rtt: self.rtt,
            tcp_state: self.tcp_state,
            tcp_state_transitions: self.tcp_state_transitions,
            protocol: self.protocol,
            tls: self.tls.clone(),
            tags: self.tags.clone(),
            lifecycle: self.lifecycle,
            close_reason,
            first_seen_ns: self.first_seen_ns,
            last_seen_ns: self.last_seen_ns,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    closed_at: Instant,
    reason: CloseReason,
}

impl Tombstone {
    fn new(closed_at: Instant, reason: CloseReason) -> Self {
        Self { closed_at, reason }
    }

    /// The kernel has not reported this socket closed yet
    fn awaits_kernel_close(&self) -> bool {
        self.reason != CloseReason::Kernel
    }
}

#[derive(Default)]
struct RegistryCounters {
    opened: AtomicU64,
    closed: AtomicU64,
    idle_closed: AtomicU64,
    shutdown_closed: AtomicU64,
    stale_events: AtomicU64,
    duplicate_closes: AtomicU64,
    counter_regressions: AtomicU64,
}

/// Registry counters for the diagnostics surface
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active: u64,
    pub tombstones: u64,
    pub opened: u64,
    pub closed: u64,
    pub idle_closed: u64,
    pub shutdown_closed: u64,
    pub stale_events: u64,
    pub duplicate_closes: u64,
    pub counter_regressions: u64,
}

/// Canonical table of active connections
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionKey, ConnectionEntry>,
    tombstones: DashMap<ConnectionKey, Tombstone>,
    activity: AtomicU64,
    counters: RegistryCounters,
    classifier: Arc<ProtocolClassifier>,
    tls: Arc<TlsCorrelator>,
    closed: Arc<ClosedBuffer>,
}

impl ConnectionRegistry {
    pub fn new(
        classifier: Arc<ProtocolClassifier>,
        tls: Arc<TlsCorrelator>,
        closed: Arc<ClosedBuffer>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            tombstones: DashMap::new(),
            activity: AtomicU64::new(0),
            counters: RegistryCounters::default(),
            classifier,
            tls,
            closed,
        }
    }

    fn next_activity(&self) -> u64 {
        self.activity.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn clamp(&self, key: &ConnectionKey, delta: &StatsDelta) -> StatsDelta {
        let (delta, regressed) = delta.clamped();
        if regressed {
            self.counters.counter_regressions.fetch_add(1, Ordering::Relaxed);
            debug!("Counter regression on {} clamped to zero", key);
        }
        delta
    }

    fn stale(&self, key: &ConnectionKey) -> Applied {
        self.counters.stale_events.fetch_add(1, Ordering::Relaxed);
        debug!("Discarding stale event for closed {}", key);
        Applied::Stale
    }

    /// Run `f` against the key's entry, creating it when missing
    ///
    /// The tombstone check happens under the entry's shard lock so a
    /// concurrent close cannot be undone.
    fn with_entry<F>(
        &self,
        key: &ConnectionKey,
        direction: Direction,
        ts_ns: u64,
        now: Instant,
        f: F,
    ) -> Applied
    where
        F: FnOnce(&mut ConnectionEntry),
    {
        // Activity sequence numbers are taken under the shard lock so a
        // concurrent `touched_since` scan cannot miss the update.
        match self.entries.entry(*key) {
            Entry::Occupied(mut occupied) => {
                let seq = self.next_activity();
                let entry = occupied.get_mut();
                f(entry);
                entry.touch(direction, ts_ns, now, seq);
                Applied::Updated
            }
            Entry::Vacant(vacant) => {
                if self.tombstones.contains_key(key) {
                    return self.stale(key);
                }
                let seq = self.next_activity();
                let mut entry =
                    ConnectionEntry::new(direction, self.classifier.protocol(key), ts_ns, now);
                f(&mut entry);
                entry.touch(direction, ts_ns, now, seq);
                vacant.insert(entry);
                self.counters.opened.fetch_add(1, Ordering::Relaxed);
                debug!("Tracking {}", key);
                Applied::Created
            }
        }
    }

    /// Create or update an active entry with a counter delta
    ///
    /// Negative counter deltas are clamped to zero and counted.
    pub fn upsert(
        &self,
        key: &ConnectionKey,
        delta: &StatsDelta,
        direction: Direction,
        ts_ns: u64,
        now: Instant,
    ) -> Applied {
        let delta = self.clamp(key, delta);
        self.with_entry(key, direction, ts_ns, now, |entry| entry.apply(&delta))
    }

    /// Close a connection and buffer its final snapshot
    ///
    /// The final delta is applied first. A close for a key that was never
    /// seen creates the entry from the delta and closes it at once. Closing
    /// also drops the flow's classifier and TLS correlation state.
    pub fn close(
        &self,
        key: &ConnectionKey,
        delta: &StatsDelta,
        direction: Direction,
        reason: CloseReason,
        ts_ns: u64,
        now: Instant,
    ) -> Closed {
        match self.tombstones.entry(*key) {
            Entry::Occupied(mut occupied) => {
                // The kernel close for a sweeper-closed key ends its wait.
                if reason == CloseReason::Kernel && occupied.get().awaits_kernel_close() {
                    occupied.insert(Tombstone::new(now, CloseReason::Kernel));
                }
                self.counters.duplicate_closes.fetch_add(1, Ordering::Relaxed);
                debug!("Duplicate close for {}", key);
                return Closed::Duplicate;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Tombstone::new(now, reason));
            }
        }

        let entry = match self.entries.remove(key) {
            Some((_, entry)) => entry,
            None => {
                self.counters.opened.fetch_add(1, Ordering::Relaxed);
                ConnectionEntry::new(direction, None, ts_ns, now)
            }
        };
        self.finalize(key, entry, delta, direction, reason, ts_ns)
    }

    /// Close every entry idle for at least `threshold`
    ///
    /// Idleness is rechecked under the entry's shard lock, so an update that
    /// lands after the scan keeps the connection open. Returns how many
    /// connections were closed.
    pub fn close_idle(&self, now: Instant, threshold: Duration) -> usize {
        let mut closed = 0;
        for key in self.idle_keys(now, threshold) {
            let entry = match self.entries.entry(key) {
                Entry::Occupied(occupied) => {
                    let idle = now.saturating_duration_since(occupied.get().last_activity);
                    if idle < threshold {
                        continue;
                    }
                    match self.tombstones.entry(key) {
                        // A kernel close is already removing it.
                        Entry::Occupied(_) => continue,
                        Entry::Vacant(vacant) => {
                            vacant.insert(Tombstone::new(now, CloseReason::IdleTimeout));
                        }
                    }
                    occupied.remove()
                }
                Entry::Vacant(_) => continue,
            };
            self.finalize(
                &key,
                entry,
                &StatsDelta::default(),
                Direction::Unknown,
                CloseReason::IdleTimeout,
                0,
            );
            closed += 1;
        }
        closed
    }

    /// Apply the final delta and buffer the snapshot of a removed entry
    fn finalize(
        &self,
        key: &ConnectionKey,
        mut entry: ConnectionEntry,
        delta: &StatsDelta,
        direction: Direction,
        reason: CloseReason,
        ts_ns: u64,
    ) -> Closed {
        let delta = self.clamp(key, delta);
        entry.apply(&delta);
        if entry.direction == Direction::Unknown {
            entry.direction = direction;
        }
        entry.last_seen_ns = entry.last_seen_ns.max(ts_ns);
        entry.lifecycle = Lifecycle::Closing;

        if let Some(protocol) = self.classifier.finish(key) {
            entry.protocol = Some(protocol);
        }
        self.tls.forget_connection(key);

        entry.lifecycle = Lifecycle::Buffered;
        let seq = self.closed.push(entry.snapshot(key, Some(reason)));

        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        match reason {
            CloseReason::IdleTimeout => {
                self.counters.idle_closed.fetch_add(1, Ordering::Relaxed);
            }
            CloseReason::Shutdown => {
                self.counters.shutdown_closed.fetch_add(1, Ordering::Relaxed);
            }
            CloseReason::Kernel => {}
        }
        debug!("Closed {} ({:?}) as seq {}", key, reason, seq);
        Closed::Buffered(seq)
    }

    /// Record the classifier's verdict on an active entry
    pub fn set_protocol(&self, key: &ConnectionKey, protocol: Protocol) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.protocol = Some(protocol);
                entry.touched = self.next_activity();
                true
            }
            None => false,
        }
    }

    /// Merge a joined TLS request into its connection
    pub fn apply_tls(&self, join: &TlsJoin, now: Instant) -> Applied {
        self.with_entry(&join.key, Direction::Unknown, 0, now, |entry| entry.merge_tls(join))
    }

    pub fn is_tombstoned(&self, key: &ConnectionKey) -> bool {
        self.tombstones.contains_key(key)
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<ConnectionSnapshot> {
        self.entries.get(key).map(|entry| entry.snapshot(key, None))
    }

    /// Copy of every active entry
    ///
    /// Each entry is copied under its own shard lock, so no snapshot is torn.
    pub fn snapshot_active(&self) -> Vec<ConnectionSnapshot> {
        self.entries
            .iter()
            .map(|entry| entry.value().snapshot(entry.key(), None))
            .collect()
    }

    /// Active entries touched after `mark`, plus the mark to pass next time
    pub fn touched_since(&self, mark: u64) -> (Vec<ConnectionSnapshot>, u64) {
        let next_mark = self.activity.load(Ordering::Acquire);
        let snapshots = self
            .entries
            .iter()
            .filter(|entry| entry.value().touched > mark)
            .map(|entry| entry.value().snapshot(entry.key(), None))
            .collect();
        (snapshots, next_mark)
    }

    /// Active keys with no activity for at least `threshold`
    pub fn idle_keys(&self, now: Instant, threshold: Duration) -> Vec<ConnectionKey> {
        self.entries
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().last_activity) >= threshold)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn active_keys(&self) -> Vec<ConnectionKey> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Forget expired tombstones; returns how many were removed
    ///
    /// Kernel-closed keys expire after `ttl`. Keys closed by the sweeper
    /// wait for their kernel close, up to `orphan_ttl`.
    pub fn prune_tombstones(&self, now: Instant, ttl: Duration, orphan_ttl: Duration) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, tombstone| {
            let limit = if tombstone.awaits_kernel_close() {
                orphan_ttl
            } else {
                ttl
            };
            now.saturating_duration_since(tombstone.closed_at) < limit
        });
        before.saturating_sub(self.tombstones.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let c = &self.counters;
        RegistryStats {
            active: self.entries.len() as u64,
            tombstones: self.tombstones.len() as u64,
            opened: c.opened.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            idle_closed: c.idle_closed.load(Ordering::Relaxed),
            shutdown_closed: c.shutdown_closed.load(Ordering::Relaxed),
            stale_events: c.stale_events.load(Ordering::Relaxed),
            duplicate_closes: c.duplicate_closes.load(Ordering::Relaxed),
            counter_regressions: c.counter_regressions.load(Ordering::Relaxed),
        }
    }

    /// Release all entries and tombstones
    pub fn clear(&self) {
        self.entries.clear();
        self.tombstones.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RequestInfo, TlsLibrary, Transport, Tuple};
    use std::net::{IpAddr, Ipv4Addr};

    fn registry(capacity: usize) -> (ConnectionRegistry, Arc<ClosedBuffer>) {
        let closed = Arc::new(ClosedBuffer::new(capacity));
        let registry = ConnectionRegistry::new(
            Arc::new(ProtocolClassifier::new(512, 8)),
            Arc::new(TlsCorrelator::new(Duration::from_secs(2), 64)),
            Arc::clone(&closed),
        );
        (registry, closed)
    }

    fn key(cookie: u64) -> ConnectionKey {
        ConnectionKey::new(
            Tuple::new(
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
                50000,
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
                80,
                1,
                Transport::Tcp,
            ),
            cookie,
        )
    }

    #[test]
    fn test_upsert_accumulates() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        assert_eq!(
            registry.upsert(&key(1), &StatsDelta::bytes(10, 20), Direction::Outgoing, 1, now),
            Applied::Created
        );
        assert_eq!(
            registry.upsert(&key(1), &StatsDelta::bytes(5, 0), Direction::Outgoing, 2, now),
            Applied::Updated
        );
        let snap = registry.get(&key(1)).unwrap();
        assert_eq!(snap.sent_bytes, 15);
        assert_eq!(snap.recv_bytes, 20);
        assert_eq!(snap.first_seen_ns, 1);
        assert_eq!(snap.last_seen_ns, 2);
        assert_eq!(snap.lifecycle, Lifecycle::Active);
    }

    #[test]
    fn test_negative_delta_is_clamped() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        registry.upsert(&key(1), &StatsDelta::bytes(100, 0), Direction::Outgoing, 0, now);
        registry.upsert(&key(1), &StatsDelta::bytes(-40, 3), Direction::Outgoing, 0, now);
        let snap = registry.get(&key(1)).unwrap();
        assert_eq!(snap.sent_bytes, 100);
        assert_eq!(snap.recv_bytes, 3);
        assert_eq!(registry.stats().counter_regressions, 1);
    }

    #[test]
    fn test_close_buffers_final_snapshot_once() {
        let (registry, closed) = registry(8);
        closed.register_client("c");
        let now = Instant::now();
        registry.upsert(&key(1), &StatsDelta::bytes(10, 0), Direction::Outgoing, 0, now);
        assert_eq!(
            registry.close(&key(1), &StatsDelta::bytes(1, 1), Direction::Outgoing, CloseReason::Kernel, 9, now),
            Closed::Buffered(0)
        );
        assert_eq!(
            registry.close(&key(1), &StatsDelta::bytes(50, 50), Direction::Outgoing, CloseReason::Kernel, 10, now),
            Closed::Duplicate
        );

        let (batch, _) = closed.poll("c", |m| ((), m)).unwrap();
        assert_eq!(batch.closed.len(), 1);
        let snap = &batch.closed[0].snapshot;
        assert_eq!(snap.sent_bytes, 11);
        assert_eq!(snap.recv_bytes, 1);
        assert_eq!(snap.lifecycle, Lifecycle::Buffered);
        assert_eq!(snap.close_reason, Some(CloseReason::Kernel));
        assert!(registry.is_empty());

        let stats = registry.stats();
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.duplicate_closes, 1);
    }

    #[test]
    fn test_events_after_close_are_stale() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        registry.upsert(&key(1), &StatsDelta::bytes(1, 1), Direction::Outgoing, 0, now);
        registry.close(&key(1), &StatsDelta::default(), Direction::Outgoing, CloseReason::Kernel, 0, now);
        assert_eq!(
            registry.upsert(&key(1), &StatsDelta::bytes(1, 1), Direction::Outgoing, 0, now),
            Applied::Stale
        );
        assert!(registry.is_empty());
        assert_eq!(registry.stats().stale_events, 1);

        // A reused tuple with a new cookie is a different connection
        assert_eq!(
            registry.upsert(&key(2), &StatsDelta::bytes(1, 1), Direction::Outgoing, 0, now),
            Applied::Created
        );
    }

    #[test]
    fn test_close_of_unknown_key_is_buffered() {
        let (registry, closed) = registry(8);
        closed.register_client("c");
        let now = Instant::now();
        assert_eq!(
            registry.close(
                &key(3),
                &StatsDelta::bytes(7, 8),
                Direction::Outgoing,
                CloseReason::Kernel,
                0,
                now
            ),
            Closed::Buffered(0)
        );
        assert_eq!(closed.len(), 1);
        let (batch, _) = closed.poll("c", |m| ((), m)).unwrap();
        let snap = &batch.closed[0].snapshot;
        assert_eq!(snap.direction, Direction::Outgoing);
        assert_eq!(snap.sent_bytes, 7);
    }

    #[test]
    fn test_tombstones_expire() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        registry.close(&key(1), &StatsDelta::default(), Direction::Outgoing, CloseReason::Kernel, 0, now);
        let ttl = Duration::from_secs(30);
        let orphan_ttl = Duration::from_secs(3600);
        assert_eq!(registry.prune_tombstones(now + Duration::from_secs(1), ttl, orphan_ttl), 0);
        assert_eq!(registry.prune_tombstones(now + ttl, ttl, orphan_ttl), 1);
        assert!(!registry.is_tombstoned(&key(1)));
    }

    #[test]
    fn test_idle_closed_key_waits_for_kernel_close() {
        let (registry, closed) = registry(8);
        closed.register_client("c");
        let now = Instant::now();
        let ttl = Duration::from_secs(30);
        let orphan_ttl = Duration::from_secs(3600);
        registry.upsert(&key(1), &StatsDelta::bytes(10, 0), Direction::Outgoing, 0, now);
        assert_eq!(registry.close_idle(now + Duration::from_secs(120), Duration::from_secs(120)), 1);

        // The socket is still alive; its tombstone outlives the short TTL.
        let later = now + Duration::from_secs(120) + ttl;
        assert_eq!(registry.prune_tombstones(later, ttl, orphan_ttl), 0);
        assert_eq!(
            registry.upsert(&key(1), &StatsDelta::bytes(5, 0), Direction::Outgoing, 0, later),
            Applied::Stale
        );
        assert_eq!(
            registry.close(&key(1), &StatsDelta::default(), Direction::Outgoing, CloseReason::Kernel, 0, later),
            Closed::Duplicate
        );

        let (batch, _) = closed.poll("c", |m| ((), m)).unwrap();
        assert_eq!(batch.closed.len(), 1);
        assert_eq!(batch.closed[0].snapshot.close_reason, Some(CloseReason::IdleTimeout));

        // Once the kernel close is consumed the short TTL applies again.
        assert_eq!(registry.prune_tombstones(later + ttl, ttl, orphan_ttl), 1);
    }

    #[test]
    fn test_orphan_tombstone_expires_after_long_ttl() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        let ttl = Duration::from_secs(30);
        let orphan_ttl = Duration::from_secs(3600);
        registry.upsert(&key(1), &StatsDelta::bytes(1, 0), Direction::Outgoing, 0, now);
        registry.close_idle(now, Duration::ZERO);
        assert_eq!(registry.prune_tombstones(now + ttl, ttl, orphan_ttl), 0);
        assert_eq!(registry.prune_tombstones(now + orphan_ttl, ttl, orphan_ttl), 1);
    }

    #[test]
    fn test_close_idle_skips_refreshed_entry() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        let threshold = Duration::from_secs(60);
        registry.upsert(&key(1), &StatsDelta::bytes(1, 0), Direction::Outgoing, 0, now);

        // Scan sees the entry idle, then an update refreshes it.
        let sweep_at = now + threshold;
        assert_eq!(registry.idle_keys(sweep_at, threshold), vec![key(1)]);
        registry.upsert(&key(1), &StatsDelta::bytes(1, 0), Direction::Outgoing, 0, sweep_at);

        assert_eq!(registry.close_idle(sweep_at, threshold), 0);
        assert!(registry.contains(&key(1)));
        assert!(!registry.is_tombstoned(&key(1)));
    }

    #[test]
    fn test_tcp_state_and_rtt() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        let mut delta = StatsDelta::bytes(0, 0);
        delta.tcp_state = Some(TcpState::SynSent);
        delta.rtt = Some(RttSample { rtt_us: 100, rtt_var_us: 10 });
        registry.upsert(&key(1), &delta, Direction::Outgoing, 0, now);
        delta.tcp_state = Some(TcpState::Established);
        delta.rtt = Some(RttSample { rtt_us: 80, rtt_var_us: 5 });
        registry.upsert(&key(1), &delta, Direction::Outgoing, 0, now);

        let snap = registry.get(&key(1)).unwrap();
        assert_eq!(snap.tcp_state, Some(TcpState::Established));
        assert_eq!(
            snap.tcp_state_transitions,
            TcpState::SynSent.bit() | TcpState::Established.bit()
        );
        assert_eq!(snap.rtt.rtt_us, 80);
    }

    #[test]
    fn test_tls_join_tags_entry() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        registry.upsert(&key(1), &StatsDelta::bytes(1, 1), Direction::Outgoing, 0, now);
        let join = TlsJoin {
            key: key(1),
            library: TlsLibrary::GnuTls,
            info: RequestInfo {
                method: "GET".to_string(),
                path: "/200/foobar".to_string(),
                status_code: 200,
                latency_ns: 1,
                plaintext_bytes: 10,
            },
        };
        registry.apply_tls(&join, now);
        registry.apply_tls(&join, now);

        let snap = registry.get(&key(1)).unwrap();
        assert_eq!(snap.tags, vec!["tls.library:gnutls"]);
        assert_eq!(snap.tls.unwrap().request_count, 2);
    }

    #[test]
    fn test_touched_since_tracks_activity() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        registry.upsert(&key(1), &StatsDelta::bytes(1, 0), Direction::Outgoing, 0, now);
        registry.upsert(&key(2), &StatsDelta::bytes(1, 0), Direction::Outgoing, 0, now);
        let (all, mark) = registry.touched_since(0);
        assert_eq!(all.len(), 2);

        registry.upsert(&key(2), &StatsDelta::bytes(1, 0), Direction::Outgoing, 0, now);
        let (touched, _) = registry.touched_since(mark);
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].key, key(2));
    }

    #[test]
    fn test_idle_keys() {
        let (registry, _) = registry(8);
        let now = Instant::now();
        registry.upsert(&key(1), &StatsDelta::bytes(1, 0), Direction::Outgoing, 0, now);
        let later = now + Duration::from_secs(60);
        registry.upsert(&key(2), &StatsDelta::bytes(1, 0), Direction::Outgoing, 0, later);
        assert_eq!(
            registry.idle_keys(later, Duration::from_secs(30)),
            vec![key(1)]
        );
    }
}
