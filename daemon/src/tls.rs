//! TLS plaintext correlation
//!
//! Plaintext events from TLS library hooks are keyed by (pid, fd) and carry
//! no tuple. The kernel independently learns which tuple a (pid, fd) refers
//! to. Either side may arrive first; whichever arrives first waits in a
//! bounded, time-ordered table until the other shows up or it expires.

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::types::{ConnectionKey, RequestInfo, TlsLibrary};

/// Process-local socket identity used by the hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PidFd {
    pub pid: u32,
    pub fd: u32,
}

impl PidFd {
    pub fn new(pid: u32, fd: u32) -> Self {
        Self { pid, fd }
    }
}

/// A plaintext request joined to its connection
#[derive(Debug, Clone, PartialEq)]
pub struct TlsJoin {
    pub key: ConnectionKey,
    pub library: TlsLibrary,
    pub info: RequestInfo,
}

struct PendingRecord {
    library: TlsLibrary,
    info: RequestInfo,
    generation: u64,
}

struct ResolvedSocket {
    key: ConnectionKey,
    joined: bool,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Record,
    Join,
}

struct TimelineEntry {
    inserted_at: Instant,
    kind: PendingKind,
    id: PidFd,
    generation: u64,
}

/// Correlator counters for the diagnostics surface
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsStats {
    pub pending_records: u64,
    pub pending_joins: u64,
    pub resolved_sockets: u64,
    pub joined: u64,
    pub replaced_records: u64,
    pub expired_records: u64,
    pub expired_joins: u64,
    /// Requests that expired without a tuple (plaintext-unknown). An expired
    /// join carries no request, so it only counts as `expired_joins`.
    pub unattributed: u64,
}

/// Number of entries removed by one expiry pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsExpiry {
    pub records: usize,
    pub joins: usize,
}

#[derive(Default)]
struct Inner {
    records: HashMap<PidFd, PendingRecord>,
    sockets: HashMap<PidFd, ResolvedSocket>,
    by_key: HashMap<ConnectionKey, Vec<PidFd>>,
    timeline: VecDeque<TimelineEntry>,
    unjoined: usize,
    next_generation: u64,
    stats: TlsStats,
}

impl Inner {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn pending(&self) -> usize {
        self.records.len() + self.unjoined
    }

    fn join(&mut self, id: PidFd, library: TlsLibrary, info: RequestInfo) -> Option<TlsJoin> {
        let socket = self.sockets.get_mut(&id)?;
        if !socket.joined {
            socket.joined = true;
            self.unjoined -= 1;
        }
        self.stats.joined += 1;
        Some(TlsJoin {
            key: socket.key,
            library,
            info,
        })
    }

    fn remove_socket(&mut self, id: &PidFd) {
        let Some(socket) = self.sockets.remove(id) else {
            return;
        };
        if !socket.joined {
            self.unjoined -= 1;
        }
        if let Some(ids) = self.by_key.get_mut(&socket.key) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_key.remove(&socket.key);
            }
        }
    }

    /// Apply the expiry of one timeline entry; stale entries are skipped
    fn expire_entry(&mut self, entry: &TimelineEntry, expiry: &mut TlsExpiry) {
        match entry.kind {
            PendingKind::Record => {
                let current = self.records.get(&entry.id).map(|r| r.generation);
                if current == Some(entry.generation) {
                    self.records.remove(&entry.id);
                    self.stats.expired_records += 1;
                    self.stats.unattributed += 1;
                    expiry.records += 1;
                    debug!(
                        "TLS record for pid={} fd={} expired without a tuple",
                        entry.id.pid, entry.id.fd
                    );
                }
            }
            PendingKind::Join => {
                let waiting = self
                    .sockets
                    .get(&entry.id)
                    .map(|s| s.generation == entry.generation && !s.joined)
                    .unwrap_or(false);
                if waiting {
                    self.remove_socket(&entry.id);
                    self.stats.expired_joins += 1;
                    expiry.joins += 1;
                }
            }
        }
    }

    fn enforce_bound(&mut self, max_pending: usize) {
        let mut evicted = TlsExpiry::default();
        while self.pending() > max_pending {
            let Some(entry) = self.timeline.pop_front() else {
                break;
            };
            self.expire_entry(&entry, &mut evicted);
        }
        if evicted.records + evicted.joins > 0 {
            warn!(
                "TLS correlation table full: evicted {} records and {} joins early",
                evicted.records, evicted.joins
            );
        }
    }
}

/// Joins hook-side plaintext events with kernel-side tuples
pub struct TlsCorrelator {
    inner: Mutex<Inner>,
    timeout: Duration,
    max_pending: usize,
}

impl TlsCorrelator {
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            timeout,
            max_pending,
        }
    }

    /// Store a plaintext request, or join it at once when the tuple is known
    ///
    /// A newer record for the same (pid, fd) replaces a pending one.
    pub fn record_plaintext_event(
        &self,
        pid: u32,
        fd: u32,
        library: TlsLibrary,
        info: RequestInfo,
        now: Instant,
    ) -> Option<TlsJoin> {
        let id = PidFd::new(pid, fd);
        let mut inner = self.inner.lock();
        if inner.sockets.contains_key(&id) {
            return inner.join(id, library, info);
        }

        let generation = inner.generation();
        let previous = inner.records.insert(
            id,
            PendingRecord {
                library,
                info,
                generation,
            },
        );
        if previous.is_some() {
            inner.stats.replaced_records += 1;
        }
        inner.timeline.push_back(TimelineEntry {
            inserted_at: now,
            kind: PendingKind::Record,
            id,
            generation,
        });
        inner.enforce_bound(self.max_pending);
        None
    }

    /// Bind (pid, fd) to a connection, joining any pending record
    pub fn resolve_tuple(
        &self,
        pid: u32,
        fd: u32,
        key: ConnectionKey,
        now: Instant,
    ) -> Option<TlsJoin> {
        let id = PidFd::new(pid, fd);
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.sockets.get(&id) {
            if existing.key == key {
                return None;
            }
            // The descriptor was reused for another socket.
            inner.remove_socket(&id);
        }

        let generation = inner.generation();
        inner.sockets.insert(
            id,
            ResolvedSocket {
                key,
                joined: false,
                generation,
            },
        );
        inner.unjoined += 1;
        inner.by_key.entry(key).or_default().push(id);

        if let Some(record) = inner.records.remove(&id) {
            return inner.join(id, record.library, record.info);
        }

        inner.timeline.push_back(TimelineEntry {
            inserted_at: now,
            kind: PendingKind::Join,
            id,
            generation,
        });
        inner.enforce_bound(self.max_pending);
        None
    }

    /// Expire every pending record or join older than the timeout
    pub fn expire(&self, now: Instant) -> TlsExpiry {
        let mut expiry = TlsExpiry::default();
        let mut inner = self.inner.lock();
        while let Some(front) = inner.timeline.front() {
            if now.saturating_duration_since(front.inserted_at) < self.timeout {
                break;
            }
            if let Some(entry) = inner.timeline.pop_front() {
                inner.expire_entry(&entry, &mut expiry);
            }
        }
        expiry
    }

    /// Forget every (pid, fd) bound to a closed connection
    pub fn forget_connection(&self, key: &ConnectionKey) {
        let mut inner = self.inner.lock();
        if let Some(ids) = inner.by_key.remove(key) {
            for id in ids {
                let matches = inner.sockets.get(&id).map(|s| s.key == *key).unwrap_or(false);
                if matches {
                    inner.remove_socket(&id);
                }
            }
        }
    }

    pub fn stats(&self) -> TlsStats {
        let inner = self.inner.lock();
        TlsStats {
            pending_records: inner.records.len() as u64,
            pending_joins: inner.unjoined as u64,
            resolved_sockets: inner.sockets.len() as u64,
            ..inner.stats.clone()
        }
    }

    pub fn clear(&self) {
        *self.inner.lock() = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Transport, Tuple};
    use std::net::{IpAddr, Ipv4Addr};

    fn key(cookie: u64) -> ConnectionKey {
        ConnectionKey::new(
            Tuple::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                41000,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
                443,
                1,
                Transport::Tcp,
            ),
            cookie,
        )
    }

    fn info(path: &str) -> RequestInfo {
        RequestInfo {
            method: "GET".to_string(),
            path: path.to_string(),
            status_code: 200,
            latency_ns: 10_000,
            plaintext_bytes: 64,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn test_record_then_resolve() {
        let tls = TlsCorrelator::new(TIMEOUT, 16);
        let now = Instant::now();
        assert!(tls
            .record_plaintext_event(1, 5, TlsLibrary::OpenSsl, info("/a"), now)
            .is_none());
        let join = tls.resolve_tuple(1, 5, key(1), now).unwrap();
        assert_eq!(join.key, key(1));
        assert_eq!(join.library, TlsLibrary::OpenSsl);
        assert_eq!(join.info.path, "/a");
        assert_eq!(tls.stats().pending_records, 0);
    }

    #[test]
    fn test_resolve_then_record_within_timeout() {
        let tls = TlsCorrelator::new(TIMEOUT, 16);
        let now = Instant::now();
        assert!(tls.resolve_tuple(1, 5, key(1), now).is_none());
        assert_eq!(tls.stats().pending_joins, 1);

        let later = now + Duration::from_millis(1500);
        assert_eq!(tls.expire(later), TlsExpiry::default());
        let join = tls
            .record_plaintext_event(1, 5, TlsLibrary::GnuTls, info("/b"), later)
            .unwrap();
        assert_eq!(join.key, key(1));
        assert_eq!(join.library, TlsLibrary::GnuTls);

        // Joined sockets keep attributing later requests
        let again = tls
            .record_plaintext_event(1, 5, TlsLibrary::GnuTls, info("/c"), later)
            .unwrap();
        assert_eq!(again.info.path, "/c");
        assert_eq!(tls.stats().joined, 2);
        assert_eq!(tls.stats().pending_joins, 0);
    }

    #[test]
    fn test_expiry_is_deterministic() {
        let tls = TlsCorrelator::new(TIMEOUT, 16);
        let now = Instant::now();
        tls.record_plaintext_event(1, 5, TlsLibrary::OpenSsl, info("/a"), now);
        tls.resolve_tuple(2, 6, key(2), now);

        let just_before = now + TIMEOUT - Duration::from_millis(1);
        assert_eq!(tls.expire(just_before), TlsExpiry::default());

        let expiry = tls.expire(now + TIMEOUT);
        assert_eq!(expiry, TlsExpiry { records: 1, joins: 1 });
        let stats = tls.stats();
        assert_eq!(stats.unattributed, 1);
        assert_eq!(stats.expired_joins, 1);
        assert_eq!(stats.pending_records + stats.pending_joins, 0);

        // Expired join no longer matches
        assert!(tls
            .record_plaintext_event(2, 6, TlsLibrary::OpenSsl, info("/late"), now + TIMEOUT)
            .is_none());
    }

    #[test]
    fn test_expired_join_is_not_an_unattributed_request() {
        let tls = TlsCorrelator::new(TIMEOUT, 16);
        let now = Instant::now();
        tls.resolve_tuple(2, 6, key(2), now);
        assert_eq!(tls.expire(now + TIMEOUT), TlsExpiry { records: 0, joins: 1 });
        let stats = tls.stats();
        assert_eq!(stats.expired_joins, 1);
        assert_eq!(stats.unattributed, 0);
    }

    #[test]
    fn test_last_write_wins_per_key() {
        let tls = TlsCorrelator::new(TIMEOUT, 16);
        let now = Instant::now();
        tls.record_plaintext_event(1, 5, TlsLibrary::OpenSsl, info("/old"), now);
        tls.record_plaintext_event(1, 5, TlsLibrary::OpenSsl, info("/new"), now);
        assert_eq!(tls.stats().replaced_records, 1);

        let join = tls.resolve_tuple(1, 5, key(1), now).unwrap();
        assert_eq!(join.info.path, "/new");

        // The replaced record's timeline entry is stale and expires nothing
        assert_eq!(tls.expire(now + TIMEOUT).records, 0);
    }

    #[test]
    fn test_bound_evicts_oldest() {
        let tls = TlsCorrelator::new(TIMEOUT, 2);
        let now = Instant::now();
        for fd in 0..3 {
            tls.record_plaintext_event(1, fd, TlsLibrary::OpenSsl, info("/x"), now);
        }
        let stats = tls.stats();
        assert_eq!(stats.pending_records, 2);
        assert_eq!(stats.expired_records, 1);
        assert!(tls.resolve_tuple(1, 0, key(1), now).is_none());
        assert!(tls.resolve_tuple(1, 2, key(2), now).is_some());
    }

    #[test]
    fn test_forget_connection() {
        let tls = TlsCorrelator::new(TIMEOUT, 16);
        let now = Instant::now();
        tls.resolve_tuple(1, 5, key(1), now);
        tls.record_plaintext_event(1, 5, TlsLibrary::OpenSsl, info("/a"), now);
        tls.forget_connection(&key(1));
        assert_eq!(tls.stats().resolved_sockets, 0);
        assert!(tls
            .record_plaintext_event(1, 5, TlsLibrary::OpenSsl, info("/b"), now)
            .is_none());
    }

    #[test]
    fn test_fd_reuse_rebinds() {
        let tls = TlsCorrelator::new(TIMEOUT, 16);
        let now = Instant::now();
        tls.resolve_tuple(1, 5, key(1), now);
        tls.resolve_tuple(1, 5, key(2), now);
        let join = tls
            .record_plaintext_event(1, 5, TlsLibrary::OpenSsl, info("/a"), now)
            .unwrap();
        assert_eq!(join.key, key(2));
        assert_eq!(tls.stats().resolved_sockets, 1);
    }
}
