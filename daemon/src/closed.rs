//! Closed-connection buffer with per-client cursors
//!
//! Closed connections are appended to a fixed-capacity ring and stamped
//! with a monotonically increasing sequence number. Every registered client
//! owns a cursor into the ring; producers never wait on clients, so a full
//! ring evicts its oldest slot and lagging clients learn about the loss on
//! their next poll.

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::ConnectionSnapshot;

/// Identifier chosen by a client when it registers
pub type ClientId = String;

/// Immutable snapshot of a connection at close time
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ClosedSlot {
    pub seq: u64,
    pub snapshot: ConnectionSnapshot,
}

/// Result of consuming a client's cursor
#[derive(Debug, Clone, Default)]
pub struct ClosedBatch {
    pub closed: Vec<Arc<ClosedSlot>>,
    /// Slots evicted before this client read them, since its previous poll
    pub dropped: u64,
}

struct Ring {
    slots: VecDeque<Arc<ClosedSlot>>,
    /// Sequence number the next pushed slot will get
    head: u64,
}

impl Ring {
    /// Sequence number of the oldest retained slot
    fn tail(&self) -> u64 {
        self.head - self.slots.len() as u64
    }
}

/// A client's read position
///
/// `next_seq` is read by producers and compaction without locking; the
/// mutex only serializes polls of the same client.
#[derive(Debug)]
struct ClientCursor {
    next_seq: AtomicU64,
    detached: AtomicBool,
    activity_mark: Mutex<u64>,
}

impl ClientCursor {
    fn new(next_seq: u64) -> Self {
        Self {
            next_seq: AtomicU64::new(next_seq),
            detached: AtomicBool::new(false),
            activity_mark: Mutex::new(0),
        }
    }

    fn position(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosedBufferStats {
    pub capacity: u64,
    pub buffered: u64,
    pub head: u64,
    pub tail: u64,
    pub pushed: u64,
    /// Slots evicted while at least one client had not read them
    pub dropped: u64,
    pub compacted: u64,
    pub clients: u64,
}

/// Bounded retention of closed connections, shared by all clients
pub struct ClosedBuffer {
    ring: RwLock<Ring>,
    clients: DashMap<ClientId, Arc<ClientCursor>>,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
    compacted: AtomicU64,
}

impl ClosedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring {
                slots: VecDeque::with_capacity(capacity.min(4096)),
                head: 0,
            }),
            clients: DashMap::new(),
            capacity: capacity.max(1),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            compacted: AtomicU64::new(0),
        }
    }

    /// Register a client positioned at the current head
    ///
    /// Re-registering an existing id resets its cursor. Returns the cursor.
    pub fn register_client(&self, id: &str) -> u64 {
        // Holding the ring keeps compaction from moving the tail past a
        // cursor that is not visible yet.
        let ring = self.ring.read();
        let head = ring.head;
        let previous = self
            .clients
            .insert(id.to_string(), Arc::new(ClientCursor::new(head)));
        drop(ring);
        if let Some(old) = previous {
            old.detached.store(true, Ordering::Release);
        }
        debug!("Client {} registered at seq {}", id, head);
        head
    }

    /// Remove a client; returns false when it was not registered
    ///
    /// Safe to call while a poll for the same client is in flight: that poll
    /// either completes with a final batch or sees the client as gone.
    pub fn unregister_client(&self, id: &str) -> bool {
        match self.clients.remove(id) {
            Some((_, cursor)) => {
                cursor.detached.store(true, Ordering::Release);
                debug!("Client {} unregistered", id);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Append a snapshot, evicting the oldest slot when full
    ///
    /// Returns the slot's sequence number.
    pub fn push(&self, snapshot: ConnectionSnapshot) -> u64 {
        let (seq, evicted) = {
            let mut ring = self.ring.write();
            let seq = ring.head;
            let evicted = if ring.slots.len() >= self.capacity {
                ring.slots.pop_front().map(|slot| slot.seq)
            } else {
                None
            };
            ring.slots.push_back(Arc::new(ClosedSlot { seq, snapshot }));
            ring.head += 1;
            (seq, evicted)
        };
        self.pushed.fetch_add(1, Ordering::Relaxed);

        if let Some(evicted_seq) = evicted {
            let lagging = self.lagging_clients(evicted_seq);
            if lagging > 0 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Closed-connection buffer full: evicted seq {} unread by {} client(s)",
                    evicted_seq, lagging
                );
            }
        }
        seq
    }

    fn lagging_clients(&self, seq: u64) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.value().position() <= seq)
            .count()
    }

    /// Consume everything after the client's cursor and advance it to head
    ///
    /// `active` receives the client's activity mark and returns the active
    /// snapshots to report together with the new mark. Producers never wait
    /// on it. Returns `None` for an unknown client.
    pub fn poll<T, F>(&self, id: &str, active: F) -> Option<(ClosedBatch, T)>
    where
        F: FnOnce(u64) -> (T, u64),
    {
        let cursor = self.clients.get(id).map(|entry| Arc::clone(entry.value()))?;
        let mut mark = cursor.activity_mark.lock();
        if cursor.detached.load(Ordering::Acquire) {
            return None;
        }

        let (active, next_mark) = active(*mark);
        *mark = next_mark;

        let ring = self.ring.read();
        let tail = ring.tail();
        let next_seq = cursor.position();
        let dropped = tail.saturating_sub(next_seq);
        let from = next_seq.max(tail);
        let skip = (from - tail) as usize;
        let closed: Vec<Arc<ClosedSlot>> = ring.slots.iter().skip(skip).cloned().collect();
        cursor.next_seq.store(ring.head, Ordering::Release);
        drop(ring);

        if dropped > 0 {
            warn!("Client {} missed {} closed connections", id, dropped);
        }
        Some((ClosedBatch { closed, dropped }, active))
    }

    /// Release slots every registered client has already consumed
    ///
    /// With no clients registered nothing is retained. Returns the number of
    /// slots released.
    pub fn compact(&self) -> usize {
        let mut ring = self.ring.write();
        let keep_from = self
            .clients
            .iter()
            .map(|entry| entry.value().position())
            .min()
            .unwrap_or(ring.head);
        let mut released = 0;
        while ring.slots.front().map(|s| s.seq < keep_from).unwrap_or(false) {
            ring.slots.pop_front();
            released += 1;
        }
        drop(ring);
        if released > 0 {
            self.compacted.fetch_add(released as u64, Ordering::Relaxed);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.ring.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ClosedBufferStats {
        let (buffered, head, tail) = {
            let ring = self.ring.read();
            (ring.slots.len() as u64, ring.head, ring.tail())
        };
        ClosedBufferStats {
            capacity: self.capacity as u64,
            buffered,
            head,
            tail,
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            compacted: self.compacted.load(Ordering::Relaxed),
            clients: self.clients.len() as u64,
        }
    }

    /// Drop retained slots; cursors keep their positions
    pub fn clear(&self) {
        self.ring.write().slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ConnectionKey, Direction, Lifecycle, RttSample, Transport, Tuple,
    };
    use std::net::{IpAddr, Ipv4Addr};

    fn snapshot(cookie: u64) -> ConnectionSnapshot {
        ConnectionSnapshot {
            key: ConnectionKey::new(
                Tuple::new(
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                    30000,
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                    80,
                    1,
                    Transport::Tcp,
                ),
                cookie,
            ),
            direction: Direction::Outgoing,
            sent_bytes: 0,
            recv_bytes: 0,
            sent_packets: 0,
            recv_packets: 0,
            retransmits: 0,
            rtt: RttSample::default(),
            tcp_state: None,
            tcp_state_transitions: 0,
            protocol: None,
            tls: None,
            tags: Vec::new(),
            lifecycle: Lifecycle::Buffered,
            close_reason: None,
            first_seen_ns: 0,
            last_seen_ns: 0,
        }
    }

    fn poll(buffer: &ClosedBuffer, id: &str) -> ClosedBatch {
        buffer.poll(id, |mark| ((), mark)).unwrap().0
    }

    #[test]
    fn test_new_client_sees_no_history() {
        let buffer = ClosedBuffer::new(8);
        buffer.push(snapshot(1));
        buffer.register_client("a");

        let batch = poll(&buffer, "a");
        assert!(batch.closed.is_empty());
        assert_eq!(batch.dropped, 0);

        buffer.push(snapshot(2));
        let batch = poll(&buffer, "a");
        assert_eq!(batch.closed.len(), 1);
        assert_eq!(batch.closed[0].snapshot.key.cookie, 2);
        assert!(poll(&buffer, "a").closed.is_empty());
    }

    #[test]
    fn test_overflow_reports_dropped() {
        let buffer = ClosedBuffer::new(100);
        buffer.register_client("a");
        for cookie in 0..150 {
            buffer.push(snapshot(cookie));
        }
        let batch = poll(&buffer, "a");
        assert_eq!(batch.closed.len(), 100);
        assert_eq!(batch.dropped, 50);
        assert_eq!(batch.closed[0].seq, 50);
        assert_eq!(buffer.stats().dropped, 50);

        // Dropped is reported once per overflow
        assert_eq!(poll(&buffer, "a").dropped, 0);
    }

    #[test]
    fn test_clients_are_independent() {
        let buffer = ClosedBuffer::new(16);
        buffer.register_client("a");
        buffer.register_client("b");
        buffer.push(snapshot(1));
        assert_eq!(poll(&buffer, "a").closed.len(), 1);
        buffer.push(snapshot(2));
        assert_eq!(poll(&buffer, "b").closed.len(), 2);
        assert_eq!(poll(&buffer, "a").closed.len(), 1);
    }

    #[test]
    fn test_compact_respects_slowest_cursor() {
        let buffer = ClosedBuffer::new(16);
        buffer.register_client("fast");
        buffer.register_client("slow");
        for cookie in 0..4 {
            buffer.push(snapshot(cookie));
        }
        poll(&buffer, "fast");
        assert_eq!(buffer.compact(), 0);

        buffer.unregister_client("slow");
        assert_eq!(buffer.compact(), 4);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_compact_without_clients_releases_everything() {
        let buffer = ClosedBuffer::new(4);
        buffer.push(snapshot(1));
        buffer.push(snapshot(2));
        assert_eq!(buffer.compact(), 2);
        assert_eq!(buffer.stats().head, 2);
    }

    #[test]
    fn test_unknown_or_unregistered_client() {
        let buffer = ClosedBuffer::new(4);
        assert!(buffer.poll("ghost", |mark| ((), mark)).is_none());
        buffer.register_client("a");
        assert!(buffer.unregister_client("a"));
        assert!(!buffer.unregister_client("a"));
        assert!(buffer.poll("a", |mark| ((), mark)).is_none());
    }

    #[test]
    fn test_activity_mark_round_trips() {
        let buffer = ClosedBuffer::new(4);
        buffer.register_client("a");
        let (_, seen) = buffer.poll("a", |mark| (mark, 7)).unwrap();
        assert_eq!(seen, 0);
        let (_, seen) = buffer.poll("a", |mark| (mark, 9)).unwrap();
        assert_eq!(seen, 7);
    }

    #[test]
    fn test_push_does_not_wait_for_poll() {
        use std::sync::mpsc;
        use std::time::{Duration, Instant};

        let buffer = Arc::new(ClosedBuffer::new(1));
        buffer.register_client("slow");
        buffer.push(snapshot(1));

        let (entered_tx, entered_rx) = mpsc::channel();
        let poller = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                buffer.poll("slow", |mark| {
                    entered_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(500));
                    ((), mark)
                })
            })
        };
        entered_rx.recv().unwrap();

        // The ring is full, so this push evicts and checks every cursor.
        let started = Instant::now();
        buffer.push(snapshot(2));
        buffer.compact();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(poller.join().unwrap().is_some());
    }

    #[test]
    fn test_registration_racing_compaction_reports_no_drops() {
        let buffer = Arc::new(ClosedBuffer::new(1 << 20));
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for cookie in 0..20_000 {
                    buffer.push(snapshot(cookie));
                    buffer.compact();
                }
            })
        };
        for i in 0..2_000 {
            let id = format!("client-{}", i);
            buffer.register_client(&id);
            assert_eq!(poll(&buffer, &id).dropped, 0);
            buffer.unregister_client(&id);
        }
        producer.join().unwrap();
    }
}
