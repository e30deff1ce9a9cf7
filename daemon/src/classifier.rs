//! Application protocol classification
//!
//! Each flow accumulates the first bytes seen in each direction into a
//! bounded buffer. The buffer is checked against an ordered list of
//! signature predicates; the outcome depends only on the bytes, never on
//! how they were split across samples.

use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::{ConnectionKey, Direction, Protocol};

/// Result of a single signature check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Match,
    NeedMore,
    NoMatch,
}

pub type Signature = (Protocol, fn(&[u8]) -> Check);

/// Signatures in precedence order. gRPC sits before HTTP/2, its carrier.
pub const SIGNATURES: &[Signature] = &[
    (Protocol::Tls, is_tls_handshake),
    (Protocol::Grpc, is_grpc),
    (Protocol::Http2, is_http2),
    (Protocol::Http, is_http1),
];

/// Outcome of classifying a byte buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A signature matched and every higher-precedence check ruled itself out
    Classified(Protocol),
    /// Some check needs more bytes; `provisional` is the first lower-precedence match
    Pending { provisional: Option<Protocol> },
    /// Every check ruled itself out
    Unknown,
}

/// Classify a buffer against [`SIGNATURES`]
pub fn classify(data: &[u8]) -> Verdict {
    if data.is_empty() {
        return Verdict::Pending { provisional: None };
    }

    let mut waiting = false;
    let mut provisional = None;
    for (protocol, check) in SIGNATURES {
        match check(data) {
            Check::Match if !waiting => return Verdict::Classified(*protocol),
            Check::Match => {
                provisional.get_or_insert(*protocol);
            }
            Check::NeedMore => waiting = true,
            Check::NoMatch => {}
        }
    }

    if waiting {
        Verdict::Pending { provisional }
    } else {
        Verdict::Unknown
    }
}

/// Resolve a buffer when no more bytes will arrive
pub fn classify_final(data: &[u8]) -> Option<Protocol> {
    match classify(data) {
        Verdict::Classified(protocol) => Some(protocol),
        Verdict::Pending {
            provisional: Some(protocol),
        } => Some(protocol),
        Verdict::Pending { provisional: None } if data.is_empty() => None,
        _ => Some(Protocol::Unknown),
    }
}

// ============================================================================
// Signature checks
// ============================================================================

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const TLS_MAX_RECORD_LEN: u16 = 16384 + 2048;
const TLS_HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const TLS_HANDSHAKE_SERVER_HELLO: u8 = 0x02;

/// TLS record header carrying a ClientHello or ServerHello
pub fn is_tls_handshake(data: &[u8]) -> Check {
    if data[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return Check::NoMatch;
    }
    if data.len() < 2 {
        return Check::NeedMore;
    }
    if data[1] != 0x03 {
        return Check::NoMatch;
    }
    if data.len() < 3 {
        return Check::NeedMore;
    }
    if data[2] > 0x04 {
        return Check::NoMatch;
    }
    if data.len() < 5 {
        return Check::NeedMore;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]);
    if record_len == 0 || record_len > TLS_MAX_RECORD_LEN {
        return Check::NoMatch;
    }
    if data.len() < 6 {
        return Check::NeedMore;
    }
    match data[5] {
        TLS_HANDSHAKE_CLIENT_HELLO | TLS_HANDSHAKE_SERVER_HELLO => Check::Match,
        _ => Check::NoMatch,
    }
}

pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const HTTP2_FRAME_HEADER_LEN: usize = 9;
const HTTP2_FRAME_HEADERS: u8 = 0x01;
const HTTP2_FRAME_SETTINGS: u8 = 0x04;
const HTTP2_FLAG_ACK: u8 = 0x01;

struct FrameHeader {
    length: usize,
    kind: u8,
    flags: u8,
    stream_id: u32,
}

fn frame_header(data: &[u8]) -> Option<FrameHeader> {
    if data.len() < HTTP2_FRAME_HEADER_LEN {
        return None;
    }
    Some(FrameHeader {
        length: ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | data[2] as usize,
        kind: data[3],
        flags: data[4],
        stream_id: u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & 0x7fff_ffff,
    })
}

/// Client connection preface, or a server's opening SETTINGS frame
pub fn is_http2(data: &[u8]) -> Check {
    if data.starts_with(HTTP2_PREFACE) {
        return Check::Match;
    }
    if HTTP2_PREFACE.starts_with(data) {
        return Check::NeedMore;
    }

    // SETTINGS payloads are small, so the top length byte is zero.
    if data[0] != 0 {
        return Check::NoMatch;
    }
    if data.len() >= 4 && data[3] != HTTP2_FRAME_SETTINGS {
        return Check::NoMatch;
    }
    if data.len() >= 5 && data[4] & !HTTP2_FLAG_ACK != 0 {
        return Check::NoMatch;
    }
    let Some(header) = frame_header(data) else {
        return Check::NeedMore;
    };
    let ack_ok = header.flags & HTTP2_FLAG_ACK == 0 || header.length == 0;
    if header.stream_id == 0 && header.length % 6 == 0 && ack_ok {
        Check::Match
    } else {
        Check::NoMatch
    }
}

/// HPACK-Huffman encoding of "application/grpc"; exactly 88 bits, so the
/// same bytes prefix "application/grpc+proto" and friends
const GRPC_CONTENT_TYPE_HUFFMAN: [u8; 11] = [
    0x1d, 0x75, 0xd0, 0x62, 0x0d, 0x26, 0x3d, 0x4c, 0x4d, 0x65, 0x64,
];
const GRPC_CONTENT_TYPE: &[u8] = b"application/grpc";

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// HTTP/2 whose first HEADERS frame carries a gRPC content-type
pub fn is_grpc(data: &[u8]) -> Check {
    match is_http2(data) {
        Check::Match => {}
        other => return other,
    }

    let mut offset = if data.starts_with(HTTP2_PREFACE) {
        HTTP2_PREFACE.len()
    } else {
        0
    };
    loop {
        let Some(header) = frame_header(&data[offset..]) else {
            return Check::NeedMore;
        };
        let payload_start = offset + HTTP2_FRAME_HEADER_LEN;
        let payload_end = payload_start + header.length;
        if header.kind == HTTP2_FRAME_HEADERS {
            let payload = &data[payload_start..payload_end.min(data.len())];
            if contains(payload, GRPC_CONTENT_TYPE) || contains(payload, &GRPC_CONTENT_TYPE_HUFFMAN)
            {
                return Check::Match;
            }
            return if payload_end <= data.len() {
                Check::NoMatch
            } else {
                Check::NeedMore
            };
        }
        if payload_end >= data.len() {
            return Check::NeedMore;
        }
        offset = payload_end;
    }
}

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

const HTTP1_VERSION: &[u8] = b"HTTP/1.";

/// Matches `prefix` against the start of `data`, allowing `data` to be shorter
fn prefix_check(data: &[u8], prefix: &[u8]) -> Check {
    let n = data.len().min(prefix.len());
    if data[..n] != prefix[..n] {
        Check::NoMatch
    } else if data.len() < prefix.len() {
        Check::NeedMore
    } else {
        Check::Match
    }
}

/// `HTTP/1.x NNN` status line
fn http1_status_line(data: &[u8]) -> Check {
    match prefix_check(data, HTTP1_VERSION) {
        Check::Match => {}
        other => return other,
    }
    // "HTTP/1." then version digit, space, three status digits
    let rest = &data[HTTP1_VERSION.len()..];
    let pattern: [fn(u8) -> bool; 5] = [
        |b| b == b'0' || b == b'1',
        |b| b == b' ',
        |b| (b'1'..=b'5').contains(&b),
        |b: u8| b.is_ascii_digit(),
        |b: u8| b.is_ascii_digit(),
    ];
    for (i, accept) in pattern.iter().enumerate() {
        match rest.get(i) {
            None => return Check::NeedMore,
            Some(&b) if !accept(b) => return Check::NoMatch,
            Some(_) => {}
        }
    }
    Check::Match
}

/// `METHOD SP request-target SP HTTP/1.x` request line
fn http1_request_line(data: &[u8]) -> Check {
    let mut waiting = false;
    for method in HTTP_METHODS {
        match prefix_check(data, method) {
            Check::Match => return http1_request_rest(&data[method.len()..]),
            Check::NeedMore => waiting = true,
            Check::NoMatch => {}
        }
    }
    if waiting {
        Check::NeedMore
    } else {
        Check::NoMatch
    }
}

fn http1_request_rest(rest: &[u8]) -> Check {
    let Some(&first) = rest.first() else {
        return Check::NeedMore;
    };
    if !(first == b'/' || first == b'*' || first.is_ascii_alphabetic()) {
        return Check::NoMatch;
    }
    for (i, &b) in rest.iter().enumerate() {
        if b == b' ' {
            let version = &rest[i + 1..];
            if version.is_empty() {
                return Check::NeedMore;
            }
            return match prefix_check(version, HTTP1_VERSION) {
                Check::Match => match version.get(HTTP1_VERSION.len()) {
                    None => Check::NeedMore,
                    Some(b'0') | Some(b'1') => Check::Match,
                    Some(_) => Check::NoMatch,
                },
                other => other,
            };
        }
        if !(0x21..=0x7e).contains(&b) {
            return Check::NoMatch;
        }
    }
    Check::NeedMore
}

/// HTTP/1.x request or status line
pub fn is_http1(data: &[u8]) -> Check {
    match (http1_request_line(data), http1_status_line(data)) {
        (Check::Match, _) | (_, Check::Match) => Check::Match,
        (Check::NeedMore, _) | (_, Check::NeedMore) => Check::NeedMore,
        _ => Check::NoMatch,
    }
}

// ============================================================================
// Per-flow state
// ============================================================================

struct PendingFlow {
    outgoing: Vec<u8>,
    incoming: Vec<u8>,
    samples: u32,
    first_seen: Instant,
}

impl PendingFlow {
    fn new(now: Instant) -> Self {
        Self {
            outgoing: Vec::new(),
            incoming: Vec::new(),
            samples: 0,
            first_seen: now,
        }
    }

    /// Final protocol: outgoing bytes are consulted before incoming bytes
    fn resolve(&self) -> Protocol {
        classify_final(&self.outgoing)
            .filter(|p| *p != Protocol::Unknown)
            .or_else(|| classify_final(&self.incoming).filter(|p| *p != Protocol::Unknown))
            .unwrap_or(Protocol::Unknown)
    }
}

enum FlowState {
    Pending(Box<PendingFlow>),
    /// Buffers are released once a flow is terminal; only the tag remains
    Terminal { protocol: Protocol, since: Instant },
}

#[derive(Debug, Default)]
struct ClassifierCounters {
    http: AtomicU64,
    http2: AtomicU64,
    grpc: AtomicU64,
    tls: AtomicU64,
    unknown: AtomicU64,
    flushed: AtomicU64,
    pruned: AtomicU64,
    ignored_samples: AtomicU64,
}

impl ClassifierCounters {
    fn record(&self, protocol: Protocol) {
        let counter = match protocol {
            Protocol::Http => &self.http,
            Protocol::Http2 => &self.http2,
            Protocol::Grpc => &self.grpc,
            Protocol::Tls => &self.tls,
            Protocol::Unknown => &self.unknown,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Classifier counters for the diagnostics surface
#[derive(serde::Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifierStats {
    pub pending: u64,
    pub terminal: u64,
    pub http: u64,
    pub http2: u64,
    pub grpc: u64,
    pub tls: u64,
    pub unknown: u64,
    pub flushed: u64,
    pub pruned: u64,
    pub ignored_samples: u64,
}

/// Incremental per-flow protocol classifier
pub struct ProtocolClassifier {
    flows: DashMap<ConnectionKey, FlowState>,
    buffer_bytes: usize,
    max_samples: u32,
    counters: ClassifierCounters,
}

impl ProtocolClassifier {
    pub fn new(buffer_bytes: usize, max_samples: u32) -> Self {
        Self {
            flows: DashMap::new(),
            buffer_bytes,
            max_samples,
            counters: ClassifierCounters::default(),
        }
    }

    /// Feed a byte sample
    ///
    /// Returns the protocol when this sample made the flow terminal.
    pub fn observe(
        &self,
        key: &ConnectionKey,
        direction: Direction,
        bytes: &[u8],
        now: Instant,
    ) -> Option<Protocol> {
        let mut state = self
            .flows
            .entry(*key)
            .or_insert_with(|| FlowState::Pending(Box::new(PendingFlow::new(now))));

        let FlowState::Pending(flow) = state.value_mut() else {
            self.counters.ignored_samples.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        flow.samples += 1;
        let buffer = match direction {
            Direction::Incoming => &mut flow.incoming,
            Direction::Outgoing | Direction::Unknown => &mut flow.outgoing,
        };
        let room = self.buffer_bytes.saturating_sub(buffer.len());
        buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
        let full = buffer.len() >= self.buffer_bytes;

        let this = classify(buffer);
        let other = match direction {
            Direction::Incoming => classify(&flow.outgoing),
            Direction::Outgoing | Direction::Unknown => classify(&flow.incoming),
        };

        let outcome = match (this, other) {
            (Verdict::Classified(protocol), _) => Some(protocol),
            (Verdict::Unknown, Verdict::Unknown) => Some(Protocol::Unknown),
            _ if full || flow.samples >= self.max_samples => Some(flow.resolve()),
            _ => None,
        };

        if let Some(protocol) = outcome {
            debug!("Classified {} as {}", key, protocol.as_str());
            *state = FlowState::Terminal {
                protocol,
                since: now,
            };
            self.counters.record(protocol);
        }
        outcome
    }

    /// Protocol of a terminal flow
    pub fn protocol(&self, key: &ConnectionKey) -> Option<Protocol> {
        match self.flows.get(key).as_deref() {
            Some(FlowState::Terminal { protocol, .. }) => Some(*protocol),
            _ => None,
        }
    }

    /// Drop the flow's state, resolving it if it was still pending
    ///
    /// Returns `None` when no bytes were ever observed for the flow.
    pub fn finish(&self, key: &ConnectionKey) -> Option<Protocol> {
        let (_, state) = self.flows.remove(key)?;
        match state {
            FlowState::Terminal { protocol, .. } => Some(protocol),
            FlowState::Pending(flow) => {
                let protocol = flow.resolve();
                self.counters.record(protocol);
                Some(protocol)
            }
        }
    }

    /// Resolve pending flows older than `deadline`
    pub fn flush_expired(&self, now: Instant, deadline: Duration) -> Vec<(ConnectionKey, Protocol)> {
        let mut flushed = Vec::new();
        for mut state in self.flows.iter_mut() {
            let protocol = match state.value() {
                FlowState::Pending(flow)
                    if now.saturating_duration_since(flow.first_seen) >= deadline =>
                {
                    flow.resolve()
                }
                _ => continue,
            };
            flushed.push((*state.key(), protocol));
            *state.value_mut() = FlowState::Terminal {
                protocol,
                since: now,
            };
        }
        for (_, protocol) in &flushed {
            self.counters.record(*protocol);
            self.counters.flushed.fetch_add(1, Ordering::Relaxed);
        }
        flushed
    }

    /// Drop terminal flows older than `deadline` that `is_tracked` rejects
    ///
    /// A flow whose connection events were lost never gets a close, so its
    /// tag would otherwise stay forever. Returns how many were dropped.
    pub fn prune_terminal<F>(&self, now: Instant, deadline: Duration, is_tracked: F) -> usize
    where
        F: Fn(&ConnectionKey) -> bool,
    {
        let expired = |state: &FlowState| match state {
            FlowState::Terminal { since, .. } => now.saturating_duration_since(*since) >= deadline,
            FlowState::Pending(_) => false,
        };
        let candidates: Vec<ConnectionKey> = self
            .flows
            .iter()
            .filter(|state| expired(state.value()))
            .map(|state| *state.key())
            .collect();

        let mut pruned = 0;
        for key in candidates {
            if is_tracked(&key) {
                continue;
            }
            if self.flows.remove_if(&key, |_, state| expired(state)).is_some() {
                pruned += 1;
            }
        }
        if pruned > 0 {
            self.counters.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
            debug!("Pruned {} orphaned classifier flows", pruned);
        }
        pruned
    }

    pub fn stats(&self) -> ClassifierStats {
        let mut pending = 0;
        let mut terminal = 0;
        for state in self.flows.iter() {
            match state.value() {
                FlowState::Pending(_) => pending += 1,
                FlowState::Terminal { .. } => terminal += 1,
            }
        }
        let c = &self.counters;
        ClassifierStats {
            pending,
            terminal,
            http: c.http.load(Ordering::Relaxed),
            http2: c.http2.load(Ordering::Relaxed),
            grpc: c.grpc.load(Ordering::Relaxed),
            tls: c.tls.load(Ordering::Relaxed),
            unknown: c.unknown.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            pruned: c.pruned.load(Ordering::Relaxed),
            ignored_samples: c.ignored_samples.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn clear(&self) {
        self.flows.clear();
    }
}
