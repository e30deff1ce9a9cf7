//! Userspace type definitions
//!
//! Defines the flow identities, counters and snapshots the engine works with.
//!
//! ## Organization
//!
//! This module separates kernel and userspace types:
//! - **Kernel Types**: Fixed-layout records shared with the probes (from flow_common)
//! - **Userspace Types**: Decoded identities, counters and snapshots handed to clients

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::DecodeError;

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between kernel eBPF programs and userspace
    //!
    //! These are re-exported from the flow-common crate and must
    //! maintain binary compatibility with the probes.

    pub use flow_common::constants;
    pub use flow_common::types::{
        ByteSampleEvent, ConnEvent, NatEvent, PortBindingEvent, RawConnTuple, SocketFdEvent,
        TlsPlaintextEvent,
    };
}

use kernel::constants::*;
use kernel::RawConnTuple;

/// Transport protocol of a flow
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            IPPROTO_TCP => Some(Transport::Tcp),
            IPPROTO_UDP => Some(Transport::Udp),
            _ => None,
        }
    }
}

/// Flow identity within a network namespace
///
/// The source side is always the local socket.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub netns: u32,
    pub transport: Transport,
}

impl Tuple {
    pub fn new(
        src_addr: IpAddr,
        src_port: u16,
        dst_addr: IpAddr,
        dst_port: u16,
        netns: u32,
        transport: Transport,
    ) -> Self {
        Self {
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            netns,
            transport,
        }
    }

    /// The same flow seen from the remote end
    pub fn reversed(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            src_port: self.dst_port,
            dst_addr: self.src_addr,
            dst_port: self.src_port,
            netns: self.netns,
            transport: self.transport,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transport = match self.transport {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        };
        write!(
            f,
            "{} {} -> {} (netns {})",
            transport,
            std::net::SocketAddr::new(self.src_addr, self.src_port),
            std::net::SocketAddr::new(self.dst_addr, self.dst_port),
            self.netns
        )
    }
}

fn decode_addr(family: u8, raw: &[u8; 16]) -> Result<IpAddr, DecodeError> {
    match family {
        FAMILY_V4 => Ok(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
        FAMILY_V6 => Ok(IpAddr::V6(Ipv6Addr::from(*raw))),
        other => Err(DecodeError::UnsupportedFamily(other)),
    }
}

impl TryFrom<&RawConnTuple> for Tuple {
    type Error = DecodeError;

    fn try_from(raw: &RawConnTuple) -> Result<Self, Self::Error> {
        let transport =
            Transport::from_code(raw.protocol).ok_or(DecodeError::UnsupportedTransport(raw.protocol))?;
        Ok(Tuple {
            src_addr: decode_addr(raw.family, &raw.saddr)?,
            src_port: raw.sport,
            dst_addr: decode_addr(raw.family, &raw.daddr)?,
            dst_port: raw.dport,
            netns: raw.netns,
            transport,
        })
    }
}

/// Tuple plus socket cookie; the registry key
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub tuple: Tuple,
    pub cookie: u64,
}

impl ConnectionKey {
    pub fn new(tuple: Tuple, cookie: u64) -> Self {
        Self { tuple, cookie }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [cookie {:#x}]", self.tuple, self.cookie)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    #[default]
    Unknown,
}

impl Direction {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            DIRECTION_UNKNOWN => Some(Direction::Unknown),
            DIRECTION_INCOMING => Some(Direction::Incoming),
            DIRECTION_OUTGOING => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

/// TCP state as numbered by the kernel
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
}

impl TcpState {
    /// `Ok(None)` for TCP_STATE_NONE
    pub fn from_code(code: u8) -> Result<Option<Self>, DecodeError> {
        let state = match code {
            TCP_STATE_NONE => return Ok(None),
            TCP_ESTABLISHED => TcpState::Established,
            TCP_SYN_SENT => TcpState::SynSent,
            TCP_SYN_RECV => TcpState::SynRecv,
            TCP_FIN_WAIT1 => TcpState::FinWait1,
            TCP_FIN_WAIT2 => TcpState::FinWait2,
            TCP_TIME_WAIT => TcpState::TimeWait,
            TCP_CLOSE => TcpState::Close,
            TCP_CLOSE_WAIT => TcpState::CloseWait,
            TCP_LAST_ACK => TcpState::LastAck,
            TCP_LISTEN => TcpState::Listen,
            TCP_CLOSING => TcpState::Closing,
            other => return Err(DecodeError::InvalidTcpState(other)),
        };
        Ok(Some(state))
    }

    /// Bit recorded in `tcp_state_transitions`
    pub fn bit(self) -> u16 {
        let code = match self {
            TcpState::Established => TCP_ESTABLISHED,
            TcpState::SynSent => TCP_SYN_SENT,
            TcpState::SynRecv => TCP_SYN_RECV,
            TcpState::FinWait1 => TCP_FIN_WAIT1,
            TcpState::FinWait2 => TCP_FIN_WAIT2,
            TcpState::TimeWait => TCP_TIME_WAIT,
            TcpState::Close => TCP_CLOSE,
            TcpState::CloseWait => TCP_CLOSE_WAIT,
            TcpState::LastAck => TCP_LAST_ACK,
            TcpState::Listen => TCP_LISTEN,
            TcpState::Closing => TCP_CLOSING,
        };
        1 << code
    }
}

/// Round-trip time sample reported by the kernel
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RttSample {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
}

/// Counter deltas carried by one lifecycle event
///
/// Signed so a regression reported by the kernel can be detected and clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsDelta {
    pub sent_bytes: i64,
    pub recv_bytes: i64,
    pub sent_packets: i64,
    pub recv_packets: i64,
    pub retransmits: i64,
    pub rtt: Option<RttSample>,
    pub tcp_state: Option<TcpState>,
}

impl StatsDelta {
    pub fn bytes(sent: i64, recv: i64) -> Self {
        Self {
            sent_bytes: sent,
            recv_bytes: recv,
            ..Self::default()
        }
    }

    /// Copy with every negative counter replaced by zero
    ///
    /// Returns the clamped delta and whether anything was clamped.
    pub fn clamped(&self) -> (Self, bool) {
        let mut regressed = false;
        let mut clamp = |v: i64| {
            if v < 0 {
                regressed = true;
                0
            } else {
                v
            }
        };
        let delta = Self {
            sent_bytes: clamp(self.sent_bytes),
            recv_bytes: clamp(self.recv_bytes),
            sent_packets: clamp(self.sent_packets),
            recv_packets: clamp(self.recv_packets),
            retransmits: clamp(self.retransmits),
            rtt: self.rtt,
            tcp_state: self.tcp_state,
        };
        (delta, regressed)
    }
}

/// Application protocol assigned by the classifier
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Unknown,
    Http,
    Http2,
    Grpc,
    Tls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Unknown => "unknown",
            Protocol::Http => "http",
            Protocol::Http2 => "http2",
            Protocol::Grpc => "grpc",
            Protocol::Tls => "tls",
        }
    }
}

/// TLS library whose hooks produced a plaintext event
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TlsLibrary {
    GnuTls,
    OpenSsl,
    Go,
    Java,
}

impl TlsLibrary {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            TLS_LIBRARY_GNUTLS => Some(TlsLibrary::GnuTls),
            TLS_LIBRARY_OPENSSL => Some(TlsLibrary::OpenSsl),
            TLS_LIBRARY_GO => Some(TlsLibrary::Go),
            TLS_LIBRARY_JAVA => Some(TlsLibrary::Java),
            _ => None,
        }
    }

    /// Static tag attached to connections carrying this library's traffic
    pub fn tag(&self) -> &'static str {
        match self {
            TlsLibrary::GnuTls => "tls.library:gnutls",
            TlsLibrary::OpenSsl => "tls.library:openssl",
            TlsLibrary::Go => "tls.library:go",
            TlsLibrary::Java => "tls.library:java",
        }
    }
}

/// Plaintext request details reported by a TLS hook
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub latency_ns: u64,
    pub plaintext_bytes: u64,
}

/// Request counts per HTTP status class
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusClassCounts {
    pub informational: u64,
    pub success: u64,
    pub redirection: u64,
    pub client_error: u64,
    pub server_error: u64,
    /// Requests without a usable status code
    pub other: u64,
}

impl StatusClassCounts {
    fn slot(&mut self, status_code: u16) -> &mut u64 {
        match status_code / 100 {
            1 => &mut self.informational,
            2 => &mut self.success,
            3 => &mut self.redirection,
            4 => &mut self.client_error,
            5 => &mut self.server_error,
            _ => &mut self.other,
        }
    }

    pub fn record(&mut self, status_code: u16) {
        *self.slot(status_code) += 1;
    }

    /// Count for the class `status_code` belongs to, e.g. 200 for 2xx
    pub fn class_of(&self, status_code: u16) -> u64 {
        let mut counts = *self;
        *counts.slot(status_code)
    }

    pub fn total(&self) -> u64 {
        self.informational
            + self.success
            + self.redirection
            + self.client_error
            + self.server_error
            + self.other
    }
}

/// TLS statistics merged into a connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TlsStats {
    pub library: TlsLibrary,
    pub request_count: u64,
    pub plaintext_bytes: u64,
    pub total_latency_ns: u64,
    pub by_status: StatusClassCounts,
    pub last_status_code: u16,
    pub last_path: String,
}

impl TlsStats {
    pub fn new(library: TlsLibrary) -> Self {
        Self {
            library,
            request_count: 0,
            plaintext_bytes: 0,
            total_latency_ns: 0,
            by_status: StatusClassCounts::default(),
            last_status_code: 0,
            last_path: String::new(),
        }
    }

    pub fn merge(&mut self, info: &RequestInfo) {
        self.request_count += 1;
        self.plaintext_bytes = self.plaintext_bytes.saturating_add(info.plaintext_bytes);
        self.total_latency_ns = self.total_latency_ns.saturating_add(info.latency_ns);
        self.by_status.record(info.status_code);
        self.last_status_code = info.status_code;
        self.last_path.clone_from(&info.path);
    }
}

/// Lifecycle of a registry entry
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Active,
    Closing,
    Buffered,
    Evicted,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// Close event from the kernel
    Kernel,
    /// Synthetic close issued by the sweeper
    IdleTimeout,
    /// Engine shutdown
    Shutdown,
}

/// Point-in-time copy of a connection entry
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub key: ConnectionKey,
    pub direction: Direction,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub retransmits: u64,
    pub rtt: RttSample,
    pub tcp_state: Option<TcpState>,
    pub tcp_state_transitions: u16,
    pub protocol: Option<Protocol>,
    pub tls: Option<TlsStats>,
    pub tags: Vec<&'static str>,
    pub lifecycle: Lifecycle,
    pub close_reason: Option<CloseReason>,
    /// Kernel timestamp of the first event seen for this flow
    pub first_seen_ns: u64,
    /// Kernel timestamp of the latest event seen for this flow
    pub last_seen_ns: u64,
}
