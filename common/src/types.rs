//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code.

use crate::constants::{MAX_SAMPLE_LEN, MAX_TLS_METHOD_LEN, MAX_TLS_PATH_LEN};

/// Connection tuple as seen by the probes
///
/// Addresses are stored in network byte order; IPv4 addresses occupy
/// the first four bytes and the rest is zero. Ports are host order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawConnTuple {
    /// Source address
    pub saddr: [u8; 16],
    /// Destination address
    pub daddr: [u8; 16],
    /// Source port
    pub sport: u16,
    /// Destination port
    pub dport: u16,
    /// Network namespace inode
    pub netns: u32,
    /// Address family (FAMILY_V4 or FAMILY_V6)
    pub family: u8,
    /// Transport protocol (IPPROTO_TCP or IPPROTO_UDP)
    pub protocol: u8,
    /// Padding for alignment
    pub _padding: [u8; 6],
}

/// Connection lifecycle event
///
/// Counter fields are deltas since the previous event for the same
/// tuple and cookie. They are signed so userspace can detect regressions.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ConnEvent {
    pub tuple: RawConnTuple,
    /// Per-socket cookie disambiguating tuple reuse
    pub cookie: u64,
    pub timestamp_ns: u64,
    pub sent_bytes: i64,
    pub recv_bytes: i64,
    pub sent_packets: i64,
    pub recv_packets: i64,
    pub retransmits: i32,
    /// Smoothed round-trip time in microseconds (0 if unknown)
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// See DIRECTION_* constants
    pub direction: u8,
    /// See CONN_EVENT_* constants
    pub kind: u8,
    /// See TCP_* state constants
    pub tcp_state: u8,
    pub _padding: [u8; 1],
}

/// Port binding lifecycle event
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PortBindingEvent {
    pub netns: u32,
    pub port: u16,
    /// IPPROTO_TCP or IPPROTO_UDP
    pub protocol: u8,
    /// 1 when bound, 0 when unbound
    pub bound: u8,
}

/// Raw bytes captured at a socket send/receive entry point
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ByteSampleEvent {
    pub tuple: RawConnTuple,
    pub cookie: u64,
    pub direction: u8,
    pub _padding: [u8; 5],
    /// Number of valid bytes in `data`
    pub len: u16,
    pub data: [u8; MAX_SAMPLE_LEN],
}

/// Plaintext request observed by a TLS library hook
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TlsPlaintextEvent {
    pub pid: u32,
    pub fd: u32,
    pub latency_ns: u64,
    pub plaintext_bytes: u64,
    pub status_code: u16,
    /// See TLS_LIBRARY_* constants
    pub library: u8,
    pub method_len: u8,
    pub path_len: u8,
    pub _padding: [u8; 3],
    pub method: [u8; MAX_TLS_METHOD_LEN],
    pub path: [u8; MAX_TLS_PATH_LEN],
}

/// Tuple learned by the kernel for a process file descriptor
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SocketFdEvent {
    pub pid: u32,
    pub fd: u32,
    pub cookie: u64,
    pub tuple: RawConnTuple,
}

/// NAT translation reported from connection-tracking metadata
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NatEvent {
    /// Tuple as observed before translation
    pub original: RawConnTuple,
    /// Tuple after translation
    pub translated: RawConnTuple,
    /// 1 when the translation is added, 0 when removed
    pub added: u8,
    pub _padding: [u8; 3],
}

// Compile-time alignment checks
// These will fail to compile if alignment is wrong
const _: () = {
    assert!(core::mem::size_of::<RawConnTuple>() % core::mem::align_of::<RawConnTuple>() == 0);
    assert!(core::mem::size_of::<ConnEvent>() % core::mem::align_of::<ConnEvent>() == 0);
    assert!(core::mem::size_of::<PortBindingEvent>() % core::mem::align_of::<PortBindingEvent>() == 0);
    assert!(core::mem::size_of::<ByteSampleEvent>() % core::mem::align_of::<ByteSampleEvent>() == 0);
    assert!(core::mem::size_of::<TlsPlaintextEvent>() % core::mem::align_of::<TlsPlaintextEvent>() == 0);
    assert!(core::mem::size_of::<SocketFdEvent>() % core::mem::align_of::<SocketFdEvent>() == 0);
    assert!(core::mem::size_of::<NatEvent>() % core::mem::align_of::<NatEvent>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for RawConnTuple {}
    unsafe impl aya::Pod for ConnEvent {}
    unsafe impl aya::Pod for PortBindingEvent {}
    unsafe impl aya::Pod for ByteSampleEvent {}
    unsafe impl aya::Pod for TlsPlaintextEvent {}
    unsafe impl aya::Pod for SocketFdEvent {}
    unsafe impl aya::Pod for NatEvent {}
}
