//! Shared constants for the connection probes
//!
//! These constants are used by both kernel and userspace programs
//! to agree on record layouts, codes and map names.

// ============================================================================
// Record Sizes
// ============================================================================

/// Maximum number of payload bytes carried by a single byte-sample record
pub const MAX_SAMPLE_LEN: usize = 160;

/// Maximum HTTP method length captured from TLS plaintext hooks
pub const MAX_TLS_METHOD_LEN: usize = 8;

/// Maximum HTTP path length captured from TLS plaintext hooks
pub const MAX_TLS_PATH_LEN: usize = 64;

// ============================================================================
// Perf Map Names
// ============================================================================

/// Connection lifecycle records (`ConnEvent`)
pub const MAP_CONN_EVENTS: &str = "CONN_EVENTS";

/// Port binding records (`PortBindingEvent`)
pub const MAP_PORT_BINDINGS: &str = "PORT_BINDINGS";

/// Byte sample records (`ByteSampleEvent`)
pub const MAP_BYTE_SAMPLES: &str = "BYTE_SAMPLES";

/// TLS plaintext records (`TlsPlaintextEvent`)
pub const MAP_TLS_EVENTS: &str = "TLS_EVENTS";

/// Socket file descriptor resolution records (`SocketFdEvent`)
pub const MAP_SOCKFD_EVENTS: &str = "SOCKFD_EVENTS";

/// NAT translation records (`NatEvent`)
pub const MAP_NAT_EVENTS: &str = "NAT_EVENTS";

// ============================================================================
// Connection Event Kinds (for ConnEvent.kind)
// ============================================================================

/// First sighting of a flow
pub const CONN_EVENT_OPEN: u8 = 0;

/// Counter update for an open flow
pub const CONN_EVENT_UPDATE: u8 = 1;

/// Flow closed; carries the final delta
pub const CONN_EVENT_CLOSE: u8 = 2;

// ============================================================================
// Directions (for ConnEvent.direction and ByteSampleEvent.direction)
// ============================================================================

/// Direction not known by the probe
pub const DIRECTION_UNKNOWN: u8 = 0;

/// Connection accepted by a local listener
pub const DIRECTION_INCOMING: u8 = 1;

/// Connection initiated locally
pub const DIRECTION_OUTGOING: u8 = 2;

// ============================================================================
// Address Families (for RawConnTuple.family)
// ============================================================================

/// AF_INET
pub const FAMILY_V4: u8 = 2;

/// AF_INET6
pub const FAMILY_V6: u8 = 10;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

// ============================================================================
// TLS Libraries (for TlsPlaintextEvent.library)
// ============================================================================

/// GnuTLS hooks
pub const TLS_LIBRARY_GNUTLS: u8 = 1;

/// OpenSSL hooks
pub const TLS_LIBRARY_OPENSSL: u8 = 2;

/// Go crypto/tls hooks
pub const TLS_LIBRARY_GO: u8 = 3;

/// Java agent injection
pub const TLS_LIBRARY_JAVA: u8 = 4;

// ============================================================================
// TCP States (from include/net/tcp_states.h)
// ============================================================================

/// No state reported with this event
pub const TCP_STATE_NONE: u8 = 0;

pub const TCP_ESTABLISHED: u8 = 1;
pub const TCP_SYN_SENT: u8 = 2;
pub const TCP_SYN_RECV: u8 = 3;
pub const TCP_FIN_WAIT1: u8 = 4;
pub const TCP_FIN_WAIT2: u8 = 5;
pub const TCP_TIME_WAIT: u8 = 6;
pub const TCP_CLOSE: u8 = 7;
pub const TCP_CLOSE_WAIT: u8 = 8;
pub const TCP_LAST_ACK: u8 = 9;
pub const TCP_LISTEN: u8 = 10;
pub const TCP_CLOSING: u8 = 11;
