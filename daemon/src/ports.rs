//! Port binding tracking
//!
//! Bound ports are kept per namespace and transport, independently of the
//! connection registry, and only used to infer direction.

use dashmap::DashMap;

use crate::types::{Direction, Transport, Tuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BindingKey {
    netns: u32,
    port: u16,
}

/// TCP listeners and UDP binds, one table per transport
#[derive(Default)]
pub struct PortBindings {
    tcp: DashMap<BindingKey, u32>,
    udp: DashMap<BindingKey, u32>,
}

impl PortBindings {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, transport: Transport) -> &DashMap<BindingKey, u32> {
        match transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
        }
    }

    /// Apply a binding event
    ///
    /// Several sockets may share a port (SO_REUSEPORT), so bindings are
    /// reference counted and the port stays bound until the last unbind.
    pub fn apply(&self, netns: u32, port: u16, transport: Transport, bound: bool) {
        let key = BindingKey { netns, port };
        let table = self.table(transport);
        if bound {
            *table.entry(key).or_insert(0) += 1;
        } else {
            table.remove_if_mut(&key, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
        }
    }

    pub fn is_bound(&self, netns: u32, port: u16, transport: Transport) -> bool {
        self.table(transport)
            .contains_key(&BindingKey { netns, port })
    }

    /// Incoming when the local port is bound in the flow's namespace
    pub fn infer_direction(&self, tuple: &Tuple) -> Direction {
        if self.is_bound(tuple.netns, tuple.src_port, tuple.transport) {
            Direction::Incoming
        } else {
            Direction::Outgoing
        }
    }

    pub fn len(&self) -> usize {
        self.tcp.len() + self.udp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.tcp.clear();
        self.udp.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple(sport: u16, transport: Transport) -> Tuple {
        Tuple::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            sport,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            51000,
            7,
            transport,
        )
    }

    #[test]
    fn test_direction_from_bound_port() {
        let ports = PortBindings::new();
        ports.apply(7, 8080, Transport::Tcp, true);

        assert_eq!(
            ports.infer_direction(&tuple(8080, Transport::Tcp)),
            Direction::Incoming
        );
        assert_eq!(
            ports.infer_direction(&tuple(8080, Transport::Udp)),
            Direction::Outgoing
        );
        assert_eq!(
            ports.infer_direction(&tuple(9090, Transport::Tcp)),
            Direction::Outgoing
        );
    }

    #[test]
    fn test_namespaces_are_separate() {
        let ports = PortBindings::new();
        ports.apply(7, 8080, Transport::Tcp, true);
        assert!(!ports.is_bound(8, 8080, Transport::Tcp));
    }

    #[test]
    fn test_refcounted_unbind() {
        let ports = PortBindings::new();
        ports.apply(7, 53, Transport::Udp, true);
        ports.apply(7, 53, Transport::Udp, true);
        ports.apply(7, 53, Transport::Udp, false);
        assert!(ports.is_bound(7, 53, Transport::Udp));
        ports.apply(7, 53, Transport::Udp, false);
        assert!(!ports.is_bound(7, 53, Transport::Udp));
        // Unbinding an unknown port is harmless
        ports.apply(7, 53, Transport::Udp, false);
        assert!(ports.is_empty());
    }
}
