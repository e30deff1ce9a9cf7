//! Kernel record layouts shared by the connection probes and flow-tracker
//!
//! This crate provides the fixed-layout records and constants that form the
//! contract between the kernel probe programs and the userspace engine.

#![no_std]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{
    ByteSampleEvent, ConnEvent, NatEvent, PortBindingEvent, RawConnTuple, SocketFdEvent,
    TlsPlaintextEvent,
};
