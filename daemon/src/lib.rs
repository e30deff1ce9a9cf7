//! Flow Tracker Userspace Library
//!
//! Connection tracking, protocol classification and multi-client delivery
//! on top of the kernel connection probes.

pub mod classifier;
pub mod closed;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod exporter;
pub mod loader;
pub mod nat;
pub mod ports;
pub mod registry;
pub mod sweeper;
pub mod tls;
pub mod types;

pub use closed::{ClientId, ClosedSlot};
pub use config::EngineConfig;
pub use diagnostics::Diagnostics;
pub use engine::{Engine, PollResult};
pub use error::{ConfigError, DecodeError};
pub use events::{EventProcessor, KernelEvent, RecordKind};
pub use exporter::{DiagnosticsExporter, ExporterType, JsonExporter, PrometheusExporter};
pub use loader::ProbeLoader;
pub use types::*;
