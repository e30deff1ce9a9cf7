//! Kernel event decoding and ingestion
//!
//! Every perf map carries one fixed-layout record kind. Records are decoded
//! into [`KernelEvent`] values and fed to the engine; decoding failures are
//! counted and never stop a reader.

use crate::{
    engine::Engine,
    error::DecodeError,
    types::{
        kernel::{
            constants::*, ByteSampleEvent, ConnEvent, NatEvent, PortBindingEvent, SocketFdEvent,
            TlsPlaintextEvent,
        },
        ConnectionKey, Direction, RequestInfo, RttSample, StatsDelta, TcpState, TlsLibrary,
        Transport, Tuple,
    },
};
use anyhow::Result;
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Record layout carried by a perf map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Connection,
    PortBinding,
    ByteSample,
    TlsPlaintext,
    SocketFd,
    Nat,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Connection,
        RecordKind::PortBinding,
        RecordKind::ByteSample,
        RecordKind::TlsPlaintext,
        RecordKind::SocketFd,
        RecordKind::Nat,
    ];

    pub fn map_name(&self) -> &'static str {
        match self {
            RecordKind::Connection => MAP_CONN_EVENTS,
            RecordKind::PortBinding => MAP_PORT_BINDINGS,
            RecordKind::ByteSample => MAP_BYTE_SAMPLES,
            RecordKind::TlsPlaintext => MAP_TLS_EVENTS,
            RecordKind::SocketFd => MAP_SOCKFD_EVENTS,
            RecordKind::Nat => MAP_NAT_EVENTS,
        }
    }

    pub fn record_size(&self) -> usize {
        match self {
            RecordKind::Connection => std::mem::size_of::<ConnEvent>(),
            RecordKind::PortBinding => std::mem::size_of::<PortBindingEvent>(),
            RecordKind::ByteSample => std::mem::size_of::<ByteSampleEvent>(),
            RecordKind::TlsPlaintext => std::mem::size_of::<TlsPlaintextEvent>(),
            RecordKind::SocketFd => std::mem::size_of::<SocketFdEvent>(),
            RecordKind::Nat => std::mem::size_of::<NatEvent>(),
        }
    }

    /// Maps without which the engine has nothing to track
    pub fn is_required(&self) -> bool {
        matches!(self, RecordKind::Connection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEventKind {
    Open,
    Update,
    Close,
}

/// Connection lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub tuple: Tuple,
    pub cookie: u64,
    pub direction: Direction,
    pub kind: ConnEventKind,
    pub delta: StatsDelta,
    pub timestamp_ns: u64,
}

impl ConnectionEvent {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.tuple, self.cookie)
    }
}

/// Decoded inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Connection(ConnectionEvent),
    PortBinding {
        netns: u32,
        port: u16,
        transport: Transport,
        bound: bool,
    },
    ByteSample {
        tuple: Tuple,
        cookie: u64,
        direction: Direction,
        data: Bytes,
    },
    TlsPlaintext {
        pid: u32,
        fd: u32,
        library: TlsLibrary,
        info: RequestInfo,
    },
    /// The kernel learned which tuple a process descriptor refers to
    SocketResolved {
        pid: u32,
        fd: u32,
        tuple: Tuple,
        cookie: u64,
    },
    NatMapping {
        original: Tuple,
        translated: Tuple,
        added: bool,
    },
}

fn read_record<T: aya::Pod>(bytes: &[u8]) -> Result<T, DecodeError> {
    let expected = std::mem::size_of::<T>();
    if bytes.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    // SAFETY: the length is checked above and `T` is a plain repr(C)
    // record that is valid for any bit pattern.
    Ok(unsafe { (bytes.as_ptr() as *const T).read_unaligned() })
}

fn direction(code: u8) -> Result<Direction, DecodeError> {
    Direction::from_code(code).ok_or(DecodeError::InvalidDirection(code))
}

fn transport(code: u8) -> Result<Transport, DecodeError> {
    Transport::from_code(code).ok_or(DecodeError::UnsupportedTransport(code))
}

fn text(raw: &[u8], len: u8) -> String {
    let len = (len as usize).min(raw.len());
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

/// Decode one raw record of the given kind
pub fn decode(kind: RecordKind, bytes: &[u8]) -> Result<KernelEvent, DecodeError> {
    match kind {
        RecordKind::Connection => {
            let raw: ConnEvent = read_record(bytes)?;
            let kind = match raw.kind {
                CONN_EVENT_OPEN => ConnEventKind::Open,
                CONN_EVENT_UPDATE => ConnEventKind::Update,
                CONN_EVENT_CLOSE => ConnEventKind::Close,
                other => return Err(DecodeError::InvalidEventKind(other)),
            };
            let rtt = (raw.rtt_us != 0).then_some(RttSample {
                rtt_us: raw.rtt_us,
                rtt_var_us: raw.rtt_var_us,
            });
            Ok(KernelEvent::Connection(ConnectionEvent {
                tuple: Tuple::try_from(&raw.tuple)?,
                cookie: raw.cookie,
                direction: direction(raw.direction)?,
                kind,
                delta: StatsDelta {
                    sent_bytes: raw.sent_bytes,
                    recv_bytes: raw.recv_bytes,
                    sent_packets: raw.sent_packets,
                    recv_packets: raw.recv_packets,
                    retransmits: raw.retransmits as i64,
                    rtt,
                    tcp_state: TcpState::from_code(raw.tcp_state)?,
                },
                timestamp_ns: raw.timestamp_ns,
            }))
        }
        RecordKind::PortBinding => {
            let raw: PortBindingEvent = read_record(bytes)?;
            Ok(KernelEvent::PortBinding {
                netns: raw.netns,
                port: raw.port,
                transport: transport(raw.protocol)?,
                bound: raw.bound != 0,
            })
        }
        RecordKind::ByteSample => {
            let raw: ByteSampleEvent = read_record(bytes)?;
            let len = raw.len as usize;
            if len > MAX_SAMPLE_LEN {
                return Err(DecodeError::SampleTooLong {
                    len,
                    max: MAX_SAMPLE_LEN,
                });
            }
            Ok(KernelEvent::ByteSample {
                tuple: Tuple::try_from(&raw.tuple)?,
                cookie: raw.cookie,
                direction: direction(raw.direction)?,
                data: Bytes::copy_from_slice(&raw.data[..len]),
            })
        }
        RecordKind::TlsPlaintext => {
            let raw: TlsPlaintextEvent = read_record(bytes)?;
            let library = TlsLibrary::from_code(raw.library)
                .ok_or(DecodeError::UnknownTlsLibrary(raw.library))?;
            Ok(KernelEvent::TlsPlaintext {
                pid: raw.pid,
                fd: raw.fd,
                library,
                info: RequestInfo {
                    method: text(&raw.method, raw.method_len),
                    path: text(&raw.path, raw.path_len),
                    status_code: raw.status_code,
                    latency_ns: raw.latency_ns,
                    plaintext_bytes: raw.plaintext_bytes,
                },
            })
        }
        RecordKind::SocketFd => {
            let raw: SocketFdEvent = read_record(bytes)?;
            Ok(KernelEvent::SocketResolved {
                pid: raw.pid,
                fd: raw.fd,
                tuple: Tuple::try_from(&raw.tuple)?,
                cookie: raw.cookie,
            })
        }
        RecordKind::Nat => {
            let raw: NatEvent = read_record(bytes)?;
            Ok(KernelEvent::NatMapping {
                original: Tuple::try_from(&raw.original)?,
                translated: Tuple::try_from(&raw.translated)?,
                added: raw.added != 0,
            })
        }
    }
}

/// Event processor that reads from perf buffers
pub struct EventProcessor {
    engine: Arc<Engine>,
}

impl EventProcessor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Spawn per-CPU event readers for one perf map
    ///
    /// Creates a task for each CPU to read events from its perf buffer.
    /// Tasks stop when the engine shuts down.
    ///
    /// # Arguments
    ///
    /// * `kind` - Record layout carried by the map
    /// * `perf_array` - Perf event array from the eBPF object
    pub fn spawn_cpu_readers(
        &self,
        kind: RecordKind,
        mut perf_array: AsyncPerfEventArray<MapData>,
    ) -> Result<()> {
        let cpus = online_cpus().map_err(|(_, e)| e)?;
        info!(
            "Spawning {} readers for {} CPUs",
            kind.map_name(),
            cpus.len()
        );

        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, None)?;
            let engine = Arc::clone(&self.engine);
            let mut shutdown = engine.shutdown_signal();

            let handle = tokio::spawn(async move {
                // Pre-allocate buffers for reading events
                let mut buffers = (0..10)
                    .map(|_| BytesMut::with_capacity(kind.record_size()))
                    .collect::<Vec<_>>();

                loop {
                    let events = tokio::select! {
                        read = buf.read_events(&mut buffers) => match read {
                            Ok(events) => events,
                            Err(e) => {
                                warn!("Reader for {} on CPU {} stopped: {}", kind.map_name(), cpu_id, e);
                                break;
                            }
                        },
                        _ = shutdown.changed() => break,
                    };

                    if events.lost > 0 {
                        engine.record_lost_events(events.lost as u64);
                    }
                    for record in buffers.iter_mut().take(events.read) {
                        engine.handle_record(kind, record);
                    }
                }
                debug!("Reader for {} on CPU {} exited", kind.map_name(), cpu_id);
            });
            self.engine.track_task(handle);
        }

        Ok(())
    }

    /// Feed already decoded events from a channel
    ///
    /// The task ends when every sender is dropped or the engine shuts down.
    pub fn spawn_channel_reader(&self, mut events: mpsc::Receiver<KernelEvent>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let mut shutdown = engine.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => engine.handle_event(event),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
