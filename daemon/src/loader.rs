//! eBPF program loader
//!
//! Loads the connection probes, attaches their kprobes and hands out the
//! perf event arrays the ingestion tasks read from.

use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    programs::KProbe,
    Bpf,
};
use aya_log::BpfLogger;
use log::{info, warn};
use std::path::Path;

use crate::events::RecordKind;

/// Result of attaching an eBPF program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachResult {
    /// Program successfully attached
    Attached,
    /// Optional program missing from the object or unsupported by the kernel
    Skipped,
}

/// A kprobe (or kretprobe) program and the kernel function it hooks
#[derive(Debug, Clone, Copy)]
pub struct ProbeSpec {
    pub program: &'static str,
    pub function: &'static str,
    pub required: bool,
}

const fn probe(program: &'static str, function: &'static str, required: bool) -> ProbeSpec {
    ProbeSpec {
        program,
        function,
        required,
    }
}

/// Probes the connection tracker attaches, in attach order
pub const PROBES: &[ProbeSpec] = &[
    // Connection lifecycle and counters
    probe("tcp_sendmsg", "tcp_sendmsg", true),
    probe("tcp_cleanup_rbuf", "tcp_cleanup_rbuf", true),
    probe("tcp_set_state", "tcp_set_state", true),
    probe("tcp_close", "tcp_close", true),
    probe("tcp_retransmit_skb", "tcp_retransmit_skb", false),
    probe("udp_sendmsg", "udp_sendmsg", false),
    probe("udp_recvmsg", "udp_recvmsg", false),
    // Port bindings
    probe("inet_csk_accept", "inet_csk_accept", false),
    probe("inet_csk_listen_stop", "inet_csk_listen_stop", false),
    probe("inet_bind", "inet_bind", false),
    probe("udp_destroy_sock", "udp_destroy_sock", false),
    // (pid, fd) to tuple resolution for TLS correlation
    probe("sockfd_lookup_light", "sockfd_lookup_light", false),
    // NAT translations from connection tracking
    probe("nf_conntrack_confirm", "__nf_conntrack_confirm", false),
];

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load the probe object from a file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the compiled eBPF object
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading eBPF object from: {:?}", path);
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read eBPF object file: {:?}", path))?;
        let ebpf = Bpf::load(&data).context("Failed to load eBPF program")?;
        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Forward probe-side log records to the `log` facade
    ///
    /// Non-fatal if the object was built without logging support.
    pub fn init_logger(&mut self) {
        if let Err(e) = BpfLogger::init(&mut self.ebpf) {
            warn!("eBPF logger not initialized, probe logs will not be captured: {}", e);
        }
    }

    fn attach_one(&mut self, spec: &ProbeSpec) -> Result<AttachResult> {
        let Some(prog) = self.ebpf.program_mut(spec.program) else {
            if spec.required {
                anyhow::bail!("{} program not found in eBPF object", spec.program);
            }
            warn!("  ⚠ {} program not found (optional)", spec.program);
            return Ok(AttachResult::Skipped);
        };
        let program: &mut KProbe = prog
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", spec.program))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", spec.program))?;

        match program.attach(spec.function, 0) {
            Ok(_) => {
                info!("  ✓ Attached to {}", spec.function);
                Ok(AttachResult::Attached)
            }
            Err(e) if !spec.required => {
                warn!(
                    "  ⚠ Failed to attach {} (not available on this kernel): {}",
                    spec.function, e
                );
                Ok(AttachResult::Skipped)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to attach {} kprobe", spec.function)),
        }
    }

    /// Attach every probe in [`PROBES`]
    ///
    /// Missing required probes are an error; optional ones only warn.
    /// Returns the number of attached probes.
    pub fn attach_kprobes(&mut self) -> Result<usize> {
        info!("Attaching kprobes for connection tracking...");
        let mut attached = 0;
        for spec in PROBES {
            if self.attach_one(spec)? == AttachResult::Attached {
                attached += 1;
            }
        }
        info!("{} of {} kprobes attached", attached, PROBES.len());
        Ok(attached)
    }

    /// Take the perf event array for one record kind
    ///
    /// Returns `None` for an optional map missing from the object.
    pub fn take_perf_array(
        &mut self,
        kind: RecordKind,
    ) -> Result<Option<AsyncPerfEventArray<MapData>>> {
        let name = kind.map_name();
        let Some(map) = self.ebpf.take_map(name) else {
            if kind.is_required() {
                anyhow::bail!("{} map not found in eBPF object", name);
            }
            warn!("  ⚠ {} map not found (optional)", name);
            return Ok(None);
        };

        let array = AsyncPerfEventArray::try_from(map)
            .with_context(|| format!("Failed to create AsyncPerfEventArray from {} map", name))?;
        Ok(Some(array))
    }
}
