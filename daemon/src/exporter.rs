//! Diagnostics exporters
//!
//! Writes a [`Diagnostics`] snapshot to a file as JSON or in the
//! Prometheus text exposition format.

use crate::diagnostics::Diagnostics;
use anyhow::{Context, Result};
use std::{fmt::Write as _, fs::File, io::Write, path::PathBuf};

/// Trait for diagnostics exporters
pub trait DiagnosticsExporter {
    /// Render the snapshot in this exporter's format
    fn render(&self, diagnostics: &Diagnostics) -> Result<String>;

    fn output_path(&self) -> &PathBuf;

    /// Render and write the snapshot to the output file
    fn export(&self, diagnostics: &Diagnostics) -> Result<()> {
        let data = self.render(diagnostics)?;
        let path = self.output_path();

        let mut file = File::create(path)
            .with_context(|| format!("Failed to create output file: {:?}", path))?;
        file.write_all(data.as_bytes())
            .with_context(|| format!("Failed to write to output file: {:?}", path))?;

        Ok(())
    }
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus format
    Prometheus,
}

impl ExporterType {
    pub fn parse(format: &str) -> Option<Self> {
        match format.to_lowercase().as_str() {
            "json" => Some(ExporterType::Json),
            "prometheus" | "prom" => Some(ExporterType::Prometheus),
            _ => None,
        }
    }

    pub fn build(self, output_path: PathBuf) -> Box<dyn DiagnosticsExporter + Send + Sync> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
        }
    }
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl DiagnosticsExporter for JsonExporter {
    fn render(&self, diagnostics: &Diagnostics) -> Result<String> {
        let json = if self.pretty {
            serde_json::to_string_pretty(diagnostics)?
        } else {
            serde_json::to_string(diagnostics)?
        };
        Ok(json)
    }

    fn output_path(&self) -> &PathBuf {
        &self.output_path
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

const PREFIX: &str = "flow_tracker";

fn metric(out: &mut String, name: &str, kind: &str, help: &str, samples: &[(&str, u64)]) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} {kind}");
    for (labels, value) in samples {
        if labels.is_empty() {
            let _ = writeln!(out, "{PREFIX}_{name} {value}");
        } else {
            let _ = writeln!(out, "{PREFIX}_{name}{{{labels}}} {value}");
        }
    }
    out.push('\n');
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Convert diagnostics to Prometheus format
    fn to_prometheus_format(d: &Diagnostics) -> String {
        let mut out = String::new();
        let r = &d.registry;
        let c = &d.classifier;
        let t = &d.tls;

        metric(&mut out, "uptime_seconds", "gauge", "Seconds since the engine started", &[("", d.uptime_seconds)]);
        metric(&mut out, "events_total", "counter", "Kernel events processed", &[("", d.events_processed)]);
        metric(&mut out, "decode_errors_total", "counter", "Kernel records that failed to decode", &[("", d.decode_errors)]);
        metric(&mut out, "kernel_lost_events_total", "counter", "Events the kernel reported as lost", &[("", d.kernel_lost_events)]);
        metric(&mut out, "active_connections", "gauge", "Connections currently tracked", &[("", r.active)]);
        metric(
            &mut out,
            "closed_connections_total",
            "counter",
            "Connections closed, by reason",
            &[
                (
                    "reason=\"kernel\"",
                    r.closed.saturating_sub(r.idle_closed + r.shutdown_closed),
                ),
                ("reason=\"idle-timeout\"", r.idle_closed),
                ("reason=\"shutdown\"", r.shutdown_closed),
            ],
        );
        metric(
            &mut out,
            "anomalies_total",
            "counter",
            "Discarded or corrected kernel events",
            &[
                ("kind=\"stale\"", r.stale_events),
                ("kind=\"duplicate_close\"", r.duplicate_closes),
                ("kind=\"counter_regression\"", r.counter_regressions),
                ("kind=\"late_sample\"", d.late_samples),
                ("kind=\"late_resolution\"", d.late_resolutions),
            ],
        );
        metric(&mut out, "closed_buffer_slots", "gauge", "Closed connections retained for clients", &[("", d.closed.buffered)]);
        metric(&mut out, "closed_buffer_dropped_total", "counter", "Closed connections evicted before every client read them", &[("", d.closed.dropped)]);
        metric(&mut out, "clients", "gauge", "Registered clients", &[("", d.closed.clients)]);
        metric(
            &mut out,
            "classified_total",
            "counter",
            "Flows classified, by protocol",
            &[
                ("protocol=\"http\"", c.http),
                ("protocol=\"http2\"", c.http2),
                ("protocol=\"grpc\"", c.grpc),
                ("protocol=\"tls\"", c.tls),
                ("protocol=\"unknown\"", c.unknown),
            ],
        );
        metric(&mut out, "classifier_pending", "gauge", "Flows still being classified", &[("", c.pending)]);
        metric(
            &mut out,
            "tls_pending",
            "gauge",
            "TLS correlations waiting for their counterpart",
            &[("side=\"record\"", t.pending_records), ("side=\"join\"", t.pending_joins)],
        );
        metric(&mut out, "tls_joined_total", "counter", "TLS requests attributed to a connection", &[("", t.joined)]);
        metric(&mut out, "tls_unattributed_total", "counter", "TLS requests that expired without a connection", &[("", t.unattributed)]);
        metric(&mut out, "nat_translations", "gauge", "Stored NAT mappings", &[("", d.nat_translations)]);
        metric(&mut out, "port_bindings", "gauge", "Bound ports tracked for direction inference", &[("", d.port_bindings)]);

        out
    }
}

impl DiagnosticsExporter for PrometheusExporter {
    fn render(&self, diagnostics: &Diagnostics) -> Result<String> {
        Ok(Self::to_prometheus_format(diagnostics))
    }

    fn output_path(&self) -> &PathBuf {
        &self.output_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;

    fn create_test_diagnostics() -> Diagnostics {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let mut diagnostics = engine.diagnostics();
        diagnostics.events_processed = 1000;
        diagnostics.registry.active = 3;
        diagnostics.registry.closed = 10;
        diagnostics.registry.idle_closed = 4;
        diagnostics.classifier.grpc = 2;
        diagnostics
    }

    #[test]
    fn test_prometheus_format() {
        let prometheus = PrometheusExporter::to_prometheus_format(&create_test_diagnostics());

        assert!(prometheus.contains("flow_tracker_events_total 1000"));
        assert!(prometheus.contains("flow_tracker_active_connections 3"));
        assert!(prometheus.contains("flow_tracker_closed_connections_total{reason=\"kernel\"} 6"));
        assert!(prometheus.contains("flow_tracker_classified_total{protocol=\"grpc\"} 2"));
        assert!(prometheus.contains("# TYPE flow_tracker_tls_pending gauge"));
    }

    #[test]
    fn test_json_render() {
        let exporter = JsonExporter::new(PathBuf::from("unused.json"), false);
        let json = exporter.render(&create_test_diagnostics()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["events_processed"], 1000);
        assert_eq!(value["registry"]["active"], 3);
    }

    #[test]
    fn test_export_writes_file() {
        let path = std::env::temp_dir().join(format!("flow-tracker-{}.prom", std::process::id()));
        let exporter = ExporterType::Prometheus.build(path.clone());
        exporter.export(&create_test_diagnostics()).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("flow_tracker_uptime_seconds"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(ExporterType::parse("JSON"), Some(ExporterType::Json));
        assert_eq!(ExporterType::parse("prom"), Some(ExporterType::Prometheus));
        assert_eq!(ExporterType::parse("influx"), None);
    }
}
