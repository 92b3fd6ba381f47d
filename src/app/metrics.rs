//! Prometheus-based metrics module
//!
//! Relay counters live in a process-wide registry. `render()` produces the
//! text exposition format; the runtime also logs a periodic summary.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Relay lifecycle ===

    /// Relays started
    pub static ref RELAYS_TOTAL: IntCounter = IntCounter::new(
        "tunnel_relays_total",
        "Total number of relays started"
    ).unwrap();

    /// Relays currently running
    pub static ref RELAYS_ACTIVE: IntGauge = IntGauge::new(
        "tunnel_relays_active",
        "Number of relays currently running"
    ).unwrap();

    /// Transport attempts made while looking for a path
    pub static ref RELAY_ATTEMPTS_TOTAL: IntCounter = IntCounter::new(
        "tunnel_relay_attempts_total",
        "Total transport attempts across all relays"
    ).unwrap();

    /// Commits per path kind (origin, peer, pinned)
    pub static ref RELAY_COMMITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tunnel_relay_commits_total", "Relays committed to a path"),
        &["path"]
    ).unwrap();

    /// Terminal failures per reason
    pub static ref RELAY_BAILS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tunnel_relay_bails_total", "Relays that gave up before committing"),
        &["reason"]
    ).unwrap();

    // === Traffic ===

    /// Bytes shoveled per direction (upload, download)
    pub static ref RELAY_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tunnel_relay_bytes_total", "Bytes relayed per direction"),
        &["direction"]
    ).unwrap();

    /// Relay duration histogram
    pub static ref RELAY_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "tunnel_relay_duration_seconds",
            "Relay lifetime in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0])
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(RELAYS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(RELAYS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(RELAY_ATTEMPTS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(RELAY_COMMITS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(RELAY_BAILS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(RELAY_BYTES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(RELAY_DURATION_SECONDS.clone())).ok();
}

/// Text exposition of the registry
pub fn render() -> String {
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Tracks one relay: counted on creation, released on drop
pub struct RelayMetrics {
    start_time: std::time::Instant,
}

impl RelayMetrics {
    pub fn new() -> Self {
        RELAYS_TOTAL.inc();
        RELAYS_ACTIVE.inc();
        Self {
            start_time: std::time::Instant::now(),
        }
    }

    pub fn record_attempts(&self, attempts: usize) {
        RELAY_ATTEMPTS_TOTAL.inc_by(attempts as u64);
    }

    pub fn record_commit(&self, path: &str) {
        RELAY_COMMITS_TOTAL.with_label_values(&[path]).inc();
    }

    pub fn record_bail(&self, reason: &str) {
        RELAY_BAILS_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn record_bytes(&self, upload: u64, download: u64) {
        RELAY_BYTES_TOTAL.with_label_values(&["upload"]).inc_by(upload);
        RELAY_BYTES_TOTAL.with_label_values(&["download"]).inc_by(download);
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RelayMetrics {
    fn drop(&mut self) {
        RELAYS_ACTIVE.dec();
        RELAY_DURATION_SECONDS.observe(self.start_time.elapsed().as_secs_f64());
    }
}

/// Point-in-time totals for the periodic log line
#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub total: u64,
    pub active: i64,
    pub upload: u64,
    pub download: u64,
}

pub fn summary() -> Summary {
    Summary {
        total: RELAYS_TOTAL.get(),
        active: RELAYS_ACTIVE.get(),
        upload: RELAY_BYTES_TOTAL.with_label_values(&["upload"]).get(),
        download: RELAY_BYTES_TOTAL.with_label_values(&["download"]).get(),
    }
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
