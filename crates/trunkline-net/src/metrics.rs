//! Runtime metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Snapshot of runtime metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Frames handed to senders.
    pub frames_sent: u64,
    /// Frames demultiplexed by receivers.
    pub frames_received: u64,
    /// Payload + header bytes written.
    pub bytes_sent: u64,
    /// Payload + header bytes read.
    pub bytes_received: u64,
    /// Socket writes issued (less than frames_sent when batching works).
    pub socket_writes: u64,
    /// Inbound frames dropped because no live request claimed their id.
    pub frames_dropped: u64,
    /// Connections that completed the handshake.
    pub connections_opened: u64,
    /// Connections finalized.
    pub connections_closed: u64,
    /// Requests-on-connection started.
    pub rocs_started: u64,
    /// Requests-on-connection terminated.
    pub rocs_finished: u64,
    /// Connections torn down for protocol violations.
    pub protocol_errors: u64,
    /// Handshakes rejected for bad credentials.
    pub auth_failures: u64,
}

/// Thread-safe metrics collector shared by a connection set or listener.
#[derive(Debug, Default)]
pub struct NetMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    socket_writes: AtomicU64,
    frames_dropped: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    rocs_started: AtomicU64,
    rocs_finished: AtomicU64,
    protocol_errors: AtomicU64,
    auth_failures: AtomicU64,
}

impl NetMetrics {
    pub fn new() -> Self {
        NetMetrics::default()
    }

    pub fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_socket_write(&self) {
        self.socket_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_roc_started(&self) {
        self.rocs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_roc_finished(&self) {
        self.rocs_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            socket_writes: self.socket_writes.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            rocs_started: self.rocs_started.load(Ordering::Relaxed),
            rocs_finished: self.rocs_finished.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }
}

/// Fixed-bucket latency histogram, microsecond bounds.
///
/// Backs the per-handler `timing` flag of the server request registry.
#[derive(Debug)]
pub struct LatencyHistogram {
    bounds_us: &'static [u64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    total_us: AtomicU64,
}

const DEFAULT_BOUNDS_US: &[u64] = &[
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000,
    1_000_000,
];

impl Default for LatencyHistogram {
    fn default() -> Self {
        LatencyHistogram::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let buckets = (0..=DEFAULT_BOUNDS_US.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        LatencyHistogram {
            bounds_us: DEFAULT_BOUNDS_US,
            buckets,
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
        }
    }

    /// Records one observation.
    pub fn observe(&self, latency: Duration) {
        let us = latency.as_micros().min(u128::from(u64::MAX)) as u64;
        let idx = self
            .bounds_us
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Number of observations recorded.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean latency in microseconds, zero when empty.
    pub fn mean_us(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.total_us.load(Ordering::Relaxed) / count
    }

    /// Cumulative counts per upper bound; the final entry is the overflow
    /// bucket.
    pub fn bucket_counts(&self) -> Vec<(Option<u64>, u64)> {
        let mut out = Vec::with_capacity(self.buckets.len());
        for (idx, bucket) in self.buckets.iter().enumerate() {
            let bound = self.bounds_us.get(idx).copied();
            out.push((bound, bucket.load(Ordering::Relaxed)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = NetMetrics::new();
        metrics.record_frame_sent(100);
        metrics.record_frame_sent(50);
        metrics.record_frame_received(30);
        metrics.record_frame_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_received, 30);
        assert_eq!(snap.frames_dropped, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = NetMetrics::new();
        metrics.record_connection_opened();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"connections_opened\":1"));
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = LatencyHistogram::new();
        hist.observe(Duration::from_micros(40));
        hist.observe(Duration::from_micros(70));
        hist.observe(Duration::from_secs(5));

        assert_eq!(hist.count(), 3);
        let buckets = hist.bucket_counts();
        assert_eq!(buckets[0], (Some(50), 1));
        assert_eq!(buckets[1], (Some(100), 1));
        assert_eq!(buckets.last().unwrap(), &(None, 1));
    }

    #[test]
    fn test_histogram_mean() {
        let hist = LatencyHistogram::new();
        assert_eq!(hist.mean_us(), 0);
        hist.observe(Duration::from_micros(100));
        hist.observe(Duration::from_micros(300));
        assert_eq!(hist.mean_us(), 200);
    }
}
