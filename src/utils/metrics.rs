//! Observability and Metrics
//!
//! Process-wide counters for chunk traffic, security failures, connection
//! lifecycle and request outcomes.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Global metrics collector for channel operations
#[derive(Debug)]
pub struct Metrics {
    /// Chunks produced by chunk encoders
    pub chunks_encoded: AtomicU64,
    /// Chunks accepted by chunk decoders
    pub chunks_decoded: AtomicU64,
    /// Bytes of encoded chunks
    pub bytes_sent: AtomicU64,
    /// Bytes of decoded chunks
    pub bytes_received: AtomicU64,
    /// Signature, decryption or certificate failures
    pub security_failures: AtomicU64,
    /// Sequence number violations
    pub sequence_errors: AtomicU64,
    /// Messages aborted by the peer
    pub messages_aborted: AtomicU64,
    /// Successful channel bootstraps
    pub connections_total: AtomicU64,
    /// Channels currently open
    pub connections_active: AtomicU64,
    /// Reconnect attempts
    pub reconnect_attempts: AtomicU64,
    /// Security tokens installed (issue and renew)
    pub tokens_installed: AtomicU64,
    /// Requests answered with a response
    pub requests_completed: AtomicU64,
    /// Requests failed with an error other than a timeout
    pub requests_failed: AtomicU64,
    /// Requests whose timer fired first
    pub requests_timed_out: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            chunks_encoded: AtomicU64::new(0),
            chunks_decoded: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            security_failures: AtomicU64::new(0),
            sequence_errors: AtomicU64::new(0),
            messages_aborted: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            tokens_installed: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn chunk_encoded(&self, byte_count: u64) {
        self.chunks_encoded.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn chunk_decoded(&self, byte_count: u64) {
        self.chunks_decoded.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn security_failure(&self) {
        self.security_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sequence_error(&self) {
        self.sequence_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_aborted(&self) {
        self.messages_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturate at zero
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn token_installed(&self) {
        self.tokens_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_encoded: self.chunks_encoded.load(Ordering::Relaxed),
            chunks_decoded: self.chunks_decoded.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            security_failures: self.security_failures.load(Ordering::Relaxed),
            sequence_errors: self.sequence_errors.load(Ordering::Relaxed),
            messages_aborted: self.messages_aborted.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            tokens_installed: self.tokens_installed.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            chunks_encoded = s.chunks_encoded,
            chunks_decoded = s.chunks_decoded,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            security_failures = s.security_failures,
            sequence_errors = s.sequence_errors,
            messages_aborted = s.messages_aborted,
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            reconnect_attempts = s.reconnect_attempts,
            tokens_installed = s.tokens_installed,
            requests_completed = s.requests_completed,
            requests_failed = s.requests_failed,
            requests_timed_out = s.requests_timed_out,
            uptime_seconds = s.uptime_seconds,
            "Channel metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub chunks_encoded: u64,
    pub chunks_decoded: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub security_failures: u64,
    pub sequence_errors: u64,
    pub messages_aborted: u64,
    pub connections_total: u64,
    pub connections_active: u64,
    pub reconnect_attempts: u64,
    pub tokens_installed: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_timed_out: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
