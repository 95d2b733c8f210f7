//! Engine metrics collection.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of engine metrics at a point in time.
pub struct MetricsSnapshot {
    /// Commands sent as initiator.
    pub commands_sent: u64,
    /// Commands received as responder.
    pub commands_received: u64,
    /// Bulk payload bytes sent (PUT payloads, GET replies, remote writes).
    pub bulk_bytes_sent: u64,
    /// Bulk payload bytes received (GET payloads, PUT payloads, remote reads).
    pub bulk_bytes_received: u64,
    /// Completions dispatched to a pending request.
    pub completions: u64,
    /// Completions that carried an error code.
    pub completion_errors: u64,
    /// Completions whose context matched no pending request.
    pub completions_dropped: u64,
    /// Requests cancelled by connection teardown.
    pub requests_cancelled: u64,
    /// Protocol violations (bad handshake, unknown command, no credits).
    pub protocol_errors: u64,
    /// Connection setups that failed and were rolled back.
    pub setup_failures: u64,
    /// Timers that fired.
    pub timers_fired: u64,
    /// Tasks whose callback ran.
    pub tasks_completed: u64,
    /// Connections opened.
    pub connections_opened: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Connections currently live.
    pub active_connections: u32,
}

/// Thread-safe engine metrics collector.
pub struct EngineMetrics {
    commands_sent: AtomicU64,
    commands_received: AtomicU64,
    bulk_bytes_sent: AtomicU64,
    bulk_bytes_received: AtomicU64,
    completions: AtomicU64,
    completion_errors: AtomicU64,
    completions_dropped: AtomicU64,
    requests_cancelled: AtomicU64,
    protocol_errors: AtomicU64,
    setup_failures: AtomicU64,
    timers_fired: AtomicU64,
    tasks_completed: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl EngineMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            commands_sent: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            bulk_bytes_sent: AtomicU64::new(0),
            bulk_bytes_received: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            completion_errors: AtomicU64::new(0),
            completions_dropped: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            setup_failures: AtomicU64::new(0),
            timers_fired: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
        }
    }

    /// Increments the commands sent counter.
    pub fn inc_commands_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the commands received counter.
    pub fn inc_commands_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the bulk bytes sent counter.
    pub fn add_bulk_bytes_sent(&self, bytes: u64) {
        self.bulk_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bulk bytes received counter.
    pub fn add_bulk_bytes_received(&self, bytes: u64) {
        self.bulk_bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one dispatched completion.
    pub fn completion(&self, failed: bool) {
        self.completions.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.completion_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increments the dropped completions counter.
    pub fn inc_completions_dropped(&self) {
        self.completions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the cancelled requests counter.
    pub fn add_requests_cancelled(&self, count: u64) {
        self.requests_cancelled.fetch_add(count, Ordering::Relaxed);
    }

    /// Increments the protocol errors counter.
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the setup failures counter.
    pub fn inc_setup_failures(&self) {
        self.setup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the timers fired counter.
    pub fn inc_timers_fired(&self) {
        self.timers_fired.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the tasks completed counter.
    pub fn inc_tasks_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a new connection, incrementing both opened and active counters.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a closed connection, decrementing active connections.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            bulk_bytes_sent: self.bulk_bytes_sent.load(Ordering::Relaxed),
            bulk_bytes_received: self.bulk_bytes_received.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            completion_errors: self.completion_errors.load(Ordering::Relaxed),
            completions_dropped: self.completions_dropped.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            setup_failures: self.setup_failures.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_metrics_new() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_completion_counting() {
        let metrics = EngineMetrics::new();
        metrics.completion(false);
        metrics.completion(true);
        metrics.inc_completions_dropped();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completions, 2);
        assert_eq!(snapshot.completion_errors, 1);
        assert_eq!(snapshot.completions_dropped, 1);
    }

    #[test]
    fn test_connection_tracking() {
        let metrics = EngineMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn test_connection_close_saturating() {
        let metrics = EngineMetrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().active_connections, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = EngineMetrics::new();
        metrics.inc_commands_sent();
        metrics.add_bulk_bytes_sent(4096);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"commands_sent\":1"));
        assert!(json.contains("\"bulk_bytes_sent\":4096"));
    }

    #[test]
    fn test_concurrent_metrics() {
        let metrics = Arc::new(EngineMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        m.inc_commands_received();
                        m.add_bulk_bytes_received(2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commands_received, 1000);
        assert_eq!(snapshot.bulk_bytes_received, 2000);
    }
}
