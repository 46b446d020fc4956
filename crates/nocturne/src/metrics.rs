// src/metrics.rs
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters shared by every worker of one queue.
#[repr(C, align(64))]
pub struct WorkerMetrics {
    pub req_count: AtomicUsize,
    pub active_conns: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub tasks_executed: AtomicUsize,
    pub tasks_failed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: usize,
    pub active_connections: usize,
    pub bytes_sent: usize,
    pub tasks_executed: usize,
    pub tasks_failed: usize,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicUsize::new(0),
            active_conns: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            tasks_executed: AtomicUsize::new(0),
            tasks_failed: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn task_done(&self, success: bool) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.req_count.load(Ordering::Relaxed),
            active_connections: self.active_conns.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
