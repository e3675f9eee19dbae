//! Global atomic counters for Tollgate adjudication.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at process exit or on a timer).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    adjudications: AtomicU64,
    denials: AtomicU64,
    escalations: AtomicU64,
    writer_conflicts: AtomicU64,
    evaluation_timeouts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            adjudications: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            writer_conflicts: AtomicU64::new(0),
            evaluation_timeouts: AtomicU64::new(0),
        }
    }

    /// Count one committed adjudication.
    pub fn inc_adjudications(&self) {
        self.adjudications.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "adjudications", "counter incremented");
    }

    pub fn inc_denials(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "denials", "counter incremented");
    }

    pub fn inc_escalations(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "escalations", "counter incremented");
    }

    pub fn inc_writer_conflicts(&self) {
        self.writer_conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "writer_conflicts", "counter incremented");
    }

    pub fn inc_evaluation_timeouts(&self) {
        self.evaluation_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "evaluation_timeouts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            adjudications = self.adjudications(),
            denials = self.denials(),
            escalations = self.escalations(),
            writer_conflicts = self.writer_conflicts(),
            evaluation_timeouts = self.evaluation_timeouts(),
        );
    }

    pub fn adjudications(&self) -> u64 {
        self.adjudications.load(Ordering::Relaxed)
    }

    pub fn denials(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }

    pub fn escalations(&self) -> u64 {
        self.escalations.load(Ordering::Relaxed)
    }

    pub fn writer_conflicts(&self) -> u64 {
        self.writer_conflicts.load(Ordering::Relaxed)
    }

    pub fn evaluation_timeouts(&self) -> u64 {
        self.evaluation_timeouts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.adjudications.store(0, Ordering::Relaxed);
        self.denials.store(0, Ordering::Relaxed);
        self.escalations.store(0, Ordering::Relaxed);
        self.writer_conflicts.store(0, Ordering::Relaxed);
        self.evaluation_timeouts.store(0, Ordering::Relaxed);
    }
}
