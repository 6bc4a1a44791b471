use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between the callers of a route and its background task.
#[derive(Debug, Default)]
pub(crate) struct RouteStats {
    buffered: AtomicU64,
    dropped_queue_full: AtomicU64,
    decode_failed: AtomicU64,
    delivered: AtomicU64,
    flush_errors: AtomicU64,
    discarded: AtomicU64,
}

impl RouteStats {
    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn inc_buffered(&self) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_buffered(&self) {
        self.buffered.fetch_sub(1, Ordering::Relaxed);
    }

    /// Resets the buffered count and returns the lines it held.
    pub fn take_buffered(&self) -> u64 {
        self.buffered.swap(0, Ordering::Relaxed)
    }

    pub fn dropped_queue_full(&self) -> u64 {
        self.dropped_queue_full.load(Ordering::Relaxed)
    }

    pub fn inc_dropped_queue_full(&self) {
        self.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failed(&self) -> u64 {
        self.decode_failed.load(Ordering::Relaxed)
    }

    pub fn inc_decode_failed(&self) {
        self.decode_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn add_delivered(&self, n: u64) {
        self.delivered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn flush_errors(&self) -> u64 {
        self.flush_errors.load(Ordering::Relaxed)
    }

    pub fn inc_flush_errors(&self) {
        self.flush_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn add_discarded(&self, n: u64) {
        self.discarded.fetch_add(n, Ordering::Relaxed);
    }
}
