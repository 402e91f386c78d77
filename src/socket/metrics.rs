use std::sync::atomic::{AtomicU64, Ordering};

/// Per-socket counters.
///
/// Written only by the owning reactor thread, readable from any thread.
/// Increments are relaxed load+store rather than read-modify-write: with a
/// single writer that is sufficient, and readers may observe a slightly
/// stale but never torn value.
#[derive(Debug, Default)]
pub struct Metrics {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_bytes_read(&self, delta: u64) {
        self.bytes_read
            .store(self.bytes_read.load(Ordering::Relaxed) + delta, Ordering::Relaxed);
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_bytes_written(&self, delta: u64) {
        self.bytes_written.store(
            self.bytes_written.load(Ordering::Relaxed) + delta,
            Ordering::Relaxed,
        );
    }

    /// Number of read events: how often the socket was handed data by the
    /// reactor.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_reads(&self) {
        self.reads
            .store(self.reads.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
    }

    /// Number of write events: how often the socket was scheduled on the
    /// reactor for draining.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_writes(&self) {
        self.writes
            .store(self.writes.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
    }
}
