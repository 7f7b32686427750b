//! Per-channel capture statistics.
//!
//! Counters are updated from the interrupt dispatcher and the drain worker
//! with relaxed atomics; they are diagnostics, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::info;

/// Capture statistics for one FGPI engine.
pub struct ChannelStats {
    /// Time the counters were created.
    start_time: Instant,
    /// Completion interrupts seen.
    interrupts: AtomicU64,
    /// Overflow interrupts seen.
    overflows: AtomicU64,
    /// Drain passes run.
    drain_passes: AtomicU64,
    /// Drain passes that found nothing to do.
    spurious_wakeups: AtomicU64,
    /// Slots submitted to the demultiplexer.
    slots_drained: AtomicU64,
    /// Bytes submitted to the demultiplexer.
    bytes_submitted: AtomicU64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            interrupts: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            drain_passes: AtomicU64::new(0),
            spurious_wakeups: AtomicU64::new(0),
            slots_drained: AtomicU64::new(0),
            bytes_submitted: AtomicU64::new(0),
        }
    }

    pub fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass(&self) {
        self.drain_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spurious(&self) {
        self.spurious_wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drained(&self, slots: u64, bytes: u64) {
        self.slots_drained.fetch_add(slots, Ordering::Relaxed);
        self.bytes_submitted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::Relaxed)
    }

    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn drain_passes(&self) -> u64 {
        self.drain_passes.load(Ordering::Relaxed)
    }

    pub fn spurious_wakeups(&self) -> u64 {
        self.spurious_wakeups.load(Ordering::Relaxed)
    }

    pub fn slots_drained(&self) -> u64 {
        self.slots_drained.load(Ordering::Relaxed)
    }

    pub fn bytes_submitted(&self) -> u64 {
        self.bytes_submitted.load(Ordering::Relaxed)
    }

    /// Time since the counters were created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Submission rate in bytes per second.
    pub fn rate_bytes_per_sec(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed < 0.01 {
            return 0.0;
        }
        self.bytes_submitted() as f64 / elapsed
    }

    /// Log a one-line summary.
    pub fn report(&self, fgpi: u8) {
        info!(
            "[FGPI {}] Stats: duration={:.1}s, irqs={}, overflows={}, passes={} (spurious={}), \
             slots={}, bytes={}, rate={:.2} MB/s",
            fgpi,
            self.elapsed().as_secs_f64(),
            self.interrupts(),
            self.overflows(),
            self.drain_passes(),
            self.spurious_wakeups(),
            self.slots_drained(),
            self.bytes_submitted(),
            self.rate_bytes_per_sec() / 1_000_000.0
        );
    }
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_stats() {
        let stats = ChannelStats::new();
        stats.record_interrupt();
        stats.record_interrupt();
        stats.record_pass();
        stats.record_drained(2, 2 * 65424);

        assert_eq!(stats.interrupts(), 2);
        assert_eq!(stats.drain_passes(), 1);
        assert_eq!(stats.slots_drained(), 2);
        assert_eq!(stats.bytes_submitted(), 130848);

        std::thread::sleep(Duration::from_millis(20));
        assert!(stats.rate_bytes_per_sec() > 0.0);
    }
}
