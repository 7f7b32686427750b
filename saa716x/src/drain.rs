//! Bottom-half drain worker.
//!
//! Each FGPI engine has exactly one worker. The worker owns the engine's ring
//! read cursor; nothing else ever moves it. A pass walks the ring from the
//! cursor up to the hardware write index, takes CPU ownership of each full
//! slot, hands the payload to the demultiplexer and gives the slot back to
//! the device.

use std::sync::{Arc, Weak};

use log::{debug, info, trace, warn};

use crate::demux::Demux;
use crate::device::Device;
use crate::error::DmaError;
use crate::fgpi::{CaptureChannel, FgpiController};
use crate::tasklet::DeferredWork;

/// Upper bound on write index samples per pass.
///
/// The engine may complete more slots while a pass is running. Those are
/// picked up by re-sampling the write index after each batch; anything still
/// left after the last round is announced by a fresh interrupt and drained
/// by the next pass.
pub const MAX_RESAMPLE_ROUNDS: usize = 4;

/// What a drain pass submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub slots: usize,
    pub bytes: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }
}

/// Drain worker state of one FGPI engine.
#[derive(Debug)]
pub struct DrainWorker {
    fgpi: u8,
    read_index: usize,
    /// Arm generation the cursor belongs to.
    generation: u32,
    /// Overflow count already reported.
    seen_overflows: u64,
}

impl DrainWorker {
    pub fn new(fgpi: u8) -> Self {
        Self {
            fgpi,
            read_index: 0,
            generation: 0,
            seen_overflows: 0,
        }
    }

    pub fn fgpi(&self) -> u8 {
        self.fgpi
    }

    /// Next slot to drain.
    pub fn read_index(&self) -> usize {
        self.read_index
    }

    /// Wait for scheduled work and drain until the device shuts the
    /// deferred work down, releases the ring or goes away.
    pub async fn run(mut self, device: Weak<Device>, work: Arc<DeferredWork>) {
        info!("[Drain] Worker for FGPI {} started", self.fgpi);
        while work.wait(self.fgpi).await {
            let Some(device) = device.upgrade() else {
                break;
            };
            match device.drain_channel(&mut self) {
                Ok(report) if !report.is_empty() => {
                    trace!(
                        "[Drain] FGPI {}: {} slots, {} bytes",
                        self.fgpi,
                        report.slots,
                        report.bytes
                    );
                }
                Ok(_) => {}
                Err(DmaError::Released) => {
                    debug!("[Drain] FGPI {}: ring released", self.fgpi);
                    break;
                }
                Err(e) => {
                    warn!("[Drain] FGPI {}: drain failed: {}", self.fgpi, e);
                }
            }
        }
        info!("[Drain] Worker for FGPI {} stopped", self.fgpi);
    }

    /// The engine was re-armed since this pass synced its cursor. The
    /// rest of the pass is dropped; the next one starts over at slot 0.
    fn rearmed(&self, channel: &CaptureChannel) -> bool {
        let generation = channel.generation();
        if generation == self.generation {
            return false;
        }
        debug!(
            "[Drain] FGPI {}: re-armed mid-pass (generation {} -> {}), pass dropped",
            self.fgpi, self.generation, generation
        );
        true
    }

    /// One drain pass over `channel`.
    pub fn drain(
        &mut self,
        channel: &CaptureChannel,
        ctl: &FgpiController,
        demux: &dyn Demux,
    ) -> Result<DrainReport, DmaError> {
        let ring = channel.ring();
        let stats = channel.stats();
        if ring.is_released() {
            return Err(DmaError::Released);
        }

        let generation = channel.generation();
        if generation != self.generation {
            // Re-armed: the engine starts over at slot 0.
            debug!(
                "[Drain] FGPI {}: generation {} -> {}, cursor reset",
                self.fgpi, self.generation, generation
            );
            self.generation = generation;
            self.read_index = 0;
            self.seen_overflows = stats.overflows();
        }

        stats.record_pass();
        let capacity = ring.capacity();
        let mut write_index = ctl.write_index(self.fgpi) % capacity;
        if write_index == self.read_index {
            stats.record_spurious();
            return Ok(DrainReport::default());
        }

        let range = channel.payload_range();
        let mut report = DrainReport::default();
        'pass: for _ in 0..MAX_RESAMPLE_ROUNDS {
            while self.read_index != write_index {
                if self.rearmed(channel) {
                    break 'pass;
                }
                let slot = ring.slot(self.read_index)?;
                slot.sync_for_cpu()?;
                let submitted = slot.with_cpu_bytes(range.clone(), |payload| {
                    demux.submit(payload);
                    payload.len()
                });
                slot.sync_for_device()?;
                let submitted = submitted?;

                report.slots += 1;
                report.bytes += submitted;
                self.read_index = ring.next(self.read_index);
            }

            if self.rearmed(channel) {
                break;
            }
            let resampled = ctl.write_index(self.fgpi) % capacity;
            if resampled == write_index {
                break;
            }
            write_index = resampled;
        }

        stats.record_drained(report.slots as u64, report.bytes as u64);

        let overflows = stats.overflows();
        if overflows > self.seen_overflows {
            warn!(
                "[Drain] FGPI {}: ring overrun, {} new overflow(s) ({} total), stream data lost",
                self.fgpi,
                overflows - self.seen_overflows,
                overflows
            );
            self.seen_overflows = overflows;
        }

        Ok(report)
    }
}
