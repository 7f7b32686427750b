//! Simulated register file and capture engine.
//!
//! [`SimRegisters`] stands in for the memory-mapped register window and
//! reproduces the write-to-clear / write-to-set behaviour of the interrupt
//! controller. [`SimEngine`] plays the FGPI hardware: it fills the slot at
//! the write index, advances the index and raises the completion bit.

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::dma::SlotWrite;
use crate::error::DmaError;
use crate::fgpi::CaptureChannel;
use crate::io::RegisterIo;
use crate::regs::{bam, fgpi, mmu, msi, Reg};

/// In-memory register file.
#[derive(Default)]
pub struct SimRegisters {
    regs: Mutex<HashMap<Reg, u32>>,
    writes: Mutex<HashMap<Reg, u64>>,
}

impl SimRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a register without side effects.
    pub fn peek(&self, reg: Reg) -> u32 {
        self.regs.lock().get(&reg).copied().unwrap_or(0)
    }

    /// Hardware-side store; not counted as a driver write.
    pub fn poke(&self, reg: Reg, value: u32) {
        self.regs.lock().insert(reg, value);
    }

    /// Hardware-side set of status bits.
    pub fn raise(&self, reg: Reg, bits: u32) {
        *self.regs.lock().entry(reg).or_insert(0) |= bits;
    }

    /// Number of driver writes to a register.
    pub fn write_count(&self, reg: Reg) -> u64 {
        self.writes.lock().get(&reg).copied().unwrap_or(0)
    }
}

impl RegisterIo for SimRegisters {
    fn read(&self, reg: Reg) -> u32 {
        self.peek(reg)
    }

    fn write(&self, reg: Reg, value: u32) {
        *self.writes.lock().entry(reg).or_insert(0) += 1;

        let mut regs = self.regs.lock();
        let (target, set, clear) = match reg {
            r if r == msi::INT_STATUS_CLR_L => (msi::INT_STATUS_L, 0, value),
            r if r == msi::INT_STATUS_CLR_H => (msi::INT_STATUS_H, 0, value),
            r if r == msi::INT_STATUS_SET_L => (msi::INT_STATUS_L, value, 0),
            r if r == msi::INT_STATUS_SET_H => (msi::INT_STATUS_H, value, 0),
            r if r == msi::INT_ENA_SET_L => (msi::INT_ENA_L, value, 0),
            r if r == msi::INT_ENA_SET_H => (msi::INT_ENA_H, value, 0),
            r if r == msi::INT_ENA_CLR_L => (msi::INT_ENA_L, 0, value),
            r if r == msi::INT_ENA_CLR_H => (msi::INT_ENA_H, 0, value),
            _ => {
                regs.insert(reg, value);
                return;
            }
        };
        let entry = regs.entry(target).or_insert(0);
        *entry = (*entry & !clear) | set;
    }
}

/// Simulated FGPI engines sharing one register file.
pub struct SimEngine {
    regs: Arc<SimRegisters>,
}

impl SimEngine {
    pub fn new(regs: Arc<SimRegisters>) -> Self {
        Self { regs }
    }

    /// True if the driver armed the engine and enabled its DMA channel.
    pub fn is_running(&self, channel: &CaptureChannel) -> bool {
        let run = self.regs.peek(fgpi::control(channel.fgpi())) & fgpi::CONTROL_RUN != 0;
        let dma = self.regs.peek(mmu::dma_config(channel.dma_channel())) & mmu::DMA_ENABLE != 0;
        run && dma
    }

    /// Current hardware write index.
    pub fn write_index(&self, channel: &CaptureChannel) -> usize {
        bam::write_index(self.regs.peek(bam::dma_buf_mode(channel.dma_channel())))
    }

    /// Complete one slot with `payload`.
    ///
    /// Returns `Ok(false)` when the engine is disarmed and nothing was
    /// written. The completion bit is raised after the write index moved.
    pub fn complete_slot(&self, channel: &CaptureChannel, payload: &[u8]) -> Result<bool, DmaError> {
        if !self.is_running(channel) {
            return Ok(false);
        }

        let fgpi = channel.fgpi();
        let mode_reg = bam::dma_buf_mode(channel.dma_channel());
        let mode = self.regs.peek(mode_reg);
        let index = bam::write_index(mode);

        let ring = channel.ring();
        let outcome = ring.dma_write(index, payload)?;
        self.regs.poke(mode_reg, bam::with_write_index(mode, ring.next(index)));

        let mut bits = msi::tagack_fgpi(fgpi);
        if outcome == SlotWrite::Overrun {
            bits |= msi::ovrflw_fgpi(fgpi);
        }
        self.regs.raise(msi::INT_STATUS_L, bits);
        trace!("[Sim] FGPI {} completed slot {} ({:?})", fgpi, index, outcome);
        Ok(true)
    }
}
