//! Simulated tuner feeding a capture channel.
//!
//! Each tick fills one ring slot through [`SimEngine`] and raises the
//! device interrupt, the way the FGPI engine does when a buffer completes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::watch;

use saa716x::device::Device;
use saa716x::error::DmaError;
use saa716x::fgpi::FrameGeometry;
use saa716x::irq::IrqReturn;
use saa716x::sim::SimEngine;
use saa716x::ts::{self, NULL_PID, PAT_PID, TS_PACKET_SIZE};

/// PID announced as the program map table.
const PMT_PID: u16 = 0x1000;
/// PES stream id of the generated video stream.
const PES_STREAM_ID: u8 = 0xE0;

/// MPEG-2 CRC32 as used by PSI sections.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Transport stream with a PAT, one PES stream and null stuffing.
#[derive(Debug)]
pub struct TsGenerator {
    pat: Vec<u8>,
    pes_pid: u16,
    pat_cc: u8,
    pes_cc: u8,
    frame: u32,
}

impl TsGenerator {
    pub fn new(transport_stream_id: u16, pes_pid: u16) -> Self {
        Self {
            pat: Self::pat_section(transport_stream_id, 1, PMT_PID),
            pes_pid,
            pat_cc: 0,
            pes_cc: 0,
            frame: 0,
        }
    }

    /// PAT section with a single program, pointer field included.
    fn pat_section(tsid: u16, program: u16, pmt_pid: u16) -> Vec<u8> {
        let mut section = vec![
            0x00,
            0xB0,
            0x0D,
            (tsid >> 8) as u8,
            tsid as u8,
            0xC1,
            0x00,
            0x00,
            (program >> 8) as u8,
            program as u8,
            0xE0 | (pmt_pid >> 8) as u8,
            pmt_pid as u8,
        ];
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        section.insert(0, 0x00);
        section
    }

    pub fn pes_pid(&self) -> u16 {
        self.pes_pid
    }

    /// Packets for one slot of `lines` lines.
    ///
    /// A slot starts with the PAT and a new PES packet; every fourth packet
    /// after that is stuffing.
    pub fn fill(&mut self, lines: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(lines * TS_PACKET_SIZE);
        self.frame = self.frame.wrapping_add(1);

        for line in 0..lines {
            let packet = match line {
                0 => {
                    let cc = self.next_pat_cc();
                    ts::packet(PAT_PID, cc, true, &self.pat)
                }
                1 => {
                    let cc = self.next_pes_cc();
                    let mut header = vec![0x00, 0x00, 0x01, PES_STREAM_ID, 0x00, 0x00, 0x80, 0x00, 0x00];
                    header.extend_from_slice(&self.frame.to_be_bytes());
                    ts::packet(self.pes_pid, cc, true, &header)
                }
                n if n % 4 == 3 => ts::packet(NULL_PID, 0, false, &[]),
                _ => {
                    let cc = self.next_pes_cc();
                    ts::packet(self.pes_pid, cc, false, &self.frame.to_be_bytes())
                }
            };
            out.extend_from_slice(&packet);
        }
        out
    }

    fn next_pat_cc(&mut self) -> u8 {
        let cc = self.pat_cc;
        self.pat_cc = (cc + 1) & 0x0F;
        cc
    }

    fn next_pes_cc(&mut self) -> u8 {
        let cc = self.pes_cc;
        self.pes_cc = (cc + 1) & 0x0F;
        cc
    }
}

/// Simulated tuner of one adapter.
pub struct SimSource {
    adapter: usize,
    fgpi: u8,
    generator: TsGenerator,
    engine: Arc<SimEngine>,
    device: Arc<Device>,
    interval: Duration,
}

impl SimSource {
    pub fn new(
        device: Arc<Device>,
        engine: Arc<SimEngine>,
        adapter: usize,
        fgpi: u8,
        pes_pid: u16,
        interval: Duration,
    ) -> Self {
        Self {
            adapter,
            fgpi,
            generator: TsGenerator::new(0x7FE0 + adapter as u16, pes_pid),
            engine,
            device,
            interval,
        }
    }

    /// Produce slots until `stop` flips. Returns the number of completed slots.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> u64 {
        let Some(channel) = self.device.channel(self.fgpi).cloned() else {
            warn!("[Source {}] FGPI {} has no capture channel", self.adapter, self.fgpi);
            return 0;
        };
        let lines = FrameGeometry::transport_stream(channel.ring().slot_size()).lines as usize;
        info!(
            "[Source {}] Streaming PID 0x{:04X} into FGPI {} every {:?}",
            self.adapter,
            self.generator.pes_pid(),
            self.fgpi,
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        let mut completed = 0u64;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }

            let payload = self.generator.fill(lines);
            match self.engine.complete_slot(&channel, &payload) {
                Ok(true) => {
                    completed += 1;
                    if self.device.handle_irq() == IrqReturn::None {
                        trace!("[Source {}] interrupt not claimed", self.adapter);
                    }
                }
                Ok(false) => trace!("[Source {}] engine disarmed, slot dropped", self.adapter),
                Err(DmaError::Released) => break,
                Err(e) => warn!("[Source {}] DMA write failed: {}", self.adapter, e),
            }
        }

        debug!("[Source {}] Stopped after {} slots", self.adapter, completed);
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saa716x::ts::{packet_pid, TsPacketAnalyzer};

    #[test]
    fn test_crc32_mpeg2() {
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_pat_section_crc() {
        let pat = TsGenerator::pat_section(0x7FE0, 1, PMT_PID);
        // Pointer field, 3 header bytes, 13 bytes of section.
        assert_eq!(pat.len(), 17);
        let section = &pat[1..];
        let crc = u32::from_be_bytes([section[12], section[13], section[14], section[15]]);
        assert_eq!(crc32_mpeg2(&section[..12]), crc);
    }

    #[test]
    fn test_fill_is_continuous() {
        let mut generator = TsGenerator::new(1, 0x100);
        let mut analyzer = TsPacketAnalyzer::new();
        for _ in 0..3 {
            let slot = generator.fill(348);
            assert_eq!(slot.len(), 348 * TS_PACKET_SIZE);
            assert_eq!(packet_pid(&slot[..TS_PACKET_SIZE]), Some(PAT_PID));
            analyzer.analyze(&slot);
        }
        let quality = analyzer.snapshot();
        assert_eq!(quality.packets_total, 3 * 348);
        assert_eq!(quality.packets_dropped, 0);
    }
}
