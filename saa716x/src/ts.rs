//! Transport-stream packet helpers and quality analyzer.

use std::collections::HashMap;

/// TS packet size.
pub const TS_PACKET_SIZE: usize = 188;
/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;
/// Null packet PID.
pub const NULL_PID: u16 = 0x1FFF;
/// Program association table PID.
pub const PAT_PID: u16 = 0x0000;

/// PID of a packet, or `None` if it does not start with a sync byte.
pub fn packet_pid(packet: &[u8]) -> Option<u16> {
    if packet.len() < 4 || packet[0] != SYNC_BYTE {
        return None;
    }
    Some(((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16)
}

/// Build a payload-only packet. `payload_unit_start` sets the PUSI flag.
pub fn packet(pid: u16, cc: u8, payload_unit_start: bool, payload: &[u8]) -> [u8; TS_PACKET_SIZE] {
    let mut pkt = [0xFFu8; TS_PACKET_SIZE];
    pkt[0] = SYNC_BYTE;
    pkt[1] = ((pid >> 8) as u8 & 0x1F) | if payload_unit_start { 0x40 } else { 0 };
    pkt[2] = pid as u8;
    pkt[3] = 0x10 | (cc & 0x0F);
    let n = payload.len().min(TS_PACKET_SIZE - 4);
    pkt[4..4 + n].copy_from_slice(&payload[..n]);
    pkt
}

/// Quality counters for a TS stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsStreamQuality {
    pub packets_total: u64,
    pub packets_dropped: u64,
    pub packets_scrambled: u64,
    pub packets_error: u64,
    /// Packets without a sync byte at the expected position.
    pub sync_lost: u64,
}

/// TS packet analyzer for continuity and error tracking.
#[derive(Debug, Default)]
pub struct TsPacketAnalyzer {
    last_cc: HashMap<u16, u8>,
    quality: TsStreamQuality,
}

impl TsPacketAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze one packet-aligned block.
    pub fn analyze(&mut self, data: &[u8]) {
        for packet in data.chunks_exact(TS_PACKET_SIZE) {
            let Some(pid) = packet_pid(packet) else {
                self.quality.sync_lost += 1;
                continue;
            };
            self.quality.packets_total += 1;

            if packet[1] & 0x80 != 0 {
                self.quality.packets_error += 1;
            }
            if (packet[3] >> 6) & 0x03 != 0 {
                self.quality.packets_scrambled += 1;
            }
            if pid == NULL_PID {
                continue;
            }

            // No payload, counter does not advance.
            let adaptation_field = (packet[3] >> 4) & 0x03;
            if adaptation_field == 0 || adaptation_field == 2 {
                continue;
            }

            let cc = packet[3] & 0x0F;
            if let Some(last) = self.last_cc.insert(pid, cc) {
                if cc != (last + 1) & 0x0F {
                    self.quality.packets_dropped += 1;
                }
            }
        }
    }

    /// Snapshot of the counters.
    pub fn snapshot(&self) -> TsStreamQuality {
        self.quality
    }

    /// Forget continuity state, e.g. after the capture restarted.
    pub fn reset_continuity(&mut self) {
        self.last_cc.clear();
    }
}
