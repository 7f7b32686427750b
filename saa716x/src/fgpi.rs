//! FGPI capture channel controller.
//!
//! One FGPI engine streams transport-stream bytes from a video input port
//! into its DMA ring. The controller programs the stream framing and arms or
//! disarms the engine; it never looks at the captured data.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::dma::DmaRing;
use crate::error::CaptureError;
use crate::io::RegisterIo;
use crate::regs::{self, bam, fgpi as fgpi_regs, mmu, msi, FGPI_ENGINES};
use crate::stats::ChannelStats;
use crate::ts::TS_PACKET_SIZE;

/// Stream type tag programmed into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Unframed samples.
    Raw,
    /// MPEG-2 transport stream.
    Transport,
}

impl StreamType {
    fn tag(self) -> u32 {
        match self {
            StreamType::Raw => 0x0,
            StreamType::Transport => 0x1,
        }
    }
}

/// Stream framing parameters of one capture channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Bits per sample.
    pub bits: u8,
    /// Samples per line.
    pub samples: u32,
    /// Lines per buffer slot.
    pub lines: u32,
    /// Distance in bytes between line starts.
    pub pitch: u32,
    /// Byte offset of the first line within a slot.
    pub offset: u32,
    pub stream_type: StreamType,
    pub flags: u32,
}

impl FrameGeometry {
    /// Transport-stream framing: one 188-byte packet per line, as many
    /// lines as fit into `slot_bytes`. The line count saturates at
    /// `u32::MAX`; [`validate`](Self::validate) rejects such frames.
    pub fn transport_stream(slot_bytes: usize) -> Self {
        let samples = TS_PACKET_SIZE as u32;
        Self {
            bits: 8,
            samples,
            lines: u32::try_from(slot_bytes / TS_PACKET_SIZE).unwrap_or(u32::MAX),
            pitch: samples,
            offset: 0,
            stream_type: StreamType::Transport,
            flags: 0,
        }
    }

    /// Bytes per line.
    pub fn line_bytes(&self) -> u32 {
        self.samples * self.bits as u32 / 8
    }

    /// Bytes of one completed slot handed to the demultiplexer.
    pub fn payload_len(&self) -> usize {
        self.lines as usize * self.pitch as usize
    }

    /// Byte range of the payload within a slot.
    pub fn payload_range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.payload_len()
    }

    /// Check that the frame fits into a slot of `slot_size` bytes.
    pub fn validate(&self, slot_size: usize) -> Result<(), CaptureError> {
        if self.bits == 0 || self.bits % 8 != 0 {
            return Err(CaptureError::InvalidGeometry(format!(
                "{} bits per sample",
                self.bits
            )));
        }
        if self.samples == 0 || self.lines == 0 {
            return Err(CaptureError::InvalidGeometry(format!(
                "empty frame ({} samples x {} lines)",
                self.samples, self.lines
            )));
        }
        if self.pitch < self.line_bytes() {
            return Err(CaptureError::InvalidGeometry(format!(
                "pitch {} shorter than line of {} bytes",
                self.pitch,
                self.line_bytes()
            )));
        }
        let needed = self.payload_range().end;
        if needed > slot_size {
            return Err(CaptureError::InvalidGeometry(format!(
                "frame needs {} bytes, slot holds {}",
                needed, slot_size
            )));
        }
        Ok(())
    }
}

/// One FGPI engine with its DMA ring.
pub struct CaptureChannel {
    fgpi: u8,
    dma_channel: u8,
    ring: DmaRing,
    geometry: Mutex<Option<FrameGeometry>>,
    enabled: AtomicBool,
    /// Bumped every time the engine is armed.
    generation: AtomicU32,
    stats: ChannelStats,
}

impl CaptureChannel {
    fn new(fgpi: u8, ring: DmaRing) -> Self {
        Self {
            fgpi,
            dma_channel: regs::fgpi_dma_channel(fgpi),
            ring,
            geometry: Mutex::new(None),
            enabled: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            stats: ChannelStats::new(),
        }
    }

    pub fn fgpi(&self) -> u8 {
        self.fgpi
    }

    pub fn dma_channel(&self) -> u8 {
        self.dma_channel
    }

    pub fn ring(&self) -> &DmaRing {
        &self.ring
    }

    /// Geometry programmed by the last start, if any.
    pub fn geometry(&self) -> Option<FrameGeometry> {
        *self.geometry.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Arm generation; changes each time the engine restarts at slot 0.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Payload range of a completed slot.
    pub fn payload_range(&self) -> Range<usize> {
        self.geometry()
            .unwrap_or_else(|| FrameGeometry::transport_stream(self.ring.slot_size()))
            .payload_range()
    }
}

/// Start/stop contract used by feed activation.
pub trait CaptureControl: Send + Sync {
    /// Program `geometry` and arm the engine.
    ///
    /// Must not be called on a running engine.
    fn start(&self, fgpi: u8, geometry: &FrameGeometry) -> Result<(), CaptureError>;

    /// Disarm the engine.
    fn stop(&self, fgpi: u8);
}

/// Controller for all FGPI engines of one device.
pub struct FgpiController {
    regs: Arc<dyn RegisterIo>,
    channels: Vec<Option<Arc<CaptureChannel>>>,
}

impl FgpiController {
    pub fn new(regs: Arc<dyn RegisterIo>) -> Self {
        Self {
            regs,
            channels: vec![None; FGPI_ENGINES],
        }
    }

    /// Allocate the ring of an engine and program its slot addresses.
    pub fn init(
        &mut self,
        fgpi: u8,
        slots: usize,
        slot_size: usize,
    ) -> Result<Arc<CaptureChannel>, CaptureError> {
        let entry = self
            .channels
            .get_mut(fgpi as usize)
            .ok_or(CaptureError::NoSuchEngine(fgpi))?;
        if let Some(channel) = entry {
            warn!("[Fgpi] FGPI {} already initialized", fgpi);
            return Ok(Arc::clone(channel));
        }

        let channel = Arc::new(CaptureChannel::new(fgpi, DmaRing::allocate(slots, slot_size)?));
        let dma_channel = channel.dma_channel();

        self.regs.write(fgpi_regs::control(fgpi), 0);
        for slot in channel.ring().slots() {
            self.regs
                .write(fgpi_regs::base(fgpi, slot.index()), slot.bus_addr() as u32);
        }
        self.regs.write(bam::dma_buf_mode(dma_channel), bam::buf_mode(slots));

        info!(
            "[Fgpi] FGPI {} initialized: DMA channel {}, {} slots x {} bytes",
            fgpi, dma_channel, slots, slot_size
        );
        *entry = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Disarm an engine and release its ring.
    pub fn exit(&self, fgpi: u8) {
        let Some(channel) = self.channel(fgpi) else {
            return;
        };
        if channel.is_enabled() {
            self.stop(fgpi);
        }
        channel.ring().release();
        debug!("[Fgpi] FGPI {} released", fgpi);
    }

    /// Initialized channel of an engine.
    pub fn channel(&self, fgpi: u8) -> Option<&Arc<CaptureChannel>> {
        self.channels.get(fgpi as usize).and_then(Option::as_ref)
    }

    /// All initialized channels.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<CaptureChannel>> {
        self.channels.iter().flatten()
    }

    /// Hardware write index of an engine.
    pub fn write_index(&self, fgpi: u8) -> usize {
        bam::write_index(self.regs.read(bam::dma_buf_mode(regs::fgpi_dma_channel(fgpi))))
    }

    fn lookup(&self, fgpi: u8) -> Result<&Arc<CaptureChannel>, CaptureError> {
        if fgpi as usize >= FGPI_ENGINES {
            return Err(CaptureError::NoSuchEngine(fgpi));
        }
        self.channel(fgpi).ok_or(CaptureError::NotInitialized(fgpi))
    }

    fn irq_bits(fgpi: u8) -> u32 {
        msi::tagack_fgpi(fgpi) | msi::ovrflw_fgpi(fgpi)
    }
}

impl CaptureControl for FgpiController {
    fn start(&self, fgpi: u8, geometry: &FrameGeometry) -> Result<(), CaptureError> {
        let channel = self.lookup(fgpi)?;
        let ring = channel.ring();
        if ring.is_released() {
            return Err(CaptureError::Dma(crate::error::DmaError::Released));
        }
        geometry.validate(ring.slot_size())?;
        if channel.is_enabled() {
            return Err(CaptureError::AlreadyRunning(fgpi));
        }

        info!(
            "[Fgpi] Start DMA engine for FGPI {}: {} bits, {} samples x {} lines, pitch {}",
            fgpi, geometry.bits, geometry.samples, geometry.lines, geometry.pitch
        );

        let regs = &self.regs;
        let dma_channel = channel.dma_channel();
        regs.write(fgpi_regs::control(fgpi), 0);
        regs.write(
            fgpi_regs::size(fgpi),
            (geometry.lines << 16) | (geometry.line_bytes() & 0xffff),
        );
        regs.write(fgpi_regs::stride(fgpi), geometry.pitch);
        regs.write(fgpi_regs::offset(fgpi), geometry.offset);
        regs.write(fgpi_regs::rec_size(fgpi), geometry.payload_len() as u32);
        regs.write(
            fgpi_regs::stream(fgpi),
            geometry.stream_type.tag() | (geometry.flags & 0xff) << 8 | (geometry.bits as u32) << 16,
        );
        regs.write(fgpi_regs::interface(fgpi), 0);

        // The engine restarts at slot 0.
        regs.modify(
            bam::dma_buf_mode(dma_channel),
            bam::WRITE_INDEX_MASK << bam::WRITE_INDEX_SHIFT,
            0,
        );
        ring.discard_pending();
        regs.modify(mmu::dma_config(dma_channel), 0, mmu::DMA_ENABLE);
        regs.write(msi::INT_ENA_SET_L, Self::irq_bits(fgpi));

        *channel.geometry.lock() = Some(*geometry);
        channel.generation.fetch_add(1, Ordering::AcqRel);
        channel.enabled.store(true, Ordering::Release);

        regs.write(fgpi_regs::control(fgpi), fgpi_regs::CONTROL_RUN);
        Ok(())
    }

    fn stop(&self, fgpi: u8) {
        let channel = match self.lookup(fgpi) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("[Fgpi] Stop ignored: {}", e);
                return;
            }
        };

        info!("[Fgpi] Stop DMA engine for FGPI {}", fgpi);
        self.regs.write(fgpi_regs::control(fgpi), 0);
        self.regs.write(msi::INT_ENA_CLR_L, Self::irq_bits(fgpi));
        self.regs
            .modify(mmu::dma_config(channel.dma_channel()), mmu::DMA_ENABLE, 0);
        channel.enabled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{RING_SLOTS, SLOT_SIZE};
    use crate::sim::SimRegisters;

    fn controller() -> (Arc<SimRegisters>, FgpiController) {
        let regs = Arc::new(SimRegisters::new());
        let ctl = FgpiController::new(regs.clone());
        (regs, ctl)
    }

    #[test]
    fn test_transport_stream_geometry() {
        let geometry = FrameGeometry::transport_stream(SLOT_SIZE);
        assert_eq!(geometry.lines, 348);
        assert_eq!(geometry.payload_len(), 348 * 188);
        assert_eq!(geometry.payload_len(), 65424);
        assert!(geometry.validate(SLOT_SIZE).is_ok());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_transport_stream_geometry_saturates() {
        let slot_bytes = (u32::MAX as usize + 1) * TS_PACKET_SIZE;
        let geometry = FrameGeometry::transport_stream(slot_bytes);
        assert_eq!(geometry.lines, u32::MAX);
        assert!(geometry.validate(SLOT_SIZE).is_err());

        // Wider than u32 in bytes, but not in lines.
        let geometry = FrameGeometry::transport_stream(u32::MAX as usize + 188);
        assert_eq!(geometry.lines, 22_845_571);
    }

    #[test]
    fn test_geometry_validation() {
        let mut geometry = FrameGeometry::transport_stream(SLOT_SIZE);
        geometry.lines = 349;
        assert!(matches!(
            geometry.validate(SLOT_SIZE),
            Err(CaptureError::InvalidGeometry(_))
        ));

        let mut geometry = FrameGeometry::transport_stream(SLOT_SIZE);
        geometry.pitch = 100;
        assert!(geometry.validate(SLOT_SIZE).is_err());

        let mut geometry = FrameGeometry::transport_stream(SLOT_SIZE);
        geometry.samples = 0;
        assert!(geometry.validate(SLOT_SIZE).is_err());
    }

    #[test]
    fn test_init_programs_slot_addresses() {
        let (regs, mut ctl) = controller();
        let channel = ctl.init(1, RING_SLOTS, SLOT_SIZE).unwrap();

        assert_eq!(channel.dma_channel(), 7);
        for slot in channel.ring().slots() {
            assert_eq!(
                regs.peek(fgpi_regs::base(1, slot.index())),
                slot.bus_addr() as u32
            );
        }
        assert_eq!(regs.peek(bam::dma_buf_mode(7)), 0x7);
        assert!(ctl.channel(0).is_none());
        assert!(matches!(ctl.init(4, RING_SLOTS, SLOT_SIZE), Err(CaptureError::NoSuchEngine(4))));
    }

    #[test]
    fn test_start_and_stop() {
        let (regs, mut ctl) = controller();
        let channel = ctl.init(3, RING_SLOTS, SLOT_SIZE).unwrap();
        let geometry = FrameGeometry::transport_stream(SLOT_SIZE);

        // Leave a stale write index behind.
        regs.poke(bam::dma_buf_mode(9), bam::with_write_index(0x7, 5));

        ctl.start(3, &geometry).unwrap();
        assert!(channel.is_enabled());
        assert_eq!(channel.generation(), 1);
        assert_eq!(channel.geometry(), Some(geometry));
        assert_eq!(regs.peek(fgpi_regs::control(3)), fgpi_regs::CONTROL_RUN);
        assert_eq!(regs.peek(fgpi_regs::size(3)), (348 << 16) | 188);
        assert_eq!(regs.peek(fgpi_regs::rec_size(3)), 65424);
        assert_eq!(ctl.write_index(3), 0);
        assert_eq!(regs.peek(bam::dma_buf_mode(9)) & bam::BUF_COUNT_MASK, 0x7);
        assert_ne!(regs.peek(mmu::dma_config(9)) & mmu::DMA_ENABLE, 0);
        assert_eq!(
            regs.peek(msi::INT_ENA_L),
            msi::TAGACK_FGPI_3 | msi::ovrflw_fgpi(3)
        );

        assert_eq!(
            ctl.start(3, &geometry),
            Err(CaptureError::AlreadyRunning(3))
        );

        ctl.stop(3);
        assert!(!channel.is_enabled());
        assert_eq!(regs.peek(fgpi_regs::control(3)), 0);
        assert_eq!(regs.peek(msi::INT_ENA_L), 0);
        assert_eq!(regs.peek(mmu::dma_config(9)) & mmu::DMA_ENABLE, 0);

        ctl.start(3, &geometry).unwrap();
        assert_eq!(channel.generation(), 2);
    }

    #[test]
    fn test_start_uninitialized_or_released() {
        let (_regs, mut ctl) = controller();
        let geometry = FrameGeometry::transport_stream(SLOT_SIZE);
        assert_eq!(ctl.start(0, &geometry), Err(CaptureError::NotInitialized(0)));

        ctl.init(0, RING_SLOTS, SLOT_SIZE).unwrap();
        ctl.exit(0);
        assert!(matches!(ctl.start(0, &geometry), Err(CaptureError::Dma(_))));
    }
}
