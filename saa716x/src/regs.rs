//! SAA716x register map.
//!
//! Registers are addressed symbolically as a (block, offset) pair. Only the
//! registers touched by the transport-stream capture path are listed.
//!
//! ```text
//! MSI  INT_STATUS_L   bit  6..9   TAGACK_FGPI_0..3   buffer completed
//!                     bit 16..19  OVRFLW_FGPI_0..3   engine overflow
//! BAM  DMA_BUF_MODE   bits [2:0]  slot count - 1
//!                     bits [5:3]  hardware write index
//! MMU  DMA_CONFIG     bit  6      DMA channel enable
//! ```

/// Register block of the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Block {
    /// Global registers (clocking, video port routing).
    Greg,
    /// Interrupt controller.
    Msi,
    /// Buffer address manager.
    Bam,
    /// DMA address translation.
    Mmu,
    /// One FGPI capture engine.
    Fgpi(u8),
}

/// Symbolic register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    pub block: Block,
    pub offset: u32,
}

impl Reg {
    pub const fn new(block: Block, offset: u32) -> Self {
        Self { block, offset }
    }
}

/// Number of FGPI capture engines on the chip.
pub const FGPI_ENGINES: usize = 4;

/// DMA channels 0..5 belong to the video input ports, FGPI engines follow.
pub const FGPI_DMA_CHANNEL_BASE: u8 = 6;

/// DMA channel used by an FGPI engine.
pub const fn fgpi_dma_channel(fgpi: u8) -> u8 {
    FGPI_DMA_CHANNEL_BASE + fgpi
}

/// Interrupt controller registers.
pub mod msi {
    use super::{Block, Reg};

    pub const INT_STATUS_L: Reg = Reg::new(Block::Msi, 0xfc0);
    pub const INT_STATUS_H: Reg = Reg::new(Block::Msi, 0xfc4);
    pub const INT_STATUS_CLR_L: Reg = Reg::new(Block::Msi, 0xfc8);
    pub const INT_STATUS_CLR_H: Reg = Reg::new(Block::Msi, 0xfcc);
    pub const INT_STATUS_SET_L: Reg = Reg::new(Block::Msi, 0xfd0);
    pub const INT_STATUS_SET_H: Reg = Reg::new(Block::Msi, 0xfd4);
    pub const INT_ENA_L: Reg = Reg::new(Block::Msi, 0xfd8);
    pub const INT_ENA_H: Reg = Reg::new(Block::Msi, 0xfdc);
    pub const INT_ENA_CLR_L: Reg = Reg::new(Block::Msi, 0xfe0);
    pub const INT_ENA_CLR_H: Reg = Reg::new(Block::Msi, 0xfe4);
    pub const INT_ENA_SET_L: Reg = Reg::new(Block::Msi, 0xfe8);
    pub const INT_ENA_SET_H: Reg = Reg::new(Block::Msi, 0xfec);

    /// Buffer completion ("tag acknowledge") bit of an FGPI engine.
    pub const fn tagack_fgpi(fgpi: u8) -> u32 {
        1 << (6 + fgpi as u32)
    }

    /// Overflow bit of an FGPI engine.
    pub const fn ovrflw_fgpi(fgpi: u8) -> u32 {
        1 << (16 + fgpi as u32)
    }

    pub const TAGACK_FGPI_0: u32 = tagack_fgpi(0);
    pub const TAGACK_FGPI_1: u32 = tagack_fgpi(1);
    pub const TAGACK_FGPI_2: u32 = tagack_fgpi(2);
    pub const TAGACK_FGPI_3: u32 = tagack_fgpi(3);
}

/// Buffer address manager registers.
pub mod bam {
    use super::{Block, Reg};

    pub const fn dma_buf_mode(dma_channel: u8) -> Reg {
        Reg::new(Block::Bam, 0x024 + 0x40 * dma_channel as u32)
    }

    pub const BUF_COUNT_MASK: u32 = 0x7;
    pub const WRITE_INDEX_SHIFT: u32 = 3;
    pub const WRITE_INDEX_MASK: u32 = 0x7;

    /// Extract the hardware write index from a buffer mode value.
    pub const fn write_index(buf_mode: u32) -> usize {
        ((buf_mode >> WRITE_INDEX_SHIFT) & WRITE_INDEX_MASK) as usize
    }

    /// Replace the write index of a buffer mode value.
    pub const fn with_write_index(buf_mode: u32, index: usize) -> u32 {
        (buf_mode & !(WRITE_INDEX_MASK << WRITE_INDEX_SHIFT))
            | (((index as u32) & WRITE_INDEX_MASK) << WRITE_INDEX_SHIFT)
    }

    /// Buffer mode value for a ring of `slots` buffers, write index 0.
    pub const fn buf_mode(slots: usize) -> u32 {
        (slots as u32 - 1) & BUF_COUNT_MASK
    }
}

/// DMA address translation registers.
pub mod mmu {
    use super::{Block, Reg};

    pub const fn dma_config(dma_channel: u8) -> Reg {
        Reg::new(Block::Mmu, 0x004 * dma_channel as u32)
    }

    pub const DMA_ENABLE: u32 = 0x40;
}

/// FGPI engine registers.
pub mod fgpi {
    use super::{Block, Reg};

    pub const fn control(fgpi: u8) -> Reg {
        Reg::new(Block::Fgpi(fgpi), 0x000)
    }

    /// Base address of one ring slot.
    pub const fn base(fgpi: u8, slot: usize) -> Reg {
        Reg::new(Block::Fgpi(fgpi), 0x004 + 4 * slot as u32)
    }

    pub const fn size(fgpi: u8) -> Reg {
        Reg::new(Block::Fgpi(fgpi), 0x024)
    }

    pub const fn stride(fgpi: u8) -> Reg {
        Reg::new(Block::Fgpi(fgpi), 0x028)
    }

    pub const fn offset(fgpi: u8) -> Reg {
        Reg::new(Block::Fgpi(fgpi), 0x02c)
    }

    pub const fn rec_size(fgpi: u8) -> Reg {
        Reg::new(Block::Fgpi(fgpi), 0x030)
    }

    pub const fn stream(fgpi: u8) -> Reg {
        Reg::new(Block::Fgpi(fgpi), 0x034)
    }

    pub const fn interface(fgpi: u8) -> Reg {
        Reg::new(Block::Fgpi(fgpi), 0x038)
    }

    pub const CONTROL_RUN: u32 = 0x1;
}

/// Global registers.
pub mod greg {
    use super::{Block, Reg};

    pub const VI_CTRL: Reg = Reg::new(Block::Greg, 0x000);
    pub const FGPI_CTRL: Reg = Reg::new(Block::Greg, 0x004);

    /// All video input ports use their own clocks.
    pub const VI_CTRL_OWN_CLOCKS: u32 = 0x2C68_8000;

    /// Route video port `vp` to FGPI engine `fgpi`.
    pub const fn fgpi_ctrl_sel(vp: u8, fgpi: u8) -> u32 {
        ((vp as u32) & 0x7) << (fgpi as u32 * 3)
    }
}
