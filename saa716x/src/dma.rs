//! DMA buffer ring for one capture channel.
//!
//! Each slot is a fixed-size region of DMA-capable memory described to the
//! device by a page-granular scatter/gather list. A slot is owned either by
//! the device or by the CPU; software may only look at its bytes after
//! [`DmaSlot::sync_for_cpu`] and must hand it back with
//! [`DmaSlot::sync_for_device`] before the engine may reuse it.

use std::ops::Range;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::error::DmaError;
use crate::ts::TS_PACKET_SIZE;

/// Page size used for scatter/gather entries.
pub const PAGE_SIZE: usize = 4096;
/// Pages per ring slot.
pub const SLOT_PAGES: usize = 16;
/// Bytes per ring slot.
pub const SLOT_SIZE: usize = SLOT_PAGES * PAGE_SIZE;
/// Slots per ring. The hardware write index is three bits wide.
pub const RING_SLOTS: usize = 8;

/// Next free simulated bus address.
static NEXT_BUS_ADDR: AtomicU64 = AtomicU64::new(0x1000_0000);

fn alloc_bus_range(len: usize) -> u64 {
    let len = len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    NEXT_BUS_ADDR.fetch_add(len as u64, Ordering::Relaxed)
}

/// Which side currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Device,
    Cpu,
}

/// One scatter/gather list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub bus_addr: u64,
    pub len: u32,
}

/// Result of a device-side slot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    /// The slot had been drained before it was overwritten.
    Clean,
    /// The slot still held undrained data (or was CPU-owned).
    Overrun,
}

/// One ring slot.
pub struct DmaSlot {
    index: usize,
    mem: Mutex<Box<[u8]>>,
    sg_list: Vec<SgEntry>,
    cpu_owned: AtomicBool,
    filled: AtomicBool,
}

impl DmaSlot {
    fn allocate(index: usize, size: usize) -> Self {
        let base = alloc_bus_range(size);
        let sg_list = (0..size.div_ceil(PAGE_SIZE))
            .map(|page| SgEntry {
                bus_addr: base + (page * PAGE_SIZE) as u64,
                len: PAGE_SIZE.min(size - page * PAGE_SIZE) as u32,
            })
            .collect();

        Self {
            index,
            mem: Mutex::new(vec![0u8; size].into_boxed_slice()),
            sg_list,
            cpu_owned: AtomicBool::new(false),
            filled: AtomicBool::new(false),
        }
    }

    /// Slot position in the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Scatter/gather list the device writes through.
    pub fn sg_list(&self) -> &[SgEntry] {
        &self.sg_list
    }

    /// Bus address of the first page.
    pub fn bus_addr(&self) -> u64 {
        self.sg_list.first().map(|e| e.bus_addr).unwrap_or(0)
    }

    /// Current owner.
    pub fn ownership(&self) -> Ownership {
        if self.cpu_owned.load(Ordering::Acquire) {
            Ownership::Cpu
        } else {
            Ownership::Device
        }
    }

    /// True once the device completed the slot and it has not been drained.
    pub fn is_filled(&self) -> bool {
        self.filled.load(Ordering::Acquire)
    }

    /// Transfer ownership from the device to the CPU.
    ///
    /// Must happen before any byte of the slot is read.
    pub fn sync_for_cpu(&self) -> Result<(), DmaError> {
        self.cpu_owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DmaError::NotDeviceOwned(self.index))?;
        fence(Ordering::Acquire);
        trace!("[Dma] slot {} synced for cpu", self.index);
        Ok(())
    }

    /// Hand the slot back to the device.
    pub fn sync_for_device(&self) -> Result<(), DmaError> {
        if !self.cpu_owned.load(Ordering::Acquire) {
            return Err(DmaError::NotCpuOwned(self.index));
        }
        fence(Ordering::Release);
        self.filled.store(false, Ordering::Release);
        self.cpu_owned.store(false, Ordering::Release);
        trace!("[Dma] slot {} synced for device", self.index);
        Ok(())
    }

    /// Run `f` over a byte range of a CPU-owned slot.
    pub fn with_cpu_bytes<R>(&self, range: Range<usize>, f: impl FnOnce(&[u8]) -> R) -> Result<R, DmaError> {
        if !self.cpu_owned.load(Ordering::Acquire) {
            return Err(DmaError::NotCpuOwned(self.index));
        }
        let mem = self.mem.lock();
        let end = range.end.min(mem.len());
        let start = range.start.min(end);
        Ok(f(&mem[start..end]))
    }

    fn device_write(&self, data: &[u8]) -> SlotWrite {
        let overrun = self.filled.load(Ordering::Acquire) || self.cpu_owned.load(Ordering::Acquire);
        {
            let mut mem = self.mem.lock();
            mem[..data.len()].copy_from_slice(data);
        }
        self.filled.store(true, Ordering::Release);
        if overrun {
            SlotWrite::Overrun
        } else {
            SlotWrite::Clean
        }
    }
}

/// Fixed-capacity ring of DMA slots.
pub struct DmaRing {
    slots: Vec<DmaSlot>,
    slot_size: usize,
    released: AtomicBool,
}

impl DmaRing {
    /// Allocate a ring of `slots` slots, `slot_size` bytes each.
    pub fn allocate(slots: usize, slot_size: usize) -> Result<Self, DmaError> {
        if slots == 0 || slots > RING_SLOTS || slot_size == 0 {
            return Err(DmaError::InvalidRing { slots, slot_size });
        }
        debug!("[Dma] allocating ring: {} slots x {} bytes", slots, slot_size);
        Ok(Self {
            slots: (0..slots).map(|i| DmaSlot::allocate(i, slot_size)).collect(),
            slot_size,
            released: AtomicBool::new(false),
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Bytes of whole transport-stream packets per slot.
    pub fn payload_len(&self) -> usize {
        self.slot_size / TS_PACKET_SIZE * TS_PACKET_SIZE
    }

    /// Access one slot.
    pub fn slot(&self, index: usize) -> Result<&DmaSlot, DmaError> {
        if self.is_released() {
            return Err(DmaError::Released);
        }
        self.slots.get(index).ok_or(DmaError::SlotOutOfRange {
            index,
            slots: self.slots.len(),
        })
    }

    /// Iterate over all slots.
    pub fn slots(&self) -> impl Iterator<Item = &DmaSlot> {
        self.slots.iter()
    }

    /// Index following `index`, modulo the ring capacity.
    pub fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    /// Number of full slots between a read and a write index.
    pub fn pending(&self, read_index: usize, write_index: usize) -> usize {
        let n = self.slots.len();
        (write_index % n + n - read_index % n) % n
    }

    /// Device-side write of one completed slot.
    pub fn dma_write(&self, index: usize, data: &[u8]) -> Result<SlotWrite, DmaError> {
        if data.len() > self.slot_size {
            return Err(DmaError::PayloadTooLarge {
                len: data.len(),
                slot_size: self.slot_size,
            });
        }
        Ok(self.slot(index)?.device_write(data))
    }

    /// Forget undrained data in device-owned slots. Used when the engine is
    /// re-armed and restarts at slot 0.
    pub fn discard_pending(&self) {
        for slot in self.slots.iter().filter(|s| s.ownership() == Ownership::Device) {
            slot.filled.store(false, Ordering::Release);
        }
    }

    /// Release the ring at teardown. Every later access fails.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!("[Dma] ring released ({} slots)", self.slots.len());
        }
    }

    /// True once [`release`](Self::release) ran.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sg_list_covers_slot() {
        let ring = DmaRing::allocate(RING_SLOTS, SLOT_SIZE).unwrap();
        let slot = ring.slot(0).unwrap();
        assert_eq!(slot.sg_list().len(), SLOT_PAGES);
        assert_eq!(ring.payload_len(), 348 * 188);
        let total: u32 = slot.sg_list().iter().map(|e| e.len).sum();
        assert_eq!(total as usize, SLOT_SIZE);

        // Slots do not share bus pages.
        let next = ring.slot(1).unwrap();
        assert!(next.bus_addr() >= slot.bus_addr() + SLOT_SIZE as u64);
    }

    #[test]
    fn test_ownership_transfer() {
        let ring = DmaRing::allocate(2, 1024).unwrap();
        let slot = ring.slot(0).unwrap();
        assert_eq!(slot.ownership(), Ownership::Device);

        // Bytes are not readable while the device owns the slot.
        assert_eq!(slot.with_cpu_bytes(0..16, |_| ()), Err(DmaError::NotCpuOwned(0)));
        assert_eq!(slot.sync_for_device(), Err(DmaError::NotCpuOwned(0)));

        ring.dma_write(0, &[0xAA; 16]).unwrap();
        assert!(slot.is_filled());

        slot.sync_for_cpu().unwrap();
        assert_eq!(slot.ownership(), Ownership::Cpu);
        assert_eq!(slot.sync_for_cpu(), Err(DmaError::NotDeviceOwned(0)));

        let sum: u32 = slot.with_cpu_bytes(0..16, |b| b.iter().map(|&x| x as u32).sum()).unwrap();
        assert_eq!(sum, 0xAA * 16);

        slot.sync_for_device().unwrap();
        assert_eq!(slot.ownership(), Ownership::Device);
        assert!(!slot.is_filled());
    }

    #[test]
    fn test_overrun_detection() {
        let ring = DmaRing::allocate(2, 64).unwrap();
        assert_eq!(ring.dma_write(1, &[1; 8]).unwrap(), SlotWrite::Clean);
        // Not drained yet: the device overwrites it anyway.
        assert_eq!(ring.dma_write(1, &[2; 8]).unwrap(), SlotWrite::Overrun);
        assert_eq!(
            ring.dma_write(0, &[0; 65]),
            Err(DmaError::PayloadTooLarge { len: 65, slot_size: 64 })
        );
    }

    #[test]
    fn test_pending_wraps() {
        let ring = DmaRing::allocate(8, 64).unwrap();
        assert_eq!(ring.pending(1, 3), 2);
        assert_eq!(ring.pending(6, 1), 3);
        assert_eq!(ring.pending(4, 4), 0);
        assert_eq!(ring.next(7), 0);
    }

    #[test]
    fn test_release() {
        let ring = DmaRing::allocate(1, 64).unwrap();
        ring.release();
        assert!(matches!(ring.slot(0), Err(DmaError::Released)));
        assert!(DmaRing::allocate(0, 64).is_err());
        assert!(DmaRing::allocate(9, 64).is_err());
    }
}
