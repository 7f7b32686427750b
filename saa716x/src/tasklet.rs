//! Coalescing deferred work slots, one per FGPI engine.
//!
//! The interrupt dispatcher schedules a slot; the drain worker of that engine
//! waits on it. Scheduling an already pending slot is a no-op, so any number
//! of interrupts before the worker runs collapse into one drain pass.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::regs::FGPI_ENGINES;

#[derive(Default)]
struct Slot {
    scheduled: AtomicBool,
    notify: Notify,
}

/// Deferred work slots of one device.
pub struct DeferredWork {
    slots: Vec<Slot>,
    shutdown: AtomicBool,
}

impl DeferredWork {
    pub fn new() -> Self {
        Self {
            slots: (0..FGPI_ENGINES).map(|_| Slot::default()).collect(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Mark the slot of `fgpi` pending.
    ///
    /// Never blocks. Returns true if the slot was idle and the worker got
    /// woken, false if a pass was already pending.
    pub fn schedule(&self, fgpi: u8) -> bool {
        let Some(slot) = self.slots.get(fgpi as usize) else {
            return false;
        };
        if slot.scheduled.swap(true, Ordering::AcqRel) {
            return false;
        }
        slot.notify.notify_one();
        true
    }

    pub fn is_scheduled(&self, fgpi: u8) -> bool {
        self.slots
            .get(fgpi as usize)
            .is_some_and(|slot| slot.scheduled.load(Ordering::Acquire))
    }

    /// Wait until the slot of `fgpi` is scheduled, then clear it.
    ///
    /// Returns false once [`shutdown`](Self::shutdown) was called.
    pub async fn wait(&self, fgpi: u8) -> bool {
        let Some(slot) = self.slots.get(fgpi as usize) else {
            return false;
        };
        loop {
            if self.is_shut_down() {
                return false;
            }
            if slot.scheduled.swap(false, Ordering::AcqRel) {
                return true;
            }
            slot.notify.notified().await;
        }
    }

    /// Stop handing out work and wake every waiting worker.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for slot in &self.slots {
            slot.notify.notify_one();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Default for DeferredWork {
    fn default() -> Self {
        Self::new()
    }
}
