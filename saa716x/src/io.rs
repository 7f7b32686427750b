//! Register access abstraction.

use std::sync::Arc;

use crate::regs::Reg;

/// Read/write access to the chip's 32-bit registers.
///
/// Register writes are fire-and-forget: the hardware protocol has no error
/// reporting at this level.
pub trait RegisterIo: Send + Sync {
    /// Read a register.
    fn read(&self, reg: Reg) -> u32;

    /// Write a register.
    fn write(&self, reg: Reg, value: u32);

    /// Read-modify-write: clears `clear` then sets `set`.
    fn modify(&self, reg: Reg, clear: u32, set: u32) {
        let value = self.read(reg);
        self.write(reg, (value & !clear) | set);
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    fn read(&self, reg: Reg) -> u32 {
        (**self).read(reg)
    }

    fn write(&self, reg: Reg, value: u32) {
        (**self).write(reg, value)
    }
}
