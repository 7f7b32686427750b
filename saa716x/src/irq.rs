//! Top-half interrupt dispatcher.
//!
//! Acknowledges every asserted status bit and schedules the deferred drain of
//! each FGPI engine that completed a buffer. No buffer work, no allocation,
//! no blocking.

use log::{debug, trace};

use crate::device::Device;
use crate::fgpi::FgpiController;
use crate::io::RegisterIo;
use crate::regs::{msi, FGPI_ENGINES};
use crate::tasklet::DeferredWork;

/// Whether an interrupt was raised by this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not ours; the line may be shared.
    None,
    /// At least one capture event was serviced.
    Handled,
}

/// Interrupt entry point for a possibly not yet attached device.
pub fn handle_irq(device: Option<&Device>) -> IrqReturn {
    match device {
        Some(device) => device.handle_irq(),
        None => {
            debug!("[Irq] interrupt without device");
            IrqReturn::None
        }
    }
}

/// Service one interrupt.
pub fn dispatch(regs: &dyn RegisterIo, ctl: &FgpiController, work: &DeferredWork) -> IrqReturn {
    let stat_l = regs.read(msi::INT_STATUS_L);
    let stat_h = regs.read(msi::INT_STATUS_H);
    let ena_l = regs.read(msi::INT_ENA_L);
    let ena_h = regs.read(msi::INT_ENA_H);

    if stat_l & ena_l == 0 && stat_h & ena_h == 0 {
        return IrqReturn::None;
    }

    // Acknowledge before dispatch so a completion arriving now is not lost.
    if stat_l != 0 {
        regs.write(msi::INT_STATUS_CLR_L, stat_l);
    }
    if stat_h != 0 {
        regs.write(msi::INT_STATUS_CLR_H, stat_h);
    }

    let active = stat_l & ena_l;
    let mut handled = false;
    for fgpi in 0..FGPI_ENGINES as u8 {
        let tagack = active & msi::tagack_fgpi(fgpi) != 0;
        let overflow = active & msi::ovrflw_fgpi(fgpi) != 0;
        if !tagack && !overflow {
            continue;
        }
        let Some(channel) = ctl.channel(fgpi) else {
            trace!("[Irq] event for uninitialized FGPI {}", fgpi);
            continue;
        };

        if overflow {
            channel.stats().record_overflow();
            handled = true;
        }
        if tagack {
            channel.stats().record_interrupt();
            work.schedule(fgpi);
            handled = true;
        }
    }

    if handled {
        IrqReturn::Handled
    } else {
        IrqReturn::None
    }
}
