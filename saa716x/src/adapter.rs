//! Tuner adapters.

use std::fmt;
use std::sync::Arc;

use crate::config::AdapterConfig;
use crate::demux::Demux;

/// One tuner frontend, bound to exactly one FGPI capture engine.
pub struct Adapter {
    index: usize,
    fgpi: u8,
    video_port: u8,
    demux: Arc<dyn Demux>,
}

impl Adapter {
    pub(crate) fn new(index: usize, config: &AdapterConfig, demux: Arc<dyn Demux>) -> Self {
        Self {
            index,
            fgpi: config.ts_fgpi,
            video_port: config.ts_vp,
            demux,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// FGPI engine capturing this adapter's stream.
    pub fn fgpi(&self) -> u8 {
        self.fgpi
    }

    pub fn video_port(&self) -> u8 {
        self.video_port
    }

    pub fn demux(&self) -> &dyn Demux {
        self.demux.as_ref()
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("index", &self.index)
            .field("fgpi", &self.fgpi)
            .field("video_port", &self.video_port)
            .field("frontend", &self.demux.frontend())
            .finish()
    }
}
