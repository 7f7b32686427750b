//! Feed activation counter.
//!
//! Many demultiplexer feeds share one capture channel. The first feed of an
//! adapter arms the channel, the last one to go disarms it; everything in
//! between only moves the count.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::demux::FrontendSource;
use crate::error::FeedError;
use crate::fgpi::{CaptureControl, FrameGeometry};

/// Per-adapter active feed counts of one device.
pub struct FeedActivation {
    ctl: Arc<dyn CaptureControl>,
    /// FGPI engine of each adapter.
    routes: Vec<u8>,
    geometry: FrameGeometry,
    /// One lock for all adapters; feed changes are rare.
    counts: Mutex<Vec<u32>>,
}

impl FeedActivation {
    pub fn new(ctl: Arc<dyn CaptureControl>, routes: Vec<u8>, geometry: FrameGeometry) -> Self {
        let counts = Mutex::new(vec![0; routes.len()]);
        Self {
            ctl,
            routes,
            geometry,
            counts,
        }
    }

    fn check(&self, adapter: usize, frontend: Option<FrontendSource>) -> Result<u8, FeedError> {
        let fgpi = *self
            .routes
            .get(adapter)
            .ok_or(FeedError::NoSuchAdapter(adapter))?;
        if frontend.is_none() {
            return Err(FeedError::NoFrontend(adapter));
        }
        Ok(fgpi)
    }

    /// A feed was added on `adapter`. Returns the new feed count.
    ///
    /// The count is left untouched if the channel fails to start.
    pub fn on_feed_start(
        &self,
        adapter: usize,
        frontend: Option<FrontendSource>,
    ) -> Result<u32, FeedError> {
        let fgpi = self.check(adapter, frontend)?;

        let mut counts = self.counts.lock();
        let count = &mut counts[adapter];
        if *count == 0 {
            info!("[Feed] Adapter {}: first feed, starting FGPI {}", adapter, fgpi);
            self.ctl.start(fgpi, &self.geometry)?;
        }
        *count += 1;
        debug!("[Feed] Adapter {}: {} active feed(s)", adapter, *count);
        Ok(*count)
    }

    /// A feed was removed from `adapter`. Returns the remaining count.
    pub fn on_feed_stop(
        &self,
        adapter: usize,
        frontend: Option<FrontendSource>,
    ) -> Result<u32, FeedError> {
        let fgpi = self.check(adapter, frontend)?;

        let mut counts = self.counts.lock();
        let count = &mut counts[adapter];
        if *count == 0 {
            return Err(FeedError::NotActive(adapter));
        }
        *count -= 1;
        if *count == 0 {
            info!("[Feed] Adapter {}: last feed gone, stopping FGPI {}", adapter, fgpi);
            self.ctl.stop(fgpi);
        } else {
            debug!("[Feed] Adapter {}: {} active feed(s)", adapter, *count);
        }
        Ok(*count)
    }

    /// Active feeds on `adapter`.
    pub fn count(&self, adapter: usize) -> u32 {
        self.counts.lock().get(adapter).copied().unwrap_or(0)
    }

    /// Active feeds on all adapters.
    pub fn total(&self) -> u32 {
        self.counts.lock().iter().sum()
    }
}
