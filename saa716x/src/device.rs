//! Device bring-up, interrupt entry and teardown.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::adapter::Adapter;
use crate::config::BoardConfig;
use crate::demux::Demux;
use crate::dma::{RING_SLOTS, SLOT_SIZE};
use crate::drain::{DrainReport, DrainWorker};
use crate::error::{DeviceError, DmaError, FeedError};
use crate::feed::FeedActivation;
use crate::fgpi::{CaptureChannel, CaptureControl, FgpiController, FrameGeometry};
use crate::io::RegisterIo;
use crate::irq::{self, IrqReturn};
use crate::regs::greg;
use crate::tasklet::DeferredWork;

/// Time a drain worker gets to finish at teardown.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Feed lifecycle callbacks, called by a demultiplexer when clients add or
/// remove feeds.
pub trait FeedHooks: Send + Sync {
    /// Returns the adapter's feed count after the start.
    fn on_feed_start(&self, adapter: usize) -> Result<u32, FeedError>;

    /// Returns the adapter's remaining feed count.
    fn on_feed_stop(&self, adapter: usize) -> Result<u32, FeedError>;
}

/// One attached SAA716x bridge.
pub struct Device {
    regs: Arc<dyn RegisterIo>,
    board: BoardConfig,
    controller: Arc<FgpiController>,
    adapters: Vec<Adapter>,
    feeds: FeedActivation,
    work: Arc<DeferredWork>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    /// Bring up the capture path of `board`.
    ///
    /// `demux_for` supplies the demultiplexer of each adapter index.
    pub fn attach<R, D, F>(
        regs: Arc<R>,
        board: BoardConfig,
        mut demux_for: F,
    ) -> Result<Arc<Self>, DeviceError>
    where
        R: RegisterIo + 'static,
        D: Demux + 'static,
        F: FnMut(usize) -> Arc<D>,
    {
        board.validate()?;
        let regs: Arc<dyn RegisterIo> = regs;
        info!(
            "[Device] Attaching {} ({}), {} adapter(s)",
            board.model_name,
            board.dev_type,
            board.adapters.len()
        );

        regs.write(greg::VI_CTRL, greg::VI_CTRL_OWN_CLOCKS);
        regs.write(greg::FGPI_CTRL, 0);

        let mut controller = FgpiController::new(regs.clone());
        let mut adapters = Vec::with_capacity(board.adapters.len());
        for (i, config) in board.adapters.iter().enumerate() {
            regs.modify(
                greg::FGPI_CTRL,
                0,
                greg::fgpi_ctrl_sel(config.ts_vp, config.ts_fgpi),
            );
            controller.init(config.ts_fgpi, RING_SLOTS, SLOT_SIZE)?;
            let demux: Arc<dyn Demux> = demux_for(i);
            adapters.push(Adapter::new(i, config, demux));
            info!(
                "[Device] Adapter {}: video port {} -> FGPI {}",
                i, config.ts_vp, config.ts_fgpi
            );
        }

        let controller = Arc::new(controller);
        let routes = adapters.iter().map(Adapter::fgpi).collect();
        let control: Arc<dyn CaptureControl> = controller.clone();
        let feeds = FeedActivation::new(control, routes, FrameGeometry::transport_stream(SLOT_SIZE));

        Ok(Arc::new(Self {
            regs,
            board,
            controller,
            adapters,
            feeds,
            work: Arc::new(DeferredWork::new()),
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Feed hooks to bind demultiplexers to.
    pub fn hooks(device: &Arc<Self>) -> Weak<dyn FeedHooks> {
        let weak: Weak<Self> = Arc::downgrade(device);
        weak
    }

    /// Spawn one drain worker per capture channel on the current runtime.
    ///
    /// Workers only hold the device weakly; dropping the last handle without
    /// [`detach`](Self::detach) shuts them down as well.
    pub fn spawn_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("[Device] Drain workers already running");
            return;
        }
        for channel in self.controller.channels() {
            let worker = DrainWorker::new(channel.fgpi());
            let device = Arc::downgrade(self);
            workers.push(tokio::spawn(worker.run(device, self.work.clone())));
        }
    }

    /// Top-half interrupt entry.
    pub fn handle_irq(&self) -> IrqReturn {
        irq::dispatch(self.regs.as_ref(), &self.controller, &self.work)
    }

    /// Bottom-half entry: one drain pass for the worker's engine.
    pub fn drain_channel(&self, worker: &mut DrainWorker) -> Result<DrainReport, DmaError> {
        let fgpi = worker.fgpi();
        let Some(adapter) = self.adapter_for_fgpi(fgpi) else {
            error!("[Device] No adapter captures FGPI {}", fgpi);
            return Ok(DrainReport::default());
        };
        let Some(channel) = self.controller.channel(fgpi) else {
            error!("[Device] FGPI {} has no capture channel", fgpi);
            return Ok(DrainReport::default());
        };
        worker.drain(channel, &self.controller, adapter.demux())
    }

    /// Adapter whose stream FGPI `fgpi` captures.
    pub fn adapter_for_fgpi(&self, fgpi: u8) -> Option<&Adapter> {
        self.adapters.iter().find(|adapter| adapter.fgpi() == fgpi)
    }

    /// Disarm all channels, stop the drain workers and release the rings.
    pub async fn detach(&self) {
        let active = self.feeds.total();
        if active > 0 {
            warn!("[Device] Detaching with {} active feed(s)", active);
        }

        for adapter in &self.adapters {
            if self.channel(adapter.fgpi()).is_some_and(|c| c.is_enabled()) {
                self.controller.stop(adapter.fgpi());
            }
        }

        self.work.shutdown();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            match tokio::time::timeout(WORKER_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("[Device] Drain worker failed: {}", e),
                Err(_) => error!("[Device] Drain worker did not stop in time"),
            }
        }

        for adapter in self.adapters.iter().rev() {
            self.controller.exit(adapter.fgpi());
        }
        info!("[Device] {} detached", self.board.model_name);
    }

    pub fn board(&self) -> &BoardConfig {
        &self.board
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub fn adapter(&self, index: usize) -> Option<&Adapter> {
        self.adapters.get(index)
    }

    pub fn channel(&self, fgpi: u8) -> Option<&Arc<CaptureChannel>> {
        self.controller.channel(fgpi)
    }

    pub fn controller(&self) -> &FgpiController {
        &self.controller
    }

    pub fn feeds(&self) -> &FeedActivation {
        &self.feeds
    }

    pub fn work(&self) -> &DeferredWork {
        &self.work
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.work.shutdown();
    }
}

impl FeedHooks for Device {
    fn on_feed_start(&self, adapter: usize) -> Result<u32, FeedError> {
        let frontend = self
            .adapter(adapter)
            .ok_or(FeedError::NoSuchAdapter(adapter))?
            .demux()
            .frontend();
        self.feeds.on_feed_start(adapter, frontend)
    }

    fn on_feed_stop(&self, adapter: usize) -> Result<u32, FeedError> {
        let frontend = self
            .adapter(adapter)
            .ok_or(FeedError::NoSuchAdapter(adapter))?
            .demux()
            .frontend();
        self.feeds.on_feed_stop(adapter, frontend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{FrontendSource, PidFilter, SoftDemux};
    use crate::error::{ConfigError, DemuxError};
    use crate::regs::{fgpi as fgpi_regs, msi};
    use crate::sim::SimRegisters;

    fn attach(board: BoardConfig) -> (Arc<SimRegisters>, Vec<Arc<SoftDemux>>, Arc<Device>) {
        let regs = Arc::new(SimRegisters::new());
        let demuxes: Vec<_> = (0..board.adapters.len()).map(SoftDemux::new).collect();
        let device = Device::attach(regs.clone(), board, |i| demuxes[i].clone()).unwrap();
        for demux in &demuxes {
            demux.bind(Device::hooks(&device));
        }
        (regs, demuxes, device)
    }

    #[test]
    fn test_attach_routes_video_ports() {
        let (regs, _demuxes, device) = attach(BoardConfig::tbs6285());
        assert_eq!(regs.peek(greg::VI_CTRL), greg::VI_CTRL_OWN_CLOCKS);

        let expected = greg::fgpi_ctrl_sel(2, 3)
            | greg::fgpi_ctrl_sel(3, 2)
            | greg::fgpi_ctrl_sel(6, 1)
            | greg::fgpi_ctrl_sel(5, 0);
        assert_eq!(regs.peek(greg::FGPI_CTRL), expected);
        assert_eq!(device.controller().channels().count(), 4);
        assert_eq!(device.adapter_for_fgpi(1).unwrap().index(), 2);
    }

    #[test]
    fn test_attach_rejects_invalid_board() {
        let mut board = BoardConfig::tbs6281();
        board.adapters[1].ts_fgpi = 1;
        let regs = Arc::new(SimRegisters::new());
        let demux = SoftDemux::new(0);
        let err = Device::attach(regs, board, |_| demux.clone()).err().unwrap();
        assert!(matches!(err, DeviceError::Config(ConfigError::FgpiInUse { .. })));
    }

    #[test]
    fn test_feed_without_frontend() {
        let (regs, demuxes, device) = attach(BoardConfig::tbs6281());
        let err = demuxes[0].start_feed(PidFilter::All).err().unwrap();
        assert_eq!(err, DemuxError::Feed(FeedError::NoFrontend(0)));
        assert_eq!(device.feeds().count(0), 0);
        assert_eq!(regs.write_count(fgpi_regs::control(1)), 1);
    }

    #[test]
    fn test_feeds_arm_their_channel() {
        let (regs, demuxes, device) = attach(BoardConfig::tbs6281());
        demuxes[1].add_frontend(FrontendSource::Hardware);
        demuxes[1].connect_frontend(FrontendSource::Hardware).unwrap();

        let a = demuxes[1].start_feed(PidFilter::Pid(0x100)).unwrap();
        let b = demuxes[1].start_feed(PidFilter::All).unwrap();
        assert!(device.channel(3).unwrap().is_enabled());
        assert!(!device.channel(1).unwrap().is_enabled());
        assert_eq!(regs.peek(msi::INT_ENA_L) & msi::TAGACK_FGPI_3, msi::TAGACK_FGPI_3);

        demuxes[1].stop_feed(a.id()).unwrap();
        assert!(device.channel(3).unwrap().is_enabled());
        demuxes[1].stop_feed(b.id()).unwrap();
        assert!(!device.channel(3).unwrap().is_enabled());
    }

    #[test]
    fn test_stop_with_disconnected_frontend_keeps_channel() {
        let (_regs, demuxes, device) = attach(BoardConfig::tbs6281());
        demuxes[0].add_frontend(FrontendSource::Hardware);
        demuxes[0].connect_frontend(FrontendSource::Hardware).unwrap();
        let feed = demuxes[0].start_feed(PidFilter::All).unwrap();

        demuxes[0].disconnect_frontend();
        assert_eq!(
            demuxes[0].stop_feed(feed.id()),
            Err(DemuxError::Feed(FeedError::NoFrontend(0)))
        );
        assert_eq!(demuxes[0].feed_count(), 1);
        assert_eq!(device.feeds().count(0), 1);
        assert!(device.channel(1).unwrap().is_enabled());

        demuxes[0].connect_frontend(FrontendSource::Hardware).unwrap();
        demuxes[0].stop_feed(feed.id()).unwrap();
        assert_eq!(demuxes[0].feed_count(), 0);
        assert_eq!(device.feeds().count(0), 0);
        assert!(!device.channel(1).unwrap().is_enabled());
    }

    #[test]
    fn test_drain_for_unrouted_fgpi() {
        let (_regs, demuxes, device) = attach(BoardConfig::tbs6281());
        for demux in &demuxes {
            demux.add_frontend(FrontendSource::Hardware);
            demux.connect_frontend(FrontendSource::Hardware).unwrap();
        }
        let _feeds: Vec<_> = demuxes
            .iter()
            .map(|demux| demux.start_feed(PidFilter::All).unwrap())
            .collect();

        assert!(device.adapter_for_fgpi(0).is_none());
        let mut worker = DrainWorker::new(0);
        assert_eq!(device.drain_channel(&mut worker), Ok(DrainReport::default()));
        assert_eq!(worker.read_index(), 0);
        for demux in &demuxes {
            assert_eq!(demux.quality().packets_total, 0);
        }
        for adapter in device.adapters() {
            assert_eq!(device.channel(adapter.fgpi()).unwrap().stats().drain_passes(), 0);
        }
    }

    #[tokio::test]
    async fn test_workers_do_not_keep_device_alive() {
        let (_regs, _demuxes, device) = attach(BoardConfig::tbs6285());
        let work = device.work.clone();
        device.spawn_workers();
        assert_eq!(Arc::strong_count(&device), 1);

        let weak = Arc::downgrade(&device);
        drop(device);
        assert!(weak.upgrade().is_none());
        assert!(work.is_shut_down());
    }

    #[tokio::test]
    async fn test_detach_releases_rings() {
        let (_regs, demuxes, device) = attach(BoardConfig::tbs6281());
        demuxes[0].add_frontend(FrontendSource::Hardware);
        demuxes[0].connect_frontend(FrontendSource::Hardware).unwrap();
        let _feed = demuxes[0].start_feed(PidFilter::All).unwrap();
        device.spawn_workers();

        device.detach().await;
        for adapter in device.adapters() {
            let channel = device.channel(adapter.fgpi()).unwrap();
            assert!(!channel.is_enabled());
            assert!(channel.ring().is_released());
        }
        assert!(device.work().is_shut_down());
    }
}
