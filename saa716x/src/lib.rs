//! Transport-stream capture core for SAA716x PCIe bridges.
//!
//! The SAA716x demultiplexes up to four tuner transport streams through its
//! FGPI (frame grabber parallel interface) DMA engines. This crate drives
//! that capture path:
//!
//! - [`fgpi`]: capture channel controller (frame geometry, start/stop)
//! - [`dma`]: the per-channel ring of DMA buffer slots
//! - [`irq`]: top-half interrupt dispatcher
//! - [`tasklet`]: coalescing per-channel deferred work slots
//! - [`drain`]: bottom-half drain worker feeding the demultiplexer
//! - [`feed`]: per-adapter feed reference counting
//! - [`device`]: device bring-up, teardown and the adapter table
//!
//! Register access goes through [`io::RegisterIo`], so the whole pipeline
//! runs against [`sim::SimRegisters`] in tests and in the budget daemon.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use saa716x::config::BoardConfig;
//! use saa716x::demux::{FrontendSource, SoftDemux};
//! use saa716x::device::Device;
//! use saa716x::sim::SimRegisters;
//!
//! let regs = Arc::new(SimRegisters::new());
//! let board = BoardConfig::tbs6281();
//! let demuxes: Vec<Arc<SoftDemux>> = (0..board.adapters.len()).map(SoftDemux::new).collect();
//! let device = Device::attach(regs, board, |i| demuxes[i].clone()).unwrap();
//!
//! for demux in &demuxes {
//!     demux.add_frontend(FrontendSource::Hardware);
//!     demux.connect_frontend(FrontendSource::Hardware).unwrap();
//!     demux.bind(Device::hooks(&device));
//! }
//! assert_eq!(device.adapters().len(), 2);
//! ```

pub mod adapter;
pub mod config;
pub mod demux;
pub mod device;
pub mod dma;
pub mod drain;
pub mod error;
pub mod feed;
pub mod fgpi;
pub mod io;
pub mod irq;
pub mod regs;
pub mod sim;
pub mod stats;
pub mod tasklet;
pub mod ts;

pub use adapter::Adapter;
pub use config::{AdapterConfig, BoardConfig};
pub use demux::{Demux, Feed, FrontendSource, PidFilter, SoftDemux};
pub use device::{Device, FeedHooks};
pub use dma::{DmaRing, DmaSlot, Ownership, SgEntry};
pub use drain::{DrainReport, DrainWorker};
pub use error::{CaptureError, ConfigError, DemuxError, DeviceError, DmaError, FeedError};
pub use feed::FeedActivation;
pub use fgpi::{CaptureChannel, CaptureControl, FgpiController, FrameGeometry, StreamType};
pub use io::RegisterIo;
pub use irq::IrqReturn;
pub use stats::ChannelStats;
