//! Error types for the capture pipeline.

use thiserror::Error;

/// Errors raised by the DMA buffer ring.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DmaError {
    /// Ring geometry is not representable by the bus address manager.
    #[error("Invalid ring: {slots} slots of {slot_size} bytes")]
    InvalidRing { slots: usize, slot_size: usize },

    /// Slot index outside of the ring.
    #[error("Slot {index} out of range (ring has {slots} slots)")]
    SlotOutOfRange { index: usize, slots: usize },

    /// CPU access attempted while the device owns the slot.
    #[error("Slot {0} is not owned by the CPU")]
    NotCpuOwned(usize),

    /// Ownership transfer to the CPU attempted twice.
    #[error("Slot {0} is not owned by the device")]
    NotDeviceOwned(usize),

    /// Payload does not fit into one slot.
    #[error("Payload too large: {len} bytes (slot size: {slot_size})")]
    PayloadTooLarge { len: usize, slot_size: usize },

    /// The ring memory was released at teardown.
    #[error("DMA ring has been released")]
    Released,
}

/// Errors raised by the capture channel controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// FGPI engine index outside of the chip's engines.
    #[error("FGPI engine {0} does not exist")]
    NoSuchEngine(u8),

    /// The engine was never initialized at bring-up.
    #[error("FGPI engine {0} is not initialized")]
    NotInitialized(u8),

    /// The engine is already armed.
    #[error("FGPI engine {0} is already running")]
    AlreadyRunning(u8),

    /// Frame geometry does not fit the channel's buffer slots.
    #[error("Invalid frame geometry: {0}")]
    InvalidGeometry(String),

    /// DMA ring failure.
    #[error(transparent)]
    Dma(#[from] DmaError),
}

/// Errors reported to feed start/stop callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The adapter's demultiplexer has no frontend source connected.
    #[error("Invalid configuration: adapter {0} has no frontend")]
    NoFrontend(usize),

    /// Adapter index outside of the board's adapters.
    #[error("Adapter {0} does not exist")]
    NoSuchAdapter(usize),

    /// Stop requested on an adapter without active feeds.
    #[error("Adapter {0} has no active feeds")]
    NotActive(usize),

    /// The capture channel could not be started.
    #[error("Failed to start capture: {0}")]
    Capture(#[from] CaptureError),
}

impl FeedError {
    /// Returns true if this error is an "invalid configuration" failure.
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, FeedError::NoFrontend(_) | FeedError::NoSuchAdapter(_))
    }
}

/// Errors raised by the software demultiplexer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    /// The feed table is full.
    #[error("Too many feeds (max: {0})")]
    TooManyFeeds(usize),

    /// No feed with this id.
    #[error("Unknown feed: {0}")]
    UnknownFeed(u32),

    /// The demultiplexer was never bound to a device.
    #[error("Demux is not bound to a device")]
    Unbound,

    /// Connecting a frontend that was never added.
    #[error("Frontend {0} has not been added")]
    FrontendNotAdded(String),

    /// Feed activation failed.
    #[error(transparent)]
    Feed(#[from] FeedError),
}

/// Board configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Unknown preset name.
    #[error("Unknown board model: {0}")]
    UnknownBoard(String),

    /// Too few or too many adapters.
    #[error("Board has {0} adapters (expected 1..=4)")]
    AdapterCount(usize),

    /// FGPI engine index out of range.
    #[error("Adapter {adapter}: FGPI {fgpi} out of range")]
    FgpiOutOfRange { adapter: usize, fgpi: u8 },

    /// Two adapters routed to the same FGPI engine.
    #[error("Adapter {adapter}: FGPI {fgpi} already used by adapter {other}")]
    FgpiInUse { adapter: usize, fgpi: u8, other: usize },

    /// Video input port out of range.
    #[error("Adapter {adapter}: video port {vp} out of range")]
    VideoPortOutOfRange { adapter: usize, vp: u8 },
}

/// Device bring-up errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The board configuration was rejected.
    #[error("Invalid board configuration: {0}")]
    Config(#[from] ConfigError),

    /// A capture channel failed to initialize.
    #[error("Channel initialization failed: {0}")]
    Capture(#[from] CaptureError),
}

impl From<DmaError> for DeviceError {
    fn from(e: DmaError) -> Self {
        DeviceError::Capture(CaptureError::Dma(e))
    }
}
