//! Software transport-stream demultiplexer.
//!
//! The drain worker hands each completed ring slot to [`Demux::submit`].
//! [`SoftDemux`] splits the block into packets and fans them out to the
//! feeds whose PID filter matches. Adding the first feed of an adapter arms
//! its capture channel through [`FeedHooks`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::device::FeedHooks;
use crate::error::DemuxError;
use crate::ts::{packet_pid, TsPacketAnalyzer, TsStreamQuality, TS_PACKET_SIZE};

/// Feeds per demultiplexer.
pub const MAX_FEEDS: usize = 256;

/// Blocks buffered per feed before a slow reader starts losing data.
const FEED_QUEUE_BLOCKS: usize = 64;

/// Ingestion side of a demultiplexer.
pub trait Demux: Send + Sync {
    /// Connected frontend, if any.
    fn frontend(&self) -> Option<FrontendSource>;

    /// Ingest one block of raw transport-stream bytes.
    fn submit(&self, data: &[u8]);
}

/// Source feeding a demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontendSource {
    /// Tuner behind a capture channel.
    Hardware,
    /// Data written by software.
    Memory,
}

impl fmt::Display for FrontendSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendSource::Hardware => write!(f, "hardware"),
            FrontendSource::Memory => write!(f, "memory"),
        }
    }
}

/// Packets a feed receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFilter {
    Pid(u16),
    /// Whole transport stream.
    All,
}

impl PidFilter {
    pub fn matches(&self, pid: u16) -> bool {
        match self {
            PidFilter::Pid(p) => *p == pid,
            PidFilter::All => true,
        }
    }
}

/// Client handle of one feed.
pub struct Feed {
    id: u32,
    filter: PidFilter,
    rx: broadcast::Receiver<Bytes>,
}

impl Feed {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn filter(&self) -> PidFilter {
        self.filter
    }

    /// Next block of matching packets. `None` once the feed was stopped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(block) => return Some(block),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[Demux] Feed {} lagged, {} block(s) lost", self.id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.try_recv() {
                Ok(block) => return Some(block),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("[Demux] Feed {} lagged, {} block(s) lost", self.id, n);
                }
                Err(_) => return None,
            }
        }
    }
}

struct FeedEntry {
    filter: PidFilter,
    tx: broadcast::Sender<Bytes>,
}

#[derive(Default)]
struct Frontends {
    added: Vec<FrontendSource>,
    connected: Option<FrontendSource>,
}

/// Demultiplexer of one adapter.
pub struct SoftDemux {
    adapter: usize,
    frontends: Mutex<Frontends>,
    hooks: Mutex<Option<Weak<dyn FeedHooks>>>,
    feeds: Mutex<HashMap<u32, FeedEntry>>,
    next_feed_id: AtomicU32,
    analyzer: Mutex<TsPacketAnalyzer>,
}

impl SoftDemux {
    pub fn new(adapter: usize) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            frontends: Mutex::new(Frontends::default()),
            hooks: Mutex::new(None),
            feeds: Mutex::new(HashMap::new()),
            next_feed_id: AtomicU32::new(1),
            analyzer: Mutex::new(TsPacketAnalyzer::new()),
        })
    }

    pub fn adapter(&self) -> usize {
        self.adapter
    }

    /// Attach the device whose capture channel feeds this demux.
    pub fn bind(&self, hooks: Weak<dyn FeedHooks>) {
        *self.hooks.lock() = Some(hooks);
    }

    /// Make a frontend available for connection.
    pub fn add_frontend(&self, source: FrontendSource) {
        let mut frontends = self.frontends.lock();
        if !frontends.added.contains(&source) {
            frontends.added.push(source);
        }
    }

    pub fn connect_frontend(&self, source: FrontendSource) -> Result<(), DemuxError> {
        let mut frontends = self.frontends.lock();
        if !frontends.added.contains(&source) {
            return Err(DemuxError::FrontendNotAdded(source.to_string()));
        }
        frontends.connected = Some(source);
        debug!("[Demux] Adapter {}: {} frontend connected", self.adapter, source);
        Ok(())
    }

    pub fn disconnect_frontend(&self) {
        self.frontends.lock().connected = None;
    }

    fn hooks(&self) -> Result<Arc<dyn FeedHooks>, DemuxError> {
        self.hooks
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(DemuxError::Unbound)
    }

    /// Register a feed. Arms the capture channel for the first feed.
    pub fn start_feed(&self, filter: PidFilter) -> Result<Feed, DemuxError> {
        let hooks = self.hooks()?;
        if self.feeds.lock().len() >= MAX_FEEDS {
            return Err(DemuxError::TooManyFeeds(MAX_FEEDS));
        }

        let count = hooks.on_feed_start(self.adapter)?;

        let id = self.next_feed_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(FEED_QUEUE_BLOCKS);
        {
            let mut feeds = self.feeds.lock();
            // A concurrent start may have taken the last entry.
            if feeds.len() >= MAX_FEEDS {
                drop(feeds);
                hooks.on_feed_stop(self.adapter)?;
                return Err(DemuxError::TooManyFeeds(MAX_FEEDS));
            }
            feeds.insert(id, FeedEntry { filter, tx });
        }
        // Outside the feed lock: submit takes the analyzer first.
        if count == 1 {
            self.analyzer.lock().reset_continuity();
        }
        info!(
            "[Demux] Adapter {}: feed {} started ({:?})",
            self.adapter, id, filter
        );
        Ok(Feed { id, filter, rx })
    }

    /// Unregister a feed. Disarms the capture channel with the last feed.
    /// The feed stays registered when the channel cannot be released.
    pub fn stop_feed(&self, id: u32) -> Result<(), DemuxError> {
        let hooks = self.hooks()?;
        let entry = self
            .feeds
            .lock()
            .remove(&id)
            .ok_or(DemuxError::UnknownFeed(id))?;
        if let Err(e) = hooks.on_feed_stop(self.adapter) {
            self.feeds.lock().insert(id, entry);
            return Err(e.into());
        }
        info!("[Demux] Adapter {}: feed {} stopped", self.adapter, id);
        Ok(())
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.lock().len()
    }

    pub fn quality(&self) -> TsStreamQuality {
        self.analyzer.lock().snapshot()
    }
}

impl Demux for SoftDemux {
    fn frontend(&self) -> Option<FrontendSource> {
        self.frontends.lock().connected
    }

    fn submit(&self, data: &[u8]) {
        self.analyzer.lock().analyze(data);

        let feeds = self.feeds.lock();
        for entry in feeds.values() {
            let block = match entry.filter {
                PidFilter::All => Bytes::copy_from_slice(data),
                PidFilter::Pid(_) => {
                    let mut buf = BytesMut::new();
                    for packet in data.chunks_exact(TS_PACKET_SIZE) {
                        if packet_pid(packet).is_some_and(|pid| entry.filter.matches(pid)) {
                            buf.extend_from_slice(packet);
                        }
                    }
                    if buf.is_empty() {
                        continue;
                    }
                    buf.freeze()
                }
            };
            // No receiver left is fine; the feed is about to be stopped.
            let _ = entry.tx.send(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::error::FeedError;
    use crate::ts::packet;

    /// Hooks that only count, with an optional frontend check.
    #[derive(Default)]
    struct CountingHooks {
        count: AtomicU32,
        reject: bool,
        reject_stop: AtomicBool,
    }

    impl FeedHooks for CountingHooks {
        fn on_feed_start(&self, adapter: usize) -> Result<u32, FeedError> {
            if self.reject {
                return Err(FeedError::NoFrontend(adapter));
            }
            Ok(self.count.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn on_feed_stop(&self, adapter: usize) -> Result<u32, FeedError> {
            if self.reject_stop.load(Ordering::SeqCst) {
                return Err(FeedError::NoFrontend(adapter));
            }
            Ok(self.count.fetch_sub(1, Ordering::SeqCst) - 1)
        }
    }

    fn bound_demux(hooks: &Arc<CountingHooks>) -> Arc<SoftDemux> {
        let demux = SoftDemux::new(0);
        let hooks: Arc<dyn FeedHooks> = hooks.clone();
        demux.bind(Arc::downgrade(&hooks));
        demux
    }

    fn block(pids: &[u16]) -> Vec<u8> {
        pids.iter()
            .enumerate()
            .flat_map(|(i, &pid)| packet(pid, i as u8, false, &[]))
            .collect()
    }

    #[test]
    fn test_frontend_connection() {
        let demux = SoftDemux::new(1);
        assert_eq!(demux.frontend(), None);
        assert!(matches!(
            demux.connect_frontend(FrontendSource::Hardware),
            Err(DemuxError::FrontendNotAdded(_))
        ));
        demux.add_frontend(FrontendSource::Hardware);
        demux.connect_frontend(FrontendSource::Hardware).unwrap();
        assert_eq!(demux.frontend(), Some(FrontendSource::Hardware));
        demux.disconnect_frontend();
        assert_eq!(demux.frontend(), None);
    }

    #[test]
    fn test_unbound_demux() {
        let demux = SoftDemux::new(0);
        assert!(matches!(demux.start_feed(PidFilter::All), Err(DemuxError::Unbound)));
    }

    #[test]
    fn test_pid_routing() {
        let hooks = Arc::new(CountingHooks::default());
        let demux = bound_demux(&hooks);
        let mut video = demux.start_feed(PidFilter::Pid(0x100)).unwrap();
        let mut audio = demux.start_feed(PidFilter::Pid(0x110)).unwrap();
        let mut all = demux.start_feed(PidFilter::All).unwrap();
        assert_eq!(hooks.count.load(Ordering::SeqCst), 3);

        demux.submit(&block(&[0x100, 0x1FFF, 0x100, 0x000]));

        assert_eq!(video.try_recv().unwrap().len(), 2 * TS_PACKET_SIZE);
        assert!(audio.try_recv().is_none());
        assert_eq!(all.try_recv().unwrap().len(), 4 * TS_PACKET_SIZE);
        assert_eq!(demux.quality().packets_total, 4);
    }

    #[test]
    fn test_rejected_feed_is_not_registered() {
        let hooks = Arc::new(CountingHooks {
            reject: true,
            ..Default::default()
        });
        let demux = bound_demux(&hooks);
        let err = demux.start_feed(PidFilter::All).err().unwrap();
        assert_eq!(err, DemuxError::Feed(FeedError::NoFrontend(0)));
        assert_eq!(demux.feed_count(), 0);
    }

    #[test]
    fn test_stop_feed() {
        let hooks = Arc::new(CountingHooks::default());
        let demux = bound_demux(&hooks);
        let feed = demux.start_feed(PidFilter::Pid(0x100)).unwrap();

        demux.stop_feed(feed.id()).unwrap();
        assert_eq!(hooks.count.load(Ordering::SeqCst), 0);
        assert_eq!(demux.stop_feed(feed.id()), Err(DemuxError::UnknownFeed(feed.id())));
    }

    #[test]
    fn test_failed_stop_keeps_feed() {
        let hooks = Arc::new(CountingHooks::default());
        let demux = bound_demux(&hooks);
        let feed = demux.start_feed(PidFilter::All).unwrap();

        hooks.reject_stop.store(true, Ordering::SeqCst);
        assert_eq!(
            demux.stop_feed(feed.id()),
            Err(DemuxError::Feed(FeedError::NoFrontend(0)))
        );
        assert_eq!(demux.feed_count(), 1);
        assert_eq!(hooks.count.load(Ordering::SeqCst), 1);

        hooks.reject_stop.store(false, Ordering::SeqCst);
        demux.stop_feed(feed.id()).unwrap();
        assert_eq!(demux.feed_count(), 0);
        assert_eq!(hooks.count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_feed_table_limit() {
        let hooks = Arc::new(CountingHooks::default());
        let demux = bound_demux(&hooks);
        let feeds: Vec<Feed> = (0..MAX_FEEDS)
            .map(|_| demux.start_feed(PidFilter::All).unwrap())
            .collect();

        assert_eq!(
            demux.start_feed(PidFilter::All).err(),
            Some(DemuxError::TooManyFeeds(MAX_FEEDS))
        );
        assert_eq!(demux.feed_count(), MAX_FEEDS);
        assert_eq!(hooks.count.load(Ordering::SeqCst), MAX_FEEDS as u32);

        demux.stop_feed(feeds[0].id()).unwrap();
        assert!(demux.start_feed(PidFilter::All).is_ok());
    }

    #[tokio::test]
    async fn test_stopped_feed_closes() {
        let hooks = Arc::new(CountingHooks::default());
        let demux = bound_demux(&hooks);
        let mut feed = demux.start_feed(PidFilter::All).unwrap();
        demux.submit(&block(&[0x100]));
        demux.stop_feed(feed.id()).unwrap();

        assert!(feed.recv().await.is_some());
        assert!(feed.recv().await.is_none());
    }
}
