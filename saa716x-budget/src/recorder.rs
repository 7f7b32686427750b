//! Feed consumers: write captured packets to disk or just count them.

use std::path::PathBuf;

use bytes::Bytes;
use log::{error, info};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use saa716x::demux::{Feed, PidFilter};
use saa716x::ts::TS_PACKET_SIZE;

/// What one feed delivered.
#[derive(Debug, Clone, Default)]
pub struct FeedSummary {
    pub adapter: usize,
    pub filter: Option<PidFilter>,
    pub blocks: u64,
    pub bytes: u64,
    pub path: Option<PathBuf>,
}

impl FeedSummary {
    pub fn packets(&self) -> u64 {
        self.bytes / TS_PACKET_SIZE as u64
    }
}

/// Output file of a feed: `<dir>/adapter<N>-<pid>.ts`.
pub fn record_path(dir: &std::path::Path, adapter: usize, filter: PidFilter) -> PathBuf {
    let pid = match filter {
        PidFilter::Pid(pid) => format!("{:04x}", pid),
        PidFilter::All => "all".to_string(),
    };
    dir.join(format!("adapter{}-{}.ts", adapter, pid))
}

struct Sink {
    writer: Option<BufWriter<File>>,
}

impl Sink {
    async fn write_block(&mut self, block: &Bytes) -> std::io::Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.write_all(block).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush().await?;
        }
        Ok(())
    }
}

/// Consume `feed` until it is stopped, writing to `path` if given.
pub async fn consume(adapter: usize, mut feed: Feed, path: Option<PathBuf>) -> FeedSummary {
    let mut summary = FeedSummary {
        adapter,
        filter: Some(feed.filter()),
        path: path.clone(),
        ..Default::default()
    };

    let writer = match &path {
        Some(path) => match File::create(path).await {
            Ok(file) => {
                info!("[Record] Adapter {}: recording to {}", adapter, path.display());
                Some(BufWriter::new(file))
            }
            Err(e) => {
                error!("[Record] Failed to create {}: {}", path.display(), e);
                summary.path = None;
                None
            }
        },
        None => None,
    };
    let mut sink = Sink { writer };

    while let Some(block) = feed.recv().await {
        summary.blocks += 1;
        summary.bytes += block.len() as u64;
        if let Err(e) = sink.write_block(&block).await {
            error!("[Record] Adapter {}: write failed, recording stopped: {}", adapter, e);
            sink.writer = None;
        }
    }
    if let Err(e) = sink.finish().await {
        error!("[Record] Adapter {}: flush failed: {}", adapter, e);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_path() {
        let dir = std::path::Path::new("rec");
        assert_eq!(
            record_path(dir, 2, PidFilter::Pid(0x100)),
            dir.join("adapter2-0100.ts")
        );
        assert_eq!(record_path(dir, 0, PidFilter::All), dir.join("adapter0-all.ts"));
    }
}
