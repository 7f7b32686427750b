//! End-of-run statistics.

use std::sync::Arc;

use log::info;

use saa716x::demux::SoftDemux;
use saa716x::device::Device;

use crate::recorder::FeedSummary;

/// Log per-channel capture statistics, demux quality and feed totals.
pub fn print_report(device: &Device, demuxes: &[Arc<SoftDemux>], feeds: &[FeedSummary]) {
    for adapter in device.adapters() {
        if let Some(channel) = device.channel(adapter.fgpi()) {
            channel.stats().report(adapter.fgpi());
        }

        if let Some(demux) = demuxes.get(adapter.index()) {
            let q = demux.quality();
            info!(
                "[Adapter {}] TS quality: packets={}, dropped={}, errors={}, scrambled={}, sync_lost={}",
                adapter.index(),
                q.packets_total,
                q.packets_dropped,
                q.packets_error,
                q.packets_scrambled,
                q.sync_lost
            );
        }
    }

    for feed in feeds {
        info!(
            "[Adapter {}] Feed {:?}: blocks={}, packets={}, bytes={}{}",
            feed.adapter,
            feed.filter,
            feed.blocks,
            feed.packets(),
            feed.bytes,
            feed.path
                .as_ref()
                .map(|p| format!(", file={}", p.display()))
                .unwrap_or_default()
        );
    }
}
