//! End-to-end capture: simulated engine -> interrupt -> drain worker -> feed.

use std::sync::Arc;
use std::time::Duration;

use saa716x::config::BoardConfig;
use saa716x::demux::{FrontendSource, PidFilter, SoftDemux};
use saa716x::device::Device;
use saa716x::irq::{handle_irq, IrqReturn};
use saa716x::sim::{SimEngine, SimRegisters};
use saa716x::ts::{self, NULL_PID, TS_PACKET_SIZE};

const VIDEO_PID: u16 = 0x0100;
const LINES: usize = 348;

struct Capture {
    regs: Arc<SimRegisters>,
    demuxes: Vec<Arc<SoftDemux>>,
    device: Arc<Device>,
}

fn bring_up(board: BoardConfig) -> Capture {
    let regs = Arc::new(SimRegisters::new());
    let demuxes: Vec<_> = (0..board.adapters.len()).map(SoftDemux::new).collect();
    let device = Device::attach(regs.clone(), board, |i| demuxes[i].clone()).unwrap();
    for demux in &demuxes {
        demux.add_frontend(FrontendSource::Hardware);
        demux.connect_frontend(FrontendSource::Hardware).unwrap();
        demux.bind(Device::hooks(&device));
    }
    device.spawn_workers();
    Capture {
        regs,
        demuxes,
        device,
    }
}

/// One slot of packets alternating between the video PID and null packets.
fn slot_payload(cc: &mut u8) -> Vec<u8> {
    let mut payload = Vec::with_capacity(LINES * TS_PACKET_SIZE);
    for line in 0..LINES {
        if line % 2 == 0 {
            payload.extend_from_slice(&ts::packet(VIDEO_PID, *cc, false, &[]));
            *cc = (*cc + 1) & 0x0F;
        } else {
            payload.extend_from_slice(&ts::packet(NULL_PID, 0, false, &[]));
        }
    }
    payload
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slots_reach_feed() {
    let capture = bring_up(BoardConfig::tbs6281());
    let demux = &capture.demuxes[0];
    let mut feed = demux.start_feed(PidFilter::Pid(VIDEO_PID)).unwrap();

    let engine = SimEngine::new(capture.regs.clone());
    let channel = capture.device.channel(1).unwrap();
    let mut cc = 0;
    for _ in 0..3 {
        assert!(engine.complete_slot(channel, &slot_payload(&mut cc)).unwrap());
        assert_eq!(capture.device.handle_irq(), IrqReturn::Handled);
    }

    for _ in 0..3 {
        let block = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .expect("no data from drain worker")
            .unwrap();
        assert_eq!(block.len(), LINES / 2 * TS_PACKET_SIZE);
        assert!(block
            .chunks_exact(TS_PACKET_SIZE)
            .all(|p| ts::packet_pid(p) == Some(VIDEO_PID)));
    }

    let quality = demux.quality();
    assert_eq!(quality.packets_total, 3 * LINES as u64);
    assert_eq!(quality.packets_dropped, 0);

    demux.stop_feed(feed.id()).unwrap();
    capture.device.detach().await;
    assert!(channel.ring().is_released());
    assert_eq!(channel.stats().slots_drained(), 3);
    assert_eq!(channel.stats().bytes_submitted(), 3 * 65424);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_adapters_do_not_mix() {
    let capture = bring_up(BoardConfig::tbs6285());
    let mut feeds: Vec<_> = capture
        .demuxes
        .iter()
        .map(|demux| demux.start_feed(PidFilter::All).unwrap())
        .collect();

    let engine = SimEngine::new(capture.regs.clone());
    for adapter in capture.device.adapters() {
        let channel = capture.device.channel(adapter.fgpi()).unwrap();
        let tag = adapter.index() as u8;
        let payload: Vec<u8> = (0..LINES)
            .flat_map(|_| ts::packet(0x200 + tag as u16, 0, false, &[tag]))
            .collect();
        assert!(engine.complete_slot(channel, &payload).unwrap());
    }
    // One interrupt covers all four completions.
    assert_eq!(handle_irq(Some(&capture.device)), IrqReturn::Handled);

    for (index, feed) in feeds.iter_mut().enumerate() {
        let block = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .expect("no data from drain worker")
            .unwrap();
        assert_eq!(ts::packet_pid(&block[..TS_PACKET_SIZE]), Some(0x200 + index as u16));
    }

    capture.device.detach().await;
}

#[tokio::test]
async fn test_interrupt_from_other_device() {
    let capture = bring_up(BoardConfig::tbs6281());
    // Nothing armed, nothing enabled.
    assert_eq!(capture.device.handle_irq(), IrqReturn::None);
    assert_eq!(handle_irq(None), IrqReturn::None);
    capture.device.detach().await;
}
