//! saa716x-budget: capture daemon for SAA716x budget DVB cards.
//!
//! Brings up the capture path of a board, opens demultiplexer feeds on every
//! adapter and records them until interrupted. The tuners are simulated, so
//! the whole DMA/interrupt/drain pipeline can run without hardware.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::watch;

use saa716x::config::BoardConfig;
use saa716x::demux::{FrontendSource, PidFilter, SoftDemux};
use saa716x::device::Device;
use saa716x::sim::{SimEngine, SimRegisters};

mod error;
mod logging;
mod recorder;
mod report;
mod source;

use error::BudgetError;
use source::SimSource;

const DEFAULT_CONFIG_FILE: &str = "saa716x-budget.toml";
const DEFAULT_BOARD: &str = "tbs6285";
const DEFAULT_PES_PID: u16 = 0x0100;
const DEFAULT_INTERVAL_MS: u64 = 20;

/// saa716x-budget - transport-stream capture daemon for SAA716x budget cards
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Board preset (tbs6281, tbs6285)
    #[arg(short, long)]
    board: Option<String>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(short, long)]
    duration_secs: Option<u64>,

    /// Interval between simulated buffer completions in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// PIDs to open a feed for on every adapter, e.g. 0x100,0x110
    #[arg(short, long, value_delimiter = ',', value_parser = parse_pid)]
    pids: Vec<u16>,

    /// Record every feed to <dir>/adapter<N>-<pid>.ts
    #[arg(short, long)]
    record_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    board: BoardSection,
    #[serde(default)]
    capture: CaptureSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    record: RecordSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct BoardSection {
    preset: Option<String>,
    /// Full board description instead of a preset.
    custom: Option<BoardConfig>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct CaptureSection {
    duration_secs: Option<u64>,
    interval_ms: Option<u64>,
    pids: Option<Vec<u16>>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct RecordSection {
    enabled: Option<bool>,
    dir: Option<String>,
}

/// Effective settings after merging the command line over the config file.
#[derive(Debug)]
struct Settings {
    board: BoardConfig,
    duration: Option<Duration>,
    interval: Duration,
    pids: Vec<u16>,
    record_dir: Option<PathBuf>,
}

impl Settings {
    fn merge(args: &Args, file: &ConfigFile) -> Result<Self, BudgetError> {
        let board = match (&args.board, &file.board.custom, &file.board.preset) {
            (Some(name), _, _) => BoardConfig::preset(name)?,
            (None, Some(custom), _) => custom.clone(),
            (None, None, Some(name)) => BoardConfig::preset(name)?,
            (None, None, None) => BoardConfig::preset(DEFAULT_BOARD)?,
        };
        board.validate()?;

        let pids = if !args.pids.is_empty() {
            args.pids.clone()
        } else {
            file.capture.pids.clone().unwrap_or_else(|| vec![DEFAULT_PES_PID])
        };
        if let Some(pid) = pids.iter().find(|&&pid| pid > 0x1FFF) {
            return Err(BudgetError::InvalidPid(format!("0x{:X}", pid)));
        }

        let record_dir = args.record_dir.clone().or_else(|| {
            match (file.record.enabled.unwrap_or(true), &file.record.dir) {
                (true, Some(dir)) => Some(PathBuf::from(dir)),
                _ => None,
            }
        });

        Ok(Self {
            board,
            duration: args
                .duration_secs
                .or(file.capture.duration_secs)
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
            interval: Duration::from_millis(
                args.interval_ms
                    .or(file.capture.interval_ms)
                    .unwrap_or(DEFAULT_INTERVAL_MS)
                    .max(1),
            ),
            pids,
            record_dir,
        })
    }
}

fn parse_pid(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let pid = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    }
    .map_err(|e| format!("{}: {}", s, e))?;
    if pid > 0x1FFF {
        return Err(format!("{}: PID out of range", s));
    }
    Ok(pid)
}

fn load_config(path: &Path) -> Result<ConfigFile, BudgetError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

async fn wait_duration(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn run(settings: Settings) -> Result<(), BudgetError> {
    let regs = Arc::new(SimRegisters::new());
    let demuxes: Vec<Arc<SoftDemux>> = (0..settings.board.adapters.len())
        .map(SoftDemux::new)
        .collect();
    let device = Device::attach(regs.clone(), settings.board.clone(), |i| demuxes[i].clone())?;

    for demux in &demuxes {
        demux.add_frontend(FrontendSource::Hardware);
        demux.connect_frontend(FrontendSource::Hardware)?;
        demux.bind(Device::hooks(&device));
    }
    device.spawn_workers();

    if let Some(dir) = &settings.record_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut open_feeds = Vec::new();
    let mut consumers = Vec::new();
    for (adapter, demux) in demuxes.iter().enumerate() {
        for &pid in &settings.pids {
            let filter = PidFilter::Pid(pid);
            let feed = demux.start_feed(filter)?;
            open_feeds.push((adapter, feed.id()));
            let path = settings
                .record_dir
                .as_deref()
                .map(|dir| recorder::record_path(dir, adapter, filter));
            consumers.push(tokio::spawn(recorder::consume(adapter, feed, path)));
        }
    }

    let engine = Arc::new(SimEngine::new(regs));
    let pes_pid = settings.pids.first().copied().unwrap_or(DEFAULT_PES_PID);
    let (stop_tx, stop_rx) = watch::channel(false);
    let sources: Vec<_> = device
        .adapters()
        .iter()
        .map(|adapter| {
            let source = SimSource::new(
                device.clone(),
                engine.clone(),
                adapter.index(),
                adapter.fgpi(),
                pes_pid,
                settings.interval,
            );
            tokio::spawn(source.run(stop_rx.clone()))
        })
        .collect();

    info!(
        "Capturing {} adapter(s), PIDs {:04X?}{}",
        device.adapters().len(),
        settings.pids,
        settings
            .duration
            .map(|d| format!(" for {}s", d.as_secs()))
            .unwrap_or_default()
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Ctrl-C received, shutting down");
        }
        _ = wait_duration(settings.duration) => info!("Capture duration elapsed"),
    }

    let _ = stop_tx.send(true);
    let mut slots = 0;
    for source in sources {
        match source.await {
            Ok(n) => slots += n,
            Err(e) => error!("Source task failed: {}", e),
        }
    }
    info!("Sources stopped after {} completed slot(s)", slots);

    for (adapter, id) in open_feeds {
        if let Err(e) = demuxes[adapter].stop_feed(id) {
            warn!("Failed to stop feed {} on adapter {}: {}", id, adapter, e);
        }
    }
    let mut summaries = Vec::new();
    for consumer in consumers {
        match consumer.await {
            Ok(summary) => summaries.push(summary),
            Err(e) => error!("Feed consumer failed: {}", e),
        }
    }

    device.detach().await;
    report::print_report(&device, &demuxes, &summaries);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Explicit path > auto-detect > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(config) => {
                eprintln!("Loaded config from: {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the file
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let settings = Settings::merge(&args, &file_config)?;
    info!(
        "Board: {} ({}), {} adapter(s)",
        settings.board.model_name,
        settings.board.dev_type,
        settings.board.adapters.len()
    );

    if let Err(e) = run(settings).await {
        error!("Capture failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}
