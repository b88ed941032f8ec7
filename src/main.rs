use anyhow::{bail, Context, Result};
use cfd_daq::*;
use clap::Parser;
use crossbeam_channel::{select, tick, unbounded};
use log::{info, warn, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};

#[derive(Parser, Debug)]
#[command(version, about = "Synchronized multi-board acquisition with CFD timing")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Seconds to acquire, overrides run_settings.run_duration
    #[arg(short, long)]
    duration: Option<u64>,

    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print a configuration template with all defaults and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_config {
        print!("{}", Conf::template());
        return Ok(());
    }

    init_logging(args.log_level, args.log_file.as_deref())?;

    let mut conf = Conf::load(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    if let Some(duration) = args.duration {
        conf.run_settings.run_duration = duration;
    }

    let clock = SimClock::new();
    let sources = conf
        .run_settings
        .boards
        .iter()
        .map(|url| open_board(url, &conf.sim_settings, &clock))
        .collect::<Result<Vec<_>>>()?;
    for (board_id, url) in conf.run_settings.boards.iter().enumerate() {
        info!("Board {}: {}", board_id, url);
    }

    let (tx_events, rx_events) = unbounded();
    let settings = PipelineSettings::from_conf(&conf);
    let acquisition =
        Acquisition::start(sources, &settings, tx_events).context("starting acquisition")?;
    info!(
        "Run started at {}",
        OffsetDateTime::now_utc().format(&Rfc3339)?
    );

    let run_duration = Duration::from_secs(conf.run_settings.run_duration);
    let t_begin = Instant::now();
    let ticker = tick(Duration::from_secs(1));
    let mut finalized = 0u64;
    let mut hits = 0usize;

    while t_begin.elapsed() < run_duration {
        select! {
            recv(rx_events) -> event => match event {
                Ok(event) => {
                    finalized += 1;
                    hits += event.n_hits();
                }
                Err(_) => {
                    warn!("Event aggregator stopped before the run ended");
                    break;
                }
            },
            recv(ticker) -> _ => {
                let acquired: u64 = acquisition.worker_stats().iter().map(|s| s.events).sum();
                info!(
                    "{:>4} s: acquired {} finalized {} queued {}",
                    t_begin.elapsed().as_secs(),
                    acquired,
                    finalized,
                    acquisition.queue_len()
                );
            }
        }
    }

    let summary = acquisition.stop().context("stopping acquisition")?;
    for event in rx_events.iter() {
        finalized += 1;
        hits += event.n_hits();
    }

    for worker in &summary.workers {
        info!(
            "Board {} ({}): {} events, {} bytes, {} dropped, {} read errors",
            worker.source_id,
            worker.name,
            worker.stats.events,
            worker.stats.bytes,
            worker.stats.dropped,
            worker.stats.read_errors
        );
    }
    info!(
        "Finalized {} of {} events in {:.1} s, {} channel hits",
        finalized,
        summary.events_acquired(),
        t_begin.elapsed().as_secs_f64(),
        hits
    );
    info!(
        "Readout to finalize latency: mean {:.2?}, max {:.2?}",
        summary.aggregator.latency.mean(),
        summary.aggregator.latency.max
    );
    if summary.aggregator.late > 0 {
        warn!(
            "{} events arrived after the {} tick window had moved past them",
            summary.aggregator.late, conf.window_settings.horizon
        );
    }
    if summary.aggregator.timed_out {
        bail!(
            "boards {:?} never ended their streams",
            summary.aggregator.missing_sources
        );
    }
    Ok(())
}

fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let config = ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, config, file));
    }
    CombinedLogger::init(loggers).context("installing logger")?;
    Ok(())
}

fn open_board(url: &str, settings: &SimSettings, clock: &Arc<SimClock>) -> Result<Arc<dyn Source>> {
    if url.starts_with("sim://") {
        Ok(Arc::new(SimulatedBoard::new(
            url,
            settings.clone(),
            Arc::clone(clock),
        )))
    } else {
        bail!("unsupported board {url}: only sim:// boards are built in")
    }
}
