use crate::{
    AcquisitionWorker, AggregatorReport, BoardMessage, CfdParams, ConcurrentQueue, ConfigState,
    Conf, Discriminator, EventAggregator, PipelineError, ProcessedEvent, Source, StartBarrier,
    WorkerContext, WorkerReport, WorkerSnapshot, WorkerStats, CMD_ARM, CMD_DISARM, CMD_START,
    CMD_TRIGGER,
};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    /// Correlation window length in clock ticks.
    pub horizon: u64,
    pub shutdown_timeout: Option<Duration>,
    pub cfd: CfdParams,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1),
            horizon: 1000,
            shutdown_timeout: None,
            cfd: CfdParams::default(),
        }
    }
}

impl PipelineSettings {
    pub fn from_conf(conf: &Conf) -> Self {
        Self {
            read_timeout: conf.run_settings.read_timeout(),
            poll_interval: conf.run_settings.poll_interval(),
            horizon: conf.window_settings.horizon,
            shutdown_timeout: conf.run_settings.shutdown_timeout(),
            cfd: conf.cfd_params(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One report per board thread that was joined.
    pub workers: Vec<WorkerReport>,
    pub aggregator: AggregatorReport,
}

impl RunSummary {
    pub fn events_acquired(&self) -> u64 {
        self.workers.iter().map(|w| w.stats.events).sum()
    }

    pub fn events_dropped(&self) -> u64 {
        self.workers.iter().map(|w| w.stats.dropped).sum()
    }
}

struct BoardHandle {
    source: Arc<dyn Source>,
    stats: Arc<WorkerStats>,
    thread: JoinHandle<WorkerReport>,
}

/// A running acquisition: one thread per board plus the event aggregator.
///
/// `start` returns once every board is configured and armed and the primary
/// board has been sent the software start. Finalized events arrive on the
/// sink passed to `start`, in timestamp order.
pub struct Acquisition {
    boards: Vec<BoardHandle>,
    aggregator: JoinHandle<AggregatorReport>,
    queue: Arc<ConcurrentQueue<BoardMessage>>,
    start: Arc<StartBarrier>,
    stop_requested: Arc<AtomicBool>,
}

impl Acquisition {
    pub fn start(
        sources: Vec<Arc<dyn Source>>,
        settings: &PipelineSettings,
        sink: Sender<ProcessedEvent>,
    ) -> Result<Self, PipelineError> {
        if sources.is_empty() {
            return Err(PipelineError::NoSources);
        }
        let n_sources = sources.len();
        let ctx = WorkerContext {
            queue: Arc::new(ConcurrentQueue::new()),
            start: Arc::new(StartBarrier::new()),
            discriminator: Discriminator::new(settings.cfd)?,
            read_timeout: settings.read_timeout,
        };

        // Spawn a data-taking thread for each board.
        let mut boards = Vec::with_capacity(n_sources);
        let mut ready_flags = Vec::with_capacity(n_sources);
        for (source_id, source) in sources.into_iter().enumerate() {
            let worker = AcquisitionWorker::new(source_id, Arc::clone(&source), ctx.clone());
            ready_flags.push(worker.ready());
            let stats = worker.stats();
            let spawned = thread::Builder::new()
                .name(format!("board-{source_id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(thread) => boards.push(BoardHandle {
                    source,
                    stats,
                    thread,
                }),
                Err(e) => {
                    abandon(&ctx.start, boards);
                    return Err(e.into());
                }
            }
        }

        let stop_requested = Arc::new(AtomicBool::new(false));
        let aggregator = EventAggregator::new(
            Arc::clone(&ctx.queue),
            n_sources,
            settings.horizon,
            settings.poll_interval,
            sink,
        )
        .with_shutdown_timeout(Arc::clone(&stop_requested), settings.shutdown_timeout);
        let aggregator = match thread::Builder::new()
            .name("event-aggregator".into())
            .spawn(move || aggregator.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                abandon(&ctx.start, boards);
                return Err(e.into());
            }
        };

        let acquisition = Self {
            boards,
            aggregator,
            queue: ctx.queue,
            start: ctx.start,
            stop_requested,
        };

        // Wait until every board has configured itself, in board order.
        for (source_id, ready) in ready_flags.iter().enumerate() {
            if let ConfigState::Failed(source) = ready.wait() {
                error!("Board {}: startup aborted", source_id);
                acquisition.abort();
                return Err(PipelineError::Configure { source_id, source });
            }
            debug!("Board {}: configured", source_id);
        }

        if let Err(e) = acquisition.command_all(CMD_ARM) {
            acquisition.abort();
            return Err(e);
        }

        acquisition.start.release();

        // The primary board starts the whole chain.
        let started = acquisition.boards[0].source.send_command(CMD_START);
        if let Err(source) = started {
            acquisition.abort();
            return Err(PipelineError::Command {
                source_id: 0,
                command: CMD_START,
                source,
            });
        }
        info!("Run started on {} boards", n_sources);
        Ok(acquisition)
    }

    pub fn n_boards(&self) -> usize {
        self.boards.len()
    }

    /// Approximate number of messages waiting for the aggregator.
    pub fn queue_len(&self) -> usize {
        self.queue.approx_size()
    }

    pub fn worker_stats(&self) -> Vec<WorkerSnapshot> {
        self.boards.iter().map(|b| b.stats.snapshot()).collect()
    }

    pub fn send_software_trigger(&self) -> Result<(), PipelineError> {
        self.boards[0]
            .source
            .send_command(CMD_TRIGGER)
            .map_err(|source| PipelineError::Command {
                source_id: 0,
                command: CMD_TRIGGER,
                source,
            })
    }

    /// Disarm every board and wait for the run to drain.
    pub fn stop(self) -> Result<RunSummary, PipelineError> {
        info!("Stopping run");
        self.stop_requested.store(true, Ordering::SeqCst);
        self.disarm_all();
        self.join()
    }

    fn command_all(&self, command: &'static str) -> Result<(), PipelineError> {
        for (source_id, board) in self.boards.iter().enumerate() {
            board
                .source
                .send_command(command)
                .map_err(|source| PipelineError::Command {
                    source_id,
                    command,
                    source,
                })?;
        }
        Ok(())
    }

    fn disarm_all(&self) {
        for (source_id, board) in self.boards.iter().enumerate() {
            if let Err(e) = board.source.send_command(CMD_DISARM) {
                warn!("Board {}: disarm failed: {}", source_id, e);
            }
        }
    }

    fn abort(self) {
        self.start.abort();
        self.stop_requested.store(true, Ordering::SeqCst);
        self.disarm_all();
        if let Err(e) = self.join() {
            error!("Cleanup after failed start: {}", e);
        }
    }

    fn join(self) -> Result<RunSummary, PipelineError> {
        let aggregator = self
            .aggregator
            .join()
            .map_err(|_| PipelineError::ThreadPanic("event aggregator"))?;

        let mut workers = Vec::with_capacity(self.boards.len());
        for (source_id, board) in self.boards.into_iter().enumerate() {
            if aggregator.timed_out && !board.thread.is_finished() {
                warn!("Board {}: thread still running, leaving it behind", source_id);
                continue;
            }
            match board.thread.join() {
                Ok(report) => workers.push(report),
                Err(_) => error!("Board {}: acquisition thread panicked", source_id),
            }
        }
        Ok(RunSummary {
            workers,
            aggregator,
        })
    }
}

/// Release and join board threads when the run could not be assembled.
fn abandon(start: &StartBarrier, boards: Vec<BoardHandle>) {
    start.abort();
    for board in boards {
        if board.thread.join().is_err() {
            error!("Board thread panicked during startup");
        }
    }
}
