use crate::{
    BoardMessage, ConcurrentQueue, ConfigState, Counter, Discriminator, ReadOutcome, ReadyFlag,
    Source, SourceError, StartBarrier, StartSignal, WorkerSnapshot, WorkerStats,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Configuring,
    Armed,
    WaitingForStart,
    Running,
    Draining,
    Done,
}

/// Everything the board threads of one run share.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<ConcurrentQueue<BoardMessage>>,
    pub start: Arc<StartBarrier>,
    pub discriminator: Discriminator,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub source_id: usize,
    pub name: String,
    /// Whether the board got past the start barrier.
    pub acquired: bool,
    pub stats: WorkerSnapshot,
}

/// Pushes the board's end-of-stream marker exactly once, at the latest when
/// dropped, so the aggregator is released even if the thread unwinds.
struct EndOfStream {
    source_id: usize,
    queue: Arc<ConcurrentQueue<BoardMessage>>,
    sent: bool,
}

impl EndOfStream {
    fn emit(&mut self) {
        if self.sent {
            return;
        }
        self.sent = true;
        let marker = BoardMessage::EndOfStream {
            source_id: self.source_id,
        };
        if let Err(e) = self.queue.push(marker) {
            error!("Board {}: could not queue end of stream: {}", self.source_id, e);
        }
    }
}

impl Drop for EndOfStream {
    fn drop(&mut self) {
        self.emit();
    }
}

/// Reports the board as failed if the thread leaves before configuring, so
/// the orchestrator never waits on a flag nobody will set.
struct ReadyGuard {
    source_id: usize,
    ready: Arc<ReadyFlag>,
}

impl Drop for ReadyGuard {
    fn drop(&mut self) {
        let failed = ConfigState::Failed(SourceError::Configuration(
            "board thread exited while configuring".into(),
        ));
        if self.ready.set_if_pending(failed) {
            error!("Board {}: thread exited while configuring", self.source_id);
        }
    }
}

/// Acquisition loop for one board.
///
/// Configures the board, reports to the orchestrator, waits for the shared
/// start signal, then reads and times events until the board reports that
/// the stream ended.
pub struct AcquisitionWorker {
    source_id: usize,
    source: Arc<dyn Source>,
    ctx: WorkerContext,
    ready: Arc<ReadyFlag>,
    stats: Arc<WorkerStats>,
    state: WorkerState,
}

impl AcquisitionWorker {
    pub fn new(source_id: usize, source: Arc<dyn Source>, ctx: WorkerContext) -> Self {
        Self {
            source_id,
            source,
            ctx,
            ready: Arc::new(ReadyFlag::new()),
            stats: Arc::new(WorkerStats::default()),
            state: WorkerState::Configuring,
        }
    }

    pub fn ready(&self) -> Arc<ReadyFlag> {
        Arc::clone(&self.ready)
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub fn run(mut self) -> WorkerReport {
        let mut end_of_stream = EndOfStream {
            source_id: self.source_id,
            queue: Arc::clone(&self.ctx.queue),
            sent: false,
        };
        let _ready_guard = ReadyGuard {
            source_id: self.source_id,
            ready: Arc::clone(&self.ready),
        };

        let acquired = self.start_up();
        if acquired {
            self.acquire();
            self.transition(WorkerState::Draining);
        }
        end_of_stream.emit();
        self.transition(WorkerState::Done);

        WorkerReport {
            source_id: self.source_id,
            name: self.source.name().to_string(),
            acquired,
            stats: self.stats.snapshot(),
        }
    }

    /// Configure, report and wait for the start signal. Returns `false` if
    /// the run must end before acquiring.
    fn start_up(&mut self) -> bool {
        self.transition(WorkerState::Configuring);
        if let Err(e) = self.source.configure() {
            error!("Board {}: configuration failed: {}", self.source_id, e);
            self.ready.set(ConfigState::Failed(e));
            return false;
        }
        self.ready.set(ConfigState::Configured);
        self.transition(WorkerState::Armed);

        self.transition(WorkerState::WaitingForStart);
        match self.ctx.start.wait() {
            StartSignal::Started => {
                self.transition(WorkerState::Running);
                true
            }
            StartSignal::Aborted => {
                info!("Board {}: run aborted before start", self.source_id);
                false
            }
        }
    }

    fn acquire(&mut self) {
        let tick_ns = self.source.tick_ns();
        let mut counter = Counter::new();
        let mut previous_report = Instant::now();

        loop {
            if previous_report.elapsed() >= REPORT_INTERVAL {
                debug!(
                    "Board {}: events {} rate {:.2} MB/s",
                    self.source_id,
                    counter.n_events,
                    counter.rate()
                );
                previous_report = Instant::now();
            }

            match self.source.read_event(self.ctx.read_timeout) {
                ReadOutcome::Event(raw) => {
                    counter.increment(raw.event_size);
                    self.stats.record_event(raw.event_size);
                    let event = self
                        .ctx
                        .discriminator
                        .process_event(self.source_id, tick_ns, &raw);
                    if let Err(e) = self.ctx.queue.push(BoardMessage::Data(event)) {
                        self.stats.record_drop();
                        warn!(
                            "Board {}: dropped trigger {}: {}",
                            self.source_id, raw.trigger_id, e
                        );
                    }
                }
                ReadOutcome::Timeout => continue,
                ReadOutcome::StreamEnded => {
                    info!(
                        "Board {}: stop received after {} events ({:.2} MB/s average)",
                        self.source_id,
                        counter.n_events,
                        counter.average_rate()
                    );
                    break;
                }
                ReadOutcome::Error(e) => {
                    self.stats.record_read_error();
                    warn!("Board {}: read failed: {}", self.source_id, e);
                }
            }
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            debug!("Board {}: {:?} -> {:?}", self.source_id, self.state, next);
            self.state = next;
        }
    }
}
