use crate::{BoardMessage, ConcurrentQueue, LatencyStats, ProcessedEvent, SortedWindow};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorReport {
    pub received: u64,
    pub finalized: u64,
    /// Events that arrived after younger events had already left the window.
    pub late: u64,
    pub end_markers: usize,
    /// The shutdown timeout expired before every board ended its stream.
    pub timed_out: bool,
    pub missing_sources: Vec<usize>,
    /// Delay between a board thread timing an event and its finalization.
    pub latency: LatencyStats,
}

/// Hands finalized events to the downstream consumer.
struct Finalizer {
    sink: Sender<ProcessedEvent>,
    delivered: u64,
    disconnected: bool,
    latency: LatencyStats,
    /// Since the last periodic report.
    recent_latency: LatencyStats,
}

impl Finalizer {
    fn deliver(&mut self, event: ProcessedEvent) {
        self.delivered += 1;
        let latency = event.latency();
        self.latency.record(latency);
        self.recent_latency.record(latency);
        if self.disconnected {
            return;
        }
        if self.sink.send(event).is_err() {
            warn!("Event consumer went away; discarding finalized events");
            self.disconnected = true;
        }
    }
}

/// Single consumer of the board queue.
///
/// The queue never blocks, so an empty queue is handled by sleeping for
/// `poll_interval` and trying again. The loop ends once every board has sent
/// its end-of-stream marker; what is left in the window is then flushed.
pub struct EventAggregator {
    queue: Arc<ConcurrentQueue<BoardMessage>>,
    window: SortedWindow,
    n_sources: usize,
    poll_interval: Duration,
    finalizer: Finalizer,
    stop_requested: Arc<AtomicBool>,
    shutdown_timeout: Option<Duration>,
}

impl EventAggregator {
    pub fn new(
        queue: Arc<ConcurrentQueue<BoardMessage>>,
        n_sources: usize,
        horizon: u64,
        poll_interval: Duration,
        sink: Sender<ProcessedEvent>,
    ) -> Self {
        Self {
            queue,
            window: SortedWindow::new(horizon),
            n_sources,
            poll_interval,
            finalizer: Finalizer {
                sink,
                delivered: 0,
                disconnected: false,
                latency: LatencyStats::default(),
                recent_latency: LatencyStats::default(),
            },
            stop_requested: Arc::new(AtomicBool::new(false)),
            shutdown_timeout: None,
        }
    }

    /// Stop waiting for missing boards `timeout` after `stop_requested` is set.
    pub fn with_shutdown_timeout(
        mut self,
        stop_requested: Arc<AtomicBool>,
        timeout: Option<Duration>,
    ) -> Self {
        self.stop_requested = stop_requested;
        self.shutdown_timeout = timeout;
        self
    }

    pub fn run(mut self) -> AggregatorReport {
        let mut report = AggregatorReport::default();
        let mut ended = vec![false; self.n_sources];
        let mut missing_end_markers = self.n_sources;
        let mut stop_seen: Option<Instant> = None;
        let mut previous_report = Instant::now();

        while missing_end_markers > 0 {
            if previous_report.elapsed() >= REPORT_INTERVAL {
                let recent = std::mem::take(&mut self.finalizer.recent_latency);
                info!(
                    "Received {} events, finalized {}, window {}, queue {}, latency mean {:.2?} max {:.2?}",
                    report.received,
                    self.finalizer.delivered,
                    self.window.len(),
                    self.queue.approx_size(),
                    recent.mean(),
                    recent.max
                );
                previous_report = Instant::now();
            }

            match self.queue.pop() {
                None => {
                    if self.shutdown_expired(&mut stop_seen) {
                        report.timed_out = true;
                        break;
                    }
                    thread::sleep(self.poll_interval);
                }
                Some(BoardMessage::EndOfStream { source_id }) => {
                    missing_end_markers -= 1;
                    report.end_markers += 1;
                    match ended.get_mut(source_id) {
                        Some(flag) => *flag = true,
                        None => warn!("End of stream from unknown board {}", source_id),
                    }
                    debug!(
                        "Board {}: end of stream, {} boards still running",
                        source_id, missing_end_markers
                    );
                }
                Some(BoardMessage::Data(event)) => {
                    report.received += 1;
                    let (source_id, timestamp) = (event.source_id, event.timestamp);
                    if !self.window.insert(event) {
                        warn!(
                            "Board {}: event at {} arrived after its window closed \
                             (board skew exceeds the {} tick horizon)",
                            source_id,
                            timestamp,
                            self.window.horizon()
                        );
                    }
                    let finalizer = &mut self.finalizer;
                    self.window.evict_expired(|e| finalizer.deliver(e));
                }
            }
        }

        if report.timed_out {
            report.missing_sources = ended
                .iter()
                .enumerate()
                .filter(|(_, &done)| !done)
                .map(|(id, _)| id)
                .collect();
            error!(
                "Boards {:?} never reported end of stream; giving up",
                report.missing_sources
            );
        }

        let finalizer = &mut self.finalizer;
        let flushed = self.window.flush(|e| finalizer.deliver(e));
        report.finalized = self.finalizer.delivered;
        report.late = self.window.late_events();
        report.latency = self.finalizer.latency;
        info!(
            "Aggregation done: {} events received, {} finalized ({} at flush), {} late, \
             latency mean {:.2?} max {:.2?}",
            report.received,
            report.finalized,
            flushed,
            report.late,
            report.latency.mean(),
            report.latency.max
        );
        report
    }

    fn shutdown_expired(&self, stop_seen: &mut Option<Instant>) -> bool {
        let Some(timeout) = self.shutdown_timeout else {
            return false;
        };
        if !self.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        stop_seen.get_or_insert_with(Instant::now).elapsed() >= timeout
    }
}
