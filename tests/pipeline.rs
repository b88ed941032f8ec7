use cfd_daq::*;
use crossbeam_channel::unbounded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Board that replays a fixed list of events, then idles until disarmed.
struct ScriptedBoard {
    name: String,
    events: Mutex<VecDeque<RawEvent>>,
    fail_configure: bool,
    panic_configure: bool,
    ignore_disarm: bool,
    disarmed: AtomicBool,
    reads: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl ScriptedBoard {
    fn new(name: &str, timestamps: impl IntoIterator<Item = u64>) -> Self {
        let events = timestamps
            .into_iter()
            .enumerate()
            .map(|(i, ts)| pulse_event(ts, i as u32))
            .collect();
        Self {
            name: name.to_string(),
            events: Mutex::new(events),
            fail_configure: false,
            panic_configure: false,
            ignore_disarm: false,
            disarmed: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Source for ScriptedBoard {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_channels(&self) -> usize {
        1
    }

    fn tick_ns(&self) -> f64 {
        8.0
    }

    fn configure(&self) -> Result<(), SourceError> {
        if self.panic_configure {
            panic!("driver crashed while configuring {}", self.name);
        }
        if self.fail_configure {
            return Err(SourceError::Device {
                code: -4,
                message: "device not found".into(),
            });
        }
        Ok(())
    }

    fn read_event(&self, timeout: Duration) -> ReadOutcome {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(event) = self.events.lock().unwrap().pop_front() {
            return ReadOutcome::Event(event);
        }
        if self.disarmed.load(Ordering::SeqCst) {
            return ReadOutcome::StreamEnded;
        }
        thread::sleep(timeout.min(Duration::from_millis(1)));
        ReadOutcome::Timeout
    }

    fn send_command(&self, command: &str) -> Result<(), SourceError> {
        self.commands.lock().unwrap().push(command.to_string());
        if command == CMD_DISARM && !self.ignore_disarm {
            self.disarmed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Negative square pulse over samples 50..70 on a flat baseline.
fn pulse_event(timestamp: u64, trigger_id: u32) -> RawEvent {
    let mut event = RawEvent::new(1, 128);
    event.timestamp = timestamp;
    event.trigger_id = trigger_id;
    event.event_size = 24 + 128 * 2;
    event.n_samples[0] = 128;
    for (i, sample) in event.waveform_data.row_mut(0).iter_mut().enumerate() {
        *sample = if (50..70).contains(&i) { 7000 } else { 8000 };
    }
    event
}

fn settings(horizon: u64) -> PipelineSettings {
    PipelineSettings {
        read_timeout: Duration::from_millis(5),
        poll_interval: Duration::from_micros(200),
        horizon,
        ..PipelineSettings::default()
    }
}

fn as_sources(boards: &[Arc<ScriptedBoard>]) -> Vec<Arc<dyn Source>> {
    boards
        .iter()
        .map(|b| Arc::clone(b) as Arc<dyn Source>)
        .collect()
}

fn wait_for_events(acquisition: &Acquisition, expected: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while acquisition.worker_stats().iter().map(|s| s.events).sum::<u64>() < expected {
        assert!(Instant::now() < deadline, "boards stalled");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn three_boards_merge_in_timestamp_order() {
    let boards: Vec<Arc<ScriptedBoard>> = (0..3u64)
        .map(|b| {
            Arc::new(ScriptedBoard::new(
                &format!("scripted://{b}"),
                (0..50u64).map(move |i| i * 300 + b * 100),
            ))
        })
        .collect();
    let (tx, rx) = unbounded();

    // Horizon longer than the run so board scheduling cannot reorder output.
    let acquisition = Acquisition::start(as_sources(&boards), &settings(1_000_000), tx).unwrap();
    assert_eq!(acquisition.n_boards(), 3);
    wait_for_events(&acquisition, 150);
    let summary = acquisition.stop().unwrap();

    let events: Vec<ProcessedEvent> = rx.iter().collect();
    assert_eq!(events.len(), 150);
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(events.iter().all(|e| e.n_hits() == 1));

    assert_eq!(summary.aggregator.end_markers, 3);
    assert_eq!(summary.aggregator.finalized, 150);
    assert_eq!(summary.aggregator.late, 0);
    assert_eq!(summary.aggregator.latency.count, 150);
    assert!(summary.aggregator.latency.max >= summary.aggregator.latency.mean());
    assert!(!summary.aggregator.timed_out);
    assert_eq!(summary.workers.len(), 3);
    assert_eq!(summary.events_acquired(), 150);
    assert_eq!(summary.events_dropped(), 0);

    assert_eq!(
        boards[0].commands(),
        vec![CMD_ARM, CMD_START, CMD_DISARM]
    );
    for board in &boards[1..] {
        assert_eq!(board.commands(), vec![CMD_ARM, CMD_DISARM]);
    }
}

#[test]
fn crossing_times_survive_the_pipeline() {
    let board = Arc::new(ScriptedBoard::new("scripted://0", [1000]));
    let (tx, rx) = unbounded();
    let acquisition = Acquisition::start(as_sources(&[board]), &settings(100), tx).unwrap();
    wait_for_events(&acquisition, 1);
    acquisition.stop().unwrap();

    let event = rx.recv().unwrap();
    assert_eq!(event.timestamp, 1000);
    // Square pulse from sample 50 with delay 32 crosses near sample 71.
    let crossing = event.crossings[0].unwrap();
    assert!((crossing / 8.0 - 71.0).abs() <= 1.0, "crossing {crossing}");
}

#[test]
fn configure_failure_aborts_startup() {
    let mut failing = ScriptedBoard::new("scripted://1", [5]);
    failing.fail_configure = true;
    let boards = vec![
        Arc::new(ScriptedBoard::new("scripted://0", [1, 2])),
        Arc::new(failing),
        Arc::new(ScriptedBoard::new("scripted://2", [3])),
    ];
    let (tx, rx) = unbounded();

    let err = Acquisition::start(as_sources(&boards), &settings(1000), tx)
        .err()
        .expect("startup should fail");
    match err {
        PipelineError::Configure { source_id, source } => {
            assert_eq!(source_id, 1);
            assert!(matches!(source, SourceError::Device { code: -4, .. }));
        }
        other => panic!("unexpected error {other}"),
    }
    for board in &boards {
        assert_eq!(board.reads.load(Ordering::SeqCst), 0);
        assert!(!board.commands().iter().any(|c| c == CMD_START));
    }
    // The aggregator has exited and dropped its sender.
    assert_eq!(rx.iter().count(), 0);
}

#[test]
fn configure_panic_aborts_startup() {
    let mut crashing = ScriptedBoard::new("scripted://0", [1]);
    crashing.panic_configure = true;
    let boards = vec![
        Arc::new(crashing),
        Arc::new(ScriptedBoard::new("scripted://1", [2])),
    ];
    let (tx, rx) = unbounded();
    let (done_tx, done_rx) = unbounded();

    let sources = as_sources(&boards);
    thread::spawn(move || {
        let result = Acquisition::start(sources, &settings(1000), tx);
        done_tx.send(result.err()).unwrap();
    });
    let err = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("startup hung on a crashed board")
        .expect("startup should fail");
    assert!(matches!(
        err,
        PipelineError::Configure { source_id: 0, .. }
    ));
    assert_eq!(boards[1].reads.load(Ordering::SeqCst), 0);
    assert_eq!(rx.iter().count(), 0);
}

#[test]
fn rejects_empty_and_misconfigured_runs() {
    let (tx, _rx) = unbounded();
    assert!(matches!(
        Acquisition::start(Vec::new(), &settings(1000), tx.clone()),
        Err(PipelineError::NoSources)
    ));

    let mut bad = settings(1000);
    bad.cfd.fraction = 1.5;
    let board = Arc::new(ScriptedBoard::new("scripted://0", []));
    assert!(matches!(
        Acquisition::start(as_sources(&[board]), &bad, tx),
        Err(PipelineError::Config(ConfigError::Fraction(_)))
    ));
}

#[test]
fn shutdown_timeout_gives_up_on_stuck_board() {
    let mut stuck = ScriptedBoard::new("scripted://1", []);
    stuck.ignore_disarm = true;
    let boards = vec![
        Arc::new(ScriptedBoard::new("scripted://0", [10, 20])),
        Arc::new(stuck),
    ];
    let (tx, rx) = unbounded();
    let mut run = settings(1000);
    run.shutdown_timeout = Some(Duration::from_millis(50));

    let acquisition = Acquisition::start(as_sources(&boards), &run, tx).unwrap();
    wait_for_events(&acquisition, 2);
    let summary = acquisition.stop().unwrap();

    assert!(summary.aggregator.timed_out);
    assert_eq!(summary.aggregator.missing_sources, vec![1]);
    assert_eq!(summary.workers.len(), 1);
    assert_eq!(rx.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![10, 20]);
}

#[test]
fn simulated_boards_run_end_to_end() {
    let sim = SimSettings {
        n_channels: 2,
        record_len: 256,
        pre_trig_len: 100,
        tick_ns: 8.0,
        rate_hz: 2000.0,
        amplitude_min: 1000,
        amplitude_max: 3000,
        baseline: 8000,
        noise: 4,
        polarity: Polarity::Negative,
    };
    let clock = SimClock::new();
    let sources: Vec<Arc<dyn Source>> = (0..2u64)
        .map(|b| {
            Arc::new(SimulatedBoard::with_seed(
                format!("sim://board{b}"),
                sim.clone(),
                Arc::clone(&clock),
                b,
            )) as Arc<dyn Source>
        })
        .collect();
    let (tx, rx) = unbounded();
    let run = PipelineSettings {
        horizon: u64::MAX,
        ..settings(0)
    };

    let acquisition = Acquisition::start(sources, &run, tx).unwrap();
    wait_for_events(&acquisition, 20);
    acquisition.send_software_trigger().unwrap();
    let summary = acquisition.stop().unwrap();

    let events: Vec<ProcessedEvent> = rx.iter().collect();
    assert_eq!(events.len() as u64, summary.events_acquired());
    assert!(events.len() >= 20);
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(events.iter().any(|e| e.source_id == 0));
    assert!(events.iter().any(|e| e.source_id == 1));
    assert!(events.iter().all(|e| e.n_hits() == 2));
    assert_eq!(summary.aggregator.end_markers, 2);
}
