//! Software digitizer for running the pipeline without hardware.
//!
//! Boards created from the same [`SimClock`] behave like a daisy-chained
//! crate: a software start on any of them starts every armed board, and all
//! timestamps count ticks from that common start.

use crate::{
    Polarity, RawEvent, ReadOutcome, SimSettings, Source, SourceError, CMD_ARM, CMD_DISARM,
    CMD_START, CMD_TRIGGER,
};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Timestamp, trigger id and size fields of the readout.
const HEADER_BYTES: usize = 24;
/// Longest a board sleeps while armed before looking at the start line again.
const ARMED_POLL: Duration = Duration::from_millis(1);
const RISE_SAMPLES: f64 = 4.0;
const DECAY_SAMPLES: f64 = 40.0;

/// Start line and time origin shared by a set of simulated boards.
#[derive(Debug, Default)]
pub struct SimClock {
    start: OnceLock<Instant>,
}

impl SimClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn start(&self) -> Instant {
        *self.start.get_or_init(Instant::now)
    }

    fn started(&self) -> Option<Instant> {
        self.start.get().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcqStatus {
    Idle,
    Armed,
    Running,
    Disarmed,
}

struct SimState {
    status: AcqStatus,
    rng: StdRng,
    trigger_id: u32,
    next_trigger: Instant,
}

pub struct SimulatedBoard {
    name: String,
    settings: SimSettings,
    clock: Arc<SimClock>,
    state: Mutex<SimState>,
    cond: Condvar,
}

impl SimulatedBoard {
    pub fn new(name: impl Into<String>, settings: SimSettings, clock: Arc<SimClock>) -> Self {
        Self::with_rng(name, settings, clock, StdRng::from_os_rng())
    }

    /// Reproducible board for tests.
    pub fn with_seed(
        name: impl Into<String>,
        settings: SimSettings,
        clock: Arc<SimClock>,
        seed: u64,
    ) -> Self {
        Self::with_rng(name, settings, clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        name: impl Into<String>,
        settings: SimSettings,
        clock: Arc<SimClock>,
        rng: StdRng,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            clock,
            state: Mutex::new(SimState {
                status: AcqStatus::Idle,
                rng,
                trigger_id: 0,
                next_trigger: Instant::now(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trigger_gap(&self, rng: &mut StdRng) -> Duration {
        let u: f64 = rng.random();
        Duration::from_secs_f64(-(1.0 - u).ln() / self.settings.rate_hz)
    }

    fn generate(&self, state: &mut SimState, now: Instant, start: Instant) -> RawEvent {
        let s = &self.settings;
        let mut event = RawEvent::new(s.n_channels, s.record_len);
        event.timestamp = (now.duration_since(start).as_nanos() as f64 / s.tick_ns) as u64;
        event.trigger_id = state.trigger_id;
        event.event_size = HEADER_BYTES + s.n_channels * s.record_len * std::mem::size_of::<u16>();
        event.n_samples.fill(s.record_len);

        let sign = match s.polarity {
            Polarity::Negative => -1.0,
            Polarity::Positive => 1.0,
        };
        let half_noise = f64::from(s.noise) / 2.0;
        for mut row in event.waveform_data.rows_mut() {
            let amplitude = f64::from(state.rng.random_range(s.amplitude_min..=s.amplitude_max));
            let arrival = s.pre_trig_len as f64 + state.rng.random::<f64>();
            for (i, sample) in row.iter_mut().enumerate() {
                let t = i as f64 - arrival;
                let pulse = if t <= 0.0 {
                    0.0
                } else if t <= RISE_SAMPLES {
                    amplitude * t / RISE_SAMPLES
                } else {
                    amplitude * (-(t - RISE_SAMPLES) / DECAY_SAMPLES).exp()
                };
                let noise = if half_noise > 0.0 {
                    state.rng.random_range(-half_noise..=half_noise)
                } else {
                    0.0
                };
                let value = f64::from(s.baseline) + sign * pulse + noise;
                *sample = value.round().clamp(0.0, f64::from(u16::MAX)) as u16;
            }
        }

        state.trigger_id = state.trigger_id.wrapping_add(1);
        let gap = self.trigger_gap(&mut state.rng);
        state.next_trigger = now + gap;
        event
    }
}

impl Source for SimulatedBoard {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_channels(&self) -> usize {
        self.settings.n_channels
    }

    fn tick_ns(&self) -> f64 {
        self.settings.tick_ns
    }

    fn configure(&self) -> Result<(), SourceError> {
        let s = &self.settings;
        if s.n_channels == 0 || s.record_len == 0 {
            return Err(SourceError::Configuration(
                "board needs at least one channel and sample".into(),
            ));
        }
        if s.pre_trig_len >= s.record_len {
            return Err(SourceError::Configuration(format!(
                "pre-trigger {} does not fit in a record of {}",
                s.pre_trig_len, s.record_len
            )));
        }
        if s.amplitude_min > s.amplitude_max {
            return Err(SourceError::Configuration(format!(
                "amplitude range {}..{} is empty",
                s.amplitude_min, s.amplitude_max
            )));
        }
        if !(s.rate_hz > 0.0 && s.tick_ns > 0.0) {
            return Err(SourceError::Configuration(
                "trigger rate and clock period must be positive".into(),
            ));
        }
        debug!("{}: configured {} channels", self.name, s.n_channels);
        Ok(())
    }

    fn read_event(&self, timeout: Duration) -> ReadOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let now = Instant::now();
            if state.status == AcqStatus::Armed && self.clock.started().is_some() {
                state.status = AcqStatus::Running;
                let gap = self.trigger_gap(&mut state.rng);
                state.next_trigger = now + gap;
            }
            let mut wake = deadline;
            match state.status {
                AcqStatus::Disarmed => return ReadOutcome::StreamEnded,
                AcqStatus::Running => {
                    if now >= state.next_trigger {
                        let start = self.clock.start();
                        return ReadOutcome::Event(self.generate(&mut state, now, start));
                    }
                    wake = wake.min(state.next_trigger);
                }
                AcqStatus::Armed => wake = wake.min(now + ARMED_POLL),
                AcqStatus::Idle => {}
            }
            if now >= deadline {
                return ReadOutcome::Timeout;
            }
            state = self
                .cond
                .wait_timeout(state, wake.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn send_command(&self, command: &str) -> Result<(), SourceError> {
        let mut state = self.lock();
        match command {
            CMD_ARM => {
                if state.status == AcqStatus::Idle {
                    state.status = AcqStatus::Armed;
                }
            }
            CMD_START => {
                if state.status == AcqStatus::Idle {
                    return Err(SourceError::Device {
                        code: -6,
                        message: "start before arm".into(),
                    });
                }
                self.clock.start();
            }
            CMD_TRIGGER => {
                if state.status == AcqStatus::Running {
                    state.next_trigger = Instant::now();
                }
            }
            CMD_DISARM => state.status = AcqStatus::Disarmed,
            _ => return Err(SourceError::UnknownCommand(command.to_string())),
        }
        self.cond.notify_all();
        Ok(())
    }
}
