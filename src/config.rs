use crate::CfdParams;
use confique::Config;
use serde::Deserialize;
use std::{path::Path, time::Duration};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub cfd_settings: CfdSettings,
    #[config(nested)]
    pub window_settings: WindowSettings,
    #[config(nested)]
    pub sim_settings: SimSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// Board URLs, one acquisition thread each. The first board is the
    /// primary and receives the software start command.
    #[config(default = ["sim://board0", "sim://board1", "sim://board2"])]
    pub boards: Vec<String>,
    /// Seconds to acquire before disarming the boards.
    #[config(default = 10)]
    pub run_duration: u64,
    /// Upper bound on a single board read, in ms.
    #[config(default = 100)]
    pub read_timeout_ms: u64,
    /// Aggregator sleep when the event queue is empty, in us.
    #[config(default = 1000)]
    pub poll_interval_us: u64,
    /// Give up on boards that never report stream end this many seconds
    /// after the stop request. 0 waits forever.
    #[config(default = 0)]
    pub shutdown_timeout_s: u64,
}

#[derive(Config, Debug, Clone)]
pub struct CfdSettings {
    /// Attenuation of the prompt signal, in (0, 1).
    #[config(default = 0.25)]
    pub fraction: f64,
    /// Delay of the inverted copy, in samples.
    #[config(default = 32)]
    pub delay: usize,
    /// The CFD signal must drop below this (negative) value before a zero
    /// crossing is accepted.
    #[config(default = -100.0)]
    pub arm_threshold: f64,
    /// Samples averaged at the start of the record for the baseline.
    #[config(default = 16)]
    pub baseline_samples: usize,
    #[config(default = "Negative")]
    pub polarity: Polarity,
}

#[derive(Config, Debug, Clone)]
pub struct WindowSettings {
    /// Events older than the newest one by at least this many clock ticks
    /// leave the correlation window.
    #[config(default = 1000)]
    pub horizon: u64,
}

#[derive(Config, Debug, Clone)]
pub struct SimSettings {
    #[config(default = 4)]
    pub n_channels: usize,
    #[config(default = 256)]
    pub record_len: usize,
    #[config(default = 100)]
    pub pre_trig_len: usize,
    /// Board clock period in ns.
    #[config(default = 8.0)]
    pub tick_ns: f64,
    /// Mean trigger rate per board, in Hz.
    #[config(default = 1000.0)]
    pub rate_hz: f64,
    #[config(default = 500)]
    pub amplitude_min: u16,
    #[config(default = 4000)]
    pub amplitude_max: u16,
    #[config(default = 8000)]
    pub baseline: u16,
    /// Peak-to-peak baseline noise in ADC counts.
    #[config(default = 10)]
    pub noise: u16,
    #[config(default = "Negative")]
    pub polarity: Polarity,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    Negative,
    Positive,
}

impl Conf {
    pub fn load(path: &Path) -> Result<Self, confique::Error> {
        Conf::builder().file(path).load()
    }

    /// Commented TOML file with every setting at its default.
    pub fn template() -> String {
        confique::toml::template::<Conf>(confique::toml::FormatOptions::default())
    }

    pub fn cfd_params(&self) -> CfdParams {
        let cfd = &self.cfd_settings;
        CfdParams {
            fraction: cfd.fraction,
            delay: cfd.delay,
            arm_threshold: cfd.arm_threshold,
            baseline_samples: cfd.baseline_samples,
            polarity: cfd.polarity,
        }
    }
}

impl RunSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        (self.shutdown_timeout_s > 0).then(|| Duration::from_secs(self.shutdown_timeout_s))
    }
}
