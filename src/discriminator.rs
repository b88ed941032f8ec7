//! Constant-fraction timing of digitized pulses.
//!
//! The CFD signal compares each baseline-corrected sample with an attenuated
//! copy delayed by `delay` samples: `d[i] = f * w[i] - w[i - delay]`. For a
//! negative pulse `d` first goes negative and then crosses zero at a point
//! that does not depend on the pulse amplitude. The detector arms once `d`
//! drops below `arm_threshold` so baseline noise cannot fire it, then reports
//! the first zero crossing, linearly interpolated between the two samples
//! that bracket it.

use crate::{ConfigError, Polarity, ProcessedEvent, RawEvent};
use ndarray::ArrayView1;
use std::time::Instant;

pub const DEFAULT_BASELINE_SAMPLES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CfdParams {
    pub fraction: f64,
    pub delay: usize,
    pub arm_threshold: f64,
    pub baseline_samples: usize,
    pub polarity: Polarity,
}

impl Default for CfdParams {
    fn default() -> Self {
        Self {
            fraction: 0.25,
            delay: 32,
            arm_threshold: -100.0,
            baseline_samples: DEFAULT_BASELINE_SAMPLES,
            polarity: Polarity::Negative,
        }
    }
}

/// Validated CFD settings. Stateless: one instance can time any number of
/// waveforms.
#[derive(Debug, Clone, Copy)]
pub struct Discriminator {
    params: CfdParams,
}

impl Discriminator {
    pub fn new(params: CfdParams) -> Result<Self, ConfigError> {
        if !(params.fraction > 0.0 && params.fraction < 1.0) {
            return Err(ConfigError::Fraction(params.fraction));
        }
        if !(params.arm_threshold < 0.0) {
            return Err(ConfigError::ArmThreshold(params.arm_threshold));
        }
        if params.baseline_samples == 0 {
            return Err(ConfigError::BaselineSamples);
        }
        Ok(Self { params })
    }

    /// Fractional sample index of the CFD zero crossing, if any.
    pub fn crossing_index(&self, waveform: ArrayView1<'_, u16>) -> Option<f64> {
        let CfdParams {
            fraction,
            delay,
            arm_threshold,
            baseline_samples,
            polarity,
        } = self.params;

        if waveform.len() < baseline_samples {
            return None;
        }

        let baseline = waveform
            .iter()
            .take(baseline_samples)
            .map(|&s| f64::from(s))
            .sum::<f64>()
            / baseline_samples as f64;
        // Positive pulses are flipped so the search is always for a
        // negative-going CFD signal.
        let sign = match polarity {
            Polarity::Negative => 1.0,
            Polarity::Positive => -1.0,
        };
        let corrected: Vec<f64> = waveform
            .iter()
            .map(|&s| sign * (f64::from(s) - baseline))
            .collect();

        let mut armed = false;
        let mut previous = 0.0;
        for (i, &sample) in corrected.iter().enumerate() {
            let delayed = if i >= delay { corrected[i - delay] } else { 0.0 };
            let cfd = fraction * sample - delayed;

            if armed && cfd >= 0.0 {
                // previous < 0 <= cfd, so the fraction lies in (0, 1].
                return Some((i - 1) as f64 + previous / (previous - cfd));
            }
            if !armed && cfd < arm_threshold {
                armed = true;
            }
            previous = cfd;
        }

        None
    }

    /// Crossing time in ns from the start of the record.
    pub fn crossing_time(&self, waveform: ArrayView1<'_, u16>, tick_ns: f64) -> Option<f64> {
        self.crossing_index(waveform).map(|t| t * tick_ns)
    }

    /// Time every channel of `event`.
    pub fn process_event(&self, source_id: usize, tick_ns: f64, event: &RawEvent) -> ProcessedEvent {
        let crossings = (0..event.n_channels())
            .map(|ch| self.crossing_time(event.waveform(ch), tick_ns))
            .collect();

        ProcessedEvent {
            source_id,
            n_channels: event.n_channels(),
            tick_ns,
            timestamp: event.timestamp,
            trigger_id: event.trigger_id,
            event_size: event.event_size,
            crossings,
            read_at: Instant::now(),
        }
    }
}
