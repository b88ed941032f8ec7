use ndarray::{Array2, ArrayView1};
use std::time::{Duration, Instant};

/// One trigger read from a board.
///
/// Waveforms are stored as a contiguous (channels, record length) matrix, the
/// way the digitizer fills its readout buffer. Only the first `n_samples[ch]`
/// samples of row `ch` are valid.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub timestamp: u64,
    pub trigger_id: u32,
    pub event_size: usize,
    pub waveform_data: Array2<u16>,
    pub n_samples: Vec<usize>,
}

impl RawEvent {
    /// Create an empty event.
    ///
    /// # Arguments
    ///
    /// * `n_channels` - Number of waveforms/channels.
    /// * `waveform_len` - Number of samples allocated per waveform.
    pub fn new(n_channels: usize, waveform_len: usize) -> Self {
        Self {
            timestamp: 0,
            trigger_id: 0,
            event_size: 0,
            waveform_data: Array2::<u16>::zeros((n_channels, waveform_len)),
            n_samples: vec![0; n_channels],
        }
    }

    pub fn n_channels(&self) -> usize {
        self.waveform_data.nrows()
    }

    /// Valid part of the waveform of `channel`.
    pub fn waveform(&self, channel: usize) -> ArrayView1<'_, u16> {
        let row = self.waveform_data.row(channel);
        let len = self
            .n_samples
            .get(channel)
            .copied()
            .unwrap_or(0)
            .min(row.len());
        row.slice_move(ndarray::s![..len])
    }
}

/// Timing information extracted from a [`RawEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    pub source_id: usize,
    pub n_channels: usize,
    pub tick_ns: f64,
    pub timestamp: u64,
    pub trigger_id: u32,
    pub event_size: usize,
    /// CFD crossing time in ns from the start of the record, per channel.
    pub crossings: Vec<Option<f64>>,
    /// When the board thread finished timing the event.
    pub read_at: Instant,
}

impl ProcessedEvent {
    pub fn timestamp_ns(&self) -> f64 {
        self.timestamp as f64 * self.tick_ns
    }

    /// Time since the board thread handed the event over.
    pub fn latency(&self) -> Duration {
        self.read_at.elapsed()
    }

    /// Number of channels where the discriminator fired.
    pub fn n_hits(&self) -> usize {
        self.crossings.iter().filter(|c| c.is_some()).count()
    }
}

/// What a board thread hands to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardMessage {
    Data(ProcessedEvent),
    /// No further data will come from this board.
    EndOfStream { source_id: usize },
}
