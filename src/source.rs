use crate::{RawEvent, SourceError};
use std::time::Duration;

pub const CMD_ARM: &str = "/cmd/armacquisition";
pub const CMD_START: &str = "/cmd/swstartacquisition";
pub const CMD_DISARM: &str = "/cmd/disarmacquisition";
pub const CMD_TRIGGER: &str = "/cmd/sendswtrigger";

/// Result of a single readout attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    Event(RawEvent),
    /// Nothing arrived within the timeout.
    Timeout,
    /// The board was disarmed and has no more data.
    StreamEnded,
    Error(SourceError),
}

/// One digitizer board as seen by the acquisition pipeline.
///
/// Methods take `&self`: the board thread reads while the orchestrator sends
/// commands to the same board, as with a shared device handle.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn n_channels(&self) -> usize;

    /// Clock period in ns of timestamps and waveform samples.
    fn tick_ns(&self) -> f64;

    /// Board-specific setup done from the board's own thread before arming.
    fn configure(&self) -> Result<(), SourceError>;

    fn read_event(&self, timeout: Duration) -> ReadOutcome;

    fn send_command(&self, command: &str) -> Result<(), SourceError>;
}
