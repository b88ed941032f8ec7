use thiserror::Error;

/// Failure of a single queue operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// A producer panicked while holding the tail lock.
    #[error("queue tail lock poisoned")]
    Poisoned,
}

/// Errors reported by a board through the [`Source`](crate::Source) interface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("device error {code}: {message}")]
    Device { code: i32, message: String },
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("configuration rejected: {0}")]
    Configuration(String),
}

/// Invalid constant-fraction discriminator settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("CFD fraction must lie in (0, 1), got {0}")]
    Fraction(f64),
    #[error("CFD arm threshold must be negative, got {0}")]
    ArmThreshold(f64),
    #[error("baseline window must hold at least one sample")]
    BaselineSamples,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no sources to acquire from")]
    NoSources,
    #[error("board {source_id} failed to configure")]
    Configure {
        source_id: usize,
        #[source]
        source: SourceError,
    },
    #[error("command {command} failed on board {source_id}")]
    Command {
        source_id: usize,
        command: &'static str,
        #[source]
        source: SourceError,
    },
    #[error("{0} thread panicked")]
    ThreadPanic(&'static str),
    #[error("could not spawn thread")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
