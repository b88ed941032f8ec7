pub mod aggregator;
pub mod barrier;
pub mod config;
pub mod discriminator;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod queue;
pub mod simulator;
pub mod source;
pub mod stats;
pub mod window;
pub mod worker;

pub use aggregator::*;
pub use barrier::*;
pub use config::*;
pub use discriminator::*;
pub use error::*;
pub use event::*;
pub use pipeline::*;
pub use queue::*;
pub use simulator::*;
pub use source::*;
pub use stats::*;
pub use window::*;
pub use worker::*;
