pub mod config;
pub mod error;
mod poller;
mod processor;

pub use error::PipelineError;
pub use poller::{Poller, PollerSettings, PollerStats};
pub use processor::{annotate, validate_routes, Processor};
