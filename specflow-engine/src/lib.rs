//! Stream-processing engine for specflow.
//!
//! The supervisor watches an input port for named sample streams and runs
//! one worker thread per live stream. Each worker takes overlapped
//! fixed-size windows, runs the real- or complex-input transform, derives
//! spectral metadata, optionally averages and log-scales the power output,
//! and writes both derived streams. Tunable parameters fan out to every
//! worker through mutex-protected parameter boxes and take effect at the
//! next loop iteration.

mod error;
mod params;
mod supervisor;
mod worker;

pub use error::{ConfigError, StopError};
pub use params::{ParamBox, ProcessorParams};
pub use supervisor::{Settings, Supervisor};
pub use worker::StreamWorker;
