//! Stream contracts for specflow - metadata, timestamped sample blocks, and
//! the typed ports that carry them.
//!
//! The input side delivers named streams of floats with framed, overlapped
//! reads; the output side fans packets out to connected consumers and tracks
//! connection state. The transport here is in-memory (channels and shared
//! queues); a network transport would implement the same surface.

mod block;
mod input;
mod output;
mod sri;

pub use block::{SampleBlock, Timestamp};
pub use input::{InFloatPort, InFloatStream, StreamWriter};
pub use output::{OutFloatPort, OutFloatStream, PortState, StreamPacket};
pub use sri::{changes, Keyword, Mode, Sri, Units};
