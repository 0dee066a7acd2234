//! Timestamped sample blocks handed out by framed reads.

use crate::sri::{Mode, Sri};

/// A per-sample time marker inside a block.
///
/// The first timestamp is always at offset 0 and may be synthetic
/// (interpolated from an earlier measurement); any further timestamps are
/// measured. The list is sorted by offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamp {
    /// Sample offset within the block (scalar or complex samples per mode)
    pub offset: usize,
    /// Seconds
    pub time: f64,
    /// True when interpolated rather than measured
    pub synthetic: bool,
}

impl Timestamp {
    pub fn new(offset: usize, time: f64, synthetic: bool) -> Self {
        Self {
            offset,
            time,
            synthetic,
        }
    }
}

/// One framed window of samples with its metadata.
#[derive(Debug, Clone)]
pub struct SampleBlock {
    data: Vec<f32>,
    sri: Sri,
    sri_changed: bool,
    sri_change_flags: u32,
    timestamps: Vec<Timestamp>,
    input_queue_flushed: bool,
}

impl SampleBlock {
    pub fn new(data: Vec<f32>, sri: Sri, timestamps: Vec<Timestamp>) -> Self {
        Self {
            data,
            sri,
            sri_changed: false,
            sri_change_flags: 0,
            timestamps,
            input_queue_flushed: false,
        }
    }

    pub fn with_sri_changed(mut self, flags: u32) -> Self {
        self.sri_changed = true;
        self.sri_change_flags = flags;
        self
    }

    pub fn with_queue_flushed(mut self) -> Self {
        self.input_queue_flushed = true;
        self
    }

    /// Raw floats (interleaved re/im pairs when complex)
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Scalar length in floats
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Complex sample count (half the float count)
    pub fn cx_len(&self) -> usize {
        self.data.len() / 2
    }

    pub fn complex(&self) -> bool {
        self.sri.mode == Mode::Complex
    }

    pub fn sri(&self) -> &Sri {
        &self.sri
    }

    /// True when the SRI differs from the previous block on this stream
    pub fn sri_changed(&self) -> bool {
        self.sri_changed
    }

    /// Bitmask of changed SRI fields (see [`crate::changes`])
    pub fn sri_change_flags(&self) -> u32 {
        self.sri_change_flags
    }

    /// Sorted time markers; first entry is offset 0
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    /// True when the upstream queue overflowed and was flushed since the
    /// previous block
    pub fn input_queue_flushed(&self) -> bool {
        self.input_queue_flushed
    }
}
