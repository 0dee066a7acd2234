//! Input port: named sample streams with framed, overlapped reads.
//!
//! A producer obtains a [`StreamWriter`] from [`InFloatPort::create_stream`]
//! and pushes timestamped float batches; a consumer polls the port for live
//! streams and reads fixed-size windows that advance by a stride, keeping
//! the overlap buffered for the next window. Reads are non-blocking; the
//! port-level poll is the only bounded wait.

use crate::block::{SampleBlock, Timestamp};
use crate::sri::{changes, Sri};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default bound on buffered floats per stream before the queue is flushed
const DEFAULT_QUEUE_DEPTH: usize = 1 << 20;

/// Generation counter + condvar used for the bounded poll wait
struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn bump(&self) {
        *self.generation.lock().unwrap() += 1;
        self.cond.notify_all();
    }

    /// Wait until the generation moves past `seen` or the timeout elapses;
    /// returns the current generation either way.
    fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock().unwrap();
        while *generation == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(generation, deadline - now)
                .unwrap();
            generation = guard;
            if result.timed_out() {
                break;
            }
        }
        *generation
    }
}

/// Mutable state of one stream. All offsets are absolute float indices from
/// the start of the stream; `buffer_start` tracks the index of the first
/// retained float so overlap survives the advance.
struct StreamState {
    /// SRI in effect at the read position
    sri: Sri,
    /// SRI updates that take effect at a later absolute offset
    pending_sri: VecDeque<(u64, Sri)>,
    /// SRI as last seen by the reader, for change detection
    delivered_sri: Option<Sri>,
    data: VecDeque<f32>,
    buffer_start: u64,
    write_pos: u64,
    read_pos: u64,
    /// Measured (offset, time) markers not yet consumed by the reader
    markers: VecDeque<(u64, f64)>,
    /// Latest marker at or before the read position
    anchor: Option<(u64, f64)>,
    max_depth: usize,
    eos: bool,
    eos_reached: bool,
    flush_pending: bool,
}

impl StreamState {
    /// Move the read position forward, consuming markers and dropping
    /// buffered floats behind it.
    fn advance_to(&mut self, pos: u64) {
        while let Some(&(offset, time)) = self.markers.front() {
            if offset <= pos {
                self.anchor = Some((offset, time));
                self.markers.pop_front();
            } else {
                break;
            }
        }
        while self.buffer_start < pos {
            self.data.pop_front();
            self.buffer_start += 1;
        }
        self.read_pos = pos;
    }

    /// Apply SRI updates that are effective at or before the read position
    fn apply_pending_sri(&mut self) {
        while let Some((offset, _)) = self.pending_sri.front() {
            if *offset <= self.read_pos {
                let (_, sri) = self.pending_sri.pop_front().unwrap();
                self.sri = sri;
            } else {
                break;
            }
        }
    }

    /// Drop everything queued and raise the flushed flag
    fn flush(&mut self, stream_id: &str) {
        let dropped = self.write_pos - self.read_pos;
        if dropped > 0 {
            warn!(stream = %stream_id, dropped, "input queue flushed");
        }
        self.data.clear();
        self.read_pos = self.write_pos;
        self.buffer_start = self.write_pos;
        self.markers.clear();
        self.anchor = None;
        self.flush_pending = true;
        // SRI updates queued behind dropped data still apply
        self.apply_pending_sri();
    }
}

struct StreamShared {
    stream_id: String,
    state: Mutex<StreamState>,
    notify: Arc<Notifier>,
}

impl StreamShared {
    /// Stream is fully consumed: writer closed and the reader has observed
    /// the end (or nothing is left to read).
    fn finished(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.eos && (state.eos_reached || state.write_pos == state.read_pos)
    }
}

struct InPortShared {
    name: String,
    streams: Mutex<Vec<Arc<StreamShared>>>,
    notify: Arc<Notifier>,
    last_polled: Mutex<u64>,
}

/// Input port carrying any number of named float streams.
#[derive(Clone)]
pub struct InFloatPort {
    shared: Arc<InPortShared>,
}

impl InFloatPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(InPortShared {
                name: name.into(),
                streams: Mutex::new(Vec::new()),
                notify: Arc::new(Notifier::new()),
                last_polled: Mutex::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Open a new named stream for writing; the stream id comes from the SRI
    pub fn create_stream(&self, sri: Sri) -> StreamWriter {
        self.create_stream_with_depth(sri, DEFAULT_QUEUE_DEPTH)
    }

    /// Open a stream with an explicit queue bound (floats). Exceeding the
    /// bound flushes queued samples and flags the next block.
    pub fn create_stream_with_depth(&self, sri: Sri, max_depth: usize) -> StreamWriter {
        let shared = Arc::new(StreamShared {
            stream_id: sri.stream_id.clone(),
            state: Mutex::new(StreamState {
                sri,
                pending_sri: VecDeque::new(),
                delivered_sri: None,
                data: VecDeque::new(),
                buffer_start: 0,
                write_pos: 0,
                read_pos: 0,
                markers: VecDeque::new(),
                anchor: None,
                max_depth: max_depth.max(1),
                eos: false,
                eos_reached: false,
                flush_pending: false,
            }),
            notify: self.shared.notify.clone(),
        });
        self.shared.streams.lock().unwrap().push(shared.clone());
        self.shared.notify.bump();
        debug!(port = %self.shared.name, stream = %shared.stream_id, "stream created");
        StreamWriter { shared }
    }

    /// Return handles for all live streams, waiting up to `timeout` for
    /// activity since the previous poll. Fully consumed streams are pruned.
    pub fn poll_streams(&self, timeout: Duration) -> Vec<InFloatStream> {
        let seen = *self.shared.last_polled.lock().unwrap();
        let current = self.shared.notify.wait_past(seen, timeout);
        *self.shared.last_polled.lock().unwrap() = current;

        let mut streams = self.shared.streams.lock().unwrap();
        streams.retain(|s| !s.finished());
        streams
            .iter()
            .map(|s| InFloatStream { shared: s.clone() })
            .collect()
    }
}

/// Producer half of one input stream.
pub struct StreamWriter {
    shared: Arc<StreamShared>,
}

impl StreamWriter {
    pub fn stream_id(&self) -> &str {
        &self.shared.stream_id
    }

    /// Queue a batch of floats with a measured timestamp for its first sample
    pub fn write(&self, data: &[f32], time: f64) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.eos {
                debug!(stream = %self.shared.stream_id, "write after close ignored");
                return;
            }
            let queued = (state.write_pos - state.read_pos) as usize;
            if queued > 0 && queued + data.len() > state.max_depth {
                let stream_id = self.shared.stream_id.clone();
                state.flush(&stream_id);
            }
            let write_pos = state.write_pos;
            state.markers.push_back((write_pos, time));
            state.data.extend(data.iter().copied());
            state.write_pos += data.len() as u64;
        }
        self.shared.notify.bump();
    }

    /// Update the SRI for samples written from this point on
    pub fn sri(&self, sri: Sri) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let offset = state.write_pos;
            state.pending_sri.push_back((offset, sri));
        }
        self.shared.notify.bump();
    }

    /// Drop queued samples and flag the next block as flushed, as a consumer
    /// falling behind would cause
    pub fn flush(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let stream_id = self.shared.stream_id.clone();
            state.flush(&stream_id);
        }
        self.shared.notify.bump();
    }

    /// Close the stream (end-of-stream for the reader)
    pub fn close(self) {}
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().eos = true;
        self.shared.notify.bump();
    }
}

/// Consumer half of one input stream.
pub struct InFloatStream {
    shared: Arc<StreamShared>,
}

impl InFloatStream {
    pub fn stream_id(&self) -> &str {
        &self.shared.stream_id
    }

    /// True when a read could make progress or end-of-stream is pending
    pub fn ready(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.write_pos > state.read_pos || state.eos
    }

    /// True once the stream has ended and no further block can be produced
    pub fn eos(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.eos && (state.eos_reached || state.write_pos == state.read_pos)
    }

    /// Read one window of exactly `n` samples, advancing by `stride` samples
    /// (`stride <= n`; the overlap stays buffered). Sample counts are scalar
    /// or complex per the stream mode. Returns `None` without blocking when
    /// a full window is not available.
    pub fn read(&self, n: usize, stride: usize) -> Option<SampleBlock> {
        if n == 0 {
            return None;
        }
        debug_assert!(stride >= 1 && stride <= n);

        let mut state = self.shared.state.lock().unwrap();
        loop {
            state.apply_pending_sri();
            let per_sample = state.sri.mode.floats_per_sample();
            let window = (n * per_sample) as u64;
            let hop = (stride.max(1) * per_sample) as u64;

            // A window never spans an SRI boundary: samples short of the
            // boundary cannot fill a window under the old SRI, so skip them.
            if let Some(&(boundary, _)) = state.pending_sri.front() {
                if boundary > state.read_pos && boundary < state.read_pos + window {
                    debug!(
                        stream = %self.shared.stream_id,
                        dropped = boundary - state.read_pos,
                        "skipping to sri boundary"
                    );
                    state.advance_to(boundary);
                    continue;
                }
            }

            let available = state.write_pos - state.read_pos;
            if available < window {
                if state.eos {
                    state.eos_reached = true;
                }
                return None;
            }

            // Normalize the anchor so a marker exactly at the window start
            // is reported as measured.
            let read_pos = state.read_pos;
            state.advance_to(read_pos);

            let mut timestamps = Vec::new();
            match state.anchor {
                Some((offset, time)) if offset == state.read_pos => {
                    timestamps.push(Timestamp::new(0, time, false));
                }
                Some((offset, time)) => {
                    let elapsed =
                        ((state.read_pos - offset) / per_sample as u64) as f64 * state.sri.xdelta;
                    timestamps.push(Timestamp::new(0, time + elapsed, true));
                }
                None => {
                    // No measurement yet on this stream; mark time zero
                    timestamps.push(Timestamp::new(0, 0.0, true));
                }
            }
            for &(offset, time) in &state.markers {
                if offset >= state.read_pos + window {
                    break;
                }
                let sample_offset = ((offset - state.read_pos) / per_sample as u64) as usize;
                timestamps.push(Timestamp::new(sample_offset, time, false));
            }

            let start = (state.read_pos - state.buffer_start) as usize;
            let data: Vec<f32> = state
                .data
                .iter()
                .skip(start)
                .take(window as usize)
                .copied()
                .collect();

            let block_sri = state.sri.clone();
            let (sri_changed, flags) = match &state.delivered_sri {
                None => (true, changes::ALL),
                Some(prev) if *prev != block_sri => (true, block_sri.changes_from(prev)),
                Some(_) => (false, 0),
            };
            state.delivered_sri = Some(block_sri.clone());

            let mut block = SampleBlock::new(data, block_sri, timestamps);
            if sri_changed {
                block = block.with_sri_changed(flags);
            }
            if state.flush_pending {
                state.flush_pending = false;
                block = block.with_queue_flushed();
            }

            let next = state.read_pos + hop;
            state.advance_to(next);
            return Some(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sri::{Keyword, Mode};

    fn time_sri(id: &str) -> Sri {
        Sri::new(id, 1.0 / 1000.0)
    }

    fn single_stream(port: &InFloatPort) -> InFloatStream {
        let mut streams = port.poll_streams(Duration::from_millis(10));
        assert_eq!(streams.len(), 1);
        streams.remove(0)
    }

    #[test]
    fn test_framed_read_with_overlap() {
        let port = InFloatPort::new("in");
        let writer = port.create_stream(time_sri("s1"));
        let stream = single_stream(&port);

        let samples: Vec<f32> = (0..12).map(|i| i as f32).collect();
        writer.write(&samples, 0.0);

        // window 8, stride 4: first two windows available
        let b1 = stream.read(8, 4).unwrap();
        assert_eq!(b1.data(), &[0., 1., 2., 3., 4., 5., 6., 7.]);
        let b2 = stream.read(8, 4).unwrap();
        assert_eq!(b2.data(), &[4., 5., 6., 7., 8., 9., 10., 11.]);
        assert!(stream.read(8, 4).is_none());
    }

    #[test]
    fn test_first_timestamp_interpolates() {
        let port = InFloatPort::new("in");
        let writer = port.create_stream(time_sri("s1"));
        let stream = single_stream(&port);

        writer.write(&[0.0; 16], 1.0);

        let b1 = stream.read(8, 8).unwrap();
        assert_eq!(b1.timestamps()[0], Timestamp::new(0, 1.0, false));

        let b2 = stream.read(8, 8).unwrap();
        let ts = b2.timestamps()[0];
        assert!(ts.synthetic);
        assert!((ts.time - (1.0 + 8.0 / 1000.0)).abs() < 1e-9);
    }

    #[test]
    fn test_measured_markers_inside_window() {
        let port = InFloatPort::new("in");
        let writer = port.create_stream(time_sri("s1"));
        let stream = single_stream(&port);

        writer.write(&[0.0; 4], 0.0);
        writer.write(&[0.0; 4], 0.004);

        let block = stream.read(8, 8).unwrap();
        assert_eq!(block.timestamps().len(), 2);
        assert_eq!(block.timestamps()[1], Timestamp::new(4, 0.004, false));
    }

    #[test]
    fn test_sri_change_is_flagged_once() {
        let port = InFloatPort::new("in");
        let writer = port.create_stream(time_sri("s1"));
        let stream = single_stream(&port);

        writer.write(&[0.0; 8], 0.0);
        let b1 = stream.read(8, 8).unwrap();
        assert!(b1.sri_changed()); // first block on the stream

        writer.write(&[0.0; 8], 0.008);
        let b2 = stream.read(8, 8).unwrap();
        assert!(!b2.sri_changed());

        writer.sri(
            time_sri("s1").with_keyword("CHAN_RF", Keyword::Long(100_000)),
        );
        writer.write(&[0.0; 8], 0.016);
        let b3 = stream.read(8, 8).unwrap();
        assert!(b3.sri_changed());
        assert_eq!(b3.sri_change_flags(), changes::KEYWORDS);
    }

    #[test]
    fn test_mode_switch_respects_boundary() {
        let port = InFloatPort::new("in");
        let writer = port.create_stream(time_sri("s1"));
        let stream = single_stream(&port);

        writer.write(&[1.0; 8], 0.0);
        writer.sri(time_sri("s1").with_mode(Mode::Complex));
        writer.write(&[2.0; 16], 0.008); // 8 complex samples

        let b1 = stream.read(8, 8).unwrap();
        assert!(!b1.complex());
        assert_eq!(b1.len(), 8);

        let b2 = stream.read(8, 8).unwrap();
        assert!(b2.complex());
        assert_eq!(b2.len(), 16);
        assert!(b2.sri_changed());
        assert_ne!(b2.sri_change_flags() & changes::MODE, 0);
    }

    #[test]
    fn test_eos_after_partial_tail() {
        let port = InFloatPort::new("in");
        let writer = port.create_stream(time_sri("s1"));
        let stream = single_stream(&port);

        writer.write(&[0.0; 10], 0.0);
        writer.close();

        assert!(stream.read(8, 8).is_some());
        assert!(!stream.eos()); // tail not yet observed
        assert!(stream.read(8, 8).is_none());
        assert!(stream.eos());
    }

    #[test]
    fn test_overflow_flushes_and_flags() {
        let port = InFloatPort::new("in");
        let writer = port.create_stream_with_depth(time_sri("s1"), 8);
        let stream = single_stream(&port);

        writer.write(&[1.0; 8], 0.0);
        writer.write(&[2.0; 8], 0.008); // overflows, queued samples dropped

        let block = stream.read(8, 8).unwrap();
        assert!(block.input_queue_flushed());
        assert_eq!(block.data(), &[2.0; 8]);
    }

    #[test]
    fn test_poll_prunes_finished_streams() {
        let port = InFloatPort::new("in");
        let writer = port.create_stream(time_sri("s1"));
        {
            let streams = port.poll_streams(Duration::from_millis(10));
            assert_eq!(streams.len(), 1);

            writer.write(&[0.0; 4], 0.0);
            writer.close();
            assert!(streams[0].read(8, 8).is_none());
            assert!(streams[0].eos());
        }
        assert!(port.poll_streams(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn test_poll_times_out_without_activity() {
        let port = InFloatPort::new("in");
        let start = Instant::now();
        let streams = port.poll_streams(Duration::from_millis(50));
        assert!(streams.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
