//! Per-stream worker: framed reads, transform dispatch, averaging, spectral
//! metadata, and emission.

use crate::error::StopError;
use crate::params::{ParamBox, ProcessorParams};
use specflow_dsp::{ComplexPsd, RealPsd, TransformError, VectorMean};
use specflow_stream::{InFloatStream, Mode, OutFloatStream, SampleBlock, Sri, Units};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Wait between iterations when no window is available
const IDLE_DELAY: Duration = Duration::from_millis(10);
/// Bounded wait for the worker thread to exit on stop
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of one service iteration
enum Service {
    Normal,
    Noop,
    Finish,
}

/// The active transform shape; rebuilt on mode or size transitions.
enum Transform {
    Real(RealPsd),
    Complex(ComplexPsd),
}

impl Transform {
    fn new(complex: bool, size: usize) -> Self {
        if complex {
            Transform::Complex(ComplexPsd::new(size))
        } else {
            Transform::Real(RealPsd::new(size))
        }
    }

    fn is_complex(&self) -> bool {
        matches!(self, Transform::Complex(_))
    }

    fn set_length(&mut self, size: usize) {
        match self {
            Transform::Real(t) => t.set_length(size),
            Transform::Complex(t) => t.set_length(size),
        }
    }

    fn run(&mut self, data: &[f32]) -> Result<(), TransformError> {
        match self {
            Transform::Real(t) => t.run(data),
            Transform::Complex(t) => t.run(data),
        }
    }

    fn fft_interleaved(&self, out: &mut Vec<f32>) {
        let bins = match self {
            Transform::Real(t) => t.spectrum(),
            Transform::Complex(t) => t.spectrum(),
        };
        out.clear();
        out.reserve(bins.len() * 2);
        for bin in bins {
            out.push(bin.re);
            out.push(bin.im);
        }
    }

    fn psd(&self) -> &[f32] {
        match self {
            Transform::Real(t) => t.psd(),
            Transform::Complex(t) => t.psd(),
        }
    }
}

struct WorkerShared {
    params: ParamBox,
    stop: AtomicBool,
    finished: AtomicBool,
}

/// Handle to one running stream worker.
///
/// The worker owns its input stream and both output streams; this handle
/// carries only the parameter box and lifecycle flags, so control callbacks
/// can reach the worker without touching its buffers.
pub struct StreamWorker {
    stream_id: String,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// Spawn a worker over `stream`, writing to `out_fft` and `out_psd`.
    pub fn spawn(
        stream: InFloatStream,
        out_fft: OutFloatStream,
        out_psd: OutFloatStream,
        initial: ProcessorParams,
    ) -> Self {
        let stream_id = stream.stream_id().to_string();
        let num_average = initial.num_average;
        let shared = Arc::new(WorkerShared {
            params: ParamBox::new(initial),
            stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });

        let task = WorkerTask {
            stream,
            out_fft,
            out_psd,
            shared: shared.clone(),
            cache: ProcessorParams::default(),
            transform: None,
            averager: VectorMean::new(num_average),
            psd_avg: Vec::new(),
            psd_out: Vec::new(),
            fft_out: Vec::new(),
        };
        let handle = thread::spawn(move || task.run());

        Self {
            stream_id,
            shared,
            handle: Some(handle),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// True once the worker's thread has exited (end-of-stream or fault)
    pub fn finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    pub fn update_fft_size(&self, fft_size: usize) {
        self.shared.params.set_fft_size(fft_size);
    }

    pub fn update_overlap(&self, overlap: usize) {
        self.shared.params.set_overlap(overlap);
    }

    pub fn update_num_avg(&self, num_average: usize) {
        self.shared.params.set_num_average(num_average);
    }

    pub fn update_log_coefficient(&self, log_coeff: f32) {
        self.shared.params.set_log_coeff(log_coeff);
    }

    pub fn update_rf_freq_units(&self, enable: bool) {
        self.shared.params.set_rf_freq_units(enable);
    }

    pub fn update_actions(&self, do_psd: bool, do_fft: bool) {
        self.shared.params.set_actions(do_psd, do_fft);
    }

    pub fn force_sri_update(&self) {
        self.shared.params.force_sri_update();
    }

    /// Ask the worker to exit and join its thread with a bounded wait.
    pub fn stop(&mut self) -> Result<(), StopError> {
        self.shared.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + STOP_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if !handle.is_finished() {
            self.handle = Some(handle);
            return Err(StopError {
                stream_id: self.stream_id.clone(),
            });
        }
        let _ = handle.join();
        Ok(())
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Thread-private state of one worker.
struct WorkerTask {
    stream: InFloatStream,
    out_fft: OutFloatStream,
    out_psd: OutFloatStream,
    shared: Arc<WorkerShared>,
    cache: ProcessorParams,
    transform: Option<Transform>,
    averager: VectorMean,
    psd_avg: Vec<f32>,
    psd_out: Vec<f32>,
    fft_out: Vec<f32>,
}

impl WorkerTask {
    fn run(mut self) {
        debug!(stream = %self.stream.stream_id(), "worker started");
        while !self.shared.stop.load(Ordering::Acquire) {
            match self.service() {
                Service::Normal => {}
                Service::Noop => thread::sleep(IDLE_DELAY),
                Service::Finish => break,
            }
        }
        self.out_fft.close();
        self.out_psd.close();
        self.shared.finished.store(true, Ordering::Release);
        debug!(stream = %self.stream.stream_id(), "worker finished");
    }

    fn service(&mut self) -> Service {
        self.shared.params.snapshot(&mut self.cache);

        // rebuild structures before touching data
        if self.cache.fft_size_changed {
            trace!(fft_size = self.cache.fft_size, "resizing transform");
            self.cache.fft_size_changed = false;
            if let Some(transform) = self.transform.as_mut() {
                transform.set_length(self.cache.fft_size);
            }
        }
        if self.cache.num_average_changed {
            trace!(num_average = self.cache.num_average, "resetting averager");
            self.cache.num_average_changed = false;
            self.averager.set_avg_num(self.cache.num_average);
        }

        if !self.stream.ready() {
            return Service::Noop;
        }

        let block = match self.stream.read(self.cache.fft_size, self.cache.stride) {
            Some(block) => block,
            None => {
                return if self.stream.eos() {
                    Service::Finish
                } else {
                    Service::Noop
                };
            }
        };

        if block.input_queue_flushed() {
            warn!(
                stream = %self.stream.stream_id(),
                "input queue flushed, dropping processing state"
            );
            self.transform = None;
        }

        // dispatch by the block's sample interpretation; a mode transition
        // rebuilds the transform and restarts the averaging cycle
        let mode_matches = self
            .transform
            .as_ref()
            .map(|t| t.is_complex() == block.complex())
            .unwrap_or(false);
        if !mode_matches {
            trace!(complex = block.complex(), "building transform");
            self.transform = Some(Transform::new(block.complex(), self.cache.fft_size));
            self.averager.clear();
        }
        let Some(transform) = self.transform.as_mut() else {
            return Service::Finish;
        };
        if let Err(err) = transform.run(block.data()) {
            error!(
                stream = %self.stream.stream_id(),
                %err,
                "transform failed, terminating worker"
            );
            return Service::Finish;
        }

        self.psd_out.clear();
        if self.cache.do_psd {
            if self.cache.num_average > 1 {
                if self.averager.run(transform.psd(), &mut self.psd_avg) {
                    self.psd_out.extend_from_slice(&self.psd_avg);
                }
            } else {
                self.psd_out.extend_from_slice(transform.psd());
            }
            if self.cache.log_coeff > 0.0 {
                for x in &mut self.psd_out {
                    *x = self.cache.log_coeff * x.log10();
                }
            }
        }

        self.fft_out.clear();
        if self.cache.do_fft {
            transform.fft_interleaved(&mut self.fft_out);
        }

        if self.cache.update_sri || block.sri_changed() {
            self.cache.update_sri = false;
            self.push_sri(&block);
        }

        let first_time = match block.timestamps().first() {
            Some(ts) => ts.time,
            None => {
                error!(
                    stream = %self.stream.stream_id(),
                    "block carried no timestamps, terminating worker"
                );
                return Service::Finish;
            }
        };
        if self.cache.do_psd && !self.psd_out.is_empty() {
            self.out_psd.write(&self.psd_out, first_time);
        }
        if self.cache.do_fft && !self.fft_out.is_empty() {
            self.out_fft.write(&self.fft_out, first_time);
        }

        if self.stream.eos() {
            debug!(stream = %self.stream.stream_id(), "end of stream");
            return Service::Finish;
        }
        Service::Normal
    }

    /// Derive the spectral SRI for the current parameters and push it to
    /// both output streams.
    fn push_sri(&self, block: &SampleBlock) {
        let n = self.cache.fft_size;
        let xdelta_in = block.sri().xdelta;
        let out_xdelta = 1.0 / (xdelta_in * n as f64);

        let if_start = if block.complex() {
            -(((n / 2).saturating_sub(1)) as f64 * out_xdelta)
        } else {
            0.0
        };

        let mut xstart = if_start;
        if self.cache.rf_freq_units {
            let rf_center = block
                .sri()
                .keyword_long("CHAN_RF")
                .or_else(|| block.sri().keyword_long("COL_RF"));
            match rf_center {
                Some(rf_center) => {
                    // real data is centered at fs/4
                    let if_center = if block.complex() {
                        0.0
                    } else {
                        1.0 / xdelta_in / 4.0
                    };
                    xstart = if_start + (rf_center as f64 - if_center);
                }
                None => {
                    warn!(
                        stream = %self.stream.stream_id(),
                        "rf frequency units requested but no rf keyword present"
                    );
                }
            }
        }

        let mut sri = Sri {
            stream_id: self.stream.stream_id().to_string(),
            xstart,
            xdelta: out_xdelta,
            xunits: Units::Frequency,
            subsize: if block.complex() { n } else { n / 2 + 1 },
            ydelta: xdelta_in * self.cache.stride as f64,
            yunits: Units::Time,
            mode: Mode::Complex,
            keywords: Vec::new(),
        };
        self.out_fft.sri(sri.clone());

        // averaged PSD advances slower along the time axis
        if self.cache.num_average > 2 {
            sri.ydelta *= self.cache.num_average as f64;
        }
        sri.mode = Mode::Real;
        self.out_psd.sri(sri);
    }
}
