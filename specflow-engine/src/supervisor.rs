//! Multi-stream supervisor: spawns one worker per live input stream, reaps
//! finished workers, and fans control changes out to all of them.

use crate::error::{ConfigError, StopError};
use crate::params::ProcessorParams;
use crate::worker::StreamWorker;
use specflow_stream::{InFloatPort, OutFloatPort, PortState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded wait for the input-port poll each service tick
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Component-level property values applied to newly created workers and
/// fanned out to running ones on change.
#[derive(Debug, Clone)]
pub struct Settings {
    pub fft_size: usize,
    pub overlap: usize,
    pub num_avg: usize,
    pub log_coefficient: f32,
    pub rf_freq_units: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            overlap: 0,
            num_avg: 1,
            log_coefficient: 0.0,
            rf_freq_units: false,
        }
    }
}

/// State reachable from control callbacks.
///
/// Lock order: the worker map lock is the outer lock; a worker's parameter
/// lock (taken inside its setters) is the inner one. Never the reverse, and
/// neither is held across blocking I/O.
struct SupervisorShared {
    workers: Mutex<HashMap<String, StreamWorker>>,
    settings: Mutex<Settings>,
    do_psd: AtomicBool,
    do_fft: AtomicBool,
    fft_port: OutFloatPort,
    psd_port: OutFloatPort,
}

impl SupervisorShared {
    /// Recompute output demand from port states and fan it out when changed
    fn refresh_actions(&self) {
        let do_psd = self.psd_port.state() != PortState::Idle;
        let do_fft = self.fft_port.state() != PortState::Idle;
        let psd_changed = self.do_psd.swap(do_psd, Ordering::AcqRel) != do_psd;
        let fft_changed = self.do_fft.swap(do_fft, Ordering::AcqRel) != do_fft;
        if !(psd_changed || fft_changed) {
            return;
        }
        debug!(do_psd, do_fft, "output demand changed");
        let workers = self.workers.lock().unwrap();
        for worker in workers.values() {
            worker.update_actions(do_psd, do_fft);
        }
    }
}

/// The component: owns the worker map and the service thread that binds
/// input streams to workers.
pub struct Supervisor {
    shared: Arc<SupervisorShared>,
    in_port: InFloatPort,
    stop_flag: Arc<AtomicBool>,
    service: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Wire a supervisor to its three ports. Connection listeners are
    /// registered here; they hold only weak references back to the
    /// supervisor state.
    pub fn new(
        in_port: InFloatPort,
        fft_port: OutFloatPort,
        psd_port: OutFloatPort,
        settings: Settings,
    ) -> Self {
        let shared = Arc::new(SupervisorShared {
            workers: Mutex::new(HashMap::new()),
            settings: Mutex::new(settings),
            do_psd: AtomicBool::new(psd_port.state() != PortState::Idle),
            do_fft: AtomicBool::new(fft_port.state() != PortState::Idle),
            fft_port: fft_port.clone(),
            psd_port: psd_port.clone(),
        });

        for port in [&fft_port, &psd_port] {
            let weak: Weak<SupervisorShared> = Arc::downgrade(&shared);
            port.set_connection_listener(move |_connection_id| {
                if let Some(shared) = weak.upgrade() {
                    shared.refresh_actions();
                }
            });
        }

        Self {
            shared,
            in_port,
            stop_flag: Arc::new(AtomicBool::new(false)),
            service: None,
        }
    }

    /// Start the service thread. Idempotent.
    pub fn start(&mut self) {
        if self.service.is_some() {
            return;
        }
        self.stop_flag.store(false, Ordering::Release);
        let shared = self.shared.clone();
        let in_port = self.in_port.clone();
        let stop_flag = self.stop_flag.clone();
        self.service = Some(thread::spawn(move || {
            debug!("supervisor service started");
            while !stop_flag.load(Ordering::Acquire) {
                Self::service_tick(&shared, &in_port);
            }
            debug!("supervisor service stopped");
        }));
    }

    fn service_tick(shared: &Arc<SupervisorShared>, in_port: &InFloatPort) {
        // reap workers that hit end-of-stream
        {
            let mut workers = shared.workers.lock().unwrap();
            workers.retain(|stream_id, worker| {
                if worker.finished() {
                    info!(stream = %stream_id, "reaping finished worker");
                    false
                } else {
                    true
                }
            });
        }

        let streams = in_port.poll_streams(POLL_TIMEOUT);
        if streams.is_empty() {
            return;
        }

        let mut workers = shared.workers.lock().unwrap();
        for stream in streams {
            if workers.contains_key(stream.stream_id()) {
                continue;
            }
            info!(stream = %stream.stream_id(), "adding worker for new stream");
            let stream_id = stream.stream_id().to_string();
            let out_fft = shared.fft_port.create_stream(stream_id.as_str());
            let out_psd = shared.psd_port.create_stream(stream_id.as_str());
            let settings = shared.settings.lock().unwrap().clone();
            let initial = ProcessorParams::initial(
                settings.fft_size,
                settings.overlap,
                settings.num_avg,
                settings.log_coefficient,
                settings.rf_freq_units,
                shared.do_psd.load(Ordering::Acquire),
                shared.do_fft.load(Ordering::Acquire),
            );
            let worker = StreamWorker::spawn(stream, out_fft, out_psd, initial);
            workers.insert(stream_id, worker);
        }
    }

    /// Stream ids with a live worker
    pub fn active_streams(&self) -> Vec<String> {
        self.shared.workers.lock().unwrap().keys().cloned().collect()
    }

    /// Current property values
    pub fn settings(&self) -> Settings {
        self.shared.settings.lock().unwrap().clone()
    }

    pub fn set_fft_size(&self, fft_size: usize) -> Result<(), ConfigError> {
        {
            let mut settings = self.shared.settings.lock().unwrap();
            if fft_size == 0 {
                return Err(ConfigError::ZeroFftSize);
            }
            if settings.overlap >= fft_size {
                return Err(ConfigError::OverlapTooLarge {
                    overlap: settings.overlap,
                    fft_size,
                });
            }
            if settings.fft_size == fft_size {
                return Ok(());
            }
            settings.fft_size = fft_size;
        }
        let workers = self.shared.workers.lock().unwrap();
        for worker in workers.values() {
            worker.update_fft_size(fft_size);
        }
        Ok(())
    }

    pub fn set_overlap(&self, overlap: usize) -> Result<(), ConfigError> {
        {
            let mut settings = self.shared.settings.lock().unwrap();
            if overlap >= settings.fft_size {
                return Err(ConfigError::OverlapTooLarge {
                    overlap,
                    fft_size: settings.fft_size,
                });
            }
            if settings.overlap == overlap {
                return Ok(());
            }
            settings.overlap = overlap;
        }
        let workers = self.shared.workers.lock().unwrap();
        for worker in workers.values() {
            worker.update_overlap(overlap);
        }
        Ok(())
    }

    pub fn set_num_avg(&self, num_avg: usize) -> Result<(), ConfigError> {
        {
            let mut settings = self.shared.settings.lock().unwrap();
            if num_avg == 0 {
                return Err(ConfigError::ZeroNumAvg);
            }
            if settings.num_avg == num_avg {
                return Ok(());
            }
            settings.num_avg = num_avg;
        }
        let workers = self.shared.workers.lock().unwrap();
        for worker in workers.values() {
            worker.update_num_avg(num_avg);
        }
        Ok(())
    }

    pub fn set_log_coefficient(&self, log_coefficient: f32) {
        {
            let mut settings = self.shared.settings.lock().unwrap();
            if settings.log_coefficient == log_coefficient {
                return;
            }
            settings.log_coefficient = log_coefficient;
        }
        let workers = self.shared.workers.lock().unwrap();
        for worker in workers.values() {
            worker.update_log_coefficient(log_coefficient);
        }
    }

    pub fn set_rf_freq_units(&self, rf_freq_units: bool) {
        {
            let mut settings = self.shared.settings.lock().unwrap();
            if settings.rf_freq_units == rf_freq_units {
                return;
            }
            settings.rf_freq_units = rf_freq_units;
        }
        let workers = self.shared.workers.lock().unwrap();
        for worker in workers.values() {
            worker.update_rf_freq_units(rf_freq_units);
        }
    }

    /// Stop the service thread and every worker. The first worker that
    /// refuses to join is reported; the rest are still stopped.
    pub fn stop(&mut self) -> Result<(), StopError> {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.service.take() {
            let _ = handle.join();
        }

        let mut workers = self.shared.workers.lock().unwrap();
        let mut first_error = None;
        for (stream_id, mut worker) in workers.drain() {
            if let Err(err) = worker.stop() {
                warn!(stream = %stream_id, %err, "worker did not stop");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specflow_stream::{Sri, StreamPacket};
    use std::time::Instant;

    fn small_settings() -> Settings {
        Settings {
            fft_size: 8,
            overlap: 0,
            num_avg: 1,
            log_coefficient: 0.0,
            rf_freq_units: false,
        }
    }

    fn wait_for<F: FnMut() -> bool>(mut cond: F, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_worker_spawned_per_stream_and_reaped() {
        let in_port = InFloatPort::new("in");
        let fft_port = OutFloatPort::new("fft_out");
        let psd_port = OutFloatPort::new("psd_out");
        let _psd_rx = psd_port.connect("c1");

        let mut supervisor = Supervisor::new(
            in_port.clone(),
            fft_port.clone(),
            psd_port.clone(),
            small_settings(),
        );
        supervisor.start();

        let writer_a = in_port.create_stream(Sri::new("alpha", 1.0 / 8_000.0));
        let writer_b = in_port.create_stream(Sri::new("beta", 1.0 / 8_000.0));
        wait_for(
            || supervisor.active_streams().len() == 2,
            "both workers to spawn",
        );

        writer_a.write(&[1.0; 8], 0.0);
        writer_a.close();
        wait_for(
            || supervisor.active_streams() == vec!["beta".to_string()],
            "alpha to be reaped",
        );

        writer_b.close();
        wait_for(|| supervisor.active_streams().is_empty(), "beta to be reaped");
        supervisor.stop().unwrap();
    }

    #[test]
    fn test_streams_processed_independently() {
        let in_port = InFloatPort::new("in");
        let fft_port = OutFloatPort::new("fft_out");
        let psd_port = OutFloatPort::new("psd_out");
        let psd_rx = psd_port.connect("c1");

        let mut supervisor = Supervisor::new(
            in_port.clone(),
            fft_port.clone(),
            psd_port.clone(),
            small_settings(),
        );
        supervisor.start();

        let writer_a = in_port.create_stream(Sri::new("alpha", 1.0 / 8_000.0));
        let writer_b = in_port.create_stream(Sri::new("beta", 1.0 / 8_000.0));
        writer_a.write(&[1.0; 16], 0.0);
        writer_b.write(&[1.0; 8], 0.0);
        writer_a.close();
        writer_b.close();

        let mut per_stream: HashMap<String, usize> = HashMap::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while per_stream.values().sum::<usize>() < 3 && Instant::now() < deadline {
            while let Ok(packet) = psd_rx.try_recv() {
                if let StreamPacket::Data { stream_id, data, .. } = packet {
                    assert_eq!(data.len(), 5);
                    *per_stream.entry(stream_id).or_default() += 1;
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(per_stream.get("alpha"), Some(&2));
        assert_eq!(per_stream.get("beta"), Some(&1));
        supervisor.stop().unwrap();
    }

    #[test]
    fn test_property_validation() {
        let supervisor = Supervisor::new(
            InFloatPort::new("in"),
            OutFloatPort::new("fft_out"),
            OutFloatPort::new("psd_out"),
            small_settings(),
        );

        assert_eq!(supervisor.set_fft_size(0), Err(ConfigError::ZeroFftSize));
        assert_eq!(supervisor.set_num_avg(0), Err(ConfigError::ZeroNumAvg));
        assert_eq!(
            supervisor.set_overlap(8),
            Err(ConfigError::OverlapTooLarge {
                overlap: 8,
                fft_size: 8
            })
        );
        // rejected values leave the previous settings in force
        assert_eq!(supervisor.settings().fft_size, 8);
        assert_eq!(supervisor.settings().num_avg, 1);
        assert_eq!(supervisor.settings().overlap, 0);

        supervisor.set_overlap(4).unwrap();
        assert_eq!(
            supervisor.set_fft_size(4),
            Err(ConfigError::OverlapTooLarge {
                overlap: 4,
                fft_size: 4
            })
        );
        supervisor.set_fft_size(16).unwrap();
        assert_eq!(supervisor.settings().fft_size, 16);
    }

    #[test]
    fn test_connection_state_drives_output_demand() {
        let in_port = InFloatPort::new("in");
        let fft_port = OutFloatPort::new("fft_out");
        let psd_port = OutFloatPort::new("psd_out");

        // no consumers yet: workers start with both outputs gated off
        let mut supervisor = Supervisor::new(
            in_port.clone(),
            fft_port.clone(),
            psd_port.clone(),
            small_settings(),
        );
        supervisor.start();

        let writer = in_port.create_stream(Sri::new("s1", 1.0 / 8_000.0));
        wait_for(
            || supervisor.active_streams().len() == 1,
            "worker to spawn",
        );

        writer.write(&[1.0; 8], 0.0);
        thread::sleep(Duration::from_millis(100));

        // a consumer appears: demand flips and fans out to the worker
        let psd_rx = psd_port.connect("late");
        thread::sleep(Duration::from_millis(100));
        writer.write(&[1.0; 8], 0.001);
        writer.close();
        wait_for(|| supervisor.active_streams().is_empty(), "worker to finish");

        let data: Vec<_> = psd_rx
            .try_iter()
            .filter(|p| matches!(p, StreamPacket::Data { .. }))
            .collect();
        // only the post-connect window was written out
        assert_eq!(data.len(), 1);
        supervisor.stop().unwrap();
    }

    #[test]
    fn test_setting_current_value_is_a_no_op() {
        let in_port = InFloatPort::new("in");
        let fft_port = OutFloatPort::new("fft_out");
        let psd_port = OutFloatPort::new("psd_out");
        let psd_rx = psd_port.connect("c1");

        let mut supervisor = Supervisor::new(
            in_port.clone(),
            fft_port.clone(),
            psd_port.clone(),
            small_settings(),
        );
        supervisor.start();

        let writer = in_port.create_stream(Sri::new("s1", 1.0 / 8_000.0));
        writer.write(&[1.0; 8], 0.0);

        let sri_count = |packets: &[StreamPacket]| {
            packets
                .iter()
                .filter(|p| matches!(p, StreamPacket::Sri { .. }))
                .count()
        };
        let mut seen = Vec::new();
        wait_for(
            || {
                seen.extend(psd_rx.try_iter());
                sri_count(&seen) >= 1
            },
            "initial sri push",
        );

        // re-applying current values must not reach the workers at all
        supervisor.set_fft_size(8).unwrap();
        supervisor.set_num_avg(1).unwrap();
        supervisor.set_overlap(0).unwrap();
        writer.write(&[1.0; 8], 0.001);
        writer.close();
        wait_for(|| supervisor.active_streams().is_empty(), "worker to finish");

        seen.extend(psd_rx.try_iter());
        assert_eq!(sri_count(&seen), 1);
        supervisor.stop().unwrap();
    }

    #[test]
    fn test_stop_with_idle_worker() {
        let in_port = InFloatPort::new("in");
        let mut supervisor = Supervisor::new(
            in_port.clone(),
            OutFloatPort::new("fft_out"),
            OutFloatPort::new("psd_out"),
            small_settings(),
        );
        supervisor.start();

        let _writer = in_port.create_stream(Sri::new("s1", 1.0 / 8_000.0));
        wait_for(|| supervisor.active_streams().len() == 1, "worker to spawn");
        // the stream never ends; stop must still join the worker
        supervisor.stop().unwrap();
        assert!(supervisor.active_streams().is_empty());
    }
}
