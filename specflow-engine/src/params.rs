//! Live processing parameters shared between control callbacks and a worker.
//!
//! Control-side setters mutate the record under a mutex and raise change
//! flags; the worker drains the record once per loop iteration through
//! `snapshot`. The `update_sri` request is sticky: it survives snapshots
//! until the worker has actually pushed SRI. The size/averaging change flags
//! are edge-triggered because the worker always acts on them in the same
//! iteration it observes them.

use std::sync::Mutex;

/// The tunable state of one stream worker.
#[derive(Debug, Clone, Default)]
pub struct ProcessorParams {
    pub fft_size: usize,
    pub overlap: usize,
    /// Samples advanced between windows; always `fft_size - overlap`
    pub stride: usize,
    pub num_average: usize,
    pub log_coeff: f32,
    pub do_fft: bool,
    pub do_psd: bool,
    pub rf_freq_units: bool,
    pub update_sri: bool,
    pub fft_size_changed: bool,
    pub num_average_changed: bool,
}

impl ProcessorParams {
    /// Initial parameters for a freshly spawned worker; all change flags are
    /// raised so the first loop builds its structures and pushes SRI.
    pub fn initial(
        fft_size: usize,
        overlap: usize,
        num_average: usize,
        log_coeff: f32,
        rf_freq_units: bool,
        do_psd: bool,
        do_fft: bool,
    ) -> Self {
        Self {
            fft_size,
            overlap,
            stride: stride_for(fft_size, overlap),
            num_average,
            log_coeff,
            do_fft,
            do_psd,
            rf_freq_units,
            update_sri: true,
            fft_size_changed: true,
            num_average_changed: true,
        }
    }
}

fn stride_for(fft_size: usize, overlap: usize) -> usize {
    fft_size.saturating_sub(overlap).max(1)
}

/// Mutex-protected parameter record with snapshot semantics.
pub struct ParamBox {
    inner: Mutex<ProcessorParams>,
}

impl ParamBox {
    pub fn new(params: ProcessorParams) -> Self {
        Self {
            inner: Mutex::new(params),
        }
    }

    pub fn set_fft_size(&self, fft_size: usize) {
        let mut params = self.inner.lock().unwrap();
        params.fft_size = fft_size;
        params.stride = stride_for(fft_size, params.overlap);
        params.fft_size_changed = true;
        params.update_sri = true;
    }

    pub fn set_overlap(&self, overlap: usize) {
        let mut params = self.inner.lock().unwrap();
        params.overlap = overlap;
        params.stride = stride_for(params.fft_size, overlap);
        params.update_sri = true;
    }

    pub fn set_num_average(&self, num_average: usize) {
        let mut params = self.inner.lock().unwrap();
        params.num_average = num_average;
        params.num_average_changed = true;
        params.update_sri = true;
    }

    pub fn set_log_coeff(&self, log_coeff: f32) {
        self.inner.lock().unwrap().log_coeff = log_coeff;
    }

    pub fn set_rf_freq_units(&self, enable: bool) {
        let mut params = self.inner.lock().unwrap();
        params.rf_freq_units = enable;
        params.update_sri = true;
    }

    pub fn set_actions(&self, do_psd: bool, do_fft: bool) {
        let mut params = self.inner.lock().unwrap();
        params.do_psd = do_psd;
        params.do_fft = do_fft;
    }

    pub fn force_sri_update(&self) {
        self.inner.lock().unwrap().update_sri = true;
    }

    /// Copy the live record into `cache` and clear the one-shot flags on the
    /// live record. A still-unaddressed `update_sri` in the cache is
    /// preserved; the other change flags need no preservation because the
    /// worker always addresses them in the observing iteration.
    pub fn snapshot(&self, cache: &mut ProcessorParams) {
        let mut live = self.inner.lock().unwrap();
        let pending_sri = cache.update_sri;
        *cache = live.clone();
        cache.update_sri = live.update_sri || pending_sri;

        live.fft_size_changed = false;
        live.num_average_changed = false;
        live.update_sri = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param_box() -> ParamBox {
        ParamBox::new(ProcessorParams::initial(16, 0, 1, 0.0, false, true, true))
    }

    #[test]
    fn test_initial_flags_raised() {
        let the_box = param_box();
        let mut cache = ProcessorParams::default();
        the_box.snapshot(&mut cache);
        assert!(cache.fft_size_changed);
        assert!(cache.num_average_changed);
        assert!(cache.update_sri);
        assert_eq!(cache.stride, 16);
    }

    #[test]
    fn test_change_flags_are_edge_triggered() {
        let the_box = param_box();
        let mut cache = ProcessorParams::default();
        the_box.snapshot(&mut cache);

        // addressed by the worker
        cache.fft_size_changed = false;
        cache.num_average_changed = false;
        cache.update_sri = false;

        the_box.snapshot(&mut cache);
        assert!(!cache.fft_size_changed);
        assert!(!cache.num_average_changed);
        assert!(!cache.update_sri);
    }

    #[test]
    fn test_update_sri_is_sticky_until_drained() {
        let the_box = param_box();
        let mut cache = ProcessorParams::default();
        the_box.snapshot(&mut cache);
        assert!(cache.update_sri);

        // worker did not get to push SRI (no data); flag must survive
        the_box.snapshot(&mut cache);
        assert!(cache.update_sri);
    }

    #[test]
    fn test_set_fft_size_updates_stride_and_flags() {
        let the_box = param_box();
        let mut cache = ProcessorParams::default();
        the_box.snapshot(&mut cache);
        cache.fft_size_changed = false;
        cache.update_sri = false;

        the_box.set_overlap(8);
        the_box.set_fft_size(32);
        the_box.snapshot(&mut cache);
        assert!(cache.fft_size_changed);
        assert!(cache.update_sri);
        assert_eq!(cache.stride, 24);
    }

    #[test]
    fn test_actions_raise_no_sri_update() {
        let the_box = param_box();
        let mut cache = ProcessorParams::default();
        the_box.snapshot(&mut cache);
        cache.update_sri = false;

        the_box.set_actions(false, true);
        the_box.set_log_coeff(10.0);
        the_box.snapshot(&mut cache);
        assert!(!cache.update_sri);
        assert!(!cache.do_psd);
        assert!(cache.do_fft);
        assert_eq!(cache.log_coeff, 10.0);
    }
}
