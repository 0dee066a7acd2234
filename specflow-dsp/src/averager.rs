//! Rolling vector averager.

/// Running mean over the last K input vectors.
///
/// `run` accumulates its input and reports `true` on every K-th call since
/// the last reset, at which point the output vector holds the element-wise
/// mean of the K accumulated inputs. Between emissions the output is left
/// untouched. Changing K or feeding a vector of a different length resets
/// the accumulator.
pub struct VectorMean {
    avg_count: usize,
    sum: Vec<f32>,
    filled: usize,
}

impl VectorMean {
    pub fn new(avg_count: usize) -> Self {
        Self {
            avg_count: avg_count.max(1),
            sum: Vec::new(),
            filled: 0,
        }
    }

    /// Current averaging count K
    pub fn avg_count(&self) -> usize {
        self.avg_count
    }

    /// Reset the accumulator and counter
    pub fn clear(&mut self) {
        self.sum.fill(0.0);
        self.filled = 0;
    }

    /// Change K; implies a reset
    pub fn set_avg_num(&mut self, avg_count: usize) {
        self.avg_count = avg_count.max(1);
        self.clear();
    }

    /// Accumulate one vector. Returns `true` when `output` now holds the
    /// mean of the last K inputs.
    pub fn run(&mut self, input: &[f32], output: &mut Vec<f32>) -> bool {
        if self.sum.len() != input.len() {
            self.sum.clear();
            self.sum.resize(input.len(), 0.0);
            self.filled = 0;
        }
        for (acc, &x) in self.sum.iter_mut().zip(input) {
            *acc += x;
        }
        self.filled += 1;
        if self.filled < self.avg_count {
            return false;
        }

        let scale = 1.0 / self.avg_count as f32;
        output.clear();
        output.extend(self.sum.iter().map(|&s| s * scale));
        self.sum.fill(0.0);
        self.filled = 0;
        true
    }
}
