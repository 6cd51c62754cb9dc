//! Targeted quantile estimation over an unbounded stream (Cormode, Korn,
//! Muthukrishnan, Srivastava: "Effective Computation of Biased Quantiles
//! over Data Streams").
//!
//! Every objective is a `(quantile, epsilon)` pair. A query for `quantile`
//! returns a value whose rank is within `epsilon * n` of the true rank.

/// Values are buffered and merged into the compressed sample list in batches.
const BUFFER_CAP: usize = 500;

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    width: f64,
    delta: f64,
}

#[derive(Debug, Clone)]
pub struct QuantileStream {
    objectives: Vec<(f64, f64)>,
    buffer: Vec<f64>,
    samples: Vec<Sample>,
    n: f64,
}

impl QuantileStream {
    pub fn new(objectives: &[(f64, f64)]) -> Self {
        Self {
            objectives: objectives.to_vec(),
            buffer: Vec::with_capacity(BUFFER_CAP),
            samples: Vec::new(),
            n: 0.0,
        }
    }

    pub fn insert(&mut self, value: f64) {
        self.buffer.push(value);
        if self.buffer.len() == BUFFER_CAP {
            self.flush();
        }
    }

    /// Returns the estimate for `q`, or `NaN` when nothing was observed.
    pub fn query(&mut self, q: f64) -> f64 {
        if self.samples.is_empty() {
            // Nothing merged yet: the buffer is small enough to answer exactly.
            if self.buffer.is_empty() {
                return f64::NAN;
            }
            self.buffer.sort_by(f64::total_cmp);
            let mut i = (self.buffer.len() as f64 * q).ceil() as usize;
            i = i.saturating_sub(1).min(self.buffer.len() - 1);
            return self.buffer[i];
        }

        self.flush();
        self.query_samples(q)
    }

    fn flush(&mut self) {
        let mut batch = std::mem::take(&mut self.buffer);
        batch.sort_by(f64::total_cmp);
        self.merge(&batch);
        batch.clear();
        self.buffer = batch;
    }

    /// Maximum allowed rank error at rank `r`, the tightest over all objectives.
    fn invariant(&self, r: f64) -> f64 {
        let mut min = f64::MAX;
        for &(quantile, epsilon) in &self.objectives {
            let f = if quantile * self.n <= r {
                2.0 * epsilon * r / quantile
            } else {
                2.0 * epsilon * (self.n - r) / (1.0 - quantile)
            };
            if f < min {
                min = f;
            }
        }
        min
    }

    fn merge(&mut self, batch: &[f64]) {
        let mut r = 0.0;
        let mut i = 0;
        for &value in batch {
            let mut inserted = false;
            while i < self.samples.len() {
                let current = self.samples[i];
                if current.value > value {
                    let delta = (self.invariant(r).floor() - 1.0).max(0.0);
                    self.samples.insert(i, Sample { value, width: 1.0, delta });
                    i += 1;
                    inserted = true;
                    break;
                }
                r += current.width;
                i += 1;
            }
            if !inserted {
                self.samples.push(Sample { value, width: 1.0, delta: 0.0 });
                i += 1;
            }
            self.n += 1.0;
            r += 1.0;
        }
        self.compress();
    }

    fn compress(&mut self) {
        if self.samples.len() < 2 {
            return;
        }
        let mut xi = self.samples.len() - 1;
        let mut x = self.samples[xi];
        let mut r = self.n - 1.0 - x.width;

        for i in (0..self.samples.len() - 1).rev() {
            let c = self.samples[i];
            if c.width + x.width + x.delta <= self.invariant(r) {
                x.width += c.width;
                self.samples[xi] = x;
                self.samples.remove(i);
                xi -= 1;
            } else {
                x = c;
                xi = i;
            }
            r -= c.width;
        }
    }

    fn query_samples(&self, q: f64) -> f64 {
        let mut t = (q * self.n).ceil();
        t += (self.invariant(t) / 2.0).ceil();

        let mut prev = self.samples[0];
        let mut r = 0.0;
        for current in &self.samples[1..] {
            r += prev.width;
            if r + current.width + current.delta > t {
                return prev.value;
            }
            prev = *current;
        }
        prev.value
    }

    #[cfg(test)]
    fn retained(&self) -> usize {
        self.samples.len() + self.buffer.len()
    }
}
