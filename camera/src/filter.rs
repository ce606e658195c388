use tracing::warn;

/// Fixed-window mean over the most recent samples.
///
/// Keeps a circular buffer of the last `capacity` samples and a running sum,
/// so each update is O(1). Until the window fills, the mean is taken over the
/// samples seen so far. If the buffer could not be allocated the filter is
/// degraded and hands every sample straight back.
#[derive(Debug)]
pub struct RunningAverage {
    values: Option<Box<[u32]>>,
    index: usize,
    count: usize,
    sum: u64,
    last: u32,
}

impl RunningAverage {
    pub fn new(capacity: usize) -> Self {
        let values = allocate(capacity);
        if values.is_none() {
            warn!(capacity, "running average buffer unavailable, passing samples through");
        }
        Self {
            values,
            index: 0,
            count: 0,
            sum: 0,
            last: 0,
        }
    }

    /// A filter without a buffer; `run` is the identity.
    pub fn degraded() -> Self {
        Self {
            values: None,
            index: 0,
            count: 0,
            sum: 0,
            last: 0,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.values.is_none()
    }

    pub fn capacity(&self) -> usize {
        self.values.as_ref().map_or(0, |v| v.len())
    }

    /// Number of samples currently in the window (saturates at capacity).
    pub fn samples(&self) -> usize {
        self.count
    }

    /// Last value returned by [`run`](Self::run).
    pub fn average(&self) -> u32 {
        self.last
    }

    /// Feed one sample and return the truncated mean of the window.
    pub fn run(&mut self, sample: u32) -> u32 {
        let Some(values) = self.values.as_mut() else {
            self.last = sample;
            return sample;
        };

        self.sum -= u64::from(values[self.index]);
        values[self.index] = sample;
        self.sum += u64::from(sample);
        self.index = (self.index + 1) % values.len();
        if self.count < values.len() {
            self.count += 1;
        }

        self.last = (self.sum / self.count as u64) as u32;
        self.last
    }
}

fn allocate(capacity: usize) -> Option<Box<[u32]>> {
    if capacity == 0 {
        return None;
    }
    let mut values = Vec::new();
    values.try_reserve_exact(capacity).ok()?;
    values.resize(capacity, 0);
    Some(values.into_boxed_slice())
}
