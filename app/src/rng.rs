use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

/// Shared source of randomness for the whole simulation.
///
/// Every component draws through a clone of the same handle, so running
/// with a fixed `--seed` replays the identical sequence of failures,
/// latencies and monkey decisions.
#[derive(Clone)]
pub struct SimRng {
    inner: Arc<Mutex<StdRng>>,
}

impl SimRng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Uniform draw from `[low, high)`.
    pub fn range_f64(&self, low: f64, high: f64) -> f64 {
        self.inner.lock().unwrap().gen_range(low..high)
    }

    /// Uniform draw from `[low, high]`, inclusive on both ends.
    pub fn range_u64(&self, low: u64, high: u64) -> u64 {
        self.inner.lock().unwrap().gen_range(low..=high)
    }

    /// True with probability `p`.
    pub fn roll(&self, p: f64) -> bool {
        self.inner.lock().unwrap().gen::<f64>() < p
    }

    pub fn index(&self, len: usize) -> usize {
        self.inner.lock().unwrap().gen_range(0..len)
    }

    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            None
        } else {
            Some(&items[self.index(items.len())])
        }
    }

    /// Up to `k` distinct indices into a collection of `len` items.
    pub fn sample_indices(&self, len: usize, k: usize) -> Vec<usize> {
        let take = k.min(len);
        let mut pool: Vec<usize> = (0..len).collect();
        let mut rng = self.inner.lock().unwrap();
        for i in 0..take {
            let j = rng.gen_range(i..len);
            pool.swap(i, j);
        }
        pool.truncate(take);
        pool
    }

    /// Eight hex chars, enough to tell instances apart in logs.
    pub fn short_id(&self) -> String {
        let n: u32 = self.inner.lock().unwrap().gen();
        format!("{n:08x}")
    }
}
