// A simple wrapper around File::open adding details about the
// problematic file.
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;
use tch::{Device, Kind, Tensor};

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> std::io::Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}: {e}", path.as_ref().to_string_lossy());
        std::io::Error::new(e.kind(), context)
    })
}

pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    /// The device for a named component, e.g. "model", "clip" or "all".
    pub fn get(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}

/// An explicit random key.
///
/// Keys are never consumed implicitly: every random draw takes a key and the
/// same key always produces the same values. Independent draws must use
/// independent keys obtained with [`PrngKey::split`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrngKey(u64);

impl PrngKey {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn rng(self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }

    /// Derives two new independent keys.
    pub fn split(self) -> (PrngKey, PrngKey) {
        let mut rng = self.rng();
        (PrngKey(rng.gen()), PrngKey(rng.gen()))
    }

    /// Derives `n` new independent keys.
    pub fn split_n(self, n: usize) -> Vec<PrngKey> {
        let mut rng = self.rng();
        (0..n).map(|_| PrngKey(rng.gen())).collect()
    }

    /// `n` samples from the uniform distribution on `[0, 1)`.
    pub fn uniform(self, n: usize) -> Vec<f64> {
        let mut rng = self.rng();
        (0..n).map(|_| rng.gen::<f64>()).collect()
    }

    /// `n` samples from the uniform distribution on `[low, high)`, one range
    /// per sample.
    pub fn uniform_in(self, ranges: &[(f64, f64)]) -> Vec<f64> {
        self.uniform(ranges.len())
            .into_iter()
            .zip(ranges.iter())
            .map(|(u, &(low, high))| low + u * (high - low))
            .collect()
    }

    /// `n` integers uniformly drawn from `[low, high)`.
    pub fn randint(self, n: usize, low: i64, high: i64) -> Vec<i64> {
        let mut rng = self.rng();
        (0..n).map(|_| rng.gen_range(low..high.max(low + 1))).collect()
    }

    /// `n` boolean draws that are true with probability `p`.
    pub fn bernoulli(self, n: usize, p: f64) -> Vec<bool> {
        self.uniform(n).into_iter().map(|u| u < p).collect()
    }

    /// A standard normal tensor with the given shape.
    pub fn normal(self, shape: &[i64], device: Device) -> Tensor {
        let numel: i64 = shape.iter().product();
        let mut rng = self.rng();
        let values: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
        Tensor::from_slice(&values).view(shape).to_kind(Kind::Float).to_device(device)
    }
}

/// A stateful helper handing out a fresh sub-key on every call.
#[derive(Debug, Clone)]
pub struct Prng {
    key: PrngKey,
}

impl Prng {
    pub fn new(key: PrngKey) -> Self {
        Self { key }
    }

    pub fn split(&mut self) -> PrngKey {
        let (next, sub) = self.key.split();
        self.key = next;
        sub
    }
}

/// Per-sample root mean square over all but the first dimension, with the
/// shape `[n, 1, 1, 1]` for image batches.
pub(crate) fn rms_per_sample(xs: &Tensor) -> Tensor {
    let dims: Vec<i64> = (1..xs.dim() as i64).collect();
    xs.square().mean_dim(Some(dims.as_slice()), true, Kind::Float).sqrt()
}

/// Returns true when every element of the tensor is finite.
pub(crate) fn all_finite(xs: &Tensor) -> bool {
    xs.isfinite().all().int64_value(&[]) != 0
}
