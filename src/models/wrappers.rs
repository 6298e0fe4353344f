//! Models built on top of other models.
use super::{DiffusionModel, DiffusionOutput};
use crate::error::Result;
use crate::utils::{Prng, PrngKey};
use tch::Tensor;

/// Rolls every image of the batch by its own `(dy, dx)` shift, with wrap
/// around.
pub fn xyroll(xs: &Tensor, shifts: &[(i64, i64)]) -> Tensor {
    let rolled: Vec<Tensor> = shifts
        .iter()
        .enumerate()
        .map(|(i, &(dy, dx))| xs.get(i as i64).roll([dy, dx], [1, 2]))
        .collect();
    Tensor::stack(&rolled, 0)
}

fn rolled_forward<M: DiffusionModel>(
    model: &M,
    x: &Tensor,
    cosine_t: &Tensor,
    shifts: Vec<(i64, i64)>,
    key: PrngKey,
) -> Result<DiffusionOutput> {
    let out = model.forward(&xyroll(x, &shifts), cosine_t, key)?;
    let unshift: Vec<(i64, i64)> = shifts.iter().map(|&(dy, dx)| (-dy, -dx)).collect();
    Ok(out.map(|xs| xyroll(xs, &unshift)))
}

/// Randomly shifts the images with wrap around before denoising so that
/// the samples tile seamlessly.
pub struct TilingModel<M> {
    pub inner: M,
}

impl<M: DiffusionModel> DiffusionModel for TilingModel<M> {
    fn forward(&self, x: &Tensor, cosine_t: &Tensor, key: PrngKey) -> Result<DiffusionOutput> {
        let mut rng = Prng::new(key);
        let n = x.size()[0] as usize;
        let draws = rng.split().randint(2 * n, -50, 50);
        let shifts = draws.chunks(2).map(|s| (s[0], s[1])).collect();
        rolled_forward(&self.inner, x, cosine_t, shifts, rng.split())
    }
}

/// Like [`TilingModel`] but only wraps horizontally, by up to the full width.
pub struct PanoramaModel<M> {
    pub inner: M,
}

impl<M: DiffusionModel> DiffusionModel for PanoramaModel<M> {
    fn forward(&self, x: &Tensor, cosine_t: &Tensor, key: PrngKey) -> Result<DiffusionOutput> {
        let mut rng = Prng::new(key);
        let (n, _c, _h, w) = x.size4()?;
        let shifts = rng.split().randint(n as usize, 0, w).into_iter().map(|dx| (0, dx)).collect();
        rolled_forward(&self.inner, x, cosine_t, shifts, rng.split())
    }
}

/// A weighted combination of models, the velocities are summed.
pub struct LerpModels {
    pub models: Vec<(Box<dyn DiffusionModel>, f64)>,
}

impl DiffusionModel for LerpModels {
    fn forward(&self, x: &Tensor, cosine_t: &Tensor, key: PrngKey) -> Result<DiffusionOutput> {
        let mut v = x.zeros_like();
        for ((model, weight), key) in self.models.iter().zip(key.split_n(self.models.len())) {
            v += model.forward(x, cosine_t, key)?.v * *weight;
        }
        Ok(DiffusionOutput::from_v(x, v, cosine_t))
    }
}
