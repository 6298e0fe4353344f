//! Loss terms, gradient helpers and the FFT blur used by the guidance.
use super::conditions::{LossKind, ParamMap};
use crate::error::{Error, Result};
use crate::models::aesthetic::AestheticScorer;
use crate::utils::rms_per_sample;
use std::rc::Rc;
use tch::{Kind, TchError, Tensor};

/// The per-sample RMS ceiling applied to the output of the main cond fn.
pub const MAX_GRAD_RMS: f64 = 0.2;

/// Normalizes the last dimension to unit length.
pub fn norm1(xs: &Tensor) -> Tensor {
    let norm = xs.square().sum_dim_intlist(Some([-1i64].as_slice()), true, Kind::Float).sqrt();
    xs / norm
}

/// Squared great circle distance between the normalized `xs` and `ys`,
/// reduced over the last dimension.
pub fn spherical_dist_loss(xs: &Tensor, ys: &Tensor) -> Tensor {
    let diff = norm1(xs) - norm1(ys);
    let chord = diff.square().sum_dim_intlist(Some([-1i64].as_slice()), false, Kind::Float).sqrt();
    (chord / 2.).asin().square() * 2.
}

/// L2 total variation, one value per sample.
pub fn tv_loss(xs: &Tensor) -> Result<Tensor> {
    let (_n, _c, h, w) = xs.size4()?;
    let x_diff = xs.narrow(-1, 1, w - 1) - xs.narrow(-1, 0, w - 1);
    let y_diff = xs.narrow(-2, 1, h - 1) - xs.narrow(-2, 0, h - 1);
    let dims = [1i64, 2, 3];
    Ok(x_diff.square().mean_dim(Some(dims.as_slice()), false, Kind::Float)
        + y_diff.square().mean_dim(Some(dims.as_slice()), false, Kind::Float))
}

/// Mean distance to the `[-1, 1]` range.
pub fn range_loss(xs: &Tensor) -> Tensor {
    (xs - xs.clamp(-1., 1.)).abs().mean(Kind::Float)
}

fn single_grad(mut grads: Vec<Tensor>) -> Result<Tensor> {
    grads.pop().ok_or_else(|| Error::Torch(TchError::Torch("no gradient returned".to_string())))
}

/// Gradient of the scalar `f(xs)` with respect to `xs`.
///
/// `f` is evaluated on a detached copy of `xs`, so the result never carries
/// any graph from previous computations.
pub fn grad<F>(xs: &Tensor, f: F) -> Result<Tensor>
where
    F: FnOnce(&Tensor) -> Result<Tensor>,
{
    tch::with_grad(|| {
        let xs = xs.detach().set_requires_grad(true);
        let loss = f(&xs)?;
        single_grad(Tensor::f_run_backward(&[loss], &[&xs], false, false)?)
    })
}

/// Vector-Jacobian product: pulls `cotangent` back from `output` to `input`.
pub fn vjp(output: &Tensor, input: &Tensor, cotangent: &Tensor) -> Result<Tensor> {
    tch::with_grad(|| {
        let loss = (output * cotangent).sum(Kind::Float);
        single_grad(Tensor::f_run_backward(&[loss], &[input], false, false)?)
    })
}

/// Rescales the samples whose RMS exceeds `max` so that it equals `max`,
/// other samples are returned unchanged.
pub fn clamp_grad(grad: &Tensor, max: f64) -> Tensor {
    let magnitude = rms_per_sample(grad);
    let peak = magnitude.max().double_value(&[]);
    if peak <= max {
        return grad.shallow_clone();
    }
    tracing::debug!(peak, max, "clamping gradient");
    let factor = (magnitude.reciprocal() * max).where_self(&magnitude.gt(max), &magnitude.ones_like());
    grad * factor
}

fn gaussian_kernel(n: i64, std: f64) -> Vec<f32> {
    let values: Vec<f64> = (0..n)
        .map(|i| {
            let offset = if i < (n + 1) / 2 { i } else { i - n } as f64;
            (-offset * offset / (2. * std * std)).exp()
        })
        .collect();
    let total: f64 = values.iter().sum();
    values.into_iter().map(|v| (v / total) as f32).collect()
}

/// Gaussian blur of the last two dimensions with wrap-around boundaries,
/// computed in the frequency domain. The kernel sums to one so constant
/// images are preserved.
pub fn blur_fft(image: &Tensor, std: f64) -> Tensor {
    let std = std.max(0.05);
    let size = image.size();
    let (h, w) = (size[size.len() - 2], size[size.len() - 1]);
    let device = image.device();
    let ky = Tensor::from_slice(&gaussian_kernel(h, std)).to_device(device);
    let kx = Tensor::from_slice(&gaussian_kernel(w, std)).to_device(device);
    let kernel = ky.unsqueeze(1) * kx.unsqueeze(0);
    let dims = [-2i64, -1];
    let kernel = kernel.fft_rfft2(None::<&[i64]>, dims.as_slice(), "backward");
    let spectrum = image.to_kind(Kind::Float).fft_rfft2(None::<&[i64]>, dims.as_slice(), "backward");
    (spectrum * kernel).fft_irfft2(Some([h, w].as_slice()), dims.as_slice(), "backward")
}

/// A loss on the perceptor embeddings of a batch of cutouts, the embeddings
/// have shape `[cutn, n, d]`.
pub enum ClipLoss {
    SphericalDist { text_embed: Tensor, scale: f64 },
    /// Leave-one-out contrastive loss between the cutout-averaged image
    /// embeddings and the prompts, in both directions.
    InfoLoob { text_embed: Tensor, scale: f64, inv_tau: f64, lm: f64 },
    Aesthetic { scorer: Rc<dyn AestheticScorer>, scale: f64 },
}

impl std::fmt::Debug for ClipLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SphericalDist { scale, .. } => write!(f, "SphericalDist({scale})"),
            Self::InfoLoob { scale, inv_tau, lm, .. } => {
                write!(f, "InfoLoob({scale}, inv_tau: {inv_tau}, lm: {lm})")
            }
            Self::Aesthetic { scale, .. } => write!(f, "Aesthetic({scale})"),
        }
    }
}

impl ClipLoss {
    pub fn spherical_dist(text_embed: Tensor, scale: f64) -> Self {
        Self::SphericalDist { text_embed, scale }
    }

    pub fn info_loob(text_embed: Tensor, scale: f64, inv_tau: f64, lm: f64) -> Result<Self> {
        let n = text_embed.size().first().copied().unwrap_or(0);
        if n < 2 {
            return Err(Error::invalid("info_loob", format!("needs at least 2 prompts, got {n}")));
        }
        Ok(Self::InfoLoob { text_embed, scale, inv_tau, lm })
    }

    pub fn aesthetic(scorer: Rc<dyn AestheticScorer>, scale: f64) -> Self {
        Self::Aesthetic { scorer, scale }
    }

    pub fn kind(&self) -> LossKind {
        match self {
            Self::SphericalDist { .. } => LossKind::SphericalDist,
            Self::InfoLoob { .. } => LossKind::InfoLoob,
            Self::Aesthetic { .. } => LossKind::Aesthetic,
        }
    }

    pub fn loss(&self, image_embeds: &Tensor) -> Result<Tensor> {
        let loss = match self {
            Self::SphericalDist { text_embed, scale } => {
                let losses = spherical_dist_loss(image_embeds, text_embed).mean_dim(
                    Some([0i64].as_slice()),
                    false,
                    Kind::Float,
                );
                (losses * *scale).sum(Kind::Float)
            }
            Self::InfoLoob { text_embed, scale, inv_tau, lm } => {
                let image_embeds =
                    norm1(&image_embeds.mean_dim(Some([0i64].as_slice()), false, Kind::Float));
                let sim = image_embeds.matmul(&norm1(text_embed).tr()) * *inv_tau;
                let n = sim.size2()?.0;
                let eye = Tensor::eye(n, (Kind::Float, sim.device())).to_kind(Kind::Bool);
                let loob = |sim: &Tensor| {
                    let diag = sim.diagonal(0, 0, 1).sum(Kind::Float);
                    let off_diag = sim
                        .masked_fill(&eye, f64::NEG_INFINITY)
                        .logsumexp([-1i64].as_slice(), false)
                        .sum(Kind::Float);
                    off_diag * *lm - diag
                };
                (loob(&sim) + loob(&sim.tr())) * *scale / *inv_tau
            }
            Self::Aesthetic { scorer, scale } => {
                let scores = scorer.score(&norm1(image_embeds))?;
                scores.mean_dim(Some([0i64].as_slice()), false, Kind::Float).sum(Kind::Float)
                    * -*scale
            }
        };
        Ok(loss)
    }

    pub fn map_params(&self, f: &mut dyn ParamMap) -> Self {
        match self {
            Self::SphericalDist { text_embed, scale } => {
                Self::SphericalDist { text_embed: f.tensor(text_embed), scale: f.scalar(*scale) }
            }
            Self::InfoLoob { text_embed, scale, inv_tau, lm } => Self::InfoLoob {
                text_embed: f.tensor(text_embed),
                scale: f.scalar(*scale),
                inv_tau: f.scalar(*inv_tau),
                lm: f.scalar(*lm),
            },
            Self::Aesthetic { scorer, scale } => {
                Self::Aesthetic { scorer: scorer.clone(), scale: f.scalar(*scale) }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::PrngKey;
    use tch::Device;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-5 * (1. + b.abs())
    }

    #[test]
    fn spherical_distance() {
        let xs = Tensor::from_slice(&[1f32, 0., 0., 2.]).view([2, 2]);
        let ys = Tensor::from_slice(&[3f32, 0., 3., 0.]).view([2, 2]);
        let dist = Vec::<f64>::try_from(&spherical_dist_loss(&xs, &ys)).unwrap();
        assert!(close(dist[0], 0.));
        // Orthogonal vectors are a quarter turn apart: 2 (π/4)².
        assert!(close(dist[1], 2. * std::f64::consts::FRAC_PI_4.powi(2)));
    }

    #[test]
    fn total_variation() {
        let flat = Tensor::ones(&[2, 3, 4, 4], (Kind::Float, Device::Cpu));
        let tv = tv_loss(&flat).unwrap();
        assert_eq!(tv.size(), [2]);
        assert_eq!(tv.abs().sum(Kind::Float).double_value(&[]), 0.);
        // Alternating columns: every horizontal difference is 1 in absolute value.
        let stripes = Tensor::from_slice(&[0f32, 1., 0., 1.]).view([1, 1, 1, 4]).expand(&[1, 3, 4, 4], false);
        let tv = tv_loss(&stripes).unwrap().double_value(&[0]);
        assert!(close(tv, 1.));
    }

    #[test]
    fn range_penalty() {
        let xs = Tensor::from_slice(&[-2f32, 0., 0.5, 1.5]);
        assert!(close(range_loss(&xs).double_value(&[]), 1.5 / 4.));
        let grad = grad(&xs, |xs| Ok(range_loss(xs))).unwrap();
        let grad = Vec::<f64>::try_from(&grad).unwrap();
        assert_eq!(grad, [-0.25, 0., 0., 0.25]);
    }

    #[test]
    fn grad_of_square() {
        let xs = Tensor::from_slice(&[1f32, -2., 3.]);
        let grad = grad(&xs, |xs| Ok(xs.square().sum(Kind::Float))).unwrap();
        assert_eq!(Vec::<f64>::try_from(&grad).unwrap(), [2., -4., 6.]);
    }

    #[test]
    fn clamp_only_scales_down() {
        let small = Tensor::full(&[1, 3, 4, 4], 0.1, (Kind::Float, Device::Cpu));
        let large = PrngKey::new(0).normal(&[1, 3, 4, 4], Device::Cpu) * 5.;
        let grads = Tensor::cat(&[&small, &large], 0);
        let clamped = clamp_grad(&grads, MAX_GRAD_RMS);
        let rms = Vec::<f64>::try_from(&rms_per_sample(&clamped).flatten(0, -1)).unwrap();
        assert!(close(rms[0], 0.1));
        assert!(close(rms[1], MAX_GRAD_RMS));
        assert!(clamped.get(0).equal(&small.get(0)));
    }

    #[test]
    fn blur_keeps_constant_images() {
        let image = Tensor::full(&[2, 3, 8, 6], 0.7, (Kind::Float, Device::Cpu));
        let blurred = blur_fft(&image, 3.);
        assert_eq!(blurred.size(), [2, 3, 8, 6]);
        assert!(blurred.allclose(&image, 1e-5, 1e-5, false));
        let noise = PrngKey::new(1).normal(&[1, 3, 8, 8], Device::Cpu);
        let blurred = blur_fft(&noise, 2.);
        let ratio = blurred.square().mean(Kind::Float).double_value(&[])
            / noise.square().mean(Kind::Float).double_value(&[]);
        assert!(ratio < 1.);
        // Tiny radii leave the image untouched.
        assert!(blur_fft(&noise, 0.).allclose(&noise, 1e-4, 1e-4, false));
    }

    #[test]
    fn info_loob_needs_two_prompts() {
        let single = Tensor::ones(&[1, 4], (Kind::Float, Device::Cpu));
        assert!(matches!(
            ClipLoss::info_loob(single, 1., 5., 1.),
            Err(Error::InvalidConfig { field: "info_loob", .. })
        ));
    }

    #[test]
    fn info_loob_is_finite_and_prefers_matches() {
        let text = Tensor::eye(3, (Kind::Float, Device::Cpu));
        let loss = ClipLoss::info_loob(text.shallow_clone(), 1., 5., 1.).unwrap();
        let matching = loss.loss(&text.unsqueeze(0).repeat(&[2, 1, 1])).unwrap();
        let shuffled = text.roll(&[1], &[0]).unsqueeze(0);
        let mismatched = loss.loss(&shuffled).unwrap();
        let (matching, mismatched) = (matching.double_value(&[]), mismatched.double_value(&[]));
        assert!(matching.is_finite() && mismatched.is_finite());
        assert!(matching < mismatched);
    }

    #[test]
    fn spherical_loss_scale() {
        let text = Tensor::from_slice(&[1f32, 0.]).view([1, 2]);
        let embeds = Tensor::from_slice(&[0f32, 1., 0., 1.]).view([2, 1, 2]);
        let loss = ClipLoss::spherical_dist(text, 3.).loss(&embeds).unwrap();
        assert!(close(loss.double_value(&[]), 3. * 2. * std::f64::consts::FRAC_PI_4.powi(2)));
    }

    /// Scores an embedding by its first coordinate.
    pub(crate) struct FirstCoordinate;

    impl AestheticScorer for FirstCoordinate {
        fn score(&self, embeds: &Tensor) -> Result<Tensor> {
            Ok(embeds.select(-1, 0))
        }
    }

    #[test]
    fn aesthetic_loss_rewards_high_scores() {
        // Two cutouts of two samples, the embeddings are normalized before scoring.
        let embeds = Tensor::from_slice(&[3f32, 4., 0., 1., 1., 0., 0., 2.]).view([2, 2, 2]);
        let loss = ClipLoss::aesthetic(Rc::new(FirstCoordinate), 2.).loss(&embeds).unwrap();
        // Sample 0 scores 0.6 and 1 (mean 0.8), sample 1 scores 0 twice.
        assert!(close(loss.double_value(&[]), -2. * 0.8));
        let better = Tensor::from_slice(&[1f32, 0., 1., 0., 1., 0., 1., 0.]).view([2, 2, 2]);
        let best = ClipLoss::aesthetic(Rc::new(FirstCoordinate), 2.).loss(&better).unwrap();
        assert!(close(best.double_value(&[]), -4.));
    }
}
