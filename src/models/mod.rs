//! # Models
//!
//! The denoising networks are opaque: a [`Backbone`] maps a noisy batch and
//! the network's native time to a raw output, and a [`ModelAdapter`] turns
//! it into a [`DiffusionOutput`] for a given cosine t. The samplers only see
//! the [`DiffusionModel`] trait, so adapters can be wrapped and combined.
use crate::error::Result;
use crate::schedules::{alpha_sigma, Schedule};
use crate::utils::PrngKey;
use std::rc::Rc;
use tch::{Kind, Tensor};

pub mod aesthetic;
pub mod wrappers;

/// The three equivalent views of a denoiser prediction.
#[derive(Debug)]
pub struct DiffusionOutput {
    /// The velocity, `α eps - σ pred`.
    pub v: Tensor,
    /// The predicted clean image.
    pub pred: Tensor,
    /// The predicted noise.
    pub eps: Tensor,
}

/// Reshapes a `[n]` per-sample tensor so that it broadcasts over images.
pub(crate) fn per_sample(xs: &Tensor) -> Tensor {
    xs.view([-1, 1, 1, 1])
}

impl DiffusionOutput {
    pub fn from_v(x: &Tensor, v: Tensor, cosine_t: &Tensor) -> Self {
        let (alpha, sigma) = alpha_sigma(cosine_t);
        let (alpha, sigma) = (per_sample(&alpha), per_sample(&sigma));
        let pred = x * &alpha - &v * &sigma;
        let eps = x * &sigma + &v * &alpha;
        Self { v, pred, eps }
    }

    pub fn from_eps(x: &Tensor, eps: Tensor, cosine_t: &Tensor) -> Self {
        let (alpha, sigma) = alpha_sigma(cosine_t);
        let (alpha, sigma) = (per_sample(&alpha), per_sample(&sigma));
        let pred = (x - &eps * &sigma) / &alpha;
        let v = &eps * &alpha - &pred * &sigma;
        Self { v, pred, eps }
    }

    /// Applies `f` to the three views.
    pub fn map<F: Fn(&Tensor) -> Tensor>(&self, f: F) -> Self {
        Self { v: f(&self.v), pred: f(&self.pred), eps: f(&self.eps) }
    }
}

/// A denoiser evaluated at cosine t, `cosine_t` has one value per sample.
///
/// Implementations must be pure functions of their inputs and differentiable
/// with respect to `x`.
pub trait DiffusionModel {
    fn forward(&self, x: &Tensor, cosine_t: &Tensor, key: PrngKey) -> Result<DiffusionOutput>;
}

impl<M: DiffusionModel + ?Sized> DiffusionModel for Rc<M> {
    fn forward(&self, x: &Tensor, cosine_t: &Tensor, key: PrngKey) -> Result<DiffusionOutput> {
        self.as_ref().forward(x, cosine_t, key)
    }
}

impl<M: DiffusionModel + ?Sized> DiffusionModel for Box<M> {
    fn forward(&self, x: &Tensor, cosine_t: &Tensor, key: PrngKey) -> Result<DiffusionOutput> {
        self.as_ref().forward(x, cosine_t, key)
    }
}

/// An opaque denoising network, `t` is expressed in the network's own time
/// parameterization.
pub trait Backbone {
    fn forward_t(&self, xs: &Tensor, t: &Tensor) -> Result<Tensor>;
}

impl Backbone for tch::CModule {
    fn forward_t(&self, xs: &Tensor, t: &Tensor) -> Result<Tensor> {
        Ok(self.forward_ts(&[xs, t])?)
    }
}

/// Uses a closure as a backbone.
pub struct FnBackbone<F>(pub F);

impl<F> Backbone for FnBackbone<F>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    fn forward_t(&self, xs: &Tensor, t: &Tensor) -> Result<Tensor> {
        (self.0)(xs, t)
    }
}

/// What the backbone was trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Objective {
    V,
    Eps,
}

/// Adapts a backbone to the cosine t parameterization.
pub struct ModelAdapter<B> {
    pub backbone: B,
    pub objective: Objective,
    /// The schedule the backbone was trained with.
    pub schedule: Schedule,
    /// Backbones trained on discrete timesteps take `t · timescale`.
    pub timescale: f64,
}

impl<B: Backbone> ModelAdapter<B> {
    pub fn new(backbone: B, objective: Objective, schedule: Schedule, timescale: f64) -> Self {
        Self { backbone, objective, schedule, timescale }
    }
}

impl<B: Backbone> DiffusionModel for ModelAdapter<B> {
    fn forward(&self, x: &Tensor, cosine_t: &Tensor, _key: PrngKey) -> Result<DiffusionOutput> {
        let cosine = Vec::<f64>::try_from(cosine_t)?;
        let t: Vec<f32> =
            cosine.iter().map(|&t| (self.schedule.from_cosine(t) * self.timescale) as f32).collect();
        let t = Tensor::from_slice(&t).to_kind(Kind::Float).to_device(x.device());
        let out = self.backbone.forward_t(x, &t)?;
        let out = match self.objective {
            Objective::V => DiffusionOutput::from_v(x, out, cosine_t),
            Objective::Eps => DiffusionOutput::from_eps(x, out, cosine_t),
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tch::Device;

    fn image() -> Tensor {
        PrngKey::new(0).normal(&[2, 3, 4, 4], Device::Cpu)
    }

    #[test]
    fn views_are_consistent() {
        let x = image();
        let t = Tensor::from_slice(&[0.3f32, 0.7]);
        let from_eps = DiffusionOutput::from_eps(&x, PrngKey::new(1).normal(&[2, 3, 4, 4], Device::Cpu), &t);
        let from_v = DiffusionOutput::from_v(&x, from_eps.v.shallow_clone(), &t);
        assert!(from_v.pred.allclose(&from_eps.pred, 1e-4, 1e-4, false));
        assert!(from_v.eps.allclose(&from_eps.eps, 1e-4, 1e-4, false));
    }

    #[test]
    fn adapter_converts_time() {
        let seen = RefCell::new(vec![]);
        let backbone = FnBackbone(|xs: &Tensor, t: &Tensor| -> Result<Tensor> {
            seen.borrow_mut().extend(Vec::<f64>::try_from(t)?);
            Ok(xs.zeros_like())
        });
        let model = ModelAdapter::new(backbone, Objective::Eps, Schedule::Cosine, 1000.);
        let x = image();
        let t = Tensor::from_slice(&[0.25f32, 0.5]);
        let out = model.forward(&x, &t, PrngKey::new(0)).unwrap();
        let seen = seen.borrow();
        assert!((seen[0] - 250.).abs() < 1e-3 && (seen[1] - 500.).abs() < 1e-3, "{seen:?}");
        // No noise predicted: the clean image is x / α.
        let (alpha, _) = alpha_sigma(&t);
        assert!(out.pred.allclose(&(&x / per_sample(&alpha)), 1e-5, 1e-5, false));
    }

    #[test]
    fn v_objective_at_zero_noise() {
        let backbone = FnBackbone(|xs: &Tensor, _t: &Tensor| -> Result<Tensor> { Ok(xs.ones_like()) });
        let model = ModelAdapter::new(backbone, Objective::V, Schedule::Cosine, 1.);
        let x = image();
        let out = model.forward(&x, &Tensor::zeros([2], (Kind::Float, Device::Cpu)), PrngKey::new(0)).unwrap();
        assert!(out.pred.allclose(&x, 1e-6, 1e-6, false));
        assert!(out.eps.allclose(&x.ones_like(), 1e-6, 1e-6, false));
    }
}
