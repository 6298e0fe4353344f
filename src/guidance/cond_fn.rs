//! # Conditioning functions
//!
//! A conditioning function maps the noisy state `x` at a given cosine t to a
//! score, i.e. a gradient that the samplers use to correct the model's noise
//! prediction.
use super::conditions::{Condition, ParamMap, Structure};
use super::losses::{blur_fft, clamp_grad, vjp, MAX_GRAD_RMS};
use crate::error::Result;
use crate::models::DiffusionModel;
use crate::schedules::{alpha_sigma, to_alpha_sigma};
use crate::utils::{Prng, PrngKey};
use serde::Deserialize;
use std::rc::Rc;
use tch::{Kind, Tensor};

const MAX_BLUR_RADIUS: f64 = 512.;
const BLUR_RANGE_MAX_RMS: f64 = 0.1;

/// The image the conditions are evaluated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenoisedInput {
    /// The model prediction of the clean image.
    #[default]
    Pred,
    /// The prediction mixed back with the noisy input, `pred σ + x α`.
    XIn,
}

/// Denoises `x` with a model, sums the gradients of the conditions on the
/// denoised estimate and pulls the result back through the model.
pub struct MainCondFn {
    pub model: Rc<dyn DiffusionModel>,
    pub conditions: Vec<Condition>,
    /// Blurs the gradient with a radius proportional to the noise level
    /// before pulling it back through the model.
    pub blur_amount: Option<f64>,
    pub use_: DenoisedInput,
}

impl MainCondFn {
    pub fn new(model: Rc<dyn DiffusionModel>, conditions: Vec<Condition>) -> Self {
        Self { model, conditions, blur_amount: None, use_: DenoisedInput::Pred }
    }

    pub fn score(&self, x: &Tensor, cosine_t: &Tensor, key: PrngKey) -> Result<Tensor> {
        if self.conditions.is_empty() {
            return Ok(x.zeros_like());
        }
        let mut rng = Prng::new(key);
        let (alphas, sigmas) = alpha_sigma(cosine_t);
        let (alphas, sigmas) = (alphas.view([-1, 1, 1, 1]), sigmas.view([-1, 1, 1, 1]));
        let model_key = rng.split();
        tch::with_grad(|| {
            let x = x.detach().set_requires_grad(true);
            let pred = self.model.forward(&x, cosine_t, model_key)?.pred;
            let x_in = match self.use_ {
                DenoisedInput::Pred => pred,
                DenoisedInput::XIn => pred * &sigmas + &x * &alphas,
            };
            let detached = x_in.detach();
            let mut total = detached.zeros_like();
            for cond in self.conditions.iter() {
                total += cond.grad(&detached, rng.split())?;
            }
            if let Some(amount) = self.blur_amount {
                let radius = (&sigmas / &alphas * amount)
                    .clamp(0.05, MAX_BLUR_RADIUS)
                    .mean(Kind::Float)
                    .double_value(&[]);
                total = blur_fft(&total, radius);
            }
            let grad = -vjp(&x_in, &x, &total)?;
            Ok(clamp_grad(&grad, MAX_GRAD_RMS))
        })
    }
}

/// Closed form gradient pushing the blurred prediction `blur(x) / α` back
/// into `[-1, 1]`, the blur radius grows with the noise level.
fn blur_range_score(x: &Tensor, cosine_t: &Tensor, scale: f64) -> Tensor {
    let (alpha, sigma) = to_alpha_sigma(cosine_t.mean(Kind::Float).double_value(&[]));
    let radius = (sigma / alpha * 2.).min(MAX_BLUR_RADIUS);
    let alpha = alpha.max(0.01);
    let pred = blur_fft(x, radius) / alpha;
    let diff = &pred - pred.clamp(-1., 1.);
    let grad = blur_fft(&(diff * 2.), radius) / alpha;
    clamp_grad(&(grad * -scale), BLUR_RANGE_MAX_RMS)
}

/// The conditioning function used by the samplers.
pub enum CondFn {
    Main(MainCondFn),
    BlurRange { scale: f64 },
    /// Adds up the scores of several conditioning functions.
    Sum(Vec<CondFn>),
}

impl CondFn {
    /// A conditioning function without any term, its score is always zero.
    pub fn none() -> Self {
        Self::Sum(vec![])
    }

    pub fn score(&self, x: &Tensor, cosine_t: &Tensor, key: PrngKey) -> Result<Tensor> {
        match self {
            Self::Main(main) => main.score(x, cosine_t, key),
            Self::BlurRange { scale } => Ok(blur_range_score(x, cosine_t, *scale)),
            Self::Sum(fns) => {
                let mut total = x.zeros_like();
                for (cond_fn, key) in fns.iter().zip(key.split_n(fns.len())) {
                    total += cond_fn.score(x, cosine_t, key)?;
                }
                Ok(total)
            }
        }
    }

    /// Whether the score can be non-zero.
    pub fn is_active(&self) -> bool {
        match self {
            Self::Main(main) => !main.conditions.is_empty(),
            Self::BlurRange { scale } => *scale != 0.,
            Self::Sum(fns) => fns.iter().any(|f| f.is_active()),
        }
    }

    pub fn structure(&self) -> Structure {
        match self {
            Self::Main(main) => Structure::Main {
                conditions: main.conditions.iter().map(|c| c.structure()).collect(),
                blur: main.blur_amount.is_some(),
                use_: main.use_,
            },
            Self::BlurRange { .. } => Structure::BlurRange,
            Self::Sum(fns) => Structure::Sum(fns.iter().map(|f| f.structure()).collect()),
        }
    }

    pub fn map_params(&self, f: &mut dyn ParamMap) -> Self {
        match self {
            Self::Main(main) => Self::Main(MainCondFn {
                model: main.model.clone(),
                conditions: main.conditions.iter().map(|c| c.map_params(f)).collect(),
                blur_amount: main.blur_amount.map(|b| f.scalar(b)),
                use_: main.use_,
            }),
            Self::BlurRange { scale } => Self::BlurRange { scale: f.scalar(*scale) },
            Self::Sum(fns) => Self::Sum(fns.iter().map(|c| c.map_params(f)).collect()),
        }
    }

    pub fn to_device(&self, device: tch::Device) -> Self {
        self.map_params(&mut super::conditions::ToDevice(device))
    }
}
