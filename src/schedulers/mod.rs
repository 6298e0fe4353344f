//! # Integration rules
//!
//! Each rule advances the noisy state from one cosine t to the next one
//! using guided evaluations of the denoiser. The rules only differ by how
//! many evaluations they make per step and how they combine them.
use crate::error::Result;
use crate::guidance::CondFn;
use crate::models::DiffusionModel;
use crate::schedules::to_alpha_sigma;
use crate::utils::PrngKey;
use tch::{Kind, Tensor};

pub mod ddim;
pub mod pndm;

/// A denoiser evaluation with the noise prediction corrected by the score of
/// the conditioning function.
#[derive(Debug)]
pub struct Guided {
    pub pred: Tensor,
    pub eps: Tensor,
}

/// Pairs a denoiser with the conditioning function steering it.
pub struct GuidedModel<'a> {
    pub model: &'a dyn DiffusionModel,
    pub cond_fn: &'a CondFn,
}

impl<'a> GuidedModel<'a> {
    pub fn new(model: &'a dyn DiffusionModel, cond_fn: &'a CondFn) -> Self {
        Self { model, cond_fn }
    }

    /// Evaluates the denoiser at `x` and `t`, `eps' = eps - σ score`.
    ///
    /// The clean image prediction is only recomputed from `eps'` when the
    /// conditioning function has active terms.
    pub fn eval(&self, x: &Tensor, t: f64, key: PrngKey) -> Result<Guided> {
        let n = x.size()[0];
        let ts = Tensor::full([n], t, (Kind::Float, x.device()));
        let (model_key, cond_key) = key.split();
        let out = self.model.forward(x, &ts, model_key)?;
        if !self.cond_fn.is_active() {
            return Ok(Guided { pred: out.pred, eps: out.eps });
        }
        let (alpha, sigma) = to_alpha_sigma(t);
        let score = self.cond_fn.score(x, &ts, cond_key)?;
        let eps = out.eps - score * sigma;
        let pred = (x - &eps * sigma) / alpha;
        Ok(Guided { pred, eps })
    }
}

/// Moves `x` from `t1` to `t2` along the noise prediction `eps`, returns the
/// new state and the clean image prediction.
pub fn transfer(x: &Tensor, eps: &Tensor, t1: f64, t2: f64) -> (Tensor, Tensor) {
    let (alpha1, sigma1) = to_alpha_sigma(t1);
    let (alpha2, sigma2) = to_alpha_sigma(t2);
    let pred = (x - eps * sigma1) / alpha1;
    let x = &pred * alpha2 + eps * sigma2;
    (x, pred)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::DiffusionOutput;
    use std::cell::Cell;
    use tch::Device;

    /// Predicts `pred = x · gain` and a constant noise, counting its calls.
    pub(crate) struct Stub {
        pub gain: f64,
        pub eps: f64,
        pub calls: Cell<usize>,
    }

    impl Stub {
        pub fn new(gain: f64, eps: f64) -> Self {
            Self { gain, eps, calls: Cell::new(0) }
        }
    }

    impl DiffusionModel for Stub {
        fn forward(&self, x: &Tensor, _cosine_t: &Tensor, _key: PrngKey) -> Result<DiffusionOutput> {
            self.calls.set(self.calls.get() + 1);
            let pred = x * self.gain;
            Ok(DiffusionOutput { v: pred.zeros_like(), eps: x.full_like(self.eps), pred })
        }
    }

    #[test]
    fn transfer_round_trip() {
        let x = PrngKey::new(0).normal(&[1, 3, 4, 4], Device::Cpu);
        let eps = PrngKey::new(1).normal(&[1, 3, 4, 4], Device::Cpu);
        let (x2, pred) = transfer(&x, &eps, 0.7, 0.3);
        let (back, pred2) = transfer(&x2, &eps, 0.3, 0.7);
        assert!(back.allclose(&x, 1e-4, 1e-4, false));
        assert!(pred.allclose(&pred2, 1e-4, 1e-4, false));
    }

    #[test]
    fn unguided_eval_passes_through() {
        let stub = Stub::new(0.5, 0.1);
        let cond_fn = CondFn::none();
        let x = PrngKey::new(0).normal(&[2, 3, 4, 4], Device::Cpu);
        let guided = GuidedModel::new(&stub, &cond_fn).eval(&x, 0.5, PrngKey::new(1)).unwrap();
        assert!(guided.pred.equal(&(&x * 0.5)));
        assert!(guided.eps.equal(&x.full_like(0.1)));
        assert_eq!(stub.calls.get(), 1);
    }

    #[test]
    fn guided_eval_shifts_eps() {
        let stub = Stub::new(1., 0.);
        let cond_fn = CondFn::BlurRange { scale: 1. };
        // Values above the range produce a negative score.
        let x = Tensor::full([1, 3, 4, 4], 3., (Kind::Float, Device::Cpu));
        let t = 0.5;
        let guided = GuidedModel::new(&stub, &cond_fn).eval(&x, t, PrngKey::new(1)).unwrap();
        assert!(guided.eps.min().double_value(&[]) > 0.);
        let (alpha, sigma) = to_alpha_sigma(t);
        let expected = (&x - &guided.eps * sigma) / alpha;
        assert!(guided.pred.allclose(&expected, 1e-5, 1e-5, false));
    }
}
