//! Pseudo numerical methods for diffusion models (PNDM) use more advanced ODE
//! integration techniques, namely a Runge-Kutta method and a linear multi-step
//! method, applied to the noise prediction.
//!
//! Pseudo Numerical Methods for Diffusion Models on Manifolds, L. Liu et al, 2022.
//! https://arxiv.org/abs/2202.09778
use super::{transfer, GuidedModel};
use crate::error::Result;
use crate::utils::Prng;
use crate::utils::PrngKey;
use std::collections::VecDeque;
use tch::Tensor;

// The linear multi-step method needs this many previous noise predictions.
const PLMS_HISTORY: usize = 3;

/// The result of a PNDM step.
#[derive(Debug)]
pub struct PndmStep {
    pub x: Tensor,
    pub pred: Tensor,
    /// The noise prediction at the start of the step.
    pub eps: Tensor,
}

/// Pseudo Runge-Kutta step from `t1` to `t2`, four model evaluations.
pub fn prk_step(model: &GuidedModel, x: &Tensor, t1: f64, t2: f64, key: PrngKey) -> Result<PndmStep> {
    let mut rng = Prng::new(key);
    let t_mid = (t1 + t2) / 2.;
    let eps_1 = model.eval(x, t1, rng.split())?.eps;
    let (x_1, _) = transfer(x, &eps_1, t1, t_mid);
    let eps_2 = model.eval(&x_1, t_mid, rng.split())?.eps;
    let (x_2, _) = transfer(x, &eps_2, t1, t_mid);
    let eps_3 = model.eval(&x_2, t_mid, rng.split())?.eps;
    let (x_3, _) = transfer(x, &eps_3, t1, t2);
    let eps_4 = model.eval(&x_3, t2, rng.split())?.eps;
    let eps_prime = (&eps_1 + &eps_2 * 2. + &eps_3 * 2. + eps_4) / 6.;
    let (x, pred) = transfer(x, &eps_prime, t1, t2);
    Ok(PndmStep { x, pred, eps: eps_1 })
}

/// Pseudo linear multi-step sampler state.
///
/// Until enough noise predictions are available, steps fall back to
/// [`prk_step`].
#[derive(Debug, Default)]
pub struct Plms {
    old_eps: VecDeque<Tensor>,
}

impl Plms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(
        &mut self,
        model: &GuidedModel,
        x: &Tensor,
        t1: f64,
        t2: f64,
        key: PrngKey,
    ) -> Result<PndmStep> {
        let step = if self.old_eps.len() < PLMS_HISTORY {
            prk_step(model, x, t1, t2, key)?
        } else {
            let eps = model.eval(x, t1, key)?.eps;
            let (e1, e2, e3) = (&self.old_eps[2], &self.old_eps[1], &self.old_eps[0]);
            let eps_prime = (&eps * 55. - e1 * 59. + e2 * 37. - e3 * 9.) / 24.;
            let (x, pred) = transfer(x, &eps_prime, t1, t2);
            self.old_eps.pop_front();
            PndmStep { x, pred, eps }
        };
        self.old_eps.push_back(step.eps.shallow_clone());
        Ok(step)
    }
}
