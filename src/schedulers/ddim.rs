//! # Denoising Diffusion Implicit Models
//!
//! The DDIM step moves the clean image prediction to the next noise level
//! and re-noises it partly with the predicted noise and partly with fresh
//! noise. `eta` sets the share of fresh noise: 0 gives the deterministic
//! DDIM sampler, 1 matches the ancestral DDPM sampler and negative values
//! re-noise with `|eta| σ'` of fresh noise.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::Guided;
use crate::schedules::to_alpha_sigma;
use crate::utils::PrngKey;
use tch::Tensor;

/// The standard deviation of the fresh noise added when going from `t1` to
/// `t2`, this never exceeds the target noise level.
pub fn ddim_sigma(t1: f64, t2: f64, eta: f64) -> f64 {
    let (alpha1, sigma1) = to_alpha_sigma(t1);
    let (alpha2, sigma2) = to_alpha_sigma(t2);
    let ddim_sigma = if eta < 0. {
        -eta * sigma2
    } else {
        eta * (sigma2 * sigma2 / (sigma1 * sigma1)).sqrt()
            * (1. - alpha1 * alpha1 / (alpha2 * alpha2)).max(0.).sqrt()
    };
    ddim_sigma.min(sigma2)
}

/// Performs a DDIM step from `t1` to `t2`.
pub fn ddim_step(x: &Tensor, guided: &Guided, t1: f64, t2: f64, eta: f64, key: PrngKey) -> Tensor {
    let (alpha2, sigma2) = to_alpha_sigma(t2);
    let ddim_sigma = ddim_sigma(t1, t2, eta);
    let adjusted_sigma = (sigma2 * sigma2 - ddim_sigma * ddim_sigma).max(0.).sqrt();
    let next = &guided.pred * alpha2 + &guided.eps * adjusted_sigma;
    if ddim_sigma > 0. {
        next + key.normal(&x.size(), x.device()) * ddim_sigma
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn sigma_bounds() {
        assert_eq!(ddim_sigma(0.8, 0.6, 0.), 0.);
        let (_, sigma2) = to_alpha_sigma(0.6);
        let ancestral = ddim_sigma(0.8, 0.6, 1.);
        assert!(ancestral > 0. && ancestral < sigma2);
        assert!((ddim_sigma(0.8, 0.6, -0.5) - 0.5 * sigma2).abs() < 1e-12);
        assert!((ddim_sigma(0.8, 0.6, -3.) - sigma2).abs() < 1e-12);
        // No noise is ever added on the way to the clean image.
        assert_eq!(ddim_sigma(0.1, 0., 1.), 0.);
    }

    #[test]
    fn deterministic_step() {
        let x = PrngKey::new(0).normal(&[1, 3, 4, 4], Device::Cpu);
        let guided = Guided { pred: x.zeros_like(), eps: x.shallow_clone() };
        let (_, sigma2) = to_alpha_sigma(0.25);
        let a = ddim_step(&x, &guided, 0.5, 0.25, 0., PrngKey::new(1));
        let b = ddim_step(&x, &guided, 0.5, 0.25, 0., PrngKey::new(2));
        assert!(a.equal(&b));
        assert!(a.allclose(&(&x * sigma2), 1e-6, 1e-6, false));
        let c = ddim_step(&x, &guided, 0.5, 0.25, 1., PrngKey::new(1));
        let d = ddim_step(&x, &guided, 0.5, 0.25, 1., PrngKey::new(2));
        assert!(!c.equal(&d));
    }
}
