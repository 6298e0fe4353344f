//! # Noise schedules
//!
//! Every schedule is expressed as a warp of the "cosine t" parameter, the
//! alpha and sigma coefficients are then always given by the cosine map
//! `alpha = cos(t π/2)`, `sigma = sin(t π/2)` so that `alpha² + sigma² = 1`.
use serde::Deserialize;
use std::f64::consts::FRAC_PI_2;
use tch::Tensor;

const DDPM_CROSSOVER: f64 = 0.48536712;
const COSINE_CROSSOVER: f64 = 0.80074257;

/// The mixing coefficients of signal and noise at a given cosine t.
pub fn to_alpha_sigma(cosine_t: f64) -> (f64, f64) {
    let theta = cosine_t * FRAC_PI_2;
    (theta.cos(), theta.sin())
}

/// Tensor version of [`to_alpha_sigma`], the results have the shape of `cosine_t`.
pub fn alpha_sigma(cosine_t: &Tensor) -> (Tensor, Tensor) {
    let theta = cosine_t * FRAC_PI_2;
    (theta.cos(), theta.sin())
}

/// Inverts the cosine map, only the ratio between `sigma` and `alpha` matters.
pub fn from_alpha_sigma(alpha: f64, sigma: f64) -> f64 {
    sigma.atan2(alpha) / FRAC_PI_2
}

/// The cosine t at which the log signal to noise ratio is `log_snr`.
pub fn from_log_snr(log_snr: f64) -> f64 {
    let sigmoid = |x: f64| 1. / (1. + (-x).exp());
    from_alpha_sigma(sigmoid(log_snr).sqrt(), sigmoid(-log_snr).sqrt())
}

/// How the sampling parameter is warped before applying the cosine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// The identity warp.
    Cosine,
    /// Continuous version of the linear-beta DDPM schedule.
    Ddpm,
    /// DDPM schedule at high noise levels smoothly joined to the cosine
    /// schedule at low noise levels.
    Spliced,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::Spliced
    }
}

impl Schedule {
    /// Maps a time in this schedule to cosine t.
    pub fn to_cosine(&self, t: f64) -> f64 {
        match self {
            Self::Cosine => t,
            Self::Ddpm => {
                let log_snr = -(1e-4 + 10. * t * t).exp_m1().ln();
                from_log_snr(log_snr)
            }
            Self::Spliced => {
                let big_t = t * (1. + COSINE_CROSSOVER - DDPM_CROSSOVER);
                if big_t < COSINE_CROSSOVER {
                    big_t
                } else {
                    Self::Ddpm.to_cosine(big_t + DDPM_CROSSOVER - COSINE_CROSSOVER)
                }
            }
        }
    }

    /// Maps a cosine t back to a time in this schedule.
    pub fn from_cosine(&self, cosine_t: f64) -> f64 {
        match self {
            Self::Cosine => cosine_t,
            Self::Ddpm => {
                let (alpha, sigma) = to_alpha_sigma(cosine_t);
                let log_snr = (alpha * alpha / (sigma * sigma)).ln();
                (((-log_snr).exp().ln_1p() - 1e-4) / 10.).max(0.).sqrt()
            }
            Self::Spliced => {
                let big_t = if cosine_t < COSINE_CROSSOVER {
                    cosine_t
                } else {
                    Self::Ddpm.from_cosine(cosine_t) - DDPM_CROSSOVER + COSINE_CROSSOVER
                };
                big_t / (1. + COSINE_CROSSOVER - DDPM_CROSSOVER)
            }
        }
    }

    /// The `steps + 1` cosine t values obtained by linearly moving from
    /// `start` to `end` in this schedule.
    pub fn steps(&self, start: f64, end: f64, steps: usize) -> Vec<f64> {
        (0..=steps)
            .map(|i| {
                let t = if steps == 0 {
                    start
                } else {
                    start + (end - start) * i as f64 / steps as f64
                };
                self.to_cosine(t)
            })
            .collect()
    }
}
