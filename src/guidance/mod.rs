//! # Guidance
//!
//! Everything needed to steer a diffusion model with gradients of
//! differentiable losses: the cutout augmentation pipeline, the individual
//! loss terms and the composite conditioning function used by the samplers.
use tch::{Kind, Tensor};

pub mod cond_fn;
pub mod conditions;
pub mod cutouts;
pub mod losses;

pub use cond_fn::{CondFn, DenoisedInput, MainCondFn};
pub use conditions::{CondClip, Condition, MaskedMse, ParamMap, Structure};
pub use cutouts::{Cutouts, MakeCutouts};
pub use losses::ClipLoss;

/// Replaces every pixel by the mean over the channel dimension, keeping the shape.
pub fn grey(image: &Tensor) -> Tensor {
    image.mean_dim(Some([-3i64].as_slice()), true, Kind::Float).expand_as(image)
}
