//! Conditions turn a denoised image estimate into a gradient.
//!
//! Conditions form a tree of plain values: the static part, as returned by
//! `structure()`, describes which terms are active and the shapes they work
//! with, the dynamic part holds tensors and scales. [`ParamMap`] visits the
//! dynamic leaves of a whole tree in a single walk.
use super::cutouts::Cutouts;
use super::losses::{grad, range_loss, tv_loss, ClipLoss};
use super::{grey, DenoisedInput};
use crate::error::{Error, Result};
use crate::transformers::perceptor::{normalize, Perceptor};
use crate::utils::PrngKey;
use std::rc::Rc;
use tch::{Device, Kind, Tensor};

const TV_SCALES: [i64; 3] = [1, 2, 4];

/// Maps the dynamic leaves of a conditioning tree.
pub trait ParamMap {
    fn scalar(&mut self, value: f64) -> f64 {
        value
    }

    fn tensor(&mut self, value: &Tensor) -> Tensor;
}

/// Moves every tensor of a tree to a device.
pub struct ToDevice(pub Device);

impl ParamMap for ToDevice {
    fn tensor(&mut self, value: &Tensor) -> Tensor {
        value.to_device(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossKind {
    SphericalDist,
    InfoLoob,
    Aesthetic,
}

/// The static part of a conditioning tree, two trees with the same
/// structure only differ by the values of their dynamic parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Structure {
    Clip {
        perceptor: String,
        cut_size: i64,
        cutn: i64,
        pixelate: Option<i64>,
        mixgrey: bool,
        cut_batches: usize,
        losses: Vec<LossKind>,
    },
    TotalVariation,
    Range,
    Mse { masked: bool, grey: bool },
    Main { conditions: Vec<Structure>, blur: bool, use_: DenoisedInput },
    BlurRange,
    Sum(Vec<Structure>),
}

/// Backpropagates a set of losses through the perceptor, averaged over
/// `cut_batches` independent cutout draws.
pub struct CondClip {
    perceptor: Rc<dyn Perceptor>,
    cutouts: Cutouts,
    cut_batches: usize,
    losses: Vec<ClipLoss>,
}

impl std::fmt::Debug for CondClip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CondClip")
            .field("perceptor", &self.perceptor.name())
            .field("cutouts", &self.cutouts)
            .field("cut_batches", &self.cut_batches)
            .field("losses", &self.losses)
            .finish()
    }
}

impl CondClip {
    pub fn new(
        perceptor: Rc<dyn Perceptor>,
        cutouts: Cutouts,
        cut_batches: usize,
        losses: Vec<ClipLoss>,
    ) -> Result<Self> {
        if losses.is_empty() {
            return Err(Error::EmptyGuidance { field: format!("clip {}", perceptor.name()) });
        }
        if cut_batches == 0 {
            return Err(Error::invalid("cut_batches", "must be at least 1"));
        }
        if cutouts.cut_size() != perceptor.image_size() {
            return Err(Error::ResolutionMismatch {
                perceptor: perceptor.name().to_string(),
                expected: perceptor.image_size(),
                got: cutouts.cut_size(),
            });
        }
        Ok(Self { perceptor, cutouts, cut_batches, losses })
    }

    pub fn perceptor(&self) -> &dyn Perceptor {
        self.perceptor.as_ref()
    }

    pub fn losses(&self) -> &[ClipLoss] {
        &self.losses
    }

    fn loss(&self, x_in: &Tensor, key: PrngKey) -> Result<Tensor> {
        let n = x_in.size()[0];
        let cutouts = self.cutouts.cutouts(&((x_in + 1.) / 2.), key)?;
        let (k, _n, c, h, w) = cutouts.size5()?;
        let cutouts = normalize(&cutouts.reshape([k * n, c, h, w]));
        let embeds = self.perceptor.embed_cutouts(&cutouts)?;
        // The perceptor may live on another device.
        let embeds = embeds.to_device(x_in.device()).reshape([k, n, -1]);
        let losses =
            self.losses.iter().map(|loss| loss.loss(&embeds)).collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&losses, 0).sum(Kind::Float))
    }

    pub fn grad(&self, x_in: &Tensor, key: PrngKey) -> Result<Tensor> {
        let mut total = x_in.zeros_like();
        for (index, key) in key.split_n(self.cut_batches).into_iter().enumerate() {
            total += grad(x_in, |xs| self.loss(xs, key))?;
            tracing::trace!(perceptor = self.perceptor.name(), index, "accumulated cut batch");
        }
        Ok(total / self.cut_batches as f64)
    }

    fn map_params(&self, f: &mut dyn ParamMap) -> Self {
        let mut cutouts = self.cutouts.clone();
        let inner = cutouts.inner_mut();
        inner.cut_pow = f.scalar(inner.cut_pow);
        inner.p_grey = f.scalar(inner.p_grey);
        inner.p_mixgrey = inner.p_mixgrey.map(|p| f.scalar(p));
        inner.p_flip = f.scalar(inner.p_flip);
        Self {
            perceptor: self.perceptor.clone(),
            cutouts,
            cut_batches: self.cut_batches,
            losses: self.losses.iter().map(|l| l.map_params(f)).collect(),
        }
    }

    fn structure(&self) -> Structure {
        let pixelate = match &self.cutouts {
            Cutouts::Standard(_) => None,
            Cutouts::Pixelated { factor, .. } => Some(*factor),
        };
        Structure::Clip {
            perceptor: self.perceptor.name().to_string(),
            cut_size: self.cutouts.cut_size(),
            cutn: self.cutouts.cutn(),
            pixelate,
            mixgrey: self.cutouts.inner().p_mixgrey.is_some(),
            cut_batches: self.cut_batches,
            losses: self.losses.iter().map(|l| l.kind()).collect(),
        }
    }
}

/// Pulls the image towards a target, optionally only where `mask` is set and
/// optionally comparing greyscale versions.
#[derive(Debug)]
pub struct MaskedMse {
    pub target: Tensor,
    pub scale: f64,
    pub mask: Option<Tensor>,
    pub grey: bool,
}

impl MaskedMse {
    pub fn new(target: Tensor, scale: f64) -> Self {
        Self { target, scale, mask: None, grey: false }
    }

    fn loss(&self, xs: &Tensor) -> Tensor {
        let diff = xs - &self.target;
        let diff = if self.grey { grey(&diff) } else { diff };
        let sq = diff.square();
        match &self.mask {
            Some(mask) => (sq * mask).mean(Kind::Float),
            None => sq.mean(Kind::Float),
        }
    }

    pub fn grad(&self, x_in: &Tensor) -> Result<Tensor> {
        Ok(grad(x_in, |xs| Ok(self.loss(xs)))? * self.scale)
    }
}

/// Antialiased bicubic downscaling by an integer factor.
fn downscale(xs: &Tensor, factor: i64) -> Result<Tensor> {
    if factor == 1 {
        return Ok(xs.shallow_clone());
    }
    let (_n, _c, h, w) = xs.size4()?;
    Ok(xs.f_internal_upsample_bicubic2d_aa([h / factor, w / factor], false, None, None)?)
}

/// A loss on the denoised image estimate.
#[derive(Debug)]
pub enum Condition {
    Clip(CondClip),
    /// Total variation at full, half and quarter resolution.
    TotalVariation { scale: f64 },
    /// Penalizes values outside of `[-1, 1]`.
    Range { scale: f64 },
    Mse(MaskedMse),
}

impl Condition {
    pub fn grad(&self, x_in: &Tensor, key: PrngKey) -> Result<Tensor> {
        match self {
            Self::Clip(clip) => clip.grad(x_in, key),
            Self::TotalVariation { scale } => {
                let (_n, _c, h, w) = x_in.size4()?;
                let coarsest = TV_SCALES[TV_SCALES.len() - 1];
                if h / coarsest < 2 || w / coarsest < 2 {
                    return Err(Error::invalid(
                        "tv_scale",
                        format!("a {w}x{h} image is too small, needs {0}x{0}", 2 * coarsest),
                    ));
                }
                let mut total = x_in.zeros_like();
                for f in TV_SCALES {
                    total += grad(x_in, |xs| {
                        Ok(tv_loss(&downscale(xs, f)?)?.sum(Kind::Float) * *scale)
                    })?;
                }
                Ok(total)
            }
            Self::Range { scale } => Ok(grad(x_in, |xs| Ok(range_loss(xs)))? * *scale),
            Self::Mse(mse) => mse.grad(x_in),
        }
    }

    pub fn map_params(&self, f: &mut dyn ParamMap) -> Self {
        match self {
            Self::Clip(clip) => Self::Clip(clip.map_params(f)),
            Self::TotalVariation { scale } => Self::TotalVariation { scale: f.scalar(*scale) },
            Self::Range { scale } => Self::Range { scale: f.scalar(*scale) },
            Self::Mse(mse) => Self::Mse(MaskedMse {
                target: f.tensor(&mse.target),
                scale: f.scalar(mse.scale),
                mask: mse.mask.as_ref().map(|m| f.tensor(m)),
                grey: mse.grey,
            }),
        }
    }

    pub fn structure(&self) -> Structure {
        match self {
            Self::Clip(clip) => clip.structure(),
            Self::TotalVariation { .. } => Structure::TotalVariation,
            Self::Range { .. } => Structure::Range,
            Self::Mse(mse) => Structure::Mse { masked: mse.mask.is_some(), grey: mse.grey },
        }
    }
}
