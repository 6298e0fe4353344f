//! # Cutouts
//!
//! Random crops of an image batch resampled to the perceptor resolution, with
//! random greyscale and horizontal flips. Averaging a loss over many cutouts
//! gives much more robust gradients than evaluating it on the full image.
//!
//! Resampling uses a Lanczos-3 kernel with the `scale_and_translate`
//! convention: output pixel `i` of a cutout of size `s` at offset `o` samples
//! the input at `(i + 0.5) * s / out + o - 0.5`, the kernel is widened when
//! downscaling and samples falling outside of the image are zero. The
//! resampling is a pair of dense matrices so gradients flow back to the image.
use super::grey;
use crate::error::Result;
use crate::utils::PrngKey;
use std::f64::consts::PI;
use tch::{Device, Tensor};

const LANCZOS_RADIUS: f64 = 3.;
const BORDER_MIN: f64 = 40.;
const BORDER_RANGE: f64 = 40.;

fn lanczos3(x: f64) -> f64 {
    let x = x.abs();
    if x >= LANCZOS_RADIUS {
        0.
    } else if x < 1e-12 {
        1.
    } else {
        let px = PI * x;
        LANCZOS_RADIUS * px.sin() * (px / LANCZOS_RADIUS).sin() / (px * px)
    }
}

/// Row-major `[out, input]` weights resampling the `[offset, offset + size)`
/// window of an axis of length `input` to `out` samples.
fn resample_weights(input: i64, out: i64, offset: f64, size: f64) -> Vec<f32> {
    let inv_scale = size / out as f64;
    let kernel_scale = inv_scale.max(1.);
    let support = LANCZOS_RADIUS * kernel_scale;
    let mut weights = vec![0f32; (out * input) as usize];
    let mut row = Vec::new();
    for i in 0..out {
        let sample = (i as f64 + 0.5) * inv_scale + offset - 0.5;
        if sample < -0.5 || sample > input as f64 - 0.5 {
            continue;
        }
        let lo = ((sample - support).floor() as i64).max(0);
        let hi = ((sample + support).ceil() as i64).min(input - 1);
        row.clear();
        row.extend((lo..=hi).map(|j| lanczos3((sample - j as f64) / kernel_scale)));
        let total: f64 = row.iter().sum();
        if total.abs() <= 1000. * f32::EPSILON as f64 {
            continue;
        }
        for (j, w) in (lo..=hi).zip(row.iter()) {
            weights[(i * input + j) as usize] = (w / total) as f32;
        }
    }
    weights
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Placement {
    x: f64,
    y: f64,
    size: f64,
}

fn mask(draws: &[bool], shape: [i64; 5], device: Device) -> Tensor {
    Tensor::from_slice(draws).view(shape).to_device(device)
}

/// Square cutouts of random sizes and positions.
#[derive(Debug, Clone, PartialEq)]
pub struct MakeCutouts {
    /// The output resolution, this should match the perceptor input size.
    pub cut_size: i64,
    /// The number of cutouts per image, half of them small and half of them
    /// covering the whole image with some border.
    pub cutn: i64,
    /// Larger values produce smaller cutouts.
    pub cut_pow: f64,
    pub p_grey: f64,
    /// When set, probability of blending a cutout with its greyscale version
    /// using a random ratio.
    pub p_mixgrey: Option<f64>,
    pub p_flip: f64,
}

impl MakeCutouts {
    pub fn new(cut_size: i64, cutn: i64) -> Self {
        Self { cut_size, cutn, cut_pow: 1.0, p_grey: 0.2, p_mixgrey: None, p_flip: 0.5 }
    }

    /// Returns the cutouts of `input` with shape `[cutn, n, c, cut_size, cut_size]`.
    pub fn cutouts(&self, input: &Tensor, key: PrngKey) -> Result<Tensor> {
        let (n, _c, h, w) = input.size4()?;
        let device = input.device();
        let keys = key.split_n(10);
        let small_cuts = self.cutn / 2;
        let large_cuts = self.cutn - small_cuts;
        let (hf, wf) = (h as f64, w as f64);

        let max_size = h.min(w) as f64;
        let min_size = h.min(w).min(self.cut_size) as f64;
        let count = (small_cuts * n) as usize;
        let sizes: Vec<f64> = keys[0]
            .uniform(count)
            .into_iter()
            .map(|u| (min_size + u.powf(self.cut_pow) * (max_size - min_size)).clamp(min_size, max_size))
            .collect();
        let xs = keys[1].uniform_in(&sizes.iter().map(|s| (0., wf - s)).collect::<Vec<_>>());
        let ys = keys[2].uniform_in(&sizes.iter().map(|s| (0., hf - s)).collect::<Vec<_>>());

        let count = (large_cuts * n) as usize;
        let borders: Vec<f64> =
            keys[3].uniform(count).into_iter().map(|u| BORDER_MIN + u * BORDER_RANGE).collect();
        let lsizes: Vec<f64> = borders.iter().map(|b| (hf.max(wf) + b).floor()).collect();
        let around = |center: f64| -> Vec<(f64, f64)> {
            lsizes
                .iter()
                .zip(borders.iter())
                .map(|(s, b)| (center - s / 2. - b, center - s / 2. + b))
                .collect()
        };
        let lxs = keys[4].uniform_in(&around(wf / 2.));
        let lys = keys[5].uniform_in(&around(hf / 2.));

        let placements: Vec<Placement> = (0..sizes.len())
            .map(|i| Placement { x: xs[i], y: ys[i], size: sizes[i] })
            .chain((0..lsizes.len()).map(|i| Placement { x: lxs[i], y: lys[i], size: lsizes[i] }))
            .collect();

        let out = self.cut_size;
        let mut wy = Vec::with_capacity(placements.len() * (out * h) as usize);
        let mut wx = Vec::with_capacity(placements.len() * (out * w) as usize);
        for p in placements.iter() {
            wy.extend(resample_weights(h, out, p.y, p.size));
            wx.extend(resample_weights(w, out, p.x, p.size));
        }
        let kind = input.kind();
        let wy = Tensor::from_slice(&wy).view([self.cutn, n, 1, out, h]).to_kind(kind).to_device(device);
        let wx = Tensor::from_slice(&wx).view([self.cutn, n, 1, out, w]).to_kind(kind).to_device(device);
        // [k n 1 o h] x [1 n c h w] x [k n 1 w o] -> [k n c o o]
        let mut cutouts = wy.matmul(&input.unsqueeze(0)).matmul(&wx.transpose(-1, -2));

        let shape = [self.cutn, n, 1, 1, 1];
        let count = (self.cutn * n) as usize;
        let greyed = grey(&cutouts);
        if let Some(p_mixgrey) = self.p_mixgrey {
            let draws = keys[6].bernoulli(count, p_mixgrey);
            let ratios: Vec<f32> = keys[7].uniform(count).into_iter().map(|r| r as f32).collect();
            let ratios = Tensor::from_slice(&ratios).view(shape).to_kind(kind).to_device(device);
            let mixed: Tensor = &greyed * &ratios + &cutouts * (1. - &ratios);
            cutouts = mixed.where_self(&mask(&draws, shape, device), &cutouts);
        }
        let draws = keys[8].bernoulli(count, self.p_grey);
        cutouts = greyed.where_self(&mask(&draws, shape, device), &cutouts);
        let draws = keys[9].bernoulli(count, self.p_flip);
        cutouts = cutouts.flip([-1]).where_self(&mask(&draws, shape, device), &cutouts);
        Ok(cutouts)
    }
}

/// The cutout pipelines that can be used by a perceptor loss.
#[derive(Debug, Clone, PartialEq)]
pub enum Cutouts {
    Standard(MakeCutouts),
    /// Upsamples the image by an integer factor with nearest neighbour
    /// interpolation before cutting, which biases the guidance towards
    /// blocky, pixel-art like patterns.
    Pixelated { inner: MakeCutouts, factor: i64 },
}

impl Cutouts {
    pub fn inner(&self) -> &MakeCutouts {
        match self {
            Self::Standard(inner) | Self::Pixelated { inner, .. } => inner,
        }
    }

    pub fn inner_mut(&mut self) -> &mut MakeCutouts {
        match self {
            Self::Standard(inner) | Self::Pixelated { inner, .. } => inner,
        }
    }

    pub fn cut_size(&self) -> i64 {
        self.inner().cut_size
    }

    pub fn cutn(&self) -> i64 {
        self.inner().cutn
    }

    pub fn cutouts(&self, input: &Tensor, key: PrngKey) -> Result<Tensor> {
        match self {
            Self::Standard(inner) => inner.cutouts(input, key),
            Self::Pixelated { inner, factor } => {
                let (_n, _c, h, w) = input.size4()?;
                let input = input.upsample_nearest2d([h * factor, w * factor], None, None);
                inner.cutouts(&input, key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn image(n: i64, h: i64, w: i64) -> Tensor {
        PrngKey::new(7).normal(&[n, 3, h, w], Device::Cpu)
    }

    #[test]
    fn lanczos_kernel() {
        assert_eq!(lanczos3(0.), 1.);
        assert!(lanczos3(1.).abs() < 1e-12);
        assert!(lanczos3(2.).abs() < 1e-12);
        assert_eq!(lanczos3(3.5), 0.);
        assert!((lanczos3(0.5) - lanczos3(-0.5)).abs() < 1e-12);
    }

    #[test]
    fn identity_resampling() {
        let weights = resample_weights(8, 8, 0., 8.);
        for i in 0..8 {
            for j in 0..8 {
                let expected = if i == j { 1. } else { 0. };
                assert!((weights[i * 8 + j] - expected).abs() < 1e-6, "{i} {j}");
            }
        }
    }

    #[test]
    fn rows_are_normalized_or_empty() {
        let weights = resample_weights(32, 16, -20., 72.);
        for row in weights.chunks(32) {
            let total: f32 = row.iter().sum();
            assert!(total == 0. || (total - 1.).abs() < 1e-5, "{total}");
        }
        // The first output samples fall left of the image.
        assert!(weights[..32].iter().all(|&w| w == 0.));
    }

    #[test]
    fn cutouts_shape() {
        let make_cutouts = MakeCutouts::new(16, 6);
        let cutouts = make_cutouts.cutouts(&image(2, 24, 20), PrngKey::new(0)).unwrap();
        assert_eq!(cutouts.size(), [6, 2, 3, 16, 16]);
        let pixelated = Cutouts::Pixelated { inner: make_cutouts, factor: 2 };
        let cutouts = pixelated.cutouts(&image(2, 12, 10), PrngKey::new(0)).unwrap();
        assert_eq!(cutouts.size(), [6, 2, 3, 16, 16]);
    }

    #[test]
    fn cutouts_are_deterministic() {
        let make_cutouts =
            MakeCutouts { p_mixgrey: Some(0.5), ..MakeCutouts::new(16, 8) };
        let input = image(2, 24, 24);
        let a = make_cutouts.cutouts(&input, PrngKey::new(1)).unwrap();
        let b = make_cutouts.cutouts(&input, PrngKey::new(1)).unwrap();
        assert!(a.equal(&b));
        let c = make_cutouts.cutouts(&input, PrngKey::new(2)).unwrap();
        assert!(!a.equal(&c));
    }

    #[test]
    fn flip_matches_unflipped_draws() {
        let input = image(2, 24, 24);
        let key = PrngKey::new(5);
        let never = MakeCutouts { p_flip: 0., ..MakeCutouts::new(16, 8) };
        let always = MakeCutouts { p_flip: 1., ..MakeCutouts::new(16, 8) };
        let never = never.cutouts(&input, key).unwrap();
        let always = always.cutouts(&input, key).unwrap();
        assert!(always.equal(&never.flip([-1])));
    }

    #[test]
    fn grey_probability_one() {
        let make_cutouts = MakeCutouts { p_grey: 1., p_flip: 0., ..MakeCutouts::new(8, 4) };
        let cutouts = make_cutouts.cutouts(&image(1, 16, 16), PrngKey::new(3)).unwrap();
        let spread = (cutouts.narrow(2, 0, 1) - cutouts.narrow(2, 1, 1)).abs().max();
        assert!(spread.double_value(&[]) < 1e-6);
    }

    #[test]
    fn cutouts_are_differentiable() {
        let input = image(1, 16, 16).set_requires_grad(true);
        let cutouts = MakeCutouts::new(8, 4).cutouts(&input, PrngKey::new(9)).unwrap();
        let mut grads = Tensor::run_backward(&[cutouts.sum(Kind::Float)], &[&input], false, false);
        let grad = grads.pop().unwrap();
        assert_eq!(grad.size(), [1, 3, 16, 16]);
        assert!(grad.abs().sum(Kind::Float).double_value(&[]) > 0.);
    }
}
