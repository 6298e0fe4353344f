//! # Guided diffusion sampling
//!
//! Image generation by steering a denoising diffusion model with gradients
//! of auxiliary losses, most notably the similarity between text prompts and
//! CLIP embeddings of random cutouts of the current image estimate. Torch is
//! used through [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - Cosine, DDPM and spliced noise schedules.
//! - DDIM, PRK and PLMS samplers driven by a lazy step iterator.
//! - A cutout augmentation pipeline and CLIP, aesthetic, total variation,
//!   range and MSE guidance terms.
//! - A CLIP BPE tokenizer and a TorchScript perceptor wrapper.
//!
//! The denoising networks and the perceptors are opaque: any TorchScript
//! module with the expected inputs and outputs can be plugged in.

pub mod config;
pub mod error;
pub mod guidance;
pub mod models;
pub mod pipelines;
pub mod sampler;
pub mod schedulers;
pub mod schedules;
pub mod transformers;
pub mod utils;

pub use error::{Error, Result};
