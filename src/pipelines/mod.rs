//! # Pipelines
//!
//! Glue between a run configuration, the externally loaded models and the
//! sampler.
pub mod clip_guided;

pub use clip_guided::{build_cond_fn, ClipGuidedPipeline, Components};
