//! # Perceptors
//!
//! Joint text and image embedding models, e.g. CLIP, used to score how well
//! the images match the prompts.
use super::tokenizer::Tokenizer;
use crate::error::{Error, Result};
use crate::guidance::losses::norm1;
use tch::{CModule, Device, Kind, Tensor};

const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

pub trait Perceptor {
    fn name(&self) -> &str;

    /// The input resolution of the image encoder.
    fn image_size(&self) -> i64;

    /// The unit norm embedding of a prompt.
    fn embed_text(&self, text: &str) -> Result<Tensor>;

    fn embed_texts(&self, texts: &[String]) -> Result<Tensor> {
        let embeds = texts.iter().map(|t| self.embed_text(t)).collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&embeds, 0))
    }

    /// Embeds a `[n, 3, image_size, image_size]` batch of normalized images.
    fn embed_cutouts(&self, cutouts: &Tensor) -> Result<Tensor>;
}

/// Standardizes `[0, 1]` images with the CLIP channel statistics.
pub fn normalize(images: &Tensor) -> Tensor {
    let device = images.device();
    let mean = Tensor::from_slice(&CLIP_MEAN).view([3, 1, 1]).to_device(device);
    let std = Tensor::from_slice(&CLIP_STD).view([3, 1, 1]).to_device(device);
    (images - mean) / std
}

/// Embeds a prompt, a `~` anywhere in the prompt negates its embedding.
pub fn embed_prompt(perceptor: &dyn Perceptor, prompt: &str) -> Result<Tensor> {
    let sign = if prompt.contains('~') { -1. } else { 1. };
    let text = prompt.replace('~', "");
    Ok(norm1(&(perceptor.embed_text(text.trim())? * sign)))
}

/// The `[n, d]` normalized embeddings of a list of prompts.
pub fn embed_prompts(perceptor: &dyn Perceptor, prompts: &[String]) -> Result<Tensor> {
    let embeds =
        prompts.iter().map(|p| embed_prompt(perceptor, p)).collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&embeds, 0))
}

/// The input resolution and embedding width of a published CLIP model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipArch {
    pub image_size: i64,
    pub embed_dim: i64,
}

impl ClipArch {
    /// Looks up a model by its release name, e.g. `ViT-B/32` or
    /// `ViT-L/14@336px`. A `@<n>px` suffix overrides the input resolution.
    pub fn from_name(name: &str) -> Result<Self> {
        let (base, image_size) = match name.split_once('@') {
            Some((base, res)) => {
                let size = res
                    .strip_suffix("px")
                    .and_then(|px| px.parse::<i64>().ok())
                    .ok_or_else(|| Error::UnsupportedModel(name.to_string()))?;
                (base, Some(size))
            }
            None => (name, None),
        };
        let (default_size, embed_dim) = match base {
            "ViT-B/32" | "ViT-B/16" | "RN101" => (224, 512),
            "ViT-L/14" => (224, 768),
            "RN50" => (224, 1024),
            "RN50x4" => (288, 640),
            "RN50x16" => (384, 768),
            "RN50x64" => (448, 1024),
            _ => return Err(Error::UnsupportedModel(name.to_string())),
        };
        Ok(Self { image_size: image_size.unwrap_or(default_size), embed_dim })
    }
}

/// A TorchScript CLIP model exposing `encode_text` and `encode_image`
/// methods, such as the jit exports of the OpenAI models.
pub struct ScriptedClip {
    name: String,
    module: CModule,
    tokenizer: Tokenizer,
    arch: ClipArch,
    device: Device,
}

impl ScriptedClip {
    /// Loads the jit export of the model called `name`, the input resolution
    /// and embedding width follow from the name.
    pub fn load<P: AsRef<std::path::Path>>(
        name: &str,
        path: P,
        tokenizer: Tokenizer,
        device: Device,
    ) -> Result<Self> {
        let arch = ClipArch::from_name(name)?;
        let module = CModule::load_on_device(path, device)?;
        Ok(Self { name: name.to_string(), module, tokenizer, arch, device })
    }

    pub fn arch(&self) -> ClipArch {
        self.arch
    }
}

impl Perceptor for ScriptedClip {
    fn name(&self) -> &str {
        &self.name
    }

    fn image_size(&self) -> i64 {
        self.arch.image_size
    }

    fn embed_text(&self, text: &str) -> Result<Tensor> {
        let tokens: Vec<i64> = self.tokenizer.encode(text)?.into_iter().map(|t| t as i64).collect();
        let tokens = Tensor::from_slice(&tokens).view([1, -1]).to_device(self.device);
        let embed = tch::no_grad(|| self.module.method_ts("encode_text", &[tokens]))?;
        Ok(norm1(&embed.to_kind(Kind::Float).squeeze_dim(0)))
    }

    fn embed_cutouts(&self, cutouts: &Tensor) -> Result<Tensor> {
        let embeds = self.module.method_ts("encode_image", &[cutouts.to_device(self.device)])?;
        Ok(embeds.to_kind(Kind::Float))
    }
}
