//! # Run configuration
//!
//! A run is described by a single immutable [`RunConfig`], usually loaded
//! from a JSON file where every missing field takes its default value.
//! [`RunConfig::validate`] checks the whole configuration before any model
//! is loaded so that mistakes surface before sampling starts.
use crate::error::{Error, Result};
use crate::guidance::DenoisedInput;
use crate::models::Objective;
use crate::sampler::SampleMode;
use crate::schedules::Schedule;
use serde::Deserialize;
use std::str::FromStr;

/// The diffusion models that the pipeline knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Openai,
    OpenaiFinetune,
    Wikiart256,
    Wikiart128,
    Danbooru128,
    Imagenet128,
    PixelartV4,
    PixelartV6,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::OpenaiFinetune => "openai_finetune",
            Self::Wikiart256 => "wikiart_256",
            Self::Wikiart128 => "wikiart_128",
            Self::Danbooru128 => "danbooru_128",
            Self::Imagenet128 => "imagenet_128",
            Self::PixelartV4 => "pixelartv4",
            Self::PixelartV6 => "pixelartv6",
        }
    }

    pub fn objective(&self) -> Objective {
        match self {
            Self::Openai | Self::OpenaiFinetune => Objective::Eps,
            _ => Objective::V,
        }
    }

    /// The schedule the model was trained with.
    pub fn schedule(&self) -> Schedule {
        match self {
            Self::Openai | Self::OpenaiFinetune => Schedule::Ddpm,
            _ => Schedule::Cosine,
        }
    }

    /// The OpenAI models take discrete timesteps in `[0, 1000]`.
    pub fn timescale(&self) -> f64 {
        match self {
            Self::Openai | Self::OpenaiFinetune => 1000.,
            _ => 1.,
        }
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s {
            "openai" => Self::Openai,
            "openai_finetune" => Self::OpenaiFinetune,
            "wikiart_256" => Self::Wikiart256,
            "wikiart_128" => Self::Wikiart128,
            "danbooru_128" => Self::Danbooru128,
            "imagenet_128" => Self::Imagenet128,
            "pixelartv4" => Self::PixelartV4,
            "pixelartv6" => Self::PixelartV6,
            _ => return Err(Error::UnsupportedModel(s.to_string())),
        };
        Ok(kind)
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Random wrap-around shifts applied around the denoiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wrap {
    #[default]
    None,
    /// Shifts in both directions, for seamless tiles.
    Tile,
    /// Horizontal shifts only, for panoramas.
    Panorama,
}

/// Replaces the spherical distance prompt loss by the InfoLOOB loss.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct InfoLoobConfig {
    pub inv_tau: f64,
    pub lm: f64,
}

impl Default for InfoLoobConfig {
    fn default() -> Self {
        Self { inv_tau: 30., lm: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Uses the current time when not set.
    pub seed: Option<u64>,
    pub width: i64,
    pub height: i64,
    pub batch_size: i64,
    pub n_batches: usize,
    pub model: String,
    /// One prompt per sample, cycled when there are fewer prompts than
    /// samples. A `~` in a prompt negates it.
    pub prompts: Vec<String>,
    /// The names of the perceptors used for guidance.
    pub clips: Vec<String>,
    pub clip_guidance_scale: f64,
    pub aesthetic_loss_scale: f64,
    /// The perceptor whose embeddings are fed to the aesthetic scorer.
    pub aesthetic_clip: String,
    pub info_loob: Option<InfoLoobConfig>,
    pub tv_scale: f64,
    pub range_scale: f64,
    pub blur_range_scale: f64,
    pub init_weight_mse: f64,
    pub init_mse_grey: bool,
    pub cutn: i64,
    pub cut_batches: usize,
    pub cut_pow: f64,
    pub cut_p_grey: f64,
    pub cut_p_mixgrey: Option<f64>,
    pub cut_p_flip: f64,
    /// Nearest neighbour upscaling factor applied before cutting.
    pub cut_pixelate: Option<i64>,
    /// The perceptor input resolution.
    pub cut_size: i64,
    pub sample_mode: String,
    pub eta: f64,
    pub steps: usize,
    pub starting_noise: f64,
    pub ending_noise: f64,
    pub schedule: Schedule,
    pub blur_amount: Option<f64>,
    pub cond_use: DenoisedInput,
    pub wrap: Wrap,
    pub save_every: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: None,
            width: 320,
            height: 256,
            batch_size: 4,
            n_batches: 1,
            model: "pixelartv6".to_string(),
            prompts: vec![
                "\"Memories of what happened leave me little butterflies\", by Mili".to_string()
            ],
            clips: vec!["ViT-B/32".to_string(), "ViT-B/16".to_string()],
            clip_guidance_scale: 2000.,
            aesthetic_loss_scale: 16.,
            aesthetic_clip: "ViT-B/16".to_string(),
            info_loob: None,
            tv_scale: 0.,
            range_scale: 0.,
            blur_range_scale: 0.,
            init_weight_mse: 0.,
            init_mse_grey: false,
            cutn: 8,
            cut_batches: 4,
            cut_pow: 1.,
            cut_p_grey: 0.2,
            cut_p_mixgrey: None,
            cut_p_flip: 0.5,
            cut_pixelate: Some(4),
            cut_size: 224,
            sample_mode: "ddim".to_string(),
            eta: 1.,
            steps: 250,
            starting_noise: 1.,
            ending_noise: 0.,
            schedule: Schedule::Spliced,
            blur_amount: None,
            cond_use: DenoisedInput::Pred,
            wrap: Wrap::None,
            save_every: 10,
        }
    }
}

/// A configuration that passed validation, with its parsed fields.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub config: RunConfig,
    pub model: ModelKind,
    pub sample_mode: SampleMode,
}

impl std::ops::Deref for ValidatedConfig {
    type Target = RunConfig;

    fn deref(&self) -> &RunConfig {
        &self.config
    }
}

fn check(ok: bool, field: &'static str, reason: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::invalid(field, reason))
    }
}

impl RunConfig {
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let file = crate::utils::file_open(path)?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    pub fn validate(self) -> Result<ValidatedConfig> {
        let model = self.model.parse::<ModelKind>()?;
        let sample_mode = SampleMode::from_name(&self.sample_mode, self.eta)?;
        check(self.width > 0 && self.height > 0, "width", "image sizes must be positive")?;
        check(self.batch_size > 0, "batch_size", "must be positive")?;
        check(self.steps > 0, "steps", "must be positive")?;
        check(
            (0. ..=1.).contains(&self.starting_noise),
            "starting_noise",
            "must be between 0 and 1",
        )?;
        check(
            (0. ..=1.).contains(&self.ending_noise) && self.ending_noise < self.starting_noise,
            "ending_noise",
            "must be between 0 and starting_noise",
        )?;
        check(self.cutn > 0, "cutn", "must be positive")?;
        check(self.cut_batches > 0, "cut_batches", "must be at least 1")?;
        check(self.cut_size > 0, "cut_size", "must be positive")?;
        check(self.cut_pixelate.map_or(true, |f| f >= 1), "cut_pixelate", "must be at least 1")?;
        let probabilities = [
            ("cut_p_grey", Some(self.cut_p_grey)),
            ("cut_p_flip", Some(self.cut_p_flip)),
            ("cut_p_mixgrey", self.cut_p_mixgrey),
        ];
        for (field, p) in probabilities {
            check(p.map_or(true, |p| (0. ..=1.).contains(&p)), field, "must be a probability")?;
        }
        check(self.blur_amount.map_or(true, |b| b > 0.), "blur_amount", "must be positive")?;
        let guided = self.clip_guidance_scale > 0. || self.aesthetic_loss_scale > 0.;
        if guided && self.clips.is_empty() {
            return Err(Error::EmptyGuidance { field: "clips".to_string() });
        }
        if self.clip_guidance_scale > 0. && self.prompts.is_empty() {
            return Err(Error::EmptyGuidance { field: "prompts".to_string() });
        }
        if self.info_loob.is_some() && self.prompts.len() < 2 {
            return Err(Error::invalid("info_loob", "needs at least 2 prompts"));
        }
        Ok(ValidatedConfig { config: self, model, sample_mode })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = RunConfig::default().validate().unwrap();
        assert_eq!(config.model, ModelKind::PixelartV6);
        assert_eq!(config.sample_mode, SampleMode::Ddim { eta: 1. });
        assert_eq!(config.steps, 250);
        assert_eq!(config.model.objective(), Objective::V);
    }

    #[test]
    fn model_registry() {
        for name in ["openai", "openai_finetune", "wikiart_256", "danbooru_128", "pixelartv4"] {
            assert_eq!(name.parse::<ModelKind>().unwrap().name(), name);
        }
        let openai = ModelKind::Openai;
        assert_eq!(openai.objective(), Objective::Eps);
        assert_eq!(openai.schedule(), Schedule::Ddpm);
        assert_eq!(openai.timescale(), 1000.);
    }

    #[test]
    fn unknown_model_is_rejected() {
        let config = RunConfig { model: "cc12m_1_cfg".to_string(), ..Default::default() };
        match config.validate() {
            Err(Error::UnsupportedModel(name)) => assert_eq!(name, "cc12m_1_cfg"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_fields_are_named() {
        let field = |config: RunConfig| match config.validate() {
            Err(Error::InvalidConfig { field, .. }) => field,
            other => panic!("unexpected {other:?}"),
        };
        let noise = RunConfig { starting_noise: 0.2, ending_noise: 0.5, ..Default::default() };
        assert_eq!(field(noise), "ending_noise");
        let mode = RunConfig { sample_mode: "euler".to_string(), ..Default::default() };
        assert_eq!(field(mode), "sample_mode");
        let grey = RunConfig { cut_p_mixgrey: Some(1.5), ..Default::default() };
        assert_eq!(field(grey), "cut_p_mixgrey");
        let loob = RunConfig { info_loob: Some(InfoLoobConfig::default()), ..Default::default() };
        assert_eq!(field(loob), "info_loob");
    }

    #[test]
    fn guidance_without_perceptors() {
        let config = RunConfig { clips: vec![], ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::EmptyGuidance { .. })));
        let unguided = RunConfig {
            clips: vec![],
            clip_guidance_scale: 0.,
            aesthetic_loss_scale: 0.,
            ..Default::default()
        };
        assert!(unguided.validate().is_ok());
    }

    #[test]
    fn parse_json() {
        let json = r#"{
            "seed": 42,
            "model": "wikiart_256",
            "prompts": ["a lighthouse", "~a storm"],
            "sample_mode": "plms",
            "schedule": "cosine",
            "cond_use": "x_in",
            "wrap": "panorama",
            "cut_pixelate": null,
            "info_loob": {"inv_tau": 10.0}
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.schedule, Schedule::Cosine);
        assert_eq!(config.cond_use, DenoisedInput::XIn);
        assert_eq!(config.wrap, Wrap::Panorama);
        assert_eq!(config.cut_pixelate, None);
        assert_eq!(config.info_loob, Some(InfoLoobConfig { inv_tau: 10., lm: 0.5 }));
        assert_eq!(config.width, 320);
        let config = config.validate().unwrap();
        assert_eq!(config.model, ModelKind::Wikiart256);
        assert_eq!(config.sample_mode, SampleMode::Plms);
    }
}
