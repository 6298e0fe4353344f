//! CLIP guided sampling.
//!
//! Builds the conditioning function, the noise schedule and the initial
//! state for a validated configuration, then runs the sampler batch after
//! batch.
use crate::config::{ValidatedConfig, Wrap};
use crate::error::{Error, Result};
use crate::guidance::{
    ClipLoss, CondClip, CondFn, Condition, Cutouts, MainCondFn, MakeCutouts, MaskedMse,
};
use crate::models::aesthetic::AestheticScorer;
use crate::models::wrappers::{PanoramaModel, TilingModel};
use crate::models::DiffusionModel;
use crate::sampler::{Sampler, StepOutput};
use crate::schedules::to_alpha_sigma;
use crate::transformers::perceptor::{embed_prompts, Perceptor};
use crate::utils::PrngKey;
use std::rc::Rc;
use tch::{Device, Tensor};

/// The externally loaded pieces a run is built from.
#[derive(Default)]
pub struct Components {
    pub perceptors: Vec<Rc<dyn Perceptor>>,
    pub aesthetic: Option<Rc<dyn AestheticScorer>>,
    /// An init image in `[-1, 1]` with shape `[1 or batch_size, 3, height, width]`.
    pub init: Option<Tensor>,
    /// Denoises for the guidance gradients, the sampling model is used
    /// when not set.
    pub cond_model: Option<Rc<dyn DiffusionModel>>,
}

/// Repeats the prompts until there is one per sample.
pub fn expand_prompts(prompts: &[String], batch_size: usize) -> Vec<String> {
    prompts.iter().cycle().take(batch_size).cloned().collect()
}

/// Applies the wrap-around shifts requested by the configuration.
pub fn wrap_model(wrap: Wrap, model: Rc<dyn DiffusionModel>) -> Rc<dyn DiffusionModel> {
    match wrap {
        Wrap::None => model,
        Wrap::Tile => Rc::new(TilingModel { inner: model }),
        Wrap::Panorama => Rc::new(PanoramaModel { inner: model }),
    }
}

fn make_cutouts(config: &ValidatedConfig) -> Cutouts {
    let inner = MakeCutouts {
        cut_size: config.cut_size,
        cutn: config.cutn,
        cut_pow: config.cut_pow,
        p_grey: config.cut_p_grey,
        p_mixgrey: config.cut_p_mixgrey,
        p_flip: config.cut_p_flip,
    };
    match config.cut_pixelate {
        Some(factor) if factor > 1 => Cutouts::Pixelated { inner, factor },
        _ => Cutouts::Standard(inner),
    }
}

fn clip_condition(
    config: &ValidatedConfig,
    perceptor: &Rc<dyn Perceptor>,
    aesthetic: Option<&Rc<dyn AestheticScorer>>,
) -> Result<Option<CondClip>> {
    let mut losses = vec![];
    if config.clip_guidance_scale > 0. {
        let prompts = expand_prompts(&config.prompts, config.batch_size as usize);
        let text_embed = embed_prompts(perceptor.as_ref(), &prompts)?;
        let loss = match config.info_loob {
            Some(loob) => {
                ClipLoss::info_loob(text_embed, config.clip_guidance_scale, loob.inv_tau, loob.lm)?
            }
            None => ClipLoss::spherical_dist(text_embed, config.clip_guidance_scale),
        };
        losses.push(loss);
    }
    if config.aesthetic_loss_scale > 0. && perceptor.name() == config.aesthetic_clip {
        let scorer = aesthetic.ok_or_else(|| {
            Error::invalid("aesthetic_loss_scale", "no aesthetic scorer was provided")
        })?;
        losses.push(ClipLoss::aesthetic(scorer.clone(), config.aesthetic_loss_scale));
    }
    if losses.is_empty() {
        return Ok(None);
    }
    let cond = CondClip::new(perceptor.clone(), make_cutouts(config), config.cut_batches, losses)?;
    Ok(Some(cond))
}

/// Builds the conditioning function described by the configuration.
pub fn build_cond_fn(
    config: &ValidatedConfig,
    cond_model: Rc<dyn DiffusionModel>,
    components: &Components,
) -> Result<CondFn> {
    let mut conditions = vec![];
    for name in config.clips.iter() {
        let perceptor = components
            .perceptors
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::invalid("clips", format!("no perceptor named {name:?}")))?;
        if let Some(cond) = clip_condition(config, perceptor, components.aesthetic.as_ref())? {
            conditions.push(Condition::Clip(cond));
        }
    }
    if config.tv_scale > 0. {
        conditions.push(Condition::TotalVariation { scale: config.tv_scale });
    }
    if config.range_scale > 0. {
        conditions.push(Condition::Range { scale: config.range_scale });
    }
    if config.init_weight_mse > 0. {
        let init = components
            .init
            .as_ref()
            .ok_or_else(|| Error::invalid("init_weight_mse", "requires an init image"))?;
        let mut mse = MaskedMse::new(init.shallow_clone(), config.init_weight_mse);
        mse.grey = config.init_mse_grey;
        conditions.push(Condition::Mse(mse));
    }
    let main = CondFn::Main(MainCondFn {
        model: cond_model,
        conditions,
        blur_amount: config.blur_amount,
        use_: config.cond_use,
    });
    let cond_fn = if config.blur_range_scale > 0. {
        CondFn::Sum(vec![main, CondFn::BlurRange { scale: config.blur_range_scale }])
    } else {
        main
    };
    Ok(cond_fn)
}

pub struct ClipGuidedPipeline {
    config: ValidatedConfig,
    model: Rc<dyn DiffusionModel>,
    cond_fn: CondFn,
    init: Option<Tensor>,
    device: Device,
}

impl ClipGuidedPipeline {
    pub fn new(
        config: ValidatedConfig,
        model: Rc<dyn DiffusionModel>,
        components: Components,
        device: Device,
    ) -> Result<Self> {
        let init = match &components.init {
            None => None,
            Some(init) => {
                let (n, c, h, w) = init.size4()?;
                if c != 3 || h != config.height || w != config.width {
                    return Err(Error::invalid(
                        "init",
                        format!("expected 3x{}x{} images, got {c}x{h}x{w}", config.height, config.width),
                    ));
                }
                if n != 1 && n != config.batch_size {
                    return Err(Error::invalid("init", format!("batch of {n} init images")));
                }
                Some(init.to_device(device))
            }
        };
        let model = wrap_model(config.wrap, model);
        let cond_model = match &components.cond_model {
            Some(cond_model) => wrap_model(config.wrap, cond_model.clone()),
            None => model.clone(),
        };
        let cond_fn = build_cond_fn(&config, cond_model, &components)?.to_device(device);
        Ok(Self { config, model, cond_fn, init, device })
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn cond_fn(&self) -> &CondFn {
        &self.cond_fn
    }

    /// The cosine t values visited by the sampler.
    pub fn schedule(&self) -> Vec<f64> {
        let config = &self.config;
        config.schedule.steps(config.starting_noise, config.ending_noise, config.steps)
    }

    /// Gaussian noise, mixed with the init image at the starting noise level
    /// when there is one.
    pub fn initial_state(&self, t0: f64, key: PrngKey) -> Tensor {
        let config = &self.config;
        let shape = [config.batch_size, 3, config.height, config.width];
        let noise = key.normal(&shape, self.device);
        match &self.init {
            None => noise,
            Some(init) => {
                let (alpha, sigma) = to_alpha_sigma(t0);
                noise * sigma + init * alpha
            }
        }
    }

    /// Samples one batch, `on_step` sees every step output. Returns the
    /// final clean image prediction, in `[-1, 1]`.
    pub fn run_batch<F>(&self, batch: usize, key: PrngKey, mut on_step: F) -> Result<Tensor>
    where
        F: FnMut(&StepOutput) -> Result<()>,
    {
        let ts = self.schedule();
        let t0 = ts.first().copied().unwrap_or(1.);
        let (noise_key, sample_key) = key.split();
        let x = self.initial_state(t0, noise_key);
        let sampler = Sampler::new(self.model.as_ref(), &self.cond_fn, ts, self.config.sample_mode);
        tracing::info!(
            batch,
            mode = ?self.config.sample_mode,
            steps = sampler.steps(),
            structure = ?self.cond_fn.structure(),
            "starting batch"
        );
        let mut pred = None;
        for out in sampler.sample(x, sample_key) {
            let out = out?;
            on_step(&out)?;
            pred = Some(out.pred);
        }
        pred.ok_or_else(|| Error::invalid("steps", "no sampling step was run"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::guidance::conditions::tests::PoolingPerceptor;
    use crate::guidance::Structure;
    use crate::models::DiffusionOutput;
    use crate::schedules::Schedule;
    use tch::Kind;

    /// Predicts a noise proportional to the state.
    struct Shrink;

    impl DiffusionModel for Shrink {
        fn forward(&self, x: &Tensor, cosine_t: &Tensor, _key: PrngKey) -> Result<DiffusionOutput> {
            Ok(DiffusionOutput::from_eps(x, x * 0.1, cosine_t))
        }
    }

    struct ConstScorer;

    impl AestheticScorer for ConstScorer {
        fn score(&self, embeds: &Tensor) -> Result<Tensor> {
            Ok(embeds.sum_dim_intlist(Some([-1i64].as_slice()), false, Kind::Float))
        }
    }

    fn config() -> RunConfig {
        RunConfig {
            seed: Some(0),
            width: 16,
            height: 8,
            batch_size: 2,
            prompts: vec!["a red fox".to_string(), "~a blue sky".to_string()],
            clips: vec!["pooling".to_string()],
            clip_guidance_scale: 100.,
            aesthetic_loss_scale: 0.,
            cutn: 4,
            cut_batches: 2,
            cut_size: 8,
            cut_pixelate: None,
            steps: 4,
            sample_mode: "ddim".to_string(),
            eta: 0.,
            schedule: Schedule::Cosine,
            starting_noise: 0.9,
            ending_noise: 0.1,
            ..Default::default()
        }
    }

    fn components() -> Components {
        Components {
            perceptors: vec![Rc::new(PoolingPerceptor { image_size: 8 })],
            ..Default::default()
        }
    }

    fn pipeline(config: RunConfig, components: Components) -> Result<ClipGuidedPipeline> {
        ClipGuidedPipeline::new(config.validate()?, Rc::new(Shrink), components, Device::Cpu)
    }

    #[test]
    fn prompts_cycle_over_the_batch() {
        let prompts = vec!["a".to_string(), "b".to_string()];
        assert_eq!(expand_prompts(&prompts, 5), ["a", "b", "a", "b", "a"]);
        assert_eq!(expand_prompts(&prompts, 1), ["a"]);
    }

    #[test]
    fn cond_fn_follows_the_config() {
        let config = RunConfig {
            tv_scale: 1.,
            blur_range_scale: 2.,
            aesthetic_loss_scale: 5.,
            aesthetic_clip: "pooling".to_string(),
            cut_pixelate: Some(2),
            ..config()
        };
        let components = Components { aesthetic: Some(Rc::new(ConstScorer)), ..components() };
        let pipeline = pipeline(config, components).unwrap();
        let structure = pipeline.cond_fn().structure();
        let Structure::Sum(terms) = &structure else { panic!("unexpected {structure:?}") };
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[1], Structure::BlurRange);
        let Structure::Main { conditions, blur, .. } = &terms[0] else {
            panic!("unexpected {terms:?}")
        };
        assert!(!blur);
        assert_eq!(conditions.len(), 2);
        assert!(matches!(
            &conditions[0],
            Structure::Clip { pixelate: Some(2), cut_batches: 2, losses, .. } if losses.len() == 2
        ));
        assert_eq!(conditions[1], Structure::TotalVariation);
    }

    #[test]
    fn missing_components_are_reported() {
        let config = RunConfig { clips: vec!["ViT-B/32".to_string()], ..config() };
        match pipeline(config, components()) {
            Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "clips"),
            other => panic!("unexpected {:?}", other.err()),
        }
        let config = RunConfig { init_weight_mse: 10., ..self::config() };
        match pipeline(config, components()) {
            Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "init_weight_mse"),
            other => panic!("unexpected {:?}", other.err()),
        }
        let config = RunConfig { aesthetic_loss_scale: 1., aesthetic_clip: "pooling".into(), ..self::config() };
        match pipeline(config, components()) {
            Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "aesthetic_loss_scale"),
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[test]
    fn resolution_mismatch_is_reported() {
        let config = RunConfig { cut_size: 16, ..self::config() };
        assert!(matches!(pipeline(config, components()), Err(Error::ResolutionMismatch { .. })));
    }

    #[test]
    fn init_image_sets_the_starting_point() {
        let init = Tensor::full([1, 3, 8, 16], 0.5, (Kind::Float, Device::Cpu));
        let with_init = Components { init: Some(init.shallow_clone()), ..components() };
        let guided = pipeline(config(), with_init).unwrap();
        let key = PrngKey::new(3);
        let x = guided.initial_state(0.25, key);
        let (alpha, sigma) = to_alpha_sigma(0.25);
        let noise = key.normal(&[2, 3, 8, 16], Device::Cpu);
        let expected = noise * sigma + init * alpha;
        assert_eq!(x.size(), [2, 3, 8, 16]);
        assert!(x.allclose(&expected, 1e-6, 1e-6, false));

        let bad = Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let with_bad_init = Components { init: Some(bad), ..components() };
        assert!(matches!(
            pipeline(config(), with_bad_init),
            Err(Error::InvalidConfig { field: "init", .. })
        ));
    }

    #[test]
    fn run_batch_visits_every_step() {
        let pipeline = pipeline(config(), components()).unwrap();
        assert_eq!(pipeline.schedule().len(), 5);
        let mut steps = vec![];
        let pred = pipeline
            .run_batch(0, PrngKey::new(7), |out| {
                steps.push(out.step);
                Ok(())
            })
            .unwrap();
        assert_eq!(steps, [0, 1, 2, 3]);
        assert_eq!(pred.size(), [2, 3, 8, 16]);
        assert!(pred.isfinite().all().int64_value(&[]) != 0);
        let again = pipeline.run_batch(0, PrngKey::new(7), |_| Ok(())).unwrap();
        assert!(pred.equal(&again));
    }

    #[test]
    fn callback_errors_stop_the_batch() {
        let pipeline = pipeline(config(), components()).unwrap();
        let mut calls = 0;
        let result = pipeline.run_batch(0, PrngKey::new(7), |out| {
            calls += 1;
            if out.step == 1 {
                Err(Error::invalid("save_every", "disk full"))
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }
}
