// CLIP guided diffusion, sampling images that match text prompts.
//
// The diffusion model and the CLIP perceptors are TorchScript modules. The
// diffusion module takes the noisy images and the timesteps and returns the
// model output (v or eps depending on the model). Each CLIP module exposes
// `encode_text` and `encode_image` methods, e.g. for the OpenAI models:
//
//   import clip, torch
//   model, _ = clip.load("ViT-B/32", jit=True)
//   model.save("data/vit-b-32.pt")
//
// The BPE vocabulary file can be downloaded with:
//
// mkdir -p data && cd data
// wget https://github.com/openai/CLIP/raw/main/clip/bpe_simple_vocab_16e6.txt.gz
// gunzip bpe_simple_vocab_16e6.txt.gz
use clap::Parser;
use guided_diffusion::{
    config::RunConfig,
    models::{
        aesthetic::{build_aesthetic, AestheticMode, AestheticScorer},
        DiffusionModel, ModelAdapter,
    },
    pipelines::{clip_guided::expand_prompts, ClipGuidedPipeline, Components},
    transformers::{ClipArch, Perceptor, ScriptedClip, Tokenizer, TokenizerConfig},
    utils::{DeviceSetup, Prng, PrngKey},
};
use std::rc::Rc;
use tch::{Device, Kind, Tensor};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const GRID_WIDTH: i64 = 2;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A JSON run configuration, missing fields take their default values.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// The prompts, one per sample, overriding the configuration.
    #[arg(long)]
    prompt: Vec<String>,

    /// The random seed, overriding the configuration.
    #[arg(long)]
    seed: Option<u64>,

    /// The number of sampling steps, overriding the configuration.
    #[arg(long)]
    steps: Option<usize>,

    /// When set, use the CPU for the listed devices, can be 'all', 'model', 'clip'.
    /// Multiple values can be set.
    #[arg(long)]
    cpu: Vec<String>,

    /// The diffusion model, a TorchScript file.
    #[arg(long, value_name = "FILE", default_value = "data/pixelartv6.pt")]
    model_weights: String,

    /// The directory holding the CLIP TorchScript files, ViT-B/32 is read
    /// from vit-b-32.pt.
    #[arg(long, value_name = "DIR", default_value = "data")]
    clip_dir: String,

    /// The BPE vocabulary used by the CLIP tokenizer.
    #[arg(long, value_name = "FILE", default_value = "data/bpe_simple_vocab_16e6.txt")]
    bpe_vocab: String,

    /// The aesthetic head weight file, in .ot format.
    #[arg(long, value_name = "FILE")]
    aesthetic_weights: Option<String>,

    /// An image the sampling starts from.
    #[arg(long, value_name = "FILE")]
    init_image: Option<String>,

    /// Where progress grids and samples are written.
    #[arg(long, value_name = "DIR", default_value = "samples")]
    output_dir: String,
}

fn clip_file(clip_dir: &str, name: &str) -> std::path::PathBuf {
    let file = format!("{}.pt", name.to_lowercase().replace('/', "-"));
    std::path::Path::new(clip_dir).join(file)
}

fn sanitize(title: &str) -> String {
    title.chars().take(100).map(|c| if c == '/' || c == '\\' { '_' } else { c }).collect()
}

fn image_preprocess<T: AsRef<std::path::Path>>(
    path: T,
    width: i64,
    height: i64,
) -> anyhow::Result<Tensor> {
    let image = tch::vision::image::load(path)?;
    let image = tch::vision::image::resize(&image, width, height)?;
    Ok((image.to_kind(Kind::Float) / 255. * 2. - 1.).unsqueeze(0))
}

/// Converts `[-1, 1]` images to bytes.
fn to_image(images: &Tensor) -> Tensor {
    let images = ((images + 1.) / 2.).clamp(0., 1.).to_device(Device::Cpu);
    (images * 255.).to_kind(Kind::Uint8)
}

/// Tiles a `[n, c, h, w]` batch into a single `[c, rows h, GRID_WIDTH w]` image.
fn make_grid(images: &Tensor) -> anyhow::Result<Tensor> {
    let (n, c, h, w) = images.size4()?;
    let cols = GRID_WIDTH.min(n);
    let rows = (n + cols - 1) / cols;
    let padding = Tensor::zeros([rows * cols - n, c, h, w], (images.kind(), images.device()));
    let grid = Tensor::cat(&[images, &padding], 0)
        .view([rows, cols, c, h, w])
        .permute([2, 0, 3, 1, 4])
        .reshape([c, rows * h, cols * w]);
    Ok(grid)
}

fn save_grid(images: &Tensor, path: &str) -> anyhow::Result<()> {
    tch::vision::image::save(&to_image(&make_grid(images)?), path)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tch::maybe_init_cuda();

    let mut config = match &args.config {
        Some(path) => RunConfig::from_json_file(path)?,
        None => RunConfig::default(),
    };
    if !args.prompt.is_empty() {
        config.prompts = args.prompt.clone();
    }
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    let seed = match args.seed.or(config.seed) {
        Some(seed) => seed,
        None => std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_secs(),
    };
    config.seed = Some(seed);
    let config = config.validate()?;
    tracing::info!(seed, model = %config.model, "starting run");

    let devices = DeviceSetup::new(args.cpu.clone());
    let model_device = devices.get("model");
    let clip_device = devices.get("clip");

    tracing::info!("loading the diffusion model");
    let backbone = tch::CModule::load_on_device(&args.model_weights, model_device)?;
    let kind = config.model;
    let model: Rc<dyn DiffusionModel> =
        Rc::new(ModelAdapter::new(backbone, kind.objective(), kind.schedule(), kind.timescale()));

    let mut perceptors: Vec<Rc<dyn Perceptor>> = vec![];
    for name in config.clips.iter() {
        tracing::info!(%name, "loading perceptor");
        let tokenizer = Tokenizer::create(&args.bpe_vocab, TokenizerConfig::default())?;
        let path = clip_file(&args.clip_dir, name);
        let clip = ScriptedClip::load(name, path, tokenizer, clip_device)?;
        perceptors.push(Rc::new(clip));
    }
    let aesthetic = match &args.aesthetic_weights {
        Some(weights) if config.aesthetic_loss_scale > 0. => {
            let embed_dim = ClipArch::from_name(&config.aesthetic_clip)?.embed_dim;
            let head = build_aesthetic(weights, embed_dim, AestheticMode::Expected, model_device)?;
            Some(Rc::new(head) as Rc<dyn AestheticScorer>)
        }
        _ => None,
    };
    let init = match &args.init_image {
        Some(path) => Some(image_preprocess(path, config.width, config.height)?),
        None => None,
    };
    let titles = expand_prompts(&config.prompts, config.batch_size as usize);
    let (n_batches, save_every, steps) = (config.n_batches, config.save_every.max(1), config.steps);
    let components = Components { perceptors, aesthetic, init, cond_model: None };
    let pipeline = ClipGuidedPipeline::new(config, model, components, model_device)?;

    std::fs::create_dir_all(format!("{}/grid", args.output_dir))?;
    std::fs::create_dir_all(format!("{}/images", args.output_dir))?;
    let mut rng = Prng::new(PrngKey::new(seed));
    for batch in 0..n_batches {
        let images = pipeline.run_batch(batch, rng.split(), |out| {
            if out.step % save_every == 0 || out.step + 1 == steps {
                let path = format!("{}/progress_{batch}_{:05}.png", args.output_dir, out.step);
                if let Err(err) = save_grid(&out.pred, &path) {
                    tracing::warn!(?err, %path, "cannot save progress");
                }
            }
            Ok(())
        })?;
        let prefix = format!("{seed}_{batch}");
        save_grid(&images, &format!("{}/grid/{prefix}.png", args.output_dir))?;
        for (k, title) in titles.iter().enumerate() {
            let path = format!("{}/images/{prefix}_{k}_{}.png", args.output_dir, sanitize(title));
            tch::vision::image::save(&to_image(&images.get(k as i64)), &path)?;
            tracing::info!(%path, "saved sample");
        }
    }
    Ok(())
}
