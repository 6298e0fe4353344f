//! Aesthetic scoring heads on top of perceptor image embeddings.
use crate::error::Result;
use serde::Deserialize;
use tch::{nn, nn::Module, Device, Kind, Tensor};

const RATING_BUCKETS: i64 = 10;

/// Scores normalized image embeddings, higher is better. The score has the
/// shape of the embeddings without their last dimension.
pub trait AestheticScorer {
    fn score(&self, embeds: &Tensor) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AestheticMode {
    /// A single linear output is the score.
    Regression,
    /// Softmax over the ratings 1 to 10, the score is the expected rating.
    #[default]
    Expected,
}

/// A linear head trained on rated images.
#[derive(Debug)]
pub struct AestheticHead {
    linear: nn::Linear,
    mode: AestheticMode,
}

impl AestheticHead {
    pub fn new(vs: nn::Path, embed_dim: i64, mode: AestheticMode) -> Self {
        let out_dim = match mode {
            AestheticMode::Regression => 1,
            AestheticMode::Expected => RATING_BUCKETS,
        };
        let linear = nn::linear(&vs / "linear", embed_dim, out_dim, Default::default());
        Self { linear, mode }
    }
}

impl AestheticScorer for AestheticHead {
    fn score(&self, embeds: &Tensor) -> Result<Tensor> {
        let logits = self.linear.forward(embeds);
        let score = match self.mode {
            AestheticMode::Regression => logits.squeeze_dim(-1),
            AestheticMode::Expected => {
                let ratings =
                    Tensor::arange_start(1, RATING_BUCKETS + 1, (Kind::Float, embeds.device()));
                (logits.softmax(-1, Kind::Float) * ratings).sum_dim_intlist(
                    Some([-1i64].as_slice()),
                    false,
                    Kind::Float,
                )
            }
        };
        Ok(score)
    }
}

/// Loads a frozen aesthetic head from a weight file.
pub fn build_aesthetic(
    weights: &str,
    embed_dim: i64,
    mode: AestheticMode,
    device: Device,
) -> Result<AestheticHead> {
    let mut vs = nn::VarStore::new(device);
    let head = AestheticHead::new(vs.root(), embed_dim, mode);
    vs.load(weights)?;
    vs.freeze();
    Ok(head)
}
