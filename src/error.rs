//! Errors raised while configuring or running a guided diffusion.

/// The error type for this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported model {0:?}")]
    UnsupportedModel(String),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// A guidance term was requested but ended up with nothing to compute.
    #[error("no loss configured for `{field}`")]
    EmptyGuidance { field: String },

    #[error("perceptor {perceptor} expects {expected}x{expected} inputs, cutouts are {got}x{got}")]
    ResolutionMismatch { perceptor: String, expected: i64, got: i64 },

    /// The sampler state stopped being finite, `last_good_step` is the last
    /// step that produced a finite state if any.
    #[error("non-finite values after step {step} (last good step: {last_good_step:?})")]
    NonFinite { step: usize, last_good_step: Option<usize> },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig { field, reason: reason.into() }
    }
}
