//! # Transformers
//!
//! Text and image embedding models used to guide the diffusion.
pub mod perceptor;
pub mod tokenizer;

pub use perceptor::{embed_prompts, normalize, ClipArch, Perceptor, ScriptedClip};
pub use tokenizer::{Tokenizer, TokenizerConfig};
