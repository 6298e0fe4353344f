//! The byte-pair encoding tokenizer used by CLIP text encoders.
//!
//! https://github.com/openai/CLIP/blob/main/clip/simple_tokenizer.py
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;

const PAT: &str =
    r"<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

// The CLIP vocabulary is made of 256 bytes, 256 end of word bytes, these
// merges and the two special tokens.
const MAX_MERGES: usize = 49152 - 256 - 2;

#[derive(Debug, Clone)]
pub struct TokenizerConfig {
    /// The length token sequences are padded or truncated to.
    pub max_position_embeddings: usize,
    /// The token to use for padding, end of text when not set.
    pub pad_with: Option<String>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self { max_position_embeddings: 77, pad_with: None }
    }
}

/// Maps every byte to a printable character, printable ascii and latin-1
/// bytes map to themselves and come first.
fn bytes_to_unicode() -> Vec<(u8, char)> {
    let printable = |b: u8| (33..=126).contains(&b) || (161..=172).contains(&b) || b >= 174;
    let mut table: Vec<(u8, char)> =
        (0..=255u8).filter(|&b| printable(b)).map(|b| (b, b as char)).collect();
    let mut next = 256u32;
    for b in (0..=255u8).filter(|&b| !printable(b)) {
        table.push((b, char::from_u32(next).unwrap_or('?')));
        next += 1;
    }
    table
}

/// A tokenizer for CLIP.
pub struct Tokenizer {
    re: regex::Regex,
    encoder: HashMap<String, usize>,
    decoder: HashMap<usize, String>,
    bpe_ranks: HashMap<(String, String), usize>,
    byte_encoder: HashMap<u8, char>,
    start_of_text_token: usize,
    end_of_text_token: usize,
    config: TokenizerConfig,
}

impl Tokenizer {
    /// Creates a new CLIP tokenizer, this takes as input the path for the bpe vocabulary file.
    pub fn create<T: AsRef<std::path::Path>>(bpe_path: T, config: TokenizerConfig) -> Result<Self> {
        let bpe_file = crate::utils::file_open(bpe_path)?;
        let bpe_lines: std::io::Result<Vec<String>> =
            std::io::BufReader::new(bpe_file).lines().collect();
        let bpe_lines = bpe_lines?
            .iter()
            .skip(1)
            .take(MAX_MERGES)
            .map(|line| {
                let vs: Vec<_> = line.split_whitespace().collect();
                if vs.len() != 2 {
                    return Err(Error::Tokenizer(format!(
                        "expected two items got {} '{line}'",
                        vs.len()
                    )));
                }
                Ok((vs[0].to_string(), vs[1].to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let byte_table = bytes_to_unicode();
        let mut vocab: Vec<String> = byte_table.iter().map(|(_, c)| c.to_string()).collect();
        vocab.extend(byte_table.iter().map(|(_, c)| format!("{c}</w>")));
        vocab.extend(bpe_lines.iter().map(|(first, second)| format!("{first}{second}")));
        let start_of_text_token = vocab.len();
        vocab.push("<|startoftext|>".to_string());
        let end_of_text_token = vocab.len();
        vocab.push("<|endoftext|>".to_string());
        let encoder: HashMap<_, _> = vocab.into_iter().enumerate().map(|(i, v)| (v, i)).collect();
        let decoder: HashMap<_, _> = encoder.iter().map(|(k, v)| (*v, k.clone())).collect();
        let bpe_ranks: HashMap<_, _> =
            bpe_lines.into_iter().enumerate().map(|(i, v)| (v, i)).collect();
        let re = regex::Regex::new(PAT)?;
        Ok(Self {
            re,
            encoder,
            decoder,
            bpe_ranks,
            byte_encoder: byte_table.into_iter().collect(),
            start_of_text_token,
            end_of_text_token,
            config,
        })
    }

    fn get_pairs(word: &[String]) -> HashSet<(String, String)> {
        word.windows(2).map(|w| (w[0].clone(), w[1].clone())).collect()
    }

    fn bpe(&self, token: &str) -> Vec<usize> {
        let mut word: Vec<String> =
            token.bytes().map(|b| self.byte_encoder[&b].to_string()).collect();
        if word.is_empty() {
            return Vec::new();
        }
        let last_index = word.len() - 1;
        word[last_index] = format!("{}</w>", word[last_index]);
        while word.len() > 1 {
            let pairs = Self::get_pairs(&word);
            let best = pairs
                .iter()
                .filter_map(|p| self.bpe_ranks.get(p).map(|rank| (rank, p)))
                .min_by_key(|(rank, _)| **rank);
            let (first, second) = match best {
                None => break,
                Some((_, (first, second))) => (first, second),
            };
            let mut new_word = vec![];
            let mut index = 0;
            while index < word.len() {
                let w = &word[index];
                if index + 1 < word.len() && w == first && &word[index + 1] == second {
                    new_word.push(format!("{first}{second}"));
                    index += 2
                } else {
                    new_word.push(w.clone());
                    index += 1
                }
            }
            word = new_word
        }
        word.iter().filter_map(|x| self.encoder.get(x)).copied().collect()
    }

    /// Tokenizes `s`, padding the result to `pad_size_to` when set. Long
    /// sequences are truncated and always end with the end of text token.
    pub fn encode_pad(&self, s: &str, pad_size_to: Option<usize>) -> Result<Vec<usize>> {
        let s = s.to_lowercase();
        let mut bpe_tokens: Vec<usize> = vec![self.start_of_text_token];
        for token in self.re.find_iter(&s) {
            bpe_tokens.extend(self.bpe(token.as_str()))
        }
        if let Some(pad_size_to) = pad_size_to {
            bpe_tokens.truncate(pad_size_to.saturating_sub(1).max(1));
        }
        bpe_tokens.push(self.end_of_text_token);
        if let Some(pad_size_to) = pad_size_to {
            let pad_with = match &self.config.pad_with {
                None => self.end_of_text_token,
                Some(pad_with) => match self.encoder.get(pad_with) {
                    None => {
                        return Err(Error::Tokenizer(format!(
                            "no encoding for padding character {pad_with}"
                        )))
                    }
                    Some(v) => *v,
                },
            };
            bpe_tokens.resize(bpe_tokens.len().max(pad_size_to), pad_with);
        }
        Ok(bpe_tokens)
    }

    /// The main tokenization entry point, takes as input a string and returns the list of tokens.
    pub fn encode(&self, s: &str) -> Result<Vec<usize>> {
        self.encode_pad(s, Some(self.config.max_position_embeddings))
    }

    /// The inverse of the tokenization process, takes as input a list of tokens and returns a
    /// string that produces this tokenization.
    pub fn decode(&self, tokens: &[usize]) -> String {
        let s: String =
            tokens.iter().filter_map(|token| self.decoder.get(token)).map(|s| s.as_str()).collect();
        s.replace("</w>", " ")
    }
}
