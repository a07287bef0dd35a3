//! Token estimation for usage accounting.
//!
//! Known model families are counted exactly with the matching BPE
//! tokenizer. Unknown models, and any failure of the exact path, fall
//! back to a character heuristic. [`estimate`] never fails: usage
//! accounting must not abort the traced call.

use crate::error::{Error, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::LazyLock;
use tiktoken_rs::CoreBPE;

/// BPE tokenizer families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Cl100kBase,
    O200kBase,
    P50kBase,
    R50kBase,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::O200kBase => "o200k_base",
            Encoding::P50kBase => "p50k_base",
            Encoding::R50kBase => "r50k_base",
        }
    }

    fn encoder(self) -> Result<&'static CoreBPE> {
        let slot = match self {
            Encoding::Cl100kBase => &CL100K,
            Encoding::O200kBase => &O200K,
            Encoding::P50kBase => &P50K,
            Encoding::R50kBase => &R50K,
        };
        slot.as_ref().map_err(|e| Error::Tokenizer(e.clone()))
    }
}

type Encoder = LazyLock<std::result::Result<CoreBPE, String>>;

static CL100K: Encoder = LazyLock::new(|| tiktoken_rs::cl100k_base().map_err(|e| e.to_string()));
static O200K: Encoder = LazyLock::new(|| tiktoken_rs::o200k_base().map_err(|e| e.to_string()));
static P50K: Encoder = LazyLock::new(|| tiktoken_rs::p50k_base().map_err(|e| e.to_string()));
static R50K: Encoder = LazyLock::new(|| tiktoken_rs::r50k_base().map_err(|e| e.to_string()));

/// Model prefix → tokenizer family. Longest matching prefix wins.
const MODEL_PREFIXES: &[(&str, Encoding)] = &[
    ("gpt-4o", Encoding::O200kBase),
    ("gpt-4.1", Encoding::O200kBase),
    ("gpt-4.5", Encoding::O200kBase),
    ("chatgpt-4o", Encoding::O200kBase),
    ("o1", Encoding::O200kBase),
    ("o3", Encoding::O200kBase),
    ("o4", Encoding::O200kBase),
    ("gpt-4", Encoding::Cl100kBase),
    ("gpt-3.5-turbo", Encoding::Cl100kBase),
    ("gpt-35-turbo", Encoding::Cl100kBase),
    ("text-embedding-3", Encoding::Cl100kBase),
    ("text-embedding-ada-002", Encoding::Cl100kBase),
    ("text-davinci-002", Encoding::P50kBase),
    ("text-davinci-003", Encoding::P50kBase),
    ("code-davinci", Encoding::P50kBase),
    ("davinci", Encoding::R50kBase),
    ("curie", Encoding::R50kBase),
    ("babbage", Encoding::R50kBase),
    ("ada", Encoding::R50kBase),
];

/// Look up the tokenizer family for a model identifier.
///
/// Provider prefixes such as `openai/gpt-4o` are ignored.
pub fn encoding_for_model(model: &str) -> Option<Encoding> {
    let model = model.rsplit('/').next().unwrap_or(model).trim();
    MODEL_PREFIXES
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, encoding)| *encoding)
}

/// Count tokens exactly with the model's tokenizer.
///
/// # Errors
/// Returns [`Error::UnknownModel`] when the model has no known tokenizer and
/// [`Error::Tokenizer`] when the tokenizer cannot be loaded or fails.
pub fn estimate_exact(text: &str, model: &str) -> Result<u64> {
    let encoding =
        encoding_for_model(model).ok_or_else(|| Error::UnknownModel(model.to_string()))?;
    let bpe = encoding.encoder()?;
    panic::catch_unwind(AssertUnwindSafe(|| bpe.encode_with_special_tokens(text).len() as u64))
        .map_err(|_| Error::Tokenizer(format!("{} panicked while encoding", encoding.name())))
}

/// Cheap approximation: one token per four characters, rounded up.
pub fn estimate_heuristic(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimate the token count of `text` for `model`.
///
/// Uses the exact tokenizer when the model family is known and falls
/// back to [`estimate_heuristic`] otherwise.
pub fn estimate(text: &str, model: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match estimate_exact(text, model) {
        Ok(count) => count,
        Err(e) => {
            tracing::debug!(model, error = %e, "falling back to heuristic token estimate");
            estimate_heuristic(text)
        }
    }
}

/// Estimate prompt tokens over the JSON serialization of the prompt.
pub fn estimate_prompt<T: serde::Serialize + ?Sized>(prompt: &T, model: &str) -> u64 {
    match serde_json::to_string(prompt) {
        Ok(serialized) => estimate(&serialized, model),
        Err(e) => {
            tracing::debug!(error = %e, "prompt is not serializable, counting as zero tokens");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        assert_eq!(encoding_for_model("gpt-4o-mini"), Some(Encoding::O200kBase));
        assert_eq!(encoding_for_model("gpt-4-turbo"), Some(Encoding::Cl100kBase));
        assert_eq!(encoding_for_model("text-davinci-003"), Some(Encoding::P50kBase));
        assert_eq!(encoding_for_model("davinci"), Some(Encoding::R50kBase));
    }

    #[test]
    fn provider_prefix_is_ignored() {
        assert_eq!(encoding_for_model("openai/gpt-4o"), Some(Encoding::O200kBase));
    }

    #[test]
    fn unknown_models_have_no_encoding() {
        assert_eq!(encoding_for_model("claude-sonnet-4"), None);
        assert_eq!(encoding_for_model(""), None);
    }

    #[test]
    fn heuristic_rounds_up() {
        assert_eq!(estimate_heuristic(""), 0);
        assert_eq!(estimate_heuristic("a"), 1);
        assert_eq!(estimate_heuristic("abcd"), 1);
        assert_eq!(estimate_heuristic("abcde"), 2);
    }

    #[test]
    fn heuristic_counts_characters_not_bytes() {
        assert_eq!(estimate_heuristic("日本語です"), 2);
    }
}
