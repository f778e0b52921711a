// ============================================================
// Layer 4 — Vocabulary
// ============================================================
// Word-level vocabulary built from the training split.
//
// Reserved ids (fixed, in this order):
//   0 <pad>   padding
//   1 <unk>   out-of-vocabulary words
//   2 <go>    decoder start token
//   3 <eos>   end of sentence
//
// Generation never emits ids 0 and 1 (see ml::model). Remaining
// words are ordered by descending frequency, ties broken
// alphabetically so the same corpus always yields the same ids.
//
// The vocabulary is persisted next to the checkpoints so that
// the `test` command rebuilds exactly the ids used in training.

use anyhow::{Context, Result};
use std::{collections::HashMap, fs, path::Path};

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const GO_ID:  u32 = 2;
pub const EOS_ID: u32 = 3;

const SPECIAL_TOKENS: [&str; 4] = ["<pad>", "<unk>", "<go>", "<eos>"];

/// Split a sentence into lowercase whitespace-separated words.
pub fn tokenize(sentence: &str) -> Vec<String> {
    sentence
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vocab {
    tokens: Vec<String>,
    index:  HashMap<String, u32>,
}

impl Vocab {
    /// Build from tokenised sentences, keeping words seen at least
    /// `min_frequency` times, capped at `max_size` entries in total.
    pub fn build<'a, I>(sentences: I, min_frequency: usize, max_size: usize) -> Self
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for sentence in sentences {
            for word in sentence {
                *counts.entry(word.as_str()).or_default() += 1;
            }
        }

        let mut words: Vec<(&str, usize)> = counts
            .into_iter()
            .filter(|(w, c)| *c >= min_frequency && !SPECIAL_TOKENS.contains(w))
            .collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let capacity = max_size.saturating_sub(SPECIAL_TOKENS.len());
        let tokens = SPECIAL_TOKENS
            .iter()
            .map(|s| s.to_string())
            .chain(words.into_iter().take(capacity).map(|(w, _)| w.to_string()))
            .collect();
        Self::from_tokens(tokens)
    }

    fn from_tokens(tokens: Vec<String>) -> Self {
        let index = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self { tokens, index }
    }

    /// Never zero: the reserved tokens are always present.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn id(&self, word: &str) -> u32 {
        self.index.get(word).copied().unwrap_or(UNK_ID)
    }

    pub fn encode(&self, words: &[String]) -> Vec<u32> {
        words.iter().map(|w| self.id(w)).collect()
    }

    pub fn token(&self, id: u32) -> &str {
        self.tokens
            .get(id as usize)
            .map_or(SPECIAL_TOKENS[UNK_ID as usize], String::as_str)
    }

    pub fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter().map(|&id| self.token(id).to_string()).collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.tokens)?;
        fs::write(path, json)
            .with_context(|| format!("Cannot write vocabulary to '{}'", path.display()))?;
        tracing::debug!("Saved vocabulary ({} words) to '{}'", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).with_context(|| {
            format!(
                "Cannot read vocabulary from '{}'. Have you run 'train' first?",
                path.display()
            )
        })?;
        let tokens: Vec<String> = serde_json::from_str(&json)?;
        anyhow::ensure!(
            tokens.len() >= SPECIAL_TOKENS.len()
                && tokens.iter().zip(SPECIAL_TOKENS).all(|(t, s)| t == s),
            "vocabulary '{}' does not start with the reserved tokens",
            path.display()
        );
        Ok(Self::from_tokens(tokens))
    }
}
