// ============================================================
// Layer 4 — Dialogue Corpus
// ============================================================
// In-memory DataSource over three split files in a directory:
//
//   <data_dir>/train.txt
//   <data_dir>/dev.txt
//   <data_dir>/test.txt
//
// Each non-empty line holds one pair:  post <TAB> response
//
// Posts are encoded as plain ids; responses are wrapped as
// <go> .. <eos>. Both are truncated to max_sent_length words
// before wrapping. Batches are right-padded with <pad>.
//
// Every split keeps its own cursor, so evaluating dev/test in
// the middle of an epoch does not disturb train iteration.
//
// Shuffling is a Fisher-Yates permutation from a seeded StdRng,
// so a fixed seed replays the same batch order.

use anyhow::{Context, Result};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{collections::HashMap, fs, path::Path};

use crate::data::vocab::{tokenize, Vocab, EOS_ID, GO_ID, PAD_ID, UNK_ID};
use crate::domain::batch::{RawBatch, Split};
use crate::domain::traits::DataSource;

#[derive(Debug, Clone)]
pub struct CorpusConfig {
    pub min_frequency:   usize,
    pub max_vocab_size:  usize,
    pub max_sent_length: usize,
    pub seed:            u64,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            min_frequency:   1,
            max_vocab_size:  20_000,
            max_sent_length: 50,
            seed:            42,
        }
    }
}

/// One encoded dialogue pair.
#[derive(Debug, Clone, PartialEq)]
struct Pair {
    post: Vec<u32>,
    resp: Vec<u32>,
}

#[derive(Debug, Default)]
struct SplitState {
    pairs:      Vec<Pair>,
    order:      Vec<usize>,
    cursor:     usize,
    batch_size: usize,
}

pub struct Corpus {
    vocab:  Vocab,
    splits: HashMap<Split, SplitState>,
    rng:    StdRng,
}

impl Corpus {
    /// Read the three split files and build the vocabulary from train.
    pub fn load(data_dir: &Path, cfg: &CorpusConfig) -> Result<Self> {
        let raw = read_splits(data_dir)?;
        let train_words: Vec<Vec<String>> = raw[&Split::Train]
            .iter()
            .flat_map(|(p, r)| [tokenize(p), tokenize(r)])
            .collect();
        let vocab = Vocab::build(
            train_words.iter().map(Vec::as_slice),
            cfg.min_frequency,
            cfg.max_vocab_size,
        );
        tracing::info!("Built vocabulary of {} words from the train split", vocab.len());
        Ok(Self::from_raw(vocab, raw, cfg))
    }

    /// Read the split files, encoding them with an existing vocabulary.
    pub fn load_with_vocab(data_dir: &Path, vocab: Vocab, cfg: &CorpusConfig) -> Result<Self> {
        let raw = read_splits(data_dir)?;
        Ok(Self::from_raw(vocab, raw, cfg))
    }

    pub fn from_pairs(
        vocab: Vocab,
        pairs: HashMap<Split, Vec<(String, String)>>,
        cfg:   &CorpusConfig,
    ) -> Self {
        Self::from_raw(vocab, pairs, cfg)
    }

    fn from_raw(
        vocab: Vocab,
        raw:   HashMap<Split, Vec<(String, String)>>,
        cfg:   &CorpusConfig,
    ) -> Self {
        let max_len = cfg.max_sent_length;
        let mut splits = HashMap::new();
        for split in Split::all() {
            let pairs: Vec<Pair> = raw
                .get(&split)
                .map(|lines| {
                    lines
                        .iter()
                        .map(|(p, r)| encode_pair(&vocab, p, r, max_len))
                        .collect()
                })
                .unwrap_or_default();
            tracing::info!("{} split: {} pairs", split, pairs.len());
            let order = (0..pairs.len()).collect();
            splits.insert(split, SplitState { pairs, order, cursor: 0, batch_size: 1 });
        }
        Self { vocab, splits, rng: StdRng::seed_from_u64(cfg.seed) }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn split_len(&self, split: Split) -> usize {
        self.splits.get(&split).map_or(0, |s| s.pairs.len())
    }
}

impl DataSource for Corpus {
    fn restart(&mut self, split: Split, batch_size: usize, shuffle: bool) {
        let state = self.splits.entry(split).or_default();
        state.batch_size = batch_size.max(1);
        state.cursor     = 0;
        state.order      = (0..state.pairs.len()).collect();
        if shuffle {
            state.order.shuffle(&mut self.rng);
        }
    }

    fn get_next_batch(&mut self, split: Split) -> Option<RawBatch> {
        let state = self.splits.get_mut(&split)?;
        if state.cursor >= state.order.len() {
            return None;
        }
        let end = (state.cursor + state.batch_size).min(state.order.len());
        let pairs: Vec<&Pair> = state.order[state.cursor..end]
            .iter()
            .map(|&i| &state.pairs[i])
            .collect();
        state.cursor = end;
        Some(pad_batch(&pairs))
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn go_id(&self) -> u32 {
        GO_ID
    }

    fn eos_id(&self) -> u32 {
        EOS_ID
    }

    fn unk_id(&self) -> u32 {
        UNK_ID
    }

    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        self.vocab.convert_ids_to_tokens(ids)
    }
}

fn read_splits(data_dir: &Path) -> Result<HashMap<Split, Vec<(String, String)>>> {
    let mut raw = HashMap::new();
    for split in Split::all() {
        let path = data_dir.join(format!("{split}.txt"));
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        let mut pairs = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (post, resp) = line.split_once('\t').with_context(|| {
                format!("{}:{}: expected 'post<TAB>response'", path.display(), lineno + 1)
            })?;
            pairs.push((post.to_string(), resp.to_string()));
        }
        raw.insert(split, pairs);
    }
    Ok(raw)
}

fn encode_pair(vocab: &Vocab, post: &str, resp: &str, max_len: usize) -> Pair {
    let mut post_ids = vocab.encode(&tokenize(post));
    post_ids.truncate(max_len);
    if post_ids.is_empty() {
        post_ids.push(UNK_ID);
    }

    let mut body = vocab.encode(&tokenize(resp));
    body.truncate(max_len);
    let mut resp_ids = Vec::with_capacity(body.len() + 2);
    resp_ids.push(GO_ID);
    resp_ids.extend(body);
    resp_ids.push(EOS_ID);

    Pair { post: post_ids, resp: resp_ids }
}

fn pad_batch(pairs: &[&Pair]) -> RawBatch {
    let post_width = pairs.iter().map(|p| p.post.len()).max().unwrap_or(0);
    let resp_width = pairs.iter().map(|p| p.resp.len()).max().unwrap_or(0);

    let pad = |ids: &[u32], width: usize| {
        let mut row = ids.to_vec();
        row.resize(width, PAD_ID);
        row
    };

    let post: Vec<Vec<u32>> = pairs.iter().map(|p| pad(&p.post, post_width)).collect();
    let resp: Vec<Vec<u32>> = pairs.iter().map(|p| pad(&p.resp, resp_width)).collect();

    RawBatch {
        post_length:    pairs.iter().map(|p| p.post.len()).collect(),
        resp_length:    pairs.iter().map(|p| p.resp.len()).collect(),
        post_allvocabs: post.clone(),
        resp_allvocabs: resp.clone(),
        post,
        resp,
    }
}
