// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The collaborators the training loop and test driver talk to:
//
//   DataSource  → hands out padded batches per split
//                 (data::corpus::Corpus implements it)
//   Metric      → accumulate-then-close evaluation metric
//                 (infra::eval_metrics implements two)
//   Learner     → one model instance with its optimizer and
//                 checkpoints (ml::learner::Seq2SeqLearner)
//
// Nothing here mentions tensors, so ml::trainer and ml::tester
// can be driven by fakes in unit tests.

use std::fmt;

use anyhow::Result;

use crate::domain::batch::{RawBatch, Split};
use crate::domain::report::MetricReport;
use crate::domain::trainer_state::TrainingProgress;

// ─── DataSource ───────────────────────────────────────────────────────────────
/// Iterates batches of one split at a time.
pub trait DataSource {
    /// Reset iteration over `split`, optionally reshuffling it.
    fn restart(&mut self, split: Split, batch_size: usize, shuffle: bool);

    /// Next batch of `split`, or None once the split is exhausted.
    fn get_next_batch(&mut self, split: Split) -> Option<RawBatch>;

    fn vocab_size(&self) -> usize;
    fn go_id(&self) -> u32;
    fn eos_id(&self) -> u32;
    fn unk_id(&self) -> u32;

    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String>;
}

// ─── Metric ───────────────────────────────────────────────────────────────────
/// An evaluation metric fed incrementally, one batch at a time.
///
/// `close` consumes the metric, so a report can be produced once only.
pub trait Metric {
    type Input;

    fn forward(&mut self, data: &Self::Input) -> Result<()>;

    fn close(self) -> Result<MetricReport>;
}

/// Per-step log-probabilities over the vocabulary, `[batch][time][vocab]`
/// stored row-major in one flat buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct LogProbs {
    pub batch:  usize,
    pub steps:  usize,
    pub vocab:  usize,
    pub values: Vec<f32>,
}

impl LogProbs {
    pub fn new(batch: usize, steps: usize, vocab: usize, values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), batch * steps * vocab);
        Self { batch, steps, vocab, values }
    }

    pub fn at(&self, example: usize, step: usize, token: usize) -> f32 {
        self.values[(example * self.steps + step) * self.vocab + token]
    }
}

/// Input of the teacher-forcing (perplexity-style) metric.
#[derive(Debug, Clone)]
pub struct TeacherForcingBatch {
    pub resp_allvocabs: Vec<Vec<u32>>,
    pub resp_length:    Vec<usize>,
    pub gen_log_prob:   LogProbs,
}

/// Input of the reference-based generation metric.
///
/// Post and response rows are cut to their lengths, so they carry
/// no padding; responses keep their <go> and <eos>.
#[derive(Debug, Clone)]
pub struct InferenceBatch {
    pub post_allvocabs: Vec<Vec<u32>>,
    pub resp_allvocabs: Vec<Vec<u32>>,
    /// Generated ids, cut after the first end token (inclusive).
    pub gen:            Vec<Vec<u32>>,
}

// ─── Learner ──────────────────────────────────────────────────────────────────
/// The two independently retained checkpoint lineages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lineage {
    Latest,
    Best,
}

impl Lineage {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Lineage::Latest => "checkpoint_latest",
            Lineage::Best   => "checkpoint_best",
        }
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lineage::Latest => f.write_str("latest"),
            Lineage::Best   => f.write_str("best"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss:          f64,
    /// Global gradient norm measured before clipping.
    pub gradient_norm: f64,
}

#[derive(Debug, Clone)]
pub struct EvalOutput {
    pub loss:      f64,
    pub log_probs: LogProbs,
}

/// One named model instance together with its optimizer and checkpoints.
pub trait Learner {
    /// Namespace of this instance; checkpoints and summaries are keyed by it.
    fn name(&self) -> &str;

    /// Forward, backward, clip, and apply one optimizer update.
    fn train_step(&mut self, batch: &RawBatch, learning_rate: f64) -> Result<StepOutput>;

    /// Teacher-forced forward pass without touching parameters.
    fn evaluate_batch(&self, batch: &RawBatch) -> Result<EvalOutput>;

    /// Greedy decoding; one id sequence per example.
    fn infer(&self, batch: &RawBatch) -> Result<Vec<Vec<u32>>>;

    fn store_checkpoint(&self, lineage: Lineage, progress: TrainingProgress) -> Result<()>;
}
