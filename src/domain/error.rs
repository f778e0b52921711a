// ============================================================
// Layer 3 — Domain Errors
// ============================================================
// Typed failures the caller may want to match on. Everything
// else travels as anyhow::Error with context attached.

use thiserror::Error;

use crate::domain::batch::Split;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Seq2SeqError {
    /// Perplexity or a metric was requested over zero batches
    #[error("no batches were evaluated on the '{split}' split; perplexity is undefined")]
    EmptySplit { split: Split },

    /// Shapes or lengths in a batch disagree with each other
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// Model hyper-parameters that cannot build a working model
    #[error("invalid model config: {0}")]
    InvalidConfig(String),

    /// A checkpoint could not be found or decoded
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}
