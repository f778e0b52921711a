// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything that touches disk besides the corpus:
//
//   checkpoint.rs     latest / best lineages written with Burn's
//                     CompactRecorder, JSON retention state, and
//                     the saved Seq2SeqConfig
//
//   summary.rs        per-run CSV summaries (train / dev / test)
//
//   eval_metrics.rs   perplexity and BLEU metrics

/// Checkpoint saving, retention and restore
pub mod checkpoint;

/// CSV summary writer
pub mod summary;

/// Reference teacher-forcing and inference metrics
pub mod eval_metrics;
