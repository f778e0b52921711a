// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// From dialog text files to device tensors:
//
//   train.txt / dev.txt / test.txt   (post<TAB>response per line)
//       │
//       ▼
//   Vocab            → frequency-sorted words, reserved ids 0..3
//       │
//       ▼
//   Corpus           → encoded pairs, padded RawBatch per split
//       │
//       ▼
//   Preprocessor     → off-by-one decoder input / target views
//       │
//       ▼
//   Seq2SeqBatcher   → Burn tensors for the model

/// Word ↔ id table with the reserved special tokens
pub mod vocab;

/// Reference DataSource over the three split files
pub mod corpus;

/// Decoder input / target / mask derivation
pub mod preprocessor;

/// RawBatch → tensor batch
pub mod batcher;
