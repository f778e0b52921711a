// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types and traits describing what the system works
// with: raw batches, splits, training progress, metric reports,
// and the collaborator contracts (data source, metrics, learner).
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only plain Rust structs, enums, and traits
//
// The training loop and the test driver are written against the
// traits in this layer, so they can be exercised with in-memory
// fakes and no tensor backend at all.

/// Raw batch contract and dataset splits
pub mod batch;

/// Typed domain errors
pub mod error;

/// Metric results (scalar and sequence valued)
pub mod report;

/// Mutable training state threaded through the loop
pub mod trainer_state;

/// Collaborator traits: DataSource, Metric, Learner
pub mod traits;
