// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// Coordinates the other layers for one command (train or test).
//
// Rules for this layer:
//   - No tensor code here (Layer 5)
//   - No argument parsing here (Layer 1)
//   - Only workflow coordination

// The training workflow and the shared run configuration
pub mod train_use_case;

// Perplexity + BLEU on the test split
pub mod test_use_case;
