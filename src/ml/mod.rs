// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All Burn tensor code lives here.
//
//   encoder.rs      GRU over the embedded post
//   decoder.rs      GRU cell + Luong attention, teacher-forced
//                   or greedy
//   projection.rs   shared output projection, full and sampled
//                   softmax sequence losses
//   model.rs        Seq2Seq: embedding + encoder + bridge +
//                   decoder + projection
//   grad_clip.rs    global-norm gradient clipping
//   learner.rs      model + optimizer + checkpoints behind the
//                   Learner trait
//   trainer.rs      checkpoint-interval training loop
//   tester.rs       perplexity + BLEU pass over the test split

pub mod encoder;
pub mod decoder;
pub mod projection;
pub mod model;
pub mod grad_clip;
pub mod learner;
pub mod trainer;
pub mod tester;
