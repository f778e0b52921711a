// ============================================================
// Layer 3 — Trainer State
// ============================================================
// Everything the training loop mutates between steps lives here
// and is passed explicitly through the loop:
//
//   learning_rate    decayed multiplicatively on loss regressions
//   global_step      one increment per optimizer update
//   loss_step        per-step average loss over the current interval
//   time_step        per-step average wall time over the interval
//   previous_losses  last 5 interval loss sums (decay decision)
//   best_valid       lowest validation loss seen so far
//
// No tensors and no I/O, so the decay / best-checkpoint policy is
// unit tested directly.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::batch::Split;
use crate::domain::error::Seq2SeqError;

/// Number of interval losses the decay decision looks back over.
pub const LOSS_HISTORY: usize = 5;

/// Sentinel for "nothing recorded yet".
const UNSEEN_LOSS: f64 = 1e18;

/// The part of the state persisted alongside each checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    pub global_step:   u64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerState {
    pub learning_rate:   f64,
    pub global_step:     u64,
    pub loss_step:       f64,
    pub time_step:       f64,
    pub previous_losses: VecDeque<f64>,
    pub best_valid:      f64,
}

impl TrainerState {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            global_step:     0,
            loss_step:       0.0,
            time_step:       0.0,
            previous_losses: VecDeque::from(vec![UNSEEN_LOSS; LOSS_HISTORY]),
            best_valid:      UNSEEN_LOSS,
        }
    }

    /// Pick up step counter and learning rate from a restored checkpoint.
    pub fn resume(progress: TrainingProgress) -> Self {
        let mut state = Self::new(progress.learning_rate);
        state.global_step = progress.global_step;
        state
    }

    pub fn progress(&self) -> TrainingProgress {
        TrainingProgress {
            global_step:   self.global_step,
            learning_rate: self.learning_rate,
        }
    }

    /// True when the step counter sits on a non-zero multiple of `interval`.
    pub fn at_checkpoint_boundary(&self, interval: u64) -> bool {
        interval > 0 && self.global_step != 0 && self.global_step % interval == 0
    }

    /// Record one finished optimizer update.
    ///
    /// Loss and time are amortised over the interval so that at the
    /// boundary the accumulators hold per-step averages.
    pub fn record_step(&mut self, loss: f64, elapsed: Duration, interval: u64) {
        let interval = interval.max(1) as f64;
        self.loss_step  += loss / interval;
        self.time_step  += elapsed.as_secs_f64() / interval;
        self.global_step += 1;
    }

    /// Current interval loss exceeds every one of the last five recorded.
    pub fn should_decay(&self) -> bool {
        let worst = self
            .previous_losses
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        self.loss_step > worst
    }

    pub fn decay_learning_rate(&mut self, factor: f64) {
        self.learning_rate *= factor;
    }

    /// Track the best validation loss; true only on strict improvement.
    pub fn observe_validation(&mut self, dev_loss: f64) -> bool {
        if dev_loss < self.best_valid {
            self.best_valid = dev_loss;
            true
        } else {
            false
        }
    }

    /// Slide the loss window and reset the interval accumulators.
    pub fn close_interval(&mut self) {
        self.previous_losses.pop_front();
        self.previous_losses.push_back(self.loss_step);
        self.loss_step = 0.0;
        self.time_step = 0.0;
    }

    pub fn train_perplexity(&self) -> f64 {
        self.loss_step.exp()
    }
}

/// exp(mean loss) over `batches` evaluated batches.
///
/// Zero batches is reported as an error rather than a NaN perplexity.
pub fn perplexity(loss_sum: f64, batches: usize, split: Split) -> Result<f64, Seq2SeqError> {
    mean_loss(loss_sum, batches, split).map(f64::exp)
}

pub fn mean_loss(loss_sum: f64, batches: usize, split: Split) -> Result<f64, Seq2SeqError> {
    if batches == 0 {
        return Err(Seq2SeqError::EmptySplit { split });
    }
    Ok(loss_sum / batches as f64)
}
