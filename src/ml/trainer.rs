// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Drives a Learner over a DataSource as a small state machine:
//
//   RunningStep ──(no batch left)──────────► EndOfEpoch
//        │  ▲                                   │    │
//        │  └──────(restart, shuffle)───────────┘    │ epochs done
//        │                                           ▼
//        └─(step % checkpoint_steps == 0)─►  AtCheckpointBoundary      Done
//
// At each boundary (step 0 excluded):
//   1. log epoch / step / lr / step-time / train perplexity
//   2. write the train summary and store the "latest" checkpoint
//   3. evaluate dev and test, write their summaries
//   4. decay lr if this interval's loss exceeds all of the last five
//   5. store the "best" checkpoint on strict dev improvement
//   6. slide the loss window and reset the accumulators
//
// The boundary check happens before a batch is consumed, so every
// boundary is handled exactly once. All mutable training state lives
// in TrainerState.

use anyhow::Result;
use std::time::Instant;

use crate::domain::batch::Split;
use crate::domain::trainer_state::{mean_loss, TrainerState};
use crate::domain::traits::{DataSource, Learner, Lineage};
use crate::infra::summary::{SummaryRow, SummaryWriter};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfig {
    pub batch_size:       usize,
    pub epochs:           usize,
    pub checkpoint_steps: u64,
    pub lr_decay:         f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopPhase {
    RunningStep,
    AtCheckpointBoundary,
    EndOfEpoch,
    Done,
}

/// Mean teacher-forcing loss over a whole split, iterated in order.
pub fn evaluate<L: Learner, D: DataSource>(
    learner:    &L,
    data:       &mut D,
    batch_size: usize,
    split:      Split,
) -> Result<f64> {
    data.restart(split, batch_size, false);
    let mut loss_sum = 0.0;
    let mut batches  = 0usize;
    while let Some(batch) = data.get_next_batch(split) {
        loss_sum += learner.evaluate_batch(&batch)?.loss;
        batches  += 1;
    }
    let loss = mean_loss(loss_sum, batches, split)?;
    tracing::info!("    perplexity on {} set: {:.2}", split, loss.exp());
    Ok(loss)
}

fn summary_row(state: &TrainerState, interval: u64, loss: f64) -> SummaryRow {
    SummaryRow {
        index:      state.global_step / interval.max(1),
        loss,
        perplexity: loss.exp(),
    }
}

fn checkpoint_boundary<L: Learner, D: DataSource>(
    learner:   &mut L,
    data:      &mut D,
    state:     &mut TrainerState,
    summaries: &SummaryWriter,
    cfg:       &LoopConfig,
    epoch:     usize,
) -> Result<()> {
    tracing::info!(
        "Epoch {} global step {} learning rate {:.4} step-time {:.2} perplexity [{:.2}]",
        epoch,
        state.global_step,
        state.learning_rate,
        state.time_step,
        state.train_perplexity(),
    );
    summaries.write(Split::Train, &summary_row(state, cfg.checkpoint_steps, state.loss_step))?;
    learner.store_checkpoint(Lineage::Latest, state.progress())?;

    let dev_loss = evaluate(learner, data, cfg.batch_size, Split::Dev)?;
    summaries.write(Split::Dev, &summary_row(state, cfg.checkpoint_steps, dev_loss))?;

    let test_loss = evaluate(learner, data, cfg.batch_size, Split::Test)?;
    summaries.write(Split::Test, &summary_row(state, cfg.checkpoint_steps, test_loss))?;

    if state.should_decay() {
        state.decay_learning_rate(cfg.lr_decay);
        tracing::info!("Learning rate decayed to {:.6}", state.learning_rate);
    }
    if state.observe_validation(dev_loss) {
        learner.store_checkpoint(Lineage::Best, state.progress())?;
        tracing::info!("New best dev loss {:.4} at step {}", dev_loss, state.global_step);
    }
    state.close_interval();
    Ok(())
}

/// Train for `cfg.epochs` passes over the train split.
pub fn train_process<L: Learner, D: DataSource>(
    learner:   &mut L,
    data:      &mut D,
    state:     &mut TrainerState,
    summaries: &SummaryWriter,
    cfg:       &LoopConfig,
) -> Result<()> {
    tracing::info!(
        "Training '{}' for {} epochs from global step {}",
        learner.name(),
        cfg.epochs,
        state.global_step
    );

    data.restart(Split::Train, cfg.batch_size, true);
    let mut batch = data.get_next_batch(Split::Train);
    let mut epoch = 0usize;
    let mut last_boundary: Option<u64> = None;
    let mut phase = if cfg.epochs == 0 { LoopPhase::Done } else { LoopPhase::RunningStep };

    loop {
        phase = match phase {
            LoopPhase::RunningStep => match batch.take() {
                None => LoopPhase::EndOfEpoch,
                Some(current) => {
                    if state.at_checkpoint_boundary(cfg.checkpoint_steps)
                        && last_boundary != Some(state.global_step)
                    {
                        batch = Some(current);
                        LoopPhase::AtCheckpointBoundary
                    } else {
                        let started = Instant::now();
                        let out = learner.train_step(&current, state.learning_rate)?;
                        state.record_step(out.loss, started.elapsed(), cfg.checkpoint_steps);
                        tracing::debug!(
                            "step {} loss {:.4} gradient-norm {:.4}",
                            state.global_step,
                            out.loss,
                            out.gradient_norm
                        );
                        batch = data.get_next_batch(Split::Train);
                        LoopPhase::RunningStep
                    }
                }
            },
            LoopPhase::AtCheckpointBoundary => {
                checkpoint_boundary(learner, data, state, summaries, cfg, epoch)?;
                last_boundary = Some(state.global_step);
                LoopPhase::RunningStep
            }
            LoopPhase::EndOfEpoch => {
                epoch += 1;
                if epoch >= cfg.epochs {
                    LoopPhase::Done
                } else {
                    data.restart(Split::Train, cfg.batch_size, true);
                    batch = data.get_next_batch(Split::Train);
                    LoopPhase::RunningStep
                }
            }
            LoopPhase::Done => break,
        };
    }

    tracing::info!("Training complete at global step {}", state.global_step);
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::batch::{tests::two_example_batch, RawBatch};
    use crate::domain::error::Seq2SeqError;
    use crate::domain::trainer_state::TrainingProgress;
    use crate::domain::traits::{EvalOutput, LogProbs, StepOutput};
    use std::collections::{HashMap, VecDeque};
    use tempfile::TempDir;

    /// Serves `sizes[split]` copies of the two-example batch per pass.
    pub(crate) struct FakeData {
        pub sizes:    HashMap<Split, usize>,
        pub served:   HashMap<Split, usize>,
        pub restarts: Vec<(Split, bool)>,
    }

    impl FakeData {
        pub(crate) fn new(train: usize, dev: usize, test: usize) -> Self {
            Self {
                sizes:    HashMap::from([(Split::Train, train), (Split::Dev, dev), (Split::Test, test)]),
                served:   HashMap::new(),
                restarts: Vec::new(),
            }
        }
    }

    impl DataSource for FakeData {
        fn restart(&mut self, split: Split, _batch_size: usize, shuffle: bool) {
            self.served.insert(split, 0);
            self.restarts.push((split, shuffle));
        }

        fn get_next_batch(&mut self, split: Split) -> Option<RawBatch> {
            let served = self.served.entry(split).or_insert(0);
            if *served >= self.sizes[&split] {
                return None;
            }
            *served += 1;
            Some(two_example_batch())
        }

        fn vocab_size(&self) -> usize { 12 }
        fn go_id(&self) -> u32 { 2 }
        fn eos_id(&self) -> u32 { 3 }
        fn unk_id(&self) -> u32 { 1 }

        fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
            ids.iter().map(|id| format!("w{id}")).collect()
        }
    }

    /// Scripted losses; records every update and checkpoint.
    struct FakeLearner {
        train_losses: VecDeque<f64>,
        dev_losses:   VecDeque<f64>,
        eval_calls:   usize,
        rates:        Vec<f64>,
        stored:       Vec<(Lineage, TrainingProgress)>,
    }

    impl FakeLearner {
        fn new(train_losses: &[f64], dev_losses: &[f64]) -> Self {
            Self {
                train_losses: train_losses.iter().copied().collect(),
                dev_losses:   dev_losses.iter().copied().collect(),
                eval_calls:   0,
                rates:        Vec::new(),
                stored:       Vec::new(),
            }
        }

        fn stored_steps(&self, lineage: Lineage) -> Vec<u64> {
            self.stored
                .iter()
                .filter(|(l, _)| *l == lineage)
                .map(|(_, p)| p.global_step)
                .collect()
        }
    }

    impl Learner for FakeLearner {
        fn name(&self) -> &str {
            "fake"
        }

        fn train_step(&mut self, _batch: &RawBatch, learning_rate: f64) -> Result<StepOutput> {
            self.rates.push(learning_rate);
            let loss = self.train_losses.pop_front().unwrap_or(1.0);
            Ok(StepOutput { loss, gradient_norm: 1.0 })
        }

        fn evaluate_batch(&self, _batch: &RawBatch) -> Result<EvalOutput> {
            Ok(EvalOutput { loss: 2.0, log_probs: LogProbs::new(0, 0, 0, Vec::new()) })
        }

        fn infer(&self, batch: &RawBatch) -> Result<Vec<Vec<u32>>> {
            Ok(vec![vec![5, 3]; batch.batch_size()])
        }

        fn store_checkpoint(&self, _lineage: Lineage, _progress: TrainingProgress) -> Result<()> {
            Ok(())
        }
    }

    /// Wraps FakeLearner so checkpoint calls and per-boundary dev losses
    /// can be recorded through `&self`.
    struct Recording(std::cell::RefCell<FakeLearner>);

    impl Learner for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn train_step(&mut self, batch: &RawBatch, learning_rate: f64) -> Result<StepOutput> {
            self.0.get_mut().train_step(batch, learning_rate)
        }

        fn evaluate_batch(&self, _batch: &RawBatch) -> Result<EvalOutput> {
            let mut inner = self.0.borrow_mut();
            inner.eval_calls += 1;
            // Dev is evaluated before test at every boundary: consume a
            // scripted loss on dev calls only (odd calls).
            let loss = if inner.eval_calls % 2 == 1 {
                inner.dev_losses.pop_front().unwrap_or(10.0)
            } else {
                2.0
            };
            Ok(EvalOutput { loss, log_probs: LogProbs::new(0, 0, 0, Vec::new()) })
        }

        fn infer(&self, batch: &RawBatch) -> Result<Vec<Vec<u32>>> {
            self.0.borrow().infer(batch)
        }

        fn store_checkpoint(&self, lineage: Lineage, progress: TrainingProgress) -> Result<()> {
            self.0.borrow_mut().stored.push((lineage, progress));
            Ok(())
        }
    }

    fn loop_config(epochs: usize, checkpoint_steps: u64) -> LoopConfig {
        LoopConfig { batch_size: 2, epochs, checkpoint_steps, lr_decay: 0.5 }
    }

    #[test]
    fn test_boundaries_and_epoch_restarts() {
        let tmp = TempDir::new().unwrap();
        let summaries = SummaryWriter::in_dir(tmp.path()).unwrap();
        let mut learner = Recording(std::cell::RefCell::new(FakeLearner::new(&[], &[])));
        let mut data = FakeData::new(3, 1, 1);
        let mut state = TrainerState::new(1e-3);

        train_process(&mut learner, &mut data, &mut state, &summaries, &loop_config(2, 2)).unwrap();

        assert_eq!(state.global_step, 6);
        let inner = learner.0.into_inner();
        assert_eq!(inner.rates.len(), 6);
        // Step 6 is reached with no batch left, so its boundary is never checked.
        assert_eq!(inner.stored_steps(Lineage::Latest), vec![2, 4]);

        let train_restarts: Vec<bool> = data
            .restarts
            .iter()
            .filter(|(s, _)| *s == Split::Train)
            .map(|(_, shuffle)| *shuffle)
            .collect();
        assert_eq!(train_restarts, vec![true, true]);
        assert!(data.restarts.iter().filter(|(s, _)| *s != Split::Train).all(|(_, shuffle)| !shuffle));

        let train_csv = std::fs::read_to_string(summaries.csv_path(Split::Train)).unwrap();
        assert_eq!(train_csv.lines().count(), 3);
        assert!(train_csv.lines().nth(2).unwrap().starts_with("2,"));
    }

    #[test]
    fn test_decay_and_best_checkpoint_policy() {
        let tmp = TempDir::new().unwrap();
        let summaries = SummaryWriter::in_dir(tmp.path()).unwrap();
        // Interval = 1 step: interval loss equals the step loss.
        let train = [1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 1.0];
        let dev   = [3.0, 3.0, 2.0, 2.0, 2.5, 1.0];
        let mut learner = Recording(std::cell::RefCell::new(FakeLearner::new(&train, &dev)));
        let mut data = FakeData::new(7, 1, 1);
        let mut state = TrainerState::new(1.0);

        train_process(&mut learner, &mut data, &mut state, &summaries, &loop_config(1, 1)).unwrap();

        let inner = learner.0.into_inner();
        // Only boundary 6 sees a loss (2.0) above the five before it.
        assert_eq!(inner.rates, vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.5]);
        assert_eq!(state.learning_rate, 0.5);
        // Equal dev loss (3.0 then 3.0) does not overwrite the best slot.
        assert_eq!(inner.stored_steps(Lineage::Best), vec![1, 3, 6]);
        assert_eq!(inner.stored_steps(Lineage::Latest), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(state.best_valid, 1.0);
    }

    #[test]
    fn test_empty_dev_split_fails_loudly() {
        let tmp = TempDir::new().unwrap();
        let summaries = SummaryWriter::in_dir(tmp.path()).unwrap();
        let mut learner = FakeLearner::new(&[], &[]);
        let mut data = FakeData::new(2, 0, 1);
        let mut state = TrainerState::new(1e-3);

        let err = train_process(&mut learner, &mut data, &mut state, &summaries, &loop_config(1, 1))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<Seq2SeqError>(),
            Some(&Seq2SeqError::EmptySplit { split: Split::Dev })
        );
    }

    #[test]
    fn test_evaluate_returns_mean_loss() {
        let learner = FakeLearner::new(&[], &[]);
        let mut data = FakeData::new(0, 3, 0);
        let loss = evaluate(&learner, &mut data, 2, Split::Dev).unwrap();
        assert_eq!(loss, 2.0);
        assert_eq!(data.restarts, vec![(Split::Dev, false)]);
    }

    #[test]
    fn test_zero_epochs_does_nothing() {
        let tmp = TempDir::new().unwrap();
        let summaries = SummaryWriter::in_dir(tmp.path()).unwrap();
        let mut learner = FakeLearner::new(&[], &[]);
        let mut data = FakeData::new(4, 1, 1);
        let mut state = TrainerState::new(1e-3);
        train_process(&mut learner, &mut data, &mut state, &summaries, &loop_config(0, 1)).unwrap();
        assert_eq!(state.global_step, 0);
        assert!(learner.rates.is_empty());
    }
}
