// ============================================================
// Layer 5 — Seq2Seq Learner
// ============================================================
// One named model instance with everything needed to train it:
//
//   model        Seq2Seq<B> on the autodiff backend
//   optim        Adam (any burn Optimizer)
//   sampler      log-uniform candidates for sampled softmax
//   checkpoints  latest / best lineages under the model dir
//
// Gradients are taken with GradientsParams::from_grads(.., &model),
// which keeps only this model's parameters, so several learners can
// share one process without touching each other's weights.
//
// Evaluation and inference run on model.valid(), i.e. the inner
// backend without autodiff bookkeeping.

use anyhow::Result;
use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::data::batcher::Seq2SeqBatcher;
use crate::domain::batch::RawBatch;
use crate::domain::trainer_state::TrainingProgress;
use crate::domain::traits::{EvalOutput, Learner, Lineage, LogProbs, StepOutput};
use crate::infra::checkpoint::{CheckpointManager, RestoreTarget};
use crate::ml::grad_clip::clip_by_global_norm;
use crate::ml::model::{Seq2Seq, Seq2SeqConfig};
use crate::ml::projection::LogUniformSampler;

pub struct Seq2SeqLearner<B: AutodiffBackend, O> {
    name:          String,
    model:         Seq2Seq<B>,
    optim:         O,
    sampler:       LogUniformSampler,
    grad_clip:     f64,
    train_batcher: Seq2SeqBatcher<B>,
    eval_batcher:  Seq2SeqBatcher<B::InnerBackend>,
    checkpoints:   CheckpointManager,
    device:        B::Device,
}

impl<B, O> Seq2SeqLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2Seq<B>, B>,
{
    /// Build a freshly initialised model; fails on an unusable config.
    pub fn new(
        name:        impl Into<String>,
        config:      &Seq2SeqConfig,
        optim:       O,
        grad_clip:   f64,
        checkpoints: CheckpointManager,
        seed:        u64,
        device:      B::Device,
    ) -> Result<Self> {
        config.validate()?;
        let model = config.init::<B>(&device);
        Ok(Self {
            name: name.into(),
            model,
            optim,
            sampler: LogUniformSampler::new(config.vocab_size, seed),
            grad_clip,
            train_batcher: Seq2SeqBatcher::new(device.clone(), config.vocab_size),
            eval_batcher: Seq2SeqBatcher::new(device.clone(), config.vocab_size),
            checkpoints,
            device,
        })
    }

    pub fn model(&self) -> &Seq2Seq<B> {
        &self.model
    }

    /// Load weights and optimizer state from `target` if it exists.
    ///
    /// Returns the restored progress, or None when parameters stay
    /// freshly initialised.
    pub fn restore(mut self, target: &RestoreTarget) -> Result<(Self, Option<TrainingProgress>)> {
        let (model, optim, progress) = self
            .checkpoints
            .load::<B, _, _>(target, self.model.clone(), self.optim, &self.device)?;
        self.model = model;
        self.optim = optim;
        match progress {
            Some(p) => tracing::info!("Resuming '{}' at global step {}", self.name, p.global_step),
            None    => tracing::info!("No {} checkpoint for '{}'; created with fresh parameters", target, self.name),
        }
        Ok((self, progress))
    }
}

impl<B, O> Learner for Seq2SeqLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2Seq<B>, B>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn train_step(&mut self, batch: &RawBatch, learning_rate: f64) -> Result<StepOutput> {
        let batch = self.train_batcher.batch(batch)?;
        let loss  = self.model.forward_train_loss(&batch, &mut self.sampler);
        let loss_value: f64 = loss.clone().into_scalar().elem::<f64>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        let (grads, gradient_norm) = clip_by_global_norm::<B, _>(&self.model, grads, self.grad_clip);
        self.model = self.optim.step(learning_rate, self.model.clone(), grads);

        Ok(StepOutput { loss: loss_value, gradient_norm })
    }

    fn evaluate_batch(&self, batch: &RawBatch) -> Result<EvalOutput> {
        let batch = self.eval_batcher.batch(batch)?;
        let out   = self.model.valid().forward_loss(&batch);
        let [b, t, v] = out.log_probs.dims();
        let values: Vec<f32> = out.log_probs.into_data().iter::<f32>().collect();
        Ok(EvalOutput {
            loss:      out.loss.into_scalar().elem::<f64>(),
            log_probs: LogProbs::new(b, t, v, values),
        })
    }

    fn infer(&self, batch: &RawBatch) -> Result<Vec<Vec<u32>>> {
        let batch = self.eval_batcher.batch(batch)?;
        Ok(self.model.valid().infer(&batch).generation_index)
    }

    fn store_checkpoint(&self, lineage: Lineage, progress: TrainingProgress) -> Result<()> {
        self.checkpoints
            .save::<B, _, _>(lineage, &self.model, &self.optim, progress)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::tests::two_example_batch;
    use crate::infra::checkpoint::RetentionPolicy;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    const VOCAB: usize = 12;

    fn learner(
        dir: &std::path::Path,
        softmax_samples: usize,
    ) -> Seq2SeqLearner<TestBackend, impl Optimizer<Seq2Seq<TestBackend>, TestBackend>> {
        let config = Seq2SeqConfig::new(VOCAB, 6, 5, 4)
            .with_max_sent_length(5)
            .with_softmax_samples(softmax_samples);
        let checkpoints = CheckpointManager::new(dir, RetentionPolicy { max_to_keep: 2, keep_every: None }).unwrap();
        let optim = AdamConfig::new().init::<TestBackend, Seq2Seq<TestBackend>>();
        Seq2SeqLearner::new("seq2seq", &config, optim, 5.0, checkpoints, 0, Default::default()).unwrap()
    }

    #[test]
    fn test_zero_sentence_length_config_rejected() {
        let tmp    = TempDir::new().unwrap();
        let config = Seq2SeqConfig::new(VOCAB, 6, 5, 4).with_max_sent_length(0);
        let checkpoints = CheckpointManager::new(tmp.path(), RetentionPolicy { max_to_keep: 2, keep_every: None }).unwrap();
        let optim  = AdamConfig::new().init::<TestBackend, Seq2Seq<TestBackend>>();
        let built  = Seq2SeqLearner::new("seq2seq", &config, optim, 5.0, checkpoints, 0, Default::default());
        assert!(built.is_err());
    }

    #[test]
    fn test_training_reduces_loss_on_repeated_batch() {
        let tmp = TempDir::new().unwrap();
        let mut l = learner(tmp.path(), 0);
        let batch = two_example_batch();
        let before = l.evaluate_batch(&batch).unwrap().loss;
        for _ in 0..20 {
            let out = l.train_step(&batch, 1e-2).unwrap();
            assert!(out.loss.is_finite());
            assert!(out.gradient_norm > 0.0);
        }
        let after = l.evaluate_batch(&batch).unwrap().loss;
        assert!(after < before, "loss did not drop: {before} -> {after}");
    }

    #[test]
    fn test_sampled_softmax_training_step() {
        let tmp = TempDir::new().unwrap();
        let mut l = learner(tmp.path(), 4);
        let out = l.train_step(&two_example_batch(), 1e-3).unwrap();
        assert!(out.loss.is_finite() && out.loss > 0.0);
    }

    #[test]
    fn test_evaluation_shapes_and_inference() {
        let tmp = TempDir::new().unwrap();
        let l = learner(tmp.path(), 0);
        let eval = l.evaluate_batch(&two_example_batch()).unwrap();
        assert_eq!((eval.log_probs.batch, eval.log_probs.steps, eval.log_probs.vocab), (2, 4, VOCAB));
        let ids = l.infer(&two_example_batch()).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|row| !row.is_empty() && row.len() <= 5));
    }

    #[test]
    fn test_checkpoint_restore_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut l = learner(tmp.path(), 0);
        l.train_step(&two_example_batch(), 1e-2).unwrap();
        let progress = TrainingProgress { global_step: 1, learning_rate: 1e-2 };
        l.store_checkpoint(Lineage::Latest, progress).unwrap();
        l.store_checkpoint(Lineage::Best, progress).unwrap();

        let (restored, found) = learner(tmp.path(), 0).restore(&RestoreTarget::Best).unwrap();
        assert_eq!(found, Some(progress));
        assert_eq!(restored.model().num_params(), l.model().num_params());

        let fresh = TempDir::new().unwrap();
        let (_, found) = learner(fresh.path(), 0).restore(&RestoreTarget::Latest).unwrap();
        assert_eq!(found, None);
    }
}
