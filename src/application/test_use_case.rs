// ============================================================
// Layer 2 — TestUseCase
// ============================================================
// Evaluates a trained model on the test split:
//
//   Step 1: Rebuild the corpus with the saved vocabulary (Layer 4 - data)
//   Step 2: Rebuild the model from its saved config      (Layer 6 - infra)
//   Step 3: Restore weights (a checkpoint is required)    (Layer 5 - ml)
//   Step 4: Run perplexity + BLEU and write the result   (Layer 5 - ml)

use anyhow::Result;
use burn::{backend::wgpu::WgpuDevice, optim::AdamConfig};

use crate::application::train_use_case::{check_reserved_ids, RunConfig, TrainBackend, VOCAB_FILE};
use crate::data::corpus::Corpus;
use crate::data::vocab::Vocab;
use crate::domain::batch::Split;
use crate::domain::error::Seq2SeqError;
use crate::domain::report::MetricReport;
use crate::domain::traits::DataSource;
use crate::infra::{
    checkpoint::CheckpointManager,
    eval_metrics::{BleuMetric, PerplexityMetric},
};
use crate::ml::{
    learner::Seq2SeqLearner,
    model::Seq2Seq,
    tester::{test_process, token_table},
};

pub struct TestUseCase {
    config: RunConfig,
}

impl TestUseCase {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// Returns the scalar metrics of the test run.
    pub fn execute(&self) -> Result<MetricReport> {
        let cfg = &self.config;
        cfg.validate()?;

        // ── Step 1: Corpus ───────────────────────────────────────────────────
        let vocab      = Vocab::load(&cfg.model_dir.join(VOCAB_FILE))?;
        let mut corpus = Corpus::load_with_vocab(&cfg.data_dir, vocab, &cfg.corpus_config())?;
        check_reserved_ids(corpus.unk_id(), corpus.go_id(), corpus.eos_id())?;

        // ── Step 2: Model config ─────────────────────────────────────────────
        let checkpoints  = CheckpointManager::new(&cfg.model_dir, cfg.latest_retention())?;
        let model_config = checkpoints.load_config()?;
        anyhow::ensure!(
            model_config.vocab_size == corpus.vocab_size(),
            "model was trained with {} words but the vocabulary has {}",
            model_config.vocab_size,
            corpus.vocab_size()
        );

        // ── Step 3: Restore weights ──────────────────────────────────────────
        let optim   = AdamConfig::new().init::<TrainBackend, Seq2Seq<TrainBackend>>();
        let learner = Seq2SeqLearner::new(
            cfg.name.clone(),
            &model_config,
            optim,
            cfg.grad_clip,
            checkpoints,
            cfg.seed,
            WgpuDevice::default(),
        )?;
        let (learner, progress) = learner.restore(&cfg.restore)?;
        let Some(progress) = progress else {
            return Err(Seq2SeqError::Checkpoint(format!(
                "no {} checkpoint under '{}'",
                cfg.restore,
                cfg.model_dir.display()
            ))
            .into());
        };
        tracing::info!("Testing '{}' at global step {}", cfg.name, progress.global_step);

        // ── Step 4: Metrics ──────────────────────────────────────────────────
        let forcing   = PerplexityMetric::new(Split::Test);
        let inference = BleuMetric::new(
            Split::Test,
            token_table(&corpus),
            corpus.go_id(),
            corpus.eos_id(),
        );
        let result_file = cfg.out_dir.join(format!("{}_test.txt", cfg.name));
        test_process(&learner, &mut corpus, cfg.batch_size, forcing, inference, &result_file)
    }
}
