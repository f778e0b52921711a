// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates one training run in order:
//
//   Step 1: Validate the run configuration
//   Step 2: Load the corpus, reusing a saved vocabulary  (Layer 4 - data)
//   Step 3: Save vocabulary, model config and run config (Layer 6 - infra)
//   Step 4: Build the learner and restore a checkpoint   (Layer 5 - ml)
//   Step 5: Open the summary run directory               (Layer 6 - infra)
//   Step 6: Run the training loop                        (Layer 5 - ml)

use anyhow::{Context, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    optim::AdamConfig,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}, time::Duration};

use crate::data::corpus::{Corpus, CorpusConfig};
use crate::data::vocab::Vocab;
use crate::domain::trainer_state::TrainerState;
use crate::domain::traits::DataSource;
use crate::infra::{
    checkpoint::{CheckpointManager, RestoreTarget, RetentionPolicy},
    summary::SummaryWriter,
};
use crate::ml::{
    learner::Seq2SeqLearner,
    model::{Seq2Seq, Seq2SeqConfig, RESERVED_IDS},
    trainer::{train_process, LoopConfig},
};

/// Backend used by the `train` and `test` commands.
pub type TrainBackend = Autodiff<Wgpu>;

pub const VOCAB_FILE: &str = "vocab.json";
pub const RUN_CONFIG_FILE: &str = "run_config.json";

// ─── Run Configuration ───────────────────────────────────────────────────────
// Every knob of a run. Serialisable so the settings a model was
// trained with are kept next to its checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub name:                        String,
    pub data_dir:                    PathBuf,
    pub model_dir:                   PathBuf,
    pub log_dir:                     PathBuf,
    pub out_dir:                     PathBuf,
    pub embedding_size:              usize,
    pub eh_size:                     usize,
    pub dh_size:                     usize,
    pub lr:                          f64,
    pub lr_decay:                    f64,
    pub batch_size:                  usize,
    pub epochs:                      usize,
    pub grad_clip:                   f64,
    pub checkpoint_steps:            u64,
    pub checkpoint_max_to_keep:      usize,
    pub keep_checkpoint_every_hours: f64,
    pub softmax_samples:             usize,
    pub max_sent_length:             usize,
    pub min_frequency:               usize,
    pub max_vocab_size:              usize,
    pub seed:                        u64,
    pub restore:                     RestoreTarget,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name:                        "seq2seq".to_string(),
            data_dir:                    PathBuf::from("data"),
            model_dir:                   PathBuf::from("model"),
            log_dir:                     PathBuf::from("log"),
            out_dir:                     PathBuf::from("output"),
            embedding_size:              300,
            eh_size:                     200,
            dh_size:                     200,
            lr:                          1e-3,
            lr_decay:                    0.995,
            batch_size:                  128,
            epochs:                      100,
            grad_clip:                   5.0,
            checkpoint_steps:            1000,
            checkpoint_max_to_keep:      5,
            keep_checkpoint_every_hours: 1.0,
            softmax_samples:             512,
            max_sent_length:             50,
            min_frequency:               1,
            max_vocab_size:              20_000,
            seed:                        0,
            restore:                     RestoreTarget::Latest,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_sent_length >= 1, "max_sent_length must be at least 1");
        anyhow::ensure!(self.batch_size >= 1, "batch_size must be at least 1");
        anyhow::ensure!(self.checkpoint_steps >= 1, "checkpoint_steps must be at least 1");
        anyhow::ensure!(
            self.lr > 0.0 && self.lr_decay > 0.0 && self.lr_decay <= 1.0,
            "lr must be positive and lr_decay within (0, 1]"
        );
        anyhow::ensure!(
            self.keep_checkpoint_every_hours >= 0.0,
            "keep_checkpoint_every_hours must not be negative"
        );
        Ok(())
    }

    pub fn corpus_config(&self) -> CorpusConfig {
        CorpusConfig {
            min_frequency:   self.min_frequency,
            max_vocab_size:  self.max_vocab_size,
            max_sent_length: self.max_sent_length,
            seed:            self.seed,
        }
    }

    /// Hourly preservation applies to the latest lineage only.
    pub fn latest_retention(&self) -> RetentionPolicy {
        let keep_every = (self.keep_checkpoint_every_hours > 0.0)
            .then(|| Duration::from_secs_f64(self.keep_checkpoint_every_hours * 3600.0));
        RetentionPolicy { max_to_keep: self.checkpoint_max_to_keep, keep_every }
    }

    pub fn model_config(&self, vocab_size: usize) -> Seq2SeqConfig {
        Seq2SeqConfig::new(vocab_size, self.embedding_size, self.eh_size, self.dh_size)
            .with_max_sent_length(self.max_sent_length)
            .with_softmax_samples(self.softmax_samples)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            batch_size:       self.batch_size,
            epochs:           self.epochs,
            checkpoint_steps: self.checkpoint_steps,
            lr_decay:         self.lr_decay,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Cannot write run config to '{}'", path.display()))
    }
}

/// Generation skips ids below `RESERVED_IDS`, so <unk> must sit there
/// while <go> and <eos> stay reachable above it.
pub fn check_reserved_ids(unk_id: u32, go_id: u32, eos_id: u32) -> Result<()> {
    let reserved = RESERVED_IDS as u32;
    anyhow::ensure!(
        unk_id < reserved,
        "<unk> id {unk_id} must be one of the {reserved} ids generation never emits"
    );
    anyhow::ensure!(
        go_id >= reserved && eos_id >= reserved,
        "<go> ({go_id}) and <eos> ({eos_id}) must not use the reserved ids below {reserved}"
    );
    Ok(())
}

/// Model config for `source`, taking its vocabulary size and special ids.
pub fn model_config_for(cfg: &RunConfig, source: &impl DataSource) -> Result<Seq2SeqConfig> {
    check_reserved_ids(source.unk_id(), source.go_id(), source.eos_id())?;
    Ok(cfg
        .model_config(source.vocab_size())
        .with_go_id(source.go_id() as usize)
        .with_eos_id(source.eos_id() as usize))
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: RunConfig,
}

impl TrainUseCase {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<()> {
        let cfg = &self.config;

        // ── Step 1: Validate ─────────────────────────────────────────────────
        cfg.validate()?;
        fs::create_dir_all(&cfg.model_dir).with_context(|| {
            format!("Cannot create model directory '{}'", cfg.model_dir.display())
        })?;

        // ── Step 2: Load the corpus ──────────────────────────────────────────
        // A resumed run must keep the ids its checkpoints were trained on.
        let vocab_path = cfg.model_dir.join(VOCAB_FILE);
        let mut corpus = if vocab_path.exists() {
            tracing::info!("Reusing vocabulary from '{}'", vocab_path.display());
            Corpus::load_with_vocab(&cfg.data_dir, Vocab::load(&vocab_path)?, &cfg.corpus_config())?
        } else {
            Corpus::load(&cfg.data_dir, &cfg.corpus_config())?
        };

        // ── Step 3: Persist everything the test command needs ────────────────
        corpus.vocab().save(&vocab_path)?;
        let model_config = model_config_for(cfg, &corpus)?;
        let checkpoints  = CheckpointManager::new(&cfg.model_dir, cfg.latest_retention())?;
        checkpoints.save_config(&model_config)?;
        tracing::info!(
            "Checkpoints under '{}'; training with {} softmax over {} words",
            checkpoints.root().display(),
            if model_config.uses_sampled_softmax() { "sampled" } else { "full" },
            model_config.vocab_size
        );
        cfg.save(&cfg.model_dir.join(RUN_CONFIG_FILE))?;

        // ── Step 4: Build the learner ────────────────────────────────────────
        let device = WgpuDevice::default();
        tracing::info!("Using device {:?}", device);
        let optim = AdamConfig::new()
            .with_epsilon(1e-8)
            .init::<TrainBackend, Seq2Seq<TrainBackend>>();
        let learner = Seq2SeqLearner::new(
            cfg.name.clone(),
            &model_config,
            optim,
            cfg.grad_clip,
            checkpoints,
            cfg.seed,
            device,
        )?;
        learner.model().log_parameters();
        let (mut learner, progress) = learner.restore(&cfg.restore)?;
        let mut state = match progress {
            Some(p) => TrainerState::resume(p),
            None    => TrainerState::new(cfg.lr),
        };

        // ── Step 5: Summaries ────────────────────────────────────────────────
        let summaries = SummaryWriter::create(&cfg.log_dir, &cfg.name)?;
        tracing::info!("Writing summaries to '{}'", summaries.run_dir().display());

        // ── Step 6: Train ────────────────────────────────────────────────────
        train_process(&mut learner, &mut corpus, &mut state, &summaries, &cfg.loop_config())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = RunConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.model_config(1000).softmax_samples, 512);
        assert_eq!(cfg.loop_config().checkpoint_steps, 1000);
    }

    #[test]
    fn test_zero_sentence_length_rejected() {
        let cfg = RunConfig { max_sent_length: 0, ..RunConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_reserved_id_layout() {
        assert!(check_reserved_ids(1, 2, 3).is_ok());
        assert!(check_reserved_ids(2, 3, 4).is_err());
        assert!(check_reserved_ids(1, 0, 3).is_err());
        assert!(check_reserved_ids(0, 2, 1).is_err());
    }

    #[test]
    fn test_model_config_takes_source_ids() {
        use crate::ml::trainer::tests::FakeData;
        let model = model_config_for(&RunConfig::default(), &FakeData::new(1, 1, 1)).unwrap();
        assert_eq!(model.vocab_size, 12);
        assert_eq!((model.go_id, model.eos_id), (2, 3));
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_latest_retention_hours() {
        let cfg = RunConfig { keep_checkpoint_every_hours: 0.5, ..RunConfig::default() };
        let policy = cfg.latest_retention();
        assert_eq!(policy.max_to_keep, 5);
        assert_eq!(policy.keep_every, Some(Duration::from_secs(1800)));

        let off = RunConfig { keep_checkpoint_every_hours: 0.0, ..RunConfig::default() };
        assert_eq!(off.latest_retention().keep_every, None);
    }

    #[test]
    fn test_run_config_json_roundtrip() {
        let tmp  = TempDir::new().unwrap();
        let path = tmp.path().join(RUN_CONFIG_FILE);
        let cfg  = RunConfig { restore: RestoreTarget::Best, epochs: 3, ..RunConfig::default() };
        cfg.save(&path).unwrap();
        let back: RunConfig = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.epochs, 3);
        assert_eq!(back.restore, RestoreTarget::Best);
    }
}
