// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Two independent checkpoint lineages under the model directory:
//
//   <model_dir>/
//     model_config.json                  Seq2SeqConfig (architecture)
//     checkpoint_latest/
//       checkpoint_state.json            retained entries + preservation clock
//       checkpoint-00001000.mpk.gz       model weights
//       checkpoint-00001000-optim.mpk.gz optimizer moments
//       ...
//     checkpoint_best/
//       checkpoint_state.json
//       checkpoint-00003000.mpk.gz       single slot
//
// Weights and optimizer state are written with Burn's
// CompactRecorder (MessagePack + gzip). Loading fails if the
// architecture does not match the saved record.
//
// Retention is decided by RetentionPolicy, a pure function of
// the lineage state; the manager only applies its verdict to disk.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::domain::error::Seq2SeqError;
use crate::domain::trainer_state::TrainingProgress;
use crate::domain::traits::Lineage;
use crate::ml::model::Seq2SeqConfig;

pub const STATE_FILE:  &str = "checkpoint_state.json";
pub const CONFIG_FILE: &str = "model_config.json";

/// File stem for the checkpoint written at `step`.
pub fn checkpoint_stem(step: u64) -> String {
    format!("checkpoint-{step:08}")
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ─── Retention Policy ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub step:          u64,
    pub stem:          String,
    pub learning_rate: f64,
    /// Unix time of the save, in seconds.
    pub saved_at:      f64,
}

impl CheckpointEntry {
    pub fn progress(&self) -> TrainingProgress {
        TrainingProgress { global_step: self.step, learning_rate: self.learning_rate }
    }
}

/// Contents of `checkpoint_state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageState {
    /// Rolling window, oldest first.
    pub entries:           Vec<CheckpointEntry>,
    /// Entries kept forever by the preservation interval.
    pub preserved:         Vec<CheckpointEntry>,
    pub last_preserved_at: f64,
}

impl LineageState {
    pub fn new(created_at: f64) -> Self {
        Self { entries: Vec::new(), preserved: Vec::new(), last_preserved_at: created_at }
    }

    pub fn latest(&self) -> Option<&CheckpointEntry> {
        self.entries.last()
    }

    pub fn find(&self, stem: &str) -> Option<&CheckpointEntry> {
        self.entries
            .iter()
            .chain(self.preserved.iter())
            .find(|e| e.stem == stem)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    /// Size of the rolling window; 0 keeps everything.
    pub max_to_keep: usize,
    /// An entry leaving the window survives if it was saved at least
    /// this long after the last preserved one.
    pub keep_every:  Option<Duration>,
}

impl RetentionPolicy {
    /// Single slot, nothing preserved.
    pub fn single() -> Self {
        Self { max_to_keep: 1, keep_every: None }
    }

    /// Add `entry` to the lineage and return the entries whose files
    /// should be deleted.
    pub fn admit(&self, state: &mut LineageState, entry: CheckpointEntry) -> Vec<CheckpointEntry> {
        // Re-saving a stem replaces it in place; its files are overwritten.
        state.entries.retain(|e| e.stem != entry.stem);
        state.entries.push(entry);

        let mut evicted = Vec::new();
        if self.max_to_keep == 0 {
            return evicted;
        }
        while state.entries.len() > self.max_to_keep {
            let oldest = state.entries.remove(0);
            match self.keep_every {
                Some(every) if oldest.saved_at - every.as_secs_f64() >= state.last_preserved_at => {
                    state.last_preserved_at = oldest.saved_at;
                    state.preserved.push(oldest);
                }
                _ => evicted.push(oldest),
            }
        }
        evicted
    }
}

// ─── Restore Target ───────────────────────────────────────────────────────────

/// Which checkpoint to load: the newest of a lineage, or a named file stem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreTarget {
    Latest,
    Best,
    Stem(String),
}

impl FromStr for RestoreTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "latest" => RestoreTarget::Latest,
            "best"   => RestoreTarget::Best,
            other    => RestoreTarget::Stem(other.to_string()),
        })
    }
}

impl std::fmt::Display for RestoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreTarget::Latest     => write!(f, "latest"),
            RestoreTarget::Best       => write!(f, "best"),
            RestoreTarget::Stem(stem) => write!(f, "{stem}"),
        }
    }
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct CheckpointManager {
    root:   PathBuf,
    latest: RetentionPolicy,
    best:   RetentionPolicy,
}

impl CheckpointManager {
    /// Creates both lineage directories if they don't exist yet.
    pub fn new(root: impl Into<PathBuf>, latest: RetentionPolicy) -> Result<Self> {
        let root = root.into();
        let manager = Self { root, latest, best: RetentionPolicy::single() };
        for lineage in [Lineage::Latest, Lineage::Best] {
            let dir = manager.lineage_dir(lineage);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        }
        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lineage_dir(&self, lineage: Lineage) -> PathBuf {
        self.root.join(lineage.dir_name())
    }

    fn policy(&self, lineage: Lineage) -> &RetentionPolicy {
        match lineage {
            Lineage::Latest => &self.latest,
            Lineage::Best   => &self.best,
        }
    }

    /// Read a lineage's state file; a missing file is an empty lineage.
    pub fn load_state(&self, lineage: Lineage) -> Result<LineageState> {
        let path = self.lineage_dir(lineage).join(STATE_FILE);
        if !path.exists() {
            return Ok(LineageState::new(unix_now()));
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Corrupt checkpoint state '{}'", path.display()))
    }

    fn write_state(&self, lineage: Lineage, state: &LineageState) -> Result<()> {
        let path = self.lineage_dir(lineage).join(STATE_FILE);
        fs::write(&path, serde_json::to_string_pretty(state)?)
            .with_context(|| format!("Cannot write '{}'", path.display()))
    }

    /// Write model and optimizer state for `progress.global_step` into
    /// `lineage`, then prune whatever the retention policy evicts.
    pub fn save<B, M, O>(
        &self,
        lineage:  Lineage,
        model:    &M,
        optim:    &O,
        progress: TrainingProgress,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let dir  = self.lineage_dir(lineage);
        let stem = checkpoint_stem(progress.global_step);
        let recorder = CompactRecorder::new();

        Recorder::<B>::record(&recorder, model.clone().into_record(), dir.join(&stem))
            .with_context(|| format!("Failed to save {lineage} checkpoint '{stem}'"))?;
        Recorder::<B>::record(&recorder, optim.to_record(), dir.join(format!("{stem}-optim")))
            .with_context(|| format!("Failed to save optimizer state for '{stem}'"))?;

        let mut state = self.load_state(lineage)?;
        let entry = CheckpointEntry {
            step:          progress.global_step,
            stem:          stem.clone(),
            learning_rate: progress.learning_rate,
            saved_at:      unix_now(),
        };
        let evicted = self.policy(lineage).admit(&mut state, entry);
        self.write_state(lineage, &state)?;

        for old in &evicted {
            self.delete_files(lineage, &old.stem);
        }
        tracing::debug!("Saved {} checkpoint '{}'", lineage, stem);
        Ok(())
    }

    /// Resolve `target` to a checkpoint entry and the directory holding it.
    pub fn resolve(&self, target: &RestoreTarget) -> Result<Option<(Lineage, CheckpointEntry)>> {
        match target {
            RestoreTarget::Latest => Ok(self
                .load_state(Lineage::Latest)?
                .latest()
                .cloned()
                .map(|e| (Lineage::Latest, e))),
            RestoreTarget::Best => Ok(self
                .load_state(Lineage::Best)?
                .latest()
                .cloned()
                .map(|e| (Lineage::Best, e))),
            RestoreTarget::Stem(stem) => {
                for lineage in [Lineage::Latest, Lineage::Best] {
                    if let Some(entry) = self.load_state(lineage)?.find(stem) {
                        return Ok(Some((lineage, entry.clone())));
                    }
                }
                Err(Seq2SeqError::Checkpoint(format!("no checkpoint named '{stem}'")).into())
            }
        }
    }

    /// Load model and optimizer state from `target`. When the lineage is
    /// empty both are handed back untouched with no progress.
    pub fn load<B, M, O>(
        &self,
        target: &RestoreTarget,
        model:  M,
        optim:  O,
        device: &B::Device,
    ) -> Result<(M, O, Option<TrainingProgress>)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let Some((lineage, entry)) = self.resolve(target)? else {
            return Ok((model, optim, None));
        };
        let dir = self.lineage_dir(lineage);
        let recorder = CompactRecorder::new();

        let record = Recorder::<B>::load(&recorder, dir.join(&entry.stem), device)
            .with_context(|| format!("Cannot load checkpoint '{}'", entry.stem))?;
        let optim_record = Recorder::<B>::load(&recorder, dir.join(format!("{}-optim", entry.stem)), device)
            .with_context(|| format!("Cannot load optimizer state for '{}'", entry.stem))?;

        tracing::info!("Restored {} checkpoint '{}'", lineage, entry.stem);
        Ok((model.load_record(record), optim.load_record(optim_record), Some(entry.progress())))
    }

    fn delete_files(&self, lineage: Lineage, stem: &str) {
        let dir = self.lineage_dir(lineage);
        let Ok(listing) = fs::read_dir(&dir) else {
            return;
        };
        let optim_prefix = format!("{stem}-optim.");
        let model_prefix = format!("{stem}.");
        for file in listing.flatten() {
            let name = file.file_name().to_string_lossy().into_owned();
            if name.starts_with(&model_prefix) || name.starts_with(&optim_prefix) {
                match fs::remove_file(file.path()) {
                    Ok(())   => tracing::debug!("Deleted old checkpoint file '{}'", name),
                    Err(err) => tracing::warn!("Could not delete '{}': {}", name, err),
                }
            }
        }
    }

    /// Save the model architecture so inference can rebuild it.
    pub fn save_config(&self, config: &Seq2SeqConfig) -> Result<()> {
        let path = self.root.join(CONFIG_FILE);
        config
            .save(&path)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved model config to '{}'", path.display());
        Ok(())
    }

    pub fn load_config(&self) -> Result<Seq2SeqConfig> {
        let path = self.root.join(CONFIG_FILE);
        Seq2SeqConfig::load(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. Make sure you have run 'train' before 'test'.",
                path.display()
            )
        })
    }
}
