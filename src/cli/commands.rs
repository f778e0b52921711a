// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// `train` and `test` share the corpus, model-shape and directory
// flags (RunArgs, flattened into both); `train` adds the
// optimisation and checkpointing flags.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::train_use_case::RunConfig;
use crate::infra::checkpoint::RestoreTarget;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train (or resume) a model on train.txt / dev.txt / test.txt
    Train(TrainArgs),

    /// Score a checkpoint on the test split
    Test(TestArgs),
}

/// Flags shared by both commands.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Model name, used for the summary run dir and the result file
    #[arg(long, default_value = "seq2seq")]
    pub name: String,

    /// Directory holding train.txt, dev.txt and test.txt
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Checkpoints, vocabulary and model config
    #[arg(long, default_value = "model")]
    pub model_dir: PathBuf,

    /// Summary CSVs
    #[arg(long, default_value = "log")]
    pub log_dir: PathBuf,

    /// Test result files
    #[arg(long, default_value = "output")]
    pub out_dir: PathBuf,

    #[arg(long, default_value_t = 300)]
    pub embedding_size: usize,

    /// Encoder GRU hidden size
    #[arg(long, default_value_t = 200)]
    pub eh_size: usize,

    /// Decoder GRU hidden size
    #[arg(long, default_value_t = 200)]
    pub dh_size: usize,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    /// Longer sentences are truncated; also the greedy decoding limit
    #[arg(long, default_value_t = 50)]
    pub max_sent_length: usize,

    /// Candidate count for sampled softmax; 0 or >= vocab size uses the full softmax
    #[arg(long, default_value_t = 512)]
    pub softmax_samples: usize,

    /// Words seen fewer times in train.txt map to <unk>
    #[arg(long, default_value_t = 1)]
    pub min_frequency: usize,

    #[arg(long, default_value_t = 20_000)]
    pub max_vocab_size: usize,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// `latest`, `best` or a checkpoint file stem
    #[arg(long)]
    pub restore: Option<RestoreTarget>,
}

impl RunArgs {
    fn into_config(self, default_restore: RestoreTarget) -> RunConfig {
        RunConfig {
            name:            self.name,
            data_dir:        self.data_dir,
            model_dir:       self.model_dir,
            log_dir:         self.log_dir,
            out_dir:         self.out_dir,
            embedding_size:  self.embedding_size,
            eh_size:         self.eh_size,
            dh_size:         self.dh_size,
            batch_size:      self.batch_size,
            max_sent_length: self.max_sent_length,
            softmax_samples: self.softmax_samples,
            min_frequency:   self.min_frequency,
            max_vocab_size:  self.max_vocab_size,
            seed:            self.seed,
            restore:         self.restore.unwrap_or(default_restore),
            ..RunConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,

    /// Factor applied when a train-interval loss exceeds the max of the previous five
    #[arg(long, default_value_t = 0.995)]
    pub lr_decay: f64,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    /// Global gradient norm threshold; 0 disables clipping
    #[arg(long, default_value_t = 5.0)]
    pub grad_clip: f64,

    /// Steps between evaluation / checkpoint boundaries
    #[arg(long, default_value_t = 1000)]
    pub checkpoint_steps: u64,

    #[arg(long, default_value_t = 5)]
    pub checkpoint_max_to_keep: usize,

    /// Preserve one pruned latest checkpoint per this many hours; 0 disables
    #[arg(long, default_value_t = 1.0)]
    pub keep_checkpoint_every_hours: f64,
}

impl From<TrainArgs> for RunConfig {
    fn from(a: TrainArgs) -> Self {
        RunConfig {
            lr:                          a.lr,
            lr_decay:                    a.lr_decay,
            epochs:                      a.epochs,
            grad_clip:                   a.grad_clip,
            checkpoint_steps:            a.checkpoint_steps,
            checkpoint_max_to_keep:      a.checkpoint_max_to_keep,
            keep_checkpoint_every_hours: a.keep_checkpoint_every_hours,
            ..a.run.into_config(RestoreTarget::Latest)
        }
    }
}

#[derive(Args, Debug)]
pub struct TestArgs {
    #[command(flatten)]
    pub run: RunArgs,
}

impl From<TestArgs> for RunConfig {
    fn from(a: TestArgs) -> Self {
        a.run.into_config(RestoreTarget::Best)
    }
}
