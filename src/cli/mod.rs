// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction, parsed with `clap`.
// All work is delegated to Layer 2 (application).
//
// Two commands are supported:
//   1. `train`  trains (or resumes) a model on a dialog corpus
//   2. `test`   restores a checkpoint and scores the test split

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, TestArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "seq2seq-dialog",
    version = "0.1.0",
    about = "Train an attention seq2seq dialog model, then score it on the test split."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Dispatch to the matching use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
            Commands::Test(args)  => run_test(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!("Starting training on corpus in: {}", args.run.data_dir.display());
    TrainUseCase::new(args.into()).execute()?;

    println!("Training complete.");
    Ok(())
}

fn run_test(args: TestArgs) -> Result<()> {
    use crate::application::test_use_case::TestUseCase;

    let report = TestUseCase::new(args.into()).execute()?;
    println!();
    for (key, value) in &report {
        if let Some(v) = value.as_f64() {
            println!("{key}: {v:.6}");
        }
    }
    Ok(())
}
