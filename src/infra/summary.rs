// ============================================================
// Layer 6 — Summary Writer
// ============================================================
// Records loss and perplexity at every checkpoint boundary, one
// CSV per group:
//
//   <log_dir>/<name>_<HHMMSS>/     (local wall-clock time)
//     train.csv
//     dev.csv
//     test.csv
//
// Each file starts with the header `index,loss,perplexity`;
// index = global_step / checkpoint_steps. Rows are appended so a
// resumed run keeps extending the same curves.

use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::domain::batch::Split;

const HEADER: &str = "index,loss,perplexity";

/// One summary point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryRow {
    pub index:      u64,
    pub loss:       f64,
    pub perplexity: f64,
}

pub struct SummaryWriter {
    run_dir: PathBuf,
}

impl SummaryWriter {
    /// Start a run directory named `<name>_<HHMMSS>` (local time) under `log_dir`.
    pub fn create(log_dir: &Path, name: &str) -> Result<Self> {
        let stamp = chrono::Local::now().format("%H%M%S");
        Self::in_dir(log_dir.join(format!("{name}_{stamp}")))
    }

    pub fn in_dir(run_dir: impl Into<PathBuf>) -> Result<Self> {
        let run_dir = run_dir.into();
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Cannot create summary directory '{}'", run_dir.display()))?;
        tracing::debug!("Writing summaries to '{}'", run_dir.display());
        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn csv_path(&self, group: Split) -> PathBuf {
        self.run_dir.join(format!("{}.csv", group.as_str()))
    }

    /// Append one row to the group's CSV, writing the header first
    /// if the file is new.
    pub fn write(&self, group: Split, row: &SummaryRow) -> Result<()> {
        let path  = self.csv_path(group);
        let fresh = !path.exists();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Cannot open summary '{}'", path.display()))?;
        if fresh {
            writeln!(f, "{HEADER}")?;
        }
        writeln!(f, "{},{:.6},{:.6}", row.index, row.loss, row.perplexity)?;
        Ok(())
    }
}
