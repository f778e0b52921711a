// ============================================================
// Layer 5 — Test Driver
// ============================================================
// One pass over the test split. Per batch:
//
//   infer()           greedy ids, cut after the first <eos>
//                     → inference metric (BLEU + readable triples)
//   evaluate_batch()  teacher-forced log-probabilities
//                     → teacher-forcing metric (perplexity)
//
// Both metrics are closed at the end and merged into one report.
// The report is written to the result file:
//
//   bleu:\t0.012345
//   perplexity:\t85.123456
//   post:\t...
//   resp:\t...
//   gen:\t...
//
// and only its scalar entries are returned to the caller.

use anyhow::{Context, Result};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

use crate::domain::batch::{truncate_at_eos, RawBatch, Split};
use crate::domain::report::{scalars, MetricReport, MetricValue};
use crate::domain::traits::{DataSource, InferenceBatch, Learner, Metric, TeacherForcingBatch};

/// Id → token table covering the whole vocabulary.
pub fn token_table<D: DataSource>(data: &D) -> Vec<String> {
    let ids: Vec<u32> = (0..data.vocab_size() as u32).collect();
    data.convert_ids_to_tokens(&ids)
}

fn cut_rows(rows: &[Vec<u32>], lengths: &[usize]) -> Vec<Vec<u32>> {
    rows.iter()
        .zip(lengths)
        .map(|(row, &len)| row[..len.min(row.len())].to_vec())
        .collect()
}

fn inference_batch(batch: &RawBatch, generated: &[Vec<u32>], eos_id: u32) -> InferenceBatch {
    InferenceBatch {
        post_allvocabs: cut_rows(&batch.post_allvocabs, &batch.post_length),
        resp_allvocabs: cut_rows(&batch.resp_allvocabs, &batch.resp_length),
        gen:            generated.iter().map(|ids| truncate_at_eos(ids, &eos_id, true)).collect(),
    }
}

/// Run both metrics over the test split, write `result_file`, and
/// return the scalar part of the merged report.
pub fn test_process<L, D, T, I>(
    learner:          &L,
    data:             &mut D,
    batch_size:       usize,
    mut forcing:      T,
    mut inference:    I,
    result_file:      &Path,
) -> Result<MetricReport>
where
    L: Learner,
    D: DataSource,
    T: Metric<Input = TeacherForcingBatch>,
    I: Metric<Input = InferenceBatch>,
{
    let eos_id = data.eos_id();
    data.restart(Split::Test, batch_size, false);

    while let Some(batch) = data.get_next_batch(Split::Test) {
        let generated = learner.infer(&batch)?;
        let eval = learner.evaluate_batch(&batch)?;

        forcing.forward(&TeacherForcingBatch {
            resp_allvocabs: batch.resp_allvocabs.clone(),
            resp_length:    batch.resp_length.clone(),
            gen_log_prob:   eval.log_probs,
        })?;
        inference.forward(&inference_batch(&batch, &generated, eos_id))?;
    }

    let mut report = forcing.close()?;
    report.extend(inference.close()?);

    write_result_file(result_file, &report)?;
    tracing::info!("Test result:");
    for (key, value) in &report {
        if let Some(v) = value.as_f64() {
            tracing::info!("\t{}:\t{:.6}", key, v);
        }
    }
    tracing::info!("result output to {}", result_file.display());

    Ok(scalars(&report))
}

fn token_rows<'a>(report: &'a MetricReport, key: &str) -> &'a [Vec<String>] {
    match report.get(key) {
        Some(MetricValue::Tokens(rows)) => rows,
        _ => &[],
    }
}

/// Scalar lines first, then one post / resp / gen triple per example.
pub fn write_result_file(path: &Path, report: &MetricReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create output directory '{}'", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Cannot write result file '{}'", path.display()))?;
    let mut out = BufWriter::new(file);

    for (key, value) in report {
        if let Some(v) = value.as_f64() {
            writeln!(out, "{key}:\t{v:.6}")?;
        }
    }

    let posts = token_rows(report, "post");
    let resps = token_rows(report, "resp");
    let gens  = token_rows(report, "gen");
    for (i, post) in posts.iter().enumerate() {
        writeln!(out, "post:\t{}", post.join(" "))?;
        writeln!(out, "resp:\t{}", resps.get(i).map(|r| r.join(" ")).unwrap_or_default())?;
        writeln!(out, "gen:\t{}", gens.get(i).map(|g| g.join(" ")).unwrap_or_default())?;
    }
    out.flush()?;
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trainer_state::TrainingProgress;
    use crate::domain::traits::{EvalOutput, Lineage, LogProbs, StepOutput};
    use crate::infra::eval_metrics::{BleuMetric, PerplexityMetric};
    use crate::ml::trainer::tests::FakeData;
    use approx::assert_abs_diff_eq;
    use tempfile::TempDir;

    const VOCAB: usize = 12;

    /// Uniform teacher-forcing distribution and fixed generations.
    struct FixedLearner;

    impl Learner for FixedLearner {
        fn name(&self) -> &str {
            "fixed"
        }

        fn train_step(&mut self, _batch: &RawBatch, _learning_rate: f64) -> Result<StepOutput> {
            unreachable!("the test driver never trains")
        }

        fn evaluate_batch(&self, batch: &RawBatch) -> Result<EvalOutput> {
            let steps = batch.resp_time() - 1;
            let rows  = batch.batch_size();
            let value = -(VOCAB as f32).ln();
            Ok(EvalOutput {
                loss:      (VOCAB as f64).ln(),
                log_probs: LogProbs::new(rows, steps, VOCAB, vec![value; rows * steps * VOCAB]),
            })
        }

        fn infer(&self, _batch: &RawBatch) -> Result<Vec<Vec<u32>>> {
            Ok(vec![vec![7, 3, 9], vec![4, 4, 4]])
        }

        fn store_checkpoint(&self, _lineage: Lineage, _progress: TrainingProgress) -> Result<()> {
            Ok(())
        }
    }

    fn run(dir: &Path) -> (MetricReport, String) {
        let mut data = FakeData::new(0, 0, 1);
        let path = dir.join("out").join("seq2seq_test.txt");
        let forcing   = PerplexityMetric::new(Split::Test);
        let inference = BleuMetric::new(Split::Test, token_table(&data), data.go_id(), data.eos_id());
        let report = test_process(&FixedLearner, &mut data, 2, forcing, inference, &path).unwrap();
        (report, fs::read_to_string(path).unwrap())
    }

    #[test]
    fn test_returns_only_scalars() {
        let tmp = TempDir::new().unwrap();
        let (report, _) = run(tmp.path());
        let keys: Vec<&str> = report.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["bleu", "perplexity"]);
        assert_abs_diff_eq!(report["perplexity"].as_f64().unwrap(), VOCAB as f64, epsilon = 1e-3);
    }

    #[test]
    fn test_result_file_layout() {
        let tmp = TempDir::new().unwrap();
        let (_, text) = run(tmp.path());
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("bleu:\t"));
        assert_eq!(lines[1], "perplexity:\t12.000000");
        assert_eq!(
            &lines[2..],
            &[
                "post:\tw4 w5",
                "resp:\tw7 w8 w9",
                "gen:\tw7",
                "post:\tw6",
                "resp:\tw10",
                "gen:\tw4 w4 w4",
            ]
        );
    }

    #[test]
    fn test_generation_cut_keeps_eos_for_ids() {
        let batch = crate::domain::batch::tests::two_example_batch();
        let ib = inference_batch(&batch, &[vec![7, 3, 9], vec![4, 4]], 3);
        assert_eq!(ib.gen, vec![vec![7, 3], vec![4, 4]]);
        assert_eq!(ib.post_allvocabs, vec![vec![4, 5], vec![6]]);
        assert_eq!(ib.resp_allvocabs[1], vec![2, 10, 3]);
    }

    #[test]
    fn test_empty_test_split_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut data = FakeData::new(0, 0, 0);
        let forcing   = PerplexityMetric::new(Split::Test);
        let inference = BleuMetric::new(Split::Test, token_table(&data), 2, 3);
        let result = test_process(&FixedLearner, &mut data, 2, forcing, inference, &tmp.path().join("x.txt"));
        assert!(result.is_err());
    }
}
