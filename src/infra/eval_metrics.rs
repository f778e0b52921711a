// ============================================================
// Layer 6 — Evaluation Metrics
// ============================================================
// Two accumulate-then-close metrics used by the test driver:
//
//   PerplexityMetric  teacher forcing: per-token NLL of the
//                     reference response under the model
//   BleuMetric        inference: corpus BLEU-4 of the generated
//                     responses against the references
//
// Both take one batch at a time through `forward` and produce a
// MetricReport when closed. `close` consumes the metric.

use std::collections::HashMap;

use anyhow::Result;

use crate::domain::batch::{truncate_at_eos, Split};
use crate::domain::error::Seq2SeqError;
use crate::domain::report::{MetricReport, MetricValue};
use crate::domain::traits::{InferenceBatch, Metric, TeacherForcingBatch};

const MAX_NGRAM: usize = 4;

/// Numerator used for an n-gram order with no matches.
const SMOOTHING_EPSILON: f64 = 0.1;

// ─── Perplexity ───────────────────────────────────────────────────────────────

/// exp(mean NLL) of reference tokens, skipping the leading <go> and
/// counting the trailing <eos>.
pub struct PerplexityMetric {
    split:     Split,
    nll_sum:   f64,
    token_num: usize,
}

impl PerplexityMetric {
    pub fn new(split: Split) -> Self {
        Self { split, nll_sum: 0.0, token_num: 0 }
    }
}

impl Metric for PerplexityMetric {
    type Input = TeacherForcingBatch;

    fn forward(&mut self, data: &TeacherForcingBatch) -> Result<()> {
        let log_probs = &data.gen_log_prob;
        if data.resp_allvocabs.len() != data.resp_length.len() || log_probs.batch != data.resp_length.len() {
            return Err(Seq2SeqError::MalformedBatch(format!(
                "perplexity input has {} responses, {} lengths and {} log-prob rows",
                data.resp_allvocabs.len(),
                data.resp_length.len(),
                log_probs.batch
            ))
            .into());
        }

        for (i, (resp, &len)) in data.resp_allvocabs.iter().zip(&data.resp_length).enumerate() {
            // Step t predicts resp[t + 1].
            let targets = len.saturating_sub(1);
            if len > resp.len() || targets > log_probs.steps {
                return Err(Seq2SeqError::MalformedBatch(format!(
                    "response {i} of length {len} exceeds its row ({}) or the decoded steps ({})",
                    resp.len(),
                    log_probs.steps
                ))
                .into());
            }
            for t in 0..targets {
                let token = resp[t + 1] as usize;
                if token >= log_probs.vocab {
                    return Err(Seq2SeqError::MalformedBatch(format!(
                        "token {token} outside a vocabulary of {}",
                        log_probs.vocab
                    ))
                    .into());
                }
                self.nll_sum -= f64::from(log_probs.at(i, t, token));
            }
            self.token_num += targets;
        }
        Ok(())
    }

    fn close(self) -> Result<MetricReport> {
        if self.token_num == 0 {
            return Err(Seq2SeqError::EmptySplit { split: self.split }.into());
        }
        let mut report = MetricReport::new();
        report.insert(
            "perplexity".into(),
            MetricValue::Float((self.nll_sum / self.token_num as f64).exp()),
        );
        Ok(report)
    }
}

// ─── BLEU ─────────────────────────────────────────────────────────────────────

/// Corpus-level BLEU-4 with uniform weights, a brevity penalty and
/// epsilon smoothing for orders without any match. Also collects
/// the readable post / resp / gen triples for the result file.
pub struct BleuMetric {
    split:      Split,
    vocab:      Vec<String>,
    go_id:      u32,
    eos_id:     u32,
    matched:    [usize; MAX_NGRAM],
    total:      [usize; MAX_NGRAM],
    hyp_len:    usize,
    ref_len:    usize,
    posts:      Vec<Vec<String>>,
    references: Vec<Vec<String>>,
    generated:  Vec<Vec<String>>,
}

impl BleuMetric {
    /// `vocab` maps ids to tokens; ids past its end read as `<unk>`.
    pub fn new(split: Split, vocab: Vec<String>, go_id: u32, eos_id: u32) -> Self {
        Self {
            split,
            vocab,
            go_id,
            eos_id,
            matched:    [0; MAX_NGRAM],
            total:      [0; MAX_NGRAM],
            hyp_len:    0,
            ref_len:    0,
            posts:      Vec::new(),
            references: Vec::new(),
            generated:  Vec::new(),
        }
    }

    fn tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|&id| self.vocab.get(id as usize).cloned().unwrap_or_else(|| "<unk>".to_string()))
            .collect()
    }

    fn add_pair(&mut self, hypothesis: &[u32], reference: &[u32]) {
        self.hyp_len += hypothesis.len();
        self.ref_len += reference.len();
        for n in 1..=MAX_NGRAM {
            let hyp_counts = ngram_counts(hypothesis, n);
            let ref_counts = ngram_counts(reference, n);
            self.total[n - 1] += hyp_counts.values().sum::<usize>();
            self.matched[n - 1] += hyp_counts
                .iter()
                .map(|(gram, &count)| count.min(ref_counts.get(gram).copied().unwrap_or(0)))
                .sum::<usize>();
        }
    }

    fn score(&self) -> f64 {
        if self.hyp_len == 0 {
            return 0.0;
        }
        let mut log_precision = 0.0;
        for n in 0..MAX_NGRAM {
            // Orders longer than every hypothesis count as epsilon / 1.
            let matched = if self.matched[n] == 0 { SMOOTHING_EPSILON } else { self.matched[n] as f64 };
            let total   = self.total[n].max(1) as f64;
            log_precision += (matched / total).ln() / MAX_NGRAM as f64;
        }
        let brevity = if self.hyp_len > self.ref_len {
            1.0
        } else {
            (1.0 - self.ref_len as f64 / self.hyp_len as f64).exp()
        };
        brevity * log_precision.exp()
    }
}

fn ngram_counts(ids: &[u32], n: usize) -> HashMap<&[u32], usize> {
    let mut counts = HashMap::new();
    if ids.len() >= n {
        for gram in ids.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

impl Metric for BleuMetric {
    type Input = InferenceBatch;

    fn forward(&mut self, data: &InferenceBatch) -> Result<()> {
        let rows = data.gen.len();
        if data.post_allvocabs.len() != rows || data.resp_allvocabs.len() != rows {
            return Err(Seq2SeqError::MalformedBatch(format!(
                "bleu input has {} posts, {} responses and {} generations",
                data.post_allvocabs.len(),
                data.resp_allvocabs.len(),
                rows
            ))
            .into());
        }

        for ((post, resp), gen) in data.post_allvocabs.iter().zip(&data.resp_allvocabs).zip(&data.gen) {
            let body = match resp.first() {
                Some(&first) if first == self.go_id => &resp[1..],
                _ => &resp[..],
            };
            let reference  = truncate_at_eos(body, &self.eos_id, false);
            let hypothesis = truncate_at_eos(gen, &self.eos_id, false);
            let post       = truncate_at_eos(post, &self.eos_id, false);

            self.add_pair(&hypothesis, &reference);
            self.posts.push(self.tokens(&post));
            self.references.push(self.tokens(&reference));
            self.generated.push(self.tokens(&hypothesis));
        }
        Ok(())
    }

    fn close(self) -> Result<MetricReport> {
        if self.generated.is_empty() {
            return Err(Seq2SeqError::EmptySplit { split: self.split }.into());
        }
        let bleu = self.score();
        let mut report = MetricReport::new();
        report.insert("bleu".into(), MetricValue::Float(bleu));
        report.insert("post".into(), MetricValue::Tokens(self.posts));
        report.insert("resp".into(), MetricValue::Tokens(self.references));
        report.insert("gen".into(), MetricValue::Tokens(self.generated));
        Ok(report)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::traits::LogProbs;
    use approx::assert_abs_diff_eq;

    fn vocab() -> Vec<String> {
        ["<pad>", "<unk>", "<go>", "<eos>", "the", "cat", "sat", "on", "mat", "a"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn bleu() -> BleuMetric {
        BleuMetric::new(Split::Test, vocab(), 2, 3)
    }

    #[test]
    fn test_uniform_log_probs_give_vocab_perplexity() {
        let vocab = 10;
        let uniform = -(vocab as f32).ln();
        let data = TeacherForcingBatch {
            resp_allvocabs: vec![vec![2, 4, 5, 3], vec![2, 6, 3, 0]],
            resp_length:    vec![4, 3],
            gen_log_prob:   LogProbs::new(2, 3, vocab, vec![uniform; 2 * 3 * vocab]),
        };
        let mut metric = PerplexityMetric::new(Split::Test);
        metric.forward(&data).unwrap();
        let report = metric.close().unwrap();
        assert_abs_diff_eq!(report["perplexity"].as_f64().unwrap(), 10.0, epsilon = 1e-4);
    }

    #[test]
    fn test_perplexity_counts_only_valid_tokens() {
        // Example 0: targets 4, 3 with log-prob ln(0.5); padded steps hold
        // a value that would blow up the result if it were counted.
        let mut values = vec![-100.0f32; 3 * 5];
        values[4]      = 0.5f32.ln();
        values[5 + 3]  = 0.5f32.ln();
        let data = TeacherForcingBatch {
            resp_allvocabs: vec![vec![2, 4, 3, 0]],
            resp_length:    vec![3],
            gen_log_prob:   LogProbs::new(1, 3, 5, values),
        };
        let mut metric = PerplexityMetric::new(Split::Test);
        metric.forward(&data).unwrap();
        let report = metric.close().unwrap();
        assert_abs_diff_eq!(report["perplexity"].as_f64().unwrap(), 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_empty_perplexity_is_an_error() {
        let err = PerplexityMetric::new(Split::Dev).close().unwrap_err();
        assert_eq!(
            err.downcast_ref::<Seq2SeqError>(),
            Some(&Seq2SeqError::EmptySplit { split: Split::Dev })
        );
    }

    #[test]
    fn test_perplexity_rejects_short_log_probs() {
        let data = TeacherForcingBatch {
            resp_allvocabs: vec![vec![2, 4, 5, 3]],
            resp_length:    vec![4],
            gen_log_prob:   LogProbs::new(1, 2, 10, vec![0.0; 20]),
        };
        assert!(PerplexityMetric::new(Split::Test).forward(&data).is_err());
    }

    #[test]
    fn test_perfect_generation_scores_one() {
        let mut metric = bleu();
        metric
            .forward(&InferenceBatch {
                post_allvocabs: vec![vec![9, 5]],
                resp_allvocabs: vec![vec![2, 4, 5, 6, 7, 4, 8, 3]],
                gen:            vec![vec![4, 5, 6, 7, 4, 8, 3]],
            })
            .unwrap();
        let report = metric.close().unwrap();
        assert_abs_diff_eq!(report["bleu"].as_f64().unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_exact_three_token_generation_is_smoothed_not_zeroed() {
        // No 4-grams exist at all; that order contributes epsilon / 1.
        let mut metric = bleu();
        metric
            .forward(&InferenceBatch {
                post_allvocabs: vec![vec![9]],
                resp_allvocabs: vec![vec![2, 5, 6, 7, 3]],
                gen:            vec![vec![5, 6, 7, 3]],
            })
            .unwrap();
        let score = metric.close().unwrap()["bleu"].as_f64().unwrap();
        assert_abs_diff_eq!(score, SMOOTHING_EPSILON.powf(0.25), epsilon = 1e-9);
        assert!(score > 0.56);
    }

    #[test]
    fn test_disjoint_generation_scores_near_zero() {
        let mut metric = bleu();
        metric
            .forward(&InferenceBatch {
                post_allvocabs: vec![vec![9]],
                resp_allvocabs: vec![vec![2, 4, 5, 6, 7, 3]],
                gen:            vec![vec![8, 9, 8, 9, 3]],
            })
            .unwrap();
        let report = metric.close().unwrap();
        let score = report["bleu"].as_f64().unwrap();
        assert!(score > 0.0 && score < 0.1);
    }

    #[test]
    fn test_short_generation_is_penalised() {
        let mut full = bleu();
        let mut short = bleu();
        let resp = vec![vec![2, 4, 5, 6, 7, 4, 8, 3]];
        full.forward(&InferenceBatch {
            post_allvocabs: vec![vec![9]],
            resp_allvocabs: resp.clone(),
            gen:            vec![vec![4, 5, 6, 7, 4, 8, 3]],
        })
        .unwrap();
        short
            .forward(&InferenceBatch {
                post_allvocabs: vec![vec![9]],
                resp_allvocabs: resp,
                gen:            vec![vec![4, 5, 6, 7, 3]],
            })
            .unwrap();
        let full  = full.close().unwrap()["bleu"].as_f64().unwrap();
        let short = short.close().unwrap()["bleu"].as_f64().unwrap();
        assert!(short < full);
        // Every 4-gram of the short output matches, so only brevity costs.
        assert_abs_diff_eq!(short, (1.0f64 - 6.0 / 4.0).exp(), epsilon = 1e-9);
    }

    #[test]
    fn test_readable_triples_strip_markers() {
        let mut metric = bleu();
        metric
            .forward(&InferenceBatch {
                post_allvocabs: vec![vec![9, 5]],
                resp_allvocabs: vec![vec![2, 4, 5, 3]],
                gen:            vec![vec![4, 6, 3]],
            })
            .unwrap();
        let report = metric.close().unwrap();
        let tokens = |key: &str| match &report[key] {
            MetricValue::Tokens(t) => t.clone(),
            other => panic!("{key} is not a token list: {other:?}"),
        };
        assert_eq!(tokens("post"), vec![vec!["a", "cat"]]);
        assert_eq!(tokens("resp"), vec![vec!["the", "cat"]]);
        assert_eq!(tokens("gen"), vec![vec!["the", "sat"]]);
    }

    #[test]
    fn test_empty_bleu_is_an_error() {
        assert!(bleu().close().is_err());
    }
}
