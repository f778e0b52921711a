// ============================================================
// Layer 5 — Output Projection and Sequence Losses
// ============================================================
// The decoder's step outputs are projected to vocabulary space by
// one dense layer (dh_size → vocab_size, with bias) shared by
// training and inference.
//
// Two masked sequence losses, both reduced as
//
//   Σ (loss · mask) / (Σ mask + 1e-12)
//
// i.e. the mean over valid target positions in the batch:
//
//   sequence_loss          exact softmax cross-entropy; also returns
//                          the full log-distribution
//   sampled_sequence_loss  sampled softmax: the true class against
//                          `num_sampled` log-uniform candidates, logits
//                          corrected by log expected counts and
//                          accidental hits removed
//
// Sampled softmax keeps the per-step cost independent of the
// vocabulary size; it is only an estimate of the full loss.

use burn::{
    nn::Linear,
    prelude::*,
    tensor::activation::log_softmax,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Added to the mask sum so an all-padding batch divides by ~0, not 0.
const MASK_EPSILON: f64 = 1e-12;

/// Logit assigned to a sampled candidate that equals the true label.
const ACCIDENTAL_HIT: f32 = -1e9;

/// Mean of `values` over positions where `mask` is 1.
pub fn masked_mean<B: Backend>(values: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 1> {
    let total = (values * mask.clone()).sum();
    total / mask.sum().add_scalar(MASK_EPSILON)
}

/// Exact masked cross-entropy.
///
/// logits `[batch, time, vocab]`, targets `[batch, time]`, mask `[batch, time]`.
/// Returns `(log_probs, loss)`.
pub fn sequence_loss<B: Backend>(
    logits:  Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    mask:    Tensor<B, 2>,
) -> (Tensor<B, 3>, Tensor<B, 1>) {
    let [batch_size, time, _] = logits.dims();
    let log_probs = log_softmax(logits, 2);
    let nll = log_probs
        .clone()
        .gather(2, targets.reshape([batch_size, time, 1]))
        .reshape([batch_size, time])
        .neg();
    (log_probs, masked_mean(nll, mask))
}

// ─── Candidate Sampler ────────────────────────────────────────────────────────

/// Unique candidates drawn for one sampled-softmax evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledCandidates {
    pub ids:       Vec<usize>,
    /// Total draws needed to collect `ids.len()` distinct classes.
    pub num_tries: usize,
}

/// Log-uniform (Zipfian) sampler over `[0, range)`:
///
///   P(k) = ln((k + 2) / (k + 1)) / ln(range + 1)
///
/// which suits vocabularies sorted by descending frequency.
#[derive(Debug, Clone)]
pub struct LogUniformSampler {
    range: usize,
    rng:   StdRng,
}

impl LogUniformSampler {
    pub fn new(range: usize, seed: u64) -> Self {
        Self { range, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn probability(&self, class: usize) -> f64 {
        let k = class as f64;
        ((k + 2.0) / (k + 1.0)).ln() / (self.range as f64 + 1.0).ln()
    }

    /// Probability that `class` shows up in a unique sample built from
    /// `num_tries` draws: 1 - (1 - p)^tries.
    pub fn expected_count(&self, class: usize, num_tries: usize) -> f64 {
        let p = self.probability(class);
        -((num_tries as f64) * (-p).ln_1p()).exp_m1()
    }

    fn draw(&mut self) -> usize {
        let u: f64 = self.rng.gen();
        let value = ((u * (self.range as f64 + 1.0).ln()).exp() - 1.0).floor() as usize;
        value.min(self.range - 1)
    }

    /// Draw until `num_sampled` distinct classes are collected.
    pub fn sample_unique(&mut self, num_sampled: usize) -> SampledCandidates {
        let wanted = num_sampled.min(self.range);
        let mut seen = vec![false; self.range];
        let mut ids  = Vec::with_capacity(wanted);
        let mut num_tries = 0;
        while ids.len() < wanted {
            let class = self.draw();
            num_tries += 1;
            if !seen[class] {
                seen[class] = true;
                ids.push(class);
            }
        }
        SampledCandidates { ids, num_tries }
    }
}

// ─── Sampled Softmax ──────────────────────────────────────────────────────────

/// Per-row sampled-softmax loss, `[rows]`.
///
/// `hidden` is `[rows, dh]`; `labels` holds the true class of each row.
pub fn sampled_softmax_loss<B: Backend>(
    projection: &Linear<B>,
    hidden:     Tensor<B, 2>,
    labels:     &[u32],
    candidates: &SampledCandidates,
    sampler:    &LogUniformSampler,
) -> Tensor<B, 1> {
    let [rows, d_hidden] = hidden.dims();
    let num_sampled = candidates.ids.len();
    let device = hidden.device();

    // Linear stores its weight as [d_input, d_output]; rows of the
    // transpose are per-class output embeddings.
    let class_weights = projection.weight.val().transpose();
    let [vocab_size, _] = class_weights.dims();
    let bias = match &projection.bias {
        Some(b) => b.val(),
        None    => Tensor::zeros([vocab_size], &device),
    };

    let label_ids: Vec<i32> = labels.iter().map(|&l| l as i32).collect();
    let label_ids = Tensor::<B, 1, Int>::from_ints(label_ids.as_slice(), &device);
    let sampled: Vec<i32> = candidates.ids.iter().map(|&c| c as i32).collect();
    let sampled = Tensor::<B, 1, Int>::from_ints(sampled.as_slice(), &device);

    let true_log_q: Vec<f32> = labels
        .iter()
        .map(|&l| sampler.expected_count(l as usize, candidates.num_tries).ln() as f32)
        .collect();
    let sampled_log_q: Vec<f32> = candidates
        .ids
        .iter()
        .map(|&c| sampler.expected_count(c, candidates.num_tries).ln() as f32)
        .collect();
    let hits: Vec<f32> = labels
        .iter()
        .flat_map(|&l| {
            candidates
                .ids
                .iter()
                .map(move |&c| if c == l as usize { ACCIDENTAL_HIT } else { 0.0 })
        })
        .collect();

    let true_w = class_weights.clone().select(0, label_ids.clone());
    let true_b = bias.clone().select(0, label_ids).reshape([rows, 1]);
    let true_logits = (hidden.clone() * true_w).sum_dim(1) + true_b
        - Tensor::<B, 1>::from_floats(true_log_q.as_slice(), &device).reshape([rows, 1]);

    let sampled_w = class_weights.select(0, sampled.clone()).reshape([num_sampled, d_hidden]);
    let sampled_b = bias.select(0, sampled).reshape([1, num_sampled]);
    let sampled_q = Tensor::<B, 1>::from_floats(sampled_log_q.as_slice(), &device)
        .reshape([1, num_sampled]);
    let sampled_logits = hidden.matmul(sampled_w.transpose())
        + (sampled_b - sampled_q).expand([rows, num_sampled])
        + Tensor::<B, 1>::from_floats(hits.as_slice(), &device).reshape([rows, num_sampled]);

    let logits = Tensor::cat(vec![true_logits, sampled_logits], 1);
    log_softmax(logits, 1)
        .slice([0..rows, 0..1])
        .reshape([rows])
        .neg()
}

/// Masked sampled-softmax loss over a whole decoded sequence.
///
/// outputs `[batch, time, dh]`, targets `[batch][time]` on the host.
pub fn sampled_sequence_loss<B: Backend>(
    projection: &Linear<B>,
    outputs:    Tensor<B, 3>,
    targets:    &[Vec<u32>],
    mask:       Tensor<B, 2>,
    sampler:    &mut LogUniformSampler,
    num_sampled: usize,
) -> Tensor<B, 1> {
    let [batch_size, time, d_hidden] = outputs.dims();
    let labels: Vec<u32> = targets.iter().flatten().copied().collect();
    let candidates = sampler.sample_unique(num_sampled);
    let per_row = sampled_softmax_loss(
        projection,
        outputs.reshape([batch_size * time, d_hidden]),
        &labels,
        &candidates,
        sampler,
    );
    masked_mean(per_row.reshape([batch_size, time]), mask)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::nn::LinearConfig;

    type TestBackend = NdArray;

    fn scalar(t: Tensor<TestBackend, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let device  = Default::default();
        let logits  = Tensor::<TestBackend, 3>::zeros([2, 3, 10], &device);
        let targets = Tensor::<TestBackend, 2, Int>::from_ints([[1, 2, 3], [4, 5, 6]], &device);
        let mask    = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0, 1.0], [1.0, 0.0, 0.0]], &device);
        let (log_probs, loss) = sequence_loss(logits, targets, mask);
        assert_eq!(log_probs.dims(), [2, 3, 10]);
        assert_abs_diff_eq!(scalar(loss), (10.0f64).ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_confident_correct_logits_give_near_zero_loss() {
        let device = Default::default();
        let mut values = vec![0.0f32; 2 * 2 * 5];
        let targets = [[1usize, 4], [3, 0]];
        for (b, row) in targets.iter().enumerate() {
            for (t, &k) in row.iter().enumerate() {
                values[(b * 2 + t) * 5 + k] = 50.0;
            }
        }
        let logits  = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([2, 2, 5]);
        let targets = Tensor::<TestBackend, 2, Int>::from_ints([[1, 4], [3, 0]], &device);
        let mask    = Tensor::<TestBackend, 2>::ones([2, 2], &device);
        let (_, loss) = sequence_loss(logits, targets, mask);
        assert!(scalar(loss) < 1e-6);
    }

    #[test]
    fn test_masked_positions_do_not_count() {
        let device = Default::default();
        let values = Tensor::<TestBackend, 2>::from_floats([[2.0, 4.0], [100.0, 6.0]], &device);
        let mask   = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0], [0.0, 1.0]], &device);
        assert_abs_diff_eq!(scalar(masked_mean(values, mask)), 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_log_uniform_probabilities_sum_to_one() {
        let sampler = LogUniformSampler::new(50, 0);
        let total: f64 = (0..50).map(|k| sampler.probability(k)).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
        assert!(sampler.probability(0) > sampler.probability(49));
    }

    #[test]
    fn test_unique_sampling() {
        let mut sampler = LogUniformSampler::new(20, 7);
        let c = sampler.sample_unique(8);
        let mut ids = c.ids.clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert!(c.num_tries >= 8);
        assert!(c.ids.iter().all(|&id| id < 20));
    }

    #[test]
    fn test_expected_count_bounds() {
        let sampler = LogUniformSampler::new(100, 0);
        assert_abs_diff_eq!(sampler.expected_count(3, 1), sampler.probability(3), epsilon = 1e-12);
        let many = sampler.expected_count(0, 10_000);
        assert!(many > 0.99 && many <= 1.0);
    }

    #[test]
    fn test_sampled_loss_is_finite_and_masked() {
        let device     = Default::default();
        let projection = LinearConfig::new(4, 30).init::<TestBackend>(&device);
        let outputs    = Tensor::<TestBackend, 3>::ones([2, 3, 4], &device);
        let targets    = vec![vec![5, 6, 3], vec![7, 3, 0]];
        let mask       = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0, 1.0], [1.0, 1.0, 0.0]], &device);
        let mut sampler = LogUniformSampler::new(30, 1);
        let loss = scalar(sampled_sequence_loss(&projection, outputs, &targets, mask, &mut sampler, 10));
        assert!(loss.is_finite());
        assert!(loss > 0.0);
    }

    #[test]
    fn test_accidental_hits_are_removed() {
        let device     = Default::default();
        let projection = LinearConfig::new(2, 4)
            .with_initializer(burn::nn::Initializer::Zeros)
            .init::<TestBackend>(&device);
        let sampler    = LogUniformSampler::new(4, 0);
        let hidden     = Tensor::<TestBackend, 2>::ones([1, 2], &device);
        // Every candidate equals the label: only the true logit survives.
        let candidates = SampledCandidates { ids: vec![2], num_tries: 1 };
        let loss = sampled_softmax_loss(&projection, hidden, &[2], &candidates, &sampler);
        assert_abs_diff_eq!(scalar(loss.sum()), 0.0, epsilon = 1e-5);
    }
}
