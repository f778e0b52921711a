// ============================================================
// Layer 4 — Seq2Seq Batcher
// ============================================================
// Turns a RawBatch into device tensors for the model.
//
//   posts            [batch, post_time]      Int
//   responses        [batch, decoder_len]    Int   (targets, no <go>)
//   responses_input  [batch, decoder_len]    Int   (inputs, no last column)
//   decoder_mask     [batch, decoder_len]    Float (1 = valid target)
//
// Lengths stay on the host as Vec<usize>: the encoder gathers its
// final state with them and the decoder builds per-step masks.
//
// Token ids are checked against the vocabulary here, so an
// out-of-range id fails before it reaches an embedding lookup.

use burn::prelude::*;

use crate::data::preprocessor::DecoderLayout;
use crate::domain::batch::RawBatch;
use crate::domain::error::Seq2SeqError;

/// A batch of dialogue pairs ready for the model forward pass.
#[derive(Debug, Clone)]
pub struct Seq2SeqBatch<B: Backend> {
    pub posts:           Tensor<B, 2, Int>,
    pub posts_length:    Vec<usize>,
    pub responses:       Tensor<B, 2, Int>,
    pub responses_input: Tensor<B, 2, Int>,
    pub decoder_mask:    Tensor<B, 2>,
    /// Host copy of the decoder views (targets, lengths, mask).
    pub layout:          DecoderLayout,
}

impl<B: Backend> Seq2SeqBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.posts_length.len()
    }
}

#[derive(Clone, Debug)]
pub struct Seq2SeqBatcher<B: Backend> {
    pub device:     B::Device,
    pub vocab_size: usize,
}

impl<B: Backend> Seq2SeqBatcher<B> {
    pub fn new(device: B::Device, vocab_size: usize) -> Self {
        Self { device, vocab_size }
    }

    pub fn batch(&self, raw: &RawBatch) -> Result<Seq2SeqBatch<B>, Seq2SeqError> {
        let layout = DecoderLayout::from_batch(raw)?;
        self.check_ids("post", &raw.post)?;
        self.check_ids("resp", &raw.resp)?;

        let batch_size  = raw.batch_size();
        let decoder_len = layout.decoder_len;

        let posts           = self.int_matrix(&raw.post);
        let responses       = self.int_matrix(&layout.responses);
        let responses_input = self.int_matrix(&layout.responses_input);
        let decoder_mask    = Tensor::<B, 1>::from_floats(layout.flat_mask().as_slice(), &self.device)
            .reshape([batch_size, decoder_len]);

        Ok(Seq2SeqBatch {
            posts,
            posts_length: raw.post_length.clone(),
            responses,
            responses_input,
            decoder_mask,
            layout,
        })
    }

    fn check_ids(&self, name: &str, rows: &[Vec<u32>]) -> Result<(), Seq2SeqError> {
        match rows.iter().flatten().find(|&&id| id as usize >= self.vocab_size) {
            Some(id) => Err(Seq2SeqError::MalformedBatch(format!(
                "{name} contains id {id} outside a vocabulary of {}", self.vocab_size
            ))),
            None => Ok(()),
        }
    }

    fn int_matrix(&self, rows: &[Vec<u32>]) -> Tensor<B, 2, Int> {
        let width = rows.first().map_or(0, Vec::len);
        let flat: Vec<i32> = rows.iter().flatten().map(|&x| x as i32).collect();
        Tensor::<B, 1, Int>::from_ints(flat.as_slice(), &self.device).reshape([rows.len(), width])
    }
}

/// `[batch, max_len]` float mask with 1.0 at positions `< lengths[i]`.
pub fn sequence_mask<B: Backend>(lengths: &[usize], max_len: usize, device: &B::Device) -> Tensor<B, 2> {
    let flat: Vec<f32> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| if t < len { 1.0 } else { 0.0 }))
        .collect();
    Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([lengths.len(), max_len])
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::batch::tests::two_example_batch;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn batcher() -> Seq2SeqBatcher<TestBackend> {
        Seq2SeqBatcher::new(Default::default(), 16)
    }

    #[test]
    fn test_tensor_shapes() {
        let b = batcher().batch(&two_example_batch()).unwrap();
        assert_eq!(b.posts.dims(), [2, 2]);
        assert_eq!(b.responses.dims(), [2, 4]);
        assert_eq!(b.responses_input.dims(), [2, 4]);
        assert_eq!(b.decoder_mask.dims(), [2, 4]);
        assert_eq!(b.batch_size(), 2);
    }

    #[test]
    fn test_mask_tensor_matches_layout() {
        let b = batcher().batch(&two_example_batch()).unwrap();
        let mask: Vec<f32> = b.decoder_mask.into_data().iter::<f32>().collect();
        assert_eq!(mask, vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_targets_drop_go_token() {
        let b = batcher().batch(&two_example_batch()).unwrap();
        let targets: Vec<i64> = b.responses.into_data().iter::<i64>().collect();
        assert_eq!(targets, vec![7, 8, 9, 3, 10, 3, 0, 0]);
    }

    #[test]
    fn test_out_of_vocabulary_id_rejected() {
        let small = Seq2SeqBatcher::<TestBackend>::new(Default::default(), 8);
        let err = small.batch(&two_example_batch()).unwrap_err();
        assert!(matches!(err, Seq2SeqError::MalformedBatch(_)));
    }

    #[test]
    fn test_sequence_mask() {
        let m = sequence_mask::<TestBackend>(&[1, 3], 3, &Default::default());
        let v: Vec<f32> = m.into_data().iter::<f32>().collect();
        assert_eq!(v, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }
}
