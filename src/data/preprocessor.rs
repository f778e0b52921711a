// ============================================================
// Layer 4 — Sequence Preprocessor
// ============================================================
// Derives the decoder-side views of a response batch.
//
// Each padded response row looks like
//
//   <go> t1 t2 .. tn <eos> <pad> ..        origin length = n + 2
//
// and is split into two off-by-one slices of width T - 1:
//
//   responses        t1 .. tn <eos> ..     loss target (no <go>)
//   responses_input  <go> t1 .. tn ..      decoder input (no last column)
//
//   responses_length = origin_length - 1
//
// decoder_mask marks the valid target positions. It is built the
// same way for every row: a single 1 at index responses_length - 1,
// then a reverse cumulative sum along time, which turns everything
// at or before that index into 1 and everything after it into 0.
//
//   length 3, T-1 = 5:  one_hot = 0 0 1 0 0
//                       mask    = 1 1 1 0 0

use crate::domain::batch::RawBatch;
use crate::domain::error::Seq2SeqError;

/// Host-side decoder views of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderLayout {
    pub responses:        Vec<Vec<u32>>,
    pub responses_input:  Vec<Vec<u32>>,
    pub responses_length: Vec<usize>,
    pub decoder_mask:     Vec<Vec<f32>>,
    pub decoder_len:      usize,
}

impl DecoderLayout {
    pub fn from_batch(batch: &RawBatch) -> Result<Self, Seq2SeqError> {
        batch.validate()?;
        Self::from_responses(&batch.resp, &batch.resp_length)
    }

    pub fn from_responses(
        origin:        &[Vec<u32>],
        origin_length: &[usize],
    ) -> Result<Self, Seq2SeqError> {
        let width = origin.first().map_or(0, Vec::len);
        if width < 2 {
            return Err(Seq2SeqError::MalformedBatch(format!(
                "response width {width} leaves no decoder steps"
            )));
        }
        let decoder_len = width - 1;

        let responses: Vec<Vec<u32>> = origin.iter().map(|row| row[1..].to_vec()).collect();
        let responses_input: Vec<Vec<u32>> =
            origin.iter().map(|row| row[..decoder_len].to_vec()).collect();
        let responses_length: Vec<usize> = origin_length
            .iter()
            .map(|&len| len.saturating_sub(1))
            .collect();
        let decoder_mask = decoder_mask(&responses_length, decoder_len);

        Ok(Self {
            responses,
            responses_input,
            responses_length,
            decoder_mask,
            decoder_len,
        })
    }

    /// Row-major flattening of the mask, `[batch * decoder_len]`.
    pub fn flat_mask(&self) -> Vec<f32> {
        self.decoder_mask.iter().flatten().copied().collect()
    }

    pub fn valid_positions(&self) -> usize {
        self.responses_length.iter().sum()
    }
}

/// One-hot at `length - 1`, then reverse cumulative sum along time.
///
/// A length of zero has no one-hot position and yields an all-zero row.
pub fn decoder_mask(lengths: &[usize], decoder_len: usize) -> Vec<Vec<f32>> {
    lengths
        .iter()
        .map(|&len| {
            let mut row = vec![0.0f32; decoder_len];
            if len > 0 && len <= decoder_len {
                row[len - 1] = 1.0;
            }
            let mut running = 0.0f32;
            for value in row.iter_mut().rev() {
                running += *value;
                *value = running;
            }
            row
        })
        .collect()
}
