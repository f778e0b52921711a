// ============================================================
// Layer 3 — Raw Batch Contract
// ============================================================
// A RawBatch is what the data collaborator hands to the model:
// right-padded token id matrices plus the true lengths.
//
//   post           [batch][post_time]   source utterance ids
//   post_length    [batch]              valid source tokens
//   resp           [batch][resp_time]   <go> t1 .. tn <eos> (+ padding)
//   resp_length    [batch]              n + 2
//   *_allvocabs    same layout, ids over the full (extended) vocabulary
//
// Batches are transient: consumed by exactly one forward pass.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::Seq2SeqError;

/// The three dataset splits the loop iterates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev   => "dev",
            Split::Test  => "test",
        }
    }

    pub fn all() -> [Split; 3] {
        [Split::Train, Split::Dev, Split::Test]
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One padded mini-batch as produced by a DataSource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub post:           Vec<Vec<u32>>,
    pub post_length:    Vec<usize>,
    pub resp:           Vec<Vec<u32>>,
    pub resp_length:    Vec<usize>,
    pub post_allvocabs: Vec<Vec<u32>>,
    pub resp_allvocabs: Vec<Vec<u32>>,
}

impl RawBatch {
    pub fn batch_size(&self) -> usize {
        self.post.len()
    }

    /// Width of the padded response matrix (includes <go> and <eos>).
    pub fn resp_time(&self) -> usize {
        self.resp.first().map_or(0, Vec::len)
    }

    /// Fail fast on batches whose shapes disagree.
    ///
    /// Checks that every row of a matrix has the same width, that the
    /// length vectors match the batch size, and that each length fits
    /// inside its padded row. Token id ranges are checked later against
    /// the model's vocabulary.
    pub fn validate(&self) -> Result<(), Seq2SeqError> {
        let batch = self.batch_size();
        if batch == 0 {
            return Err(Seq2SeqError::MalformedBatch("batch is empty".into()));
        }
        if self.resp.len() != batch {
            return Err(Seq2SeqError::MalformedBatch(format!(
                "post has {} rows but resp has {}", batch, self.resp.len()
            )));
        }
        check_lengths("post", &self.post, &self.post_length, 1)?;
        check_lengths("resp", &self.resp, &self.resp_length, 1)?;
        if self.resp_time() < 2 {
            return Err(Seq2SeqError::MalformedBatch(
                "resp must hold at least <go> and <eos>".into(),
            ));
        }
        Ok(())
    }
}

fn check_lengths(
    name:    &str,
    rows:    &[Vec<u32>],
    lengths: &[usize],
    min_len: usize,
) -> Result<(), Seq2SeqError> {
    if lengths.len() != rows.len() {
        return Err(Seq2SeqError::MalformedBatch(format!(
            "{name}_length has {} entries for {} rows", lengths.len(), rows.len()
        )));
    }
    let width = rows.first().map_or(0, Vec::len);
    for (i, (row, &len)) in rows.iter().zip(lengths).enumerate() {
        if row.len() != width {
            return Err(Seq2SeqError::MalformedBatch(format!(
                "{name} row {i} has width {} but row 0 has width {width}", row.len()
            )));
        }
        if len < min_len || len > width {
            return Err(Seq2SeqError::MalformedBatch(format!(
                "{name}_length[{i}] = {len} is outside 1..={width}"
            )));
        }
    }
    Ok(())
}

/// Cut a generated id sequence at the first end token.
///
/// `inclusive` keeps the end token itself (id-level output); the
/// exclusive form is what human-readable output uses.
pub fn truncate_at_eos<T: PartialEq + Clone>(seq: &[T], eos: &T, inclusive: bool) -> Vec<T> {
    match seq.iter().position(|t| t == eos) {
        Some(pos) if inclusive => seq[..=pos].to_vec(),
        Some(pos)              => seq[..pos].to_vec(),
        None                   => seq.to_vec(),
    }
}
