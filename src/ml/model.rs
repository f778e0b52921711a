// ============================================================
// Layer 5 — Seq2Seq Model
// ============================================================
// Encoder-decoder with attention:
//
//   post ids ─► embedding ─► GRU encoder ─► outputs ──────────┐
//                                  │                          │ attention memory
//                                  └► final state ─► bridge ─►│ decoder init
//                                                             ▼
//   resp ids ─► embedding ─► attention decoder ─► projection ─► loss / ids
//
// The embedding table is shared by encoder and decoder inputs,
// and the output projection is shared by training and inference.
//
// Generation reserves the first two vocabulary ids (<pad>, <unk>):
// argmax is taken over ids 2.. and offset by 2, so they are never
// emitted.

use burn::{
    module::{ModuleVisitor, Param},
    nn::{Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig},
    prelude::*,
};

use crate::data::batcher::Seq2SeqBatch;
use crate::domain::error::Seq2SeqError;
use crate::ml::decoder::{AttentionDecoder, AttentionDecoderConfig, AttentionMemory, DecodeMode};
use crate::ml::encoder::{Encoder, EncoderConfig};
use crate::ml::projection::{sampled_sequence_loss, sequence_loss, LogUniformSampler};

/// Ids below this offset are never produced by generation.
pub const RESERVED_IDS: usize = 2;

/// Sampled softmax needs a candidate set strictly smaller than the vocabulary.
fn sampled_softmax_enabled(softmax_samples: usize, vocab_size: usize) -> bool {
    softmax_samples > 0 && softmax_samples < vocab_size
}

#[derive(Config, Debug)]
pub struct Seq2SeqConfig {
    pub vocab_size:     usize,
    pub embedding_size: usize,
    pub eh_size:        usize,
    pub dh_size:        usize,
    #[config(default = 2)]
    pub go_id:           usize,
    #[config(default = 3)]
    pub eos_id:          usize,
    #[config(default = 50)]
    pub max_sent_length: usize,
    /// Sampled-softmax candidates per training step; 0 or
    /// >= vocab_size trains with the exact softmax.
    #[config(default = 512)]
    pub softmax_samples: usize,
    #[config(default = "Initializer::XavierUniform { gain: 1.0 }")]
    pub initializer:     Initializer,
}

impl Seq2SeqConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Seq2Seq<B> {
        // Embedding keeps its own N(0, 1) init: a lookup table has no fan-in.
        let embedding = EmbeddingConfig::new(self.vocab_size, self.embedding_size).init(device);
        let encoder = EncoderConfig::new(self.embedding_size, self.eh_size)
            .with_initializer(self.initializer.clone())
            .init(device);
        let bridge = LinearConfig::new(self.eh_size, self.dh_size)
            .with_initializer(self.initializer.clone())
            .init(device);
        let decoder = AttentionDecoderConfig::new(self.embedding_size, self.eh_size, self.dh_size)
            .with_initializer(self.initializer.clone())
            .init(device);
        let projection = LinearConfig::new(self.dh_size, self.vocab_size)
            .with_initializer(self.initializer.clone())
            .init(device);

        Seq2Seq {
            embedding,
            encoder,
            bridge,
            decoder,
            projection,
            vocab_size:      self.vocab_size,
            go_id:           self.go_id,
            eos_id:          self.eos_id,
            max_sent_length: self.max_sent_length,
            softmax_samples: self.softmax_samples,
        }
    }

    /// Rejects shapes the model cannot run with.
    pub fn validate(&self) -> Result<(), Seq2SeqError> {
        if self.max_sent_length == 0 {
            return Err(Seq2SeqError::InvalidConfig(
                "max_sent_length must be at least 1".into(),
            ));
        }
        if self.go_id < RESERVED_IDS || self.eos_id < RESERVED_IDS {
            return Err(Seq2SeqError::InvalidConfig(format!(
                "<go> ({}) and <eos> ({}) must not use the reserved ids below {}",
                self.go_id, self.eos_id, RESERVED_IDS
            )));
        }
        if self.go_id >= self.vocab_size || self.eos_id >= self.vocab_size {
            return Err(Seq2SeqError::InvalidConfig(format!(
                "<go> ({}) and <eos> ({}) must lie inside the {}-word vocabulary",
                self.go_id, self.eos_id, self.vocab_size
            )));
        }
        Ok(())
    }

    pub fn uses_sampled_softmax(&self) -> bool {
        sampled_softmax_enabled(self.softmax_samples, self.vocab_size)
    }
}

#[derive(Module, Debug)]
pub struct Seq2Seq<B: Backend> {
    pub embedding:       Embedding<B>,
    pub encoder:         Encoder<B>,
    pub bridge:          Linear<B>,
    pub decoder:         AttentionDecoder<B>,
    pub projection:      Linear<B>,
    pub vocab_size:      usize,
    pub go_id:           usize,
    pub eos_id:          usize,
    pub max_sent_length: usize,
    pub softmax_samples: usize,
}

/// Teacher-forced pass with the exact softmax.
pub struct TeacherForcingOutput<B: Backend> {
    /// `[batch, decoder_len, vocab]`
    pub log_probs: Tensor<B, 3>,
    pub loss:      Tensor<B, 1>,
}

/// Greedy decoding result.
pub struct GreedyOutput<B: Backend> {
    /// `[batch, steps, vocab]`; zero rows once an example has finished.
    pub logits:           Tensor<B, 3>,
    /// Argmax over non-reserved ids, offset back into vocabulary space.
    pub generation_index: Vec<Vec<u32>>,
}

impl<B: Backend> Seq2Seq<B> {
    /// Encoder pass: attention memory plus the decoder's initial state.
    fn encode(&self, batch: &Seq2SeqBatch<B>) -> (AttentionMemory<B>, Tensor<B, 2>) {
        let embedded = self.embedding.forward(batch.posts.clone());
        let encoded  = self.encoder.forward(embedded, &batch.posts_length);
        let initial  = self.bridge.forward(encoded.state);
        let memory   = self.decoder.attention.prepare(encoded.outputs, &batch.posts_length);
        (memory, initial)
    }

    /// Decoder attention outputs under teacher forcing, `[batch, decoder_len, dh]`.
    pub fn teacher_forcing_outputs(&self, batch: &Seq2SeqBatch<B>) -> Tensor<B, 3> {
        let (memory, initial) = self.encode(batch);
        let inputs = self.embedding.forward(batch.responses_input.clone());
        let mode = DecodeMode::TeacherForced {
            inputs,
            lengths: batch.layout.responses_length.clone(),
        };
        self.decoder
            .decode(&memory, initial, mode, &self.embedding, &self.projection)
            .rnn_output
    }

    /// Exact masked cross-entropy plus the full per-step distribution.
    pub fn forward_loss(&self, batch: &Seq2SeqBatch<B>) -> TeacherForcingOutput<B> {
        let outputs = self.teacher_forcing_outputs(batch);
        let logits  = self.projection.forward(outputs);
        let (log_probs, loss) =
            sequence_loss(logits, batch.responses.clone(), batch.decoder_mask.clone());
        TeacherForcingOutput { log_probs, loss }
    }

    /// Training loss: sampled softmax when configured, exact otherwise.
    pub fn forward_train_loss(
        &self,
        batch:   &Seq2SeqBatch<B>,
        sampler: &mut LogUniformSampler,
    ) -> Tensor<B, 1> {
        if !sampled_softmax_enabled(self.softmax_samples, self.vocab_size) {
            return self.forward_loss(batch).loss;
        }
        let outputs = self.teacher_forcing_outputs(batch);
        sampled_sequence_loss(
            &self.projection,
            outputs,
            &batch.layout.responses,
            batch.decoder_mask.clone(),
            sampler,
            self.softmax_samples,
        )
    }

    /// Greedy decoding from <go> until <eos> or max_sent_length steps.
    pub fn infer(&self, batch: &Seq2SeqBatch<B>) -> GreedyOutput<B> {
        let (memory, initial) = self.encode(batch);
        let mode = DecodeMode::Greedy {
            start_token: self.go_id,
            end_token:   self.eos_id,
            max_steps:   self.max_sent_length,
        };
        let logits = self
            .decoder
            .decode(&memory, initial, mode, &self.embedding, &self.projection)
            .rnn_output;
        let generation_index = generation_index(logits.clone());
        GreedyOutput { logits, generation_index }
    }
}

struct ShapeVisitor {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeVisitor {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.shapes.push(param.val().dims().to_vec());
    }
}

fn parameter_shapes<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<usize>> {
    let mut visitor = ShapeVisitor { shapes: Vec::new() };
    module.visit(&mut visitor);
    visitor.shapes
}

impl<B: Backend> Seq2Seq<B> {
    /// Parameter shapes grouped by submodule, in construction order.
    pub fn parameter_summary(&self) -> Vec<(&'static str, Vec<Vec<usize>>)> {
        vec![
            ("embedding", parameter_shapes(&self.embedding)),
            ("encoder", parameter_shapes(&self.encoder)),
            ("bridge", parameter_shapes(&self.bridge)),
            ("decoder", parameter_shapes(&self.decoder)),
            ("projection", parameter_shapes(&self.projection)),
        ]
    }

    pub fn log_parameters(&self) {
        for (name, shapes) in self.parameter_summary() {
            for shape in shapes {
                tracing::info!("  {}: {:?}", name, shape);
            }
        }
        tracing::info!("Total parameters: {}", self.num_params());
    }
}

/// Argmax over vocabulary ids `RESERVED_IDS..`, shifted back by `RESERVED_IDS`.
pub fn generation_index<B: Backend>(logits: Tensor<B, 3>) -> Vec<Vec<u32>> {
    let [batch_size, steps, vocab_size] = logits.dims();
    let ids: Vec<i64> = logits
        .slice([0..batch_size, 0..steps, RESERVED_IDS..vocab_size])
        .argmax(2)
        .into_data()
        .iter::<i64>()
        .collect();
    ids.chunks(steps.max(1))
        .take(batch_size)
        .map(|row| row.iter().map(|&id| (id as usize + RESERVED_IDS) as u32).collect())
        .collect()
}
