// ============================================================
// Layer 5 — Attention Decoder
// ============================================================
// A GRU cell wrapped with Luong (multiplicative) attention over
// the encoder outputs. One set of parameters, two ways of picking
// the next input:
//
//   DecodeMode::TeacherForced  → ground-truth previous token
//   DecodeMode::Greedy         → argmax of the previous step
//
// One decoding step:
//
//   cell_in   = [ embed(input) ; attention_{t-1} ]      input feeding
//   h_t       = GRU(cell_in, h_{t-1})
//   score_s   = < h_t , W_m · memory_s >                 masked by post length
//   align     = softmax(score)
//   context   = Σ_s align_s · memory_s
//   attention = W_a · [ h_t ; context ]                 step output
//
// Finished examples (past their length in teacher forcing, or
// after <eos> in greedy mode) hold their state and attention and
// emit zeros, so padding steps contribute nothing downstream.

use burn::{
    nn::{
        gru::{Gru, GruConfig},
        Embedding, Initializer, Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::softmax,
};

use crate::data::batcher::sequence_mask;

/// Score given to padded memory positions; exp() of it underflows to 0.
const MASKED_SCORE: f32 = -1e9;

/// How the decoder chooses its input at each step.
pub enum DecodeMode<B: Backend> {
    /// Embedded ground-truth inputs `[batch, time, embedding]` and the
    /// number of valid steps per example.
    TeacherForced {
        inputs:  Tensor<B, 3>,
        lengths: Vec<usize>,
    },
    /// Feed back the most probable token, starting from `start_token`,
    /// until `end_token` or `max_steps`, which must be at least 1
    /// (`Seq2SeqConfig::validate` guarantees it for model decoding).
    Greedy {
        start_token: usize,
        end_token:   usize,
        max_steps:   usize,
    },
}

/// Teacher forcing yields the attention outputs `[batch, time, dh]`;
/// greedy decoding yields vocabulary logits `[batch, steps, vocab]`.
pub struct DecoderOutput<B: Backend> {
    pub rnn_output: Tensor<B, 3>,
    /// Fed-back token ids per example (greedy mode only).
    pub sample_ids: Vec<Vec<u32>>,
}

// ─── Attention ────────────────────────────────────────────────────────────────

/// Encoder outputs prepared once per batch.
pub struct AttentionMemory<B: Backend> {
    pub keys:    Tensor<B, 3>,
    pub values:  Tensor<B, 3>,
    pub padding: Tensor<B, 2, Bool>,
}

#[derive(Module, Debug)]
pub struct LuongAttention<B: Backend> {
    pub memory_layer:    Linear<B>,
    pub attention_layer: Linear<B>,
}

impl<B: Backend> LuongAttention<B> {
    pub fn prepare(&self, encoder_outputs: Tensor<B, 3>, lengths: &[usize]) -> AttentionMemory<B> {
        let [_, time, _] = encoder_outputs.dims();
        let device  = encoder_outputs.device();
        let padding = sequence_mask::<B>(lengths, time, &device).equal_elem(0.0);
        let keys    = self.memory_layer.forward(encoder_outputs.clone());
        AttentionMemory { keys, values: encoder_outputs, padding }
    }

    /// Attention weights over memory positions, `[batch, post_time]`.
    pub fn alignments(&self, memory: &AttentionMemory<B>, query: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch_size, time, d_key] = memory.keys.dims();
        let scores = memory
            .keys
            .clone()
            .matmul(query.reshape([batch_size, d_key, 1]))
            .reshape([batch_size, time])
            .mask_fill(memory.padding.clone(), MASKED_SCORE);
        softmax(scores, 1)
    }

    pub fn forward(&self, memory: &AttentionMemory<B>, query: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch_size, time, d_value] = memory.values.dims();
        let weights = self.alignments(memory, query.clone());
        let context = weights
            .reshape([batch_size, 1, time])
            .matmul(memory.values.clone())
            .reshape([batch_size, d_value]);
        self.attention_layer.forward(Tensor::cat(vec![query, context], 1))
    }
}

// ─── Decoder ──────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct AttentionDecoderConfig {
    pub d_embedding: usize,
    pub d_memory:    usize,
    pub d_hidden:    usize,
    #[config(default = "Initializer::XavierUniform { gain: 1.0 }")]
    pub initializer: Initializer,
}

impl AttentionDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionDecoder<B> {
        let cell = GruConfig::new(self.d_embedding + self.d_hidden, self.d_hidden, true)
            .with_initializer(self.initializer.clone())
            .init(device);
        let memory_layer = LinearConfig::new(self.d_memory, self.d_hidden)
            .with_bias(false)
            .with_initializer(self.initializer.clone())
            .init(device);
        let attention_layer = LinearConfig::new(self.d_hidden + self.d_memory, self.d_hidden)
            .with_bias(false)
            .with_initializer(self.initializer.clone())
            .init(device);
        AttentionDecoder {
            cell,
            attention: LuongAttention { memory_layer, attention_layer },
            d_embedding: self.d_embedding,
            d_hidden: self.d_hidden,
        }
    }
}

#[derive(Module, Debug)]
pub struct AttentionDecoder<B: Backend> {
    pub cell:        Gru<B>,
    pub attention:   LuongAttention<B>,
    pub d_embedding: usize,
    pub d_hidden:    usize,
}

impl<B: Backend> AttentionDecoder<B> {
    /// One recurrent step: returns the new cell state and attention output.
    fn step(
        &self,
        memory:    &AttentionMemory<B>,
        input:     Tensor<B, 2>,
        state:     Tensor<B, 2>,
        attention: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let [batch_size, _] = input.dims();
        let cell_in = Tensor::cat(vec![input, attention], 1)
            .reshape([batch_size, 1, self.d_embedding + self.d_hidden]);
        let cell_out = self
            .cell
            .forward(cell_in, Some(state))
            .reshape([batch_size, self.d_hidden]);
        let attention = self.attention.forward(memory, cell_out.clone());
        (cell_out, attention)
    }

    /// Unroll from `initial_state` in the requested mode.
    ///
    /// Greedy mode needs the shared embedding table and output
    /// projection to turn step outputs into the next input.
    pub fn decode(
        &self,
        memory:        &AttentionMemory<B>,
        initial_state: Tensor<B, 2>,
        mode:          DecodeMode<B>,
        embedding:     &Embedding<B>,
        projection:    &Linear<B>,
    ) -> DecoderOutput<B> {
        match mode {
            DecodeMode::TeacherForced { inputs, lengths } => {
                self.teacher_forced(memory, initial_state, inputs, &lengths)
            }
            DecodeMode::Greedy { start_token, end_token, max_steps } => self.greedy(
                memory,
                initial_state,
                start_token,
                end_token,
                max_steps,
                embedding,
                projection,
            ),
        }
    }

    fn teacher_forced(
        &self,
        memory:    &AttentionMemory<B>,
        mut state: Tensor<B, 2>,
        inputs:    Tensor<B, 3>,
        lengths:   &[usize],
    ) -> DecoderOutput<B> {
        let [batch_size, time, d_embedding] = inputs.dims();
        let device = inputs.device();
        let active = sequence_mask::<B>(lengths, time, &device);

        let mut attention = Tensor::<B, 2>::zeros([batch_size, self.d_hidden], &device);
        let mut outputs   = Vec::with_capacity(time);

        for t in 0..time {
            let input = inputs
                .clone()
                .slice([0..batch_size, t..t + 1, 0..d_embedding])
                .reshape([batch_size, d_embedding]);
            let (cell_out, attn) = self.step(memory, input, state.clone(), attention.clone());

            let keep = active
                .clone()
                .slice([0..batch_size, t..t + 1])
                .expand([batch_size, self.d_hidden]);
            outputs.push(attn.clone() * keep.clone());
            state     = hold(cell_out, state, keep.clone());
            attention = hold(attn, attention, keep);
        }

        DecoderOutput {
            rnn_output: Tensor::stack(outputs, 1),
            sample_ids: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn greedy(
        &self,
        memory:      &AttentionMemory<B>,
        mut state:   Tensor<B, 2>,
        start_token: usize,
        end_token:   usize,
        max_steps:   usize,
        embedding:   &Embedding<B>,
        projection:  &Linear<B>,
    ) -> DecoderOutput<B> {
        let [batch_size, _] = state.dims();
        let device = state.device();

        let start: Vec<i32> = vec![start_token as i32; batch_size];
        let mut input = embed_ids(embedding, Tensor::from_ints(start.as_slice(), &device), self.d_embedding);
        let mut attention  = Tensor::<B, 2>::zeros([batch_size, self.d_hidden], &device);
        let mut finished   = vec![false; batch_size];
        let mut sample_ids = vec![Vec::new(); batch_size];
        let mut outputs    = Vec::new();

        for _ in 0..max_steps {
            if finished.iter().all(|&f| f) {
                break;
            }
            let (cell_out, attn) = self.step(memory, input, state.clone(), attention.clone());
            let logits = projection.forward(attn.clone());
            let [_, vocab_size] = logits.dims();

            let alive: Vec<f32> = finished.iter().map(|&f| if f { 0.0 } else { 1.0 }).collect();
            let alive = Tensor::<B, 1>::from_floats(alive.as_slice(), &device).reshape([batch_size, 1]);
            let logits = logits * alive.clone().expand([batch_size, vocab_size]);

            let samples = logits.clone().argmax(1).reshape([batch_size]);
            let ids: Vec<i64> = samples.clone().into_data().iter::<i64>().collect();
            for (i, &id) in ids.iter().enumerate() {
                if finished[i] {
                    continue;
                }
                sample_ids[i].push(id as u32);
                if id as usize == end_token {
                    finished[i] = true;
                }
            }

            let keep = alive.expand([batch_size, self.d_hidden]);
            state     = hold(cell_out, state, keep.clone());
            attention = hold(attn, attention, keep);
            outputs.push(logits);
            input = embed_ids(embedding, samples, self.d_embedding);
        }

        DecoderOutput {
            rnn_output: Tensor::stack(outputs, 1),
            sample_ids,
        }
    }
}

/// `keep * new + (1 - keep) * old`
fn hold<B: Backend>(new: Tensor<B, 2>, old: Tensor<B, 2>, keep: Tensor<B, 2>) -> Tensor<B, 2> {
    let drop = keep.clone().neg().add_scalar(1.0);
    new * keep + old * drop
}

fn embed_ids<B: Backend>(embedding: &Embedding<B>, ids: Tensor<B, 1, Int>, d_embedding: usize) -> Tensor<B, 2> {
    let [batch_size] = ids.dims();
    embedding
        .forward(ids.reshape([batch_size, 1]))
        .reshape([batch_size, d_embedding])
}
