// ============================================================
// Layer 5 — GRU Encoder
// ============================================================
// Runs a GRU over the embedded source utterance.
//
//   input    [batch, post_time, embedding]
//   outputs  [batch, post_time, eh_size]   zero past each length
//   state    [batch, eh_size]              hidden state at length - 1
//
// The recurrence is causal, so positions before an example's
// length never see its padding; the final state is gathered at
// the last valid step rather than the last padded one.

use burn::{
    nn::{
        gru::{Gru, GruConfig},
        Initializer,
    },
    prelude::*,
};

use crate::data::batcher::sequence_mask;

#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub d_input:  usize,
    pub d_hidden: usize,
    #[config(default = "Initializer::XavierUniform { gain: 1.0 }")]
    pub initializer: Initializer,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let gru = GruConfig::new(self.d_input, self.d_hidden, true)
            .with_initializer(self.initializer.clone())
            .init(device);
        Encoder { gru, d_hidden: self.d_hidden }
    }
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    pub gru:      Gru<B>,
    pub d_hidden: usize,
}

pub struct EncoderOutput<B: Backend> {
    pub outputs: Tensor<B, 3>,
    pub state:   Tensor<B, 2>,
}

impl<B: Backend> Encoder<B> {
    pub fn forward(&self, embedded: Tensor<B, 3>, lengths: &[usize]) -> EncoderOutput<B> {
        let [batch_size, time, _] = embedded.dims();
        let device = embedded.device();

        let outputs = self.gru.forward(embedded, None);

        let valid = sequence_mask::<B>(lengths, time, &device)
            .reshape([batch_size, time, 1])
            .expand([batch_size, time, self.d_hidden]);
        let outputs = outputs * valid;

        let last: Vec<i32> = lengths
            .iter()
            .map(|&len| len.saturating_sub(1).min(time.saturating_sub(1)) as i32)
            .collect();
        let index = Tensor::<B, 1, Int>::from_ints(last.as_slice(), &device)
            .reshape([batch_size, 1, 1])
            .expand([batch_size, 1, self.d_hidden]);
        let state = outputs
            .clone()
            .gather(1, index)
            .reshape([batch_size, self.d_hidden]);

        EncoderOutput { outputs, state }
    }
}
