// ============================================================
// Layer 5 — Global-Norm Gradient Clipping
// ============================================================
//   global_norm = sqrt( Σ_params ‖g‖² )
//   g ← g · clip / max(global_norm, clip)
//
// Gradients are only scaled down, never up, and the relative
// magnitudes across parameters are preserved. The returned norm
// is the one measured before clipping.

use std::marker::PhantomData;

use burn::{
    module::{AutodiffModule, ModuleVisitor, Param},
    optim::GradientsParams,
    prelude::*,
    tensor::backend::AutodiffBackend,
};

struct NormVisitor<'a, B: AutodiffBackend> {
    grads:   &'a GradientsParams,
    sum_sq:  f64,
    _marker: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for NormVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) {
            self.sum_sq += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

struct ScaleVisitor<'a, B: AutodiffBackend> {
    grads:   &'a mut GradientsParams,
    scale:   f64,
    _marker: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads
                .register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.scale));
        }
    }
}

/// Global L2 norm of the gradients belonging to `module`'s parameters.
pub fn global_norm<B, M>(module: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = NormVisitor::<B> { grads, sum_sq: 0.0, _marker: PhantomData };
    module.visit(&mut visitor);
    visitor.sum_sq.sqrt()
}

/// Clip `grads` to a global norm of at most `max_norm`.
///
/// A non-positive `max_norm` disables clipping. Returns the clipped
/// gradients and the norm measured before clipping.
pub fn clip_by_global_norm<B, M>(
    module:    &M,
    mut grads: GradientsParams,
    max_norm:  f64,
) -> (GradientsParams, f64)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_norm::<B, M>(module, &grads);
    if max_norm > 0.0 && norm > max_norm {
        let mut visitor = ScaleVisitor::<B> {
            grads:   &mut grads,
            scale:   max_norm / norm,
            _marker: PhantomData,
        };
        module.visit(&mut visitor);
    }
    (grads, norm)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Initializer, Linear, LinearConfig};

    type TestBackend = Autodiff<NdArray>;

    /// Linear 2 → 1 with unit weights; the weight gradient of
    /// sum(x · W) is x itself, here [3, 4] with norm 5.
    fn setup() -> (Linear<TestBackend>, GradientsParams) {
        let device = Default::default();
        let layer  = LinearConfig::new(2, 1)
            .with_bias(false)
            .with_initializer(Initializer::Ones)
            .init::<TestBackend>(&device);
        let x    = Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0]], &device);
        let loss = layer.forward(x).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &layer);
        (layer, grads)
    }

    fn weight_grad(layer: &Linear<TestBackend>, grads: &GradientsParams) -> Vec<f32> {
        grads
            .get::<NdArray, 2>(layer.weight.id)
            .unwrap()
            .into_data()
            .iter::<f32>()
            .collect()
    }

    #[test]
    fn test_norm_measured() {
        let (layer, grads) = setup();
        assert_abs_diff_eq!(global_norm::<TestBackend, _>(&layer, &grads), 5.0, epsilon = 1e-5);
    }

    #[test]
    fn test_clipping_scales_to_max_norm() {
        let (layer, grads) = setup();
        let (grads, norm) = clip_by_global_norm::<TestBackend, _>(&layer, grads, 1.0);
        assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-5);
        let g = weight_grad(&layer, &grads);
        assert_abs_diff_eq!(g[0], 0.6, epsilon = 1e-5);
        assert_abs_diff_eq!(g[1], 0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_small_gradients_untouched() {
        let (layer, grads) = setup();
        let (grads, _) = clip_by_global_norm::<TestBackend, _>(&layer, grads, 10.0);
        assert_eq!(weight_grad(&layer, &grads), vec![3.0, 4.0]);
    }

    #[test]
    fn test_zero_disables_clipping() {
        let (layer, grads) = setup();
        let (grads, norm) = clip_by_global_norm::<TestBackend, _>(&layer, grads, 0.0);
        assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-5);
        assert_eq!(weight_grad(&layer, &grads), vec![3.0, 4.0]);
    }
}
