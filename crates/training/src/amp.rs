//! Dynamic loss scaling.
//!
//! The loss is multiplied by a running scale before the backward pass and the
//! gradients are divided by it before the optimizer step. A non-finite
//! gradient skips the step and halves the scale; a run of finite steps grows
//! it again. Arithmetic precision itself is whatever the backend element type
//! is.

use std::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    growth_tracker: usize,
}

impl LossScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    pub fn with_init_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_growth_interval(mut self, steps: usize) -> Self {
        self.growth_interval = steps.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current scale; 1 when disabled.
    pub fn scale_factor(&self) -> f32 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    pub fn scale<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divide every gradient of `module` by the scale in place.
    ///
    /// Returns `true` when any gradient holds an inf or NaN, in which case the
    /// optimizer step must be skipped.
    pub fn unscale<B, M>(&self, grads: &mut GradientsParams, module: &M) -> bool
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if !self.enabled {
            return false;
        }
        let mut visitor = Unscale::<B> {
            grads,
            inv_scale: 1.0 / self.scale,
            found_inf: false,
            _backend: PhantomData,
        };
        module.visit(&mut visitor);
        visitor.found_inf
    }

    /// Adjust the scale after a step.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            return;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.growth_tracker = 0;
        }
    }
}

struct Unscale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    inv_scale: f32,
    found_inf: bool,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inv_scale);
        let total = grad
            .clone()
            .sum()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
            .first()
            .copied()
            .unwrap_or(f32::NAN);
        if !total.is_finite() {
            self.found_inf = true;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;

    type AD = Autodiff<NdArray<f32>>;

    fn weight_grad(scaler: &LossScaler, model: &Linear<AD>, input: f32) -> (Vec<f32>, bool) {
        let device = Default::default();
        let x = Tensor::<AD, 2>::from_floats([[input, 1.0]], &device);
        let loss = model.forward(x).sum();
        let mut grads = GradientsParams::from_grads(scaler.scale(loss).backward(), model);
        let found_inf = scaler.unscale::<AD, _>(&mut grads, model);
        let grad = grads
            .get::<NdArray<f32>, 2>(model.weight.id)
            .expect("weight gradient");
        (grad.into_data().to_vec::<f32>().unwrap(), found_inf)
    }

    #[test]
    fn unscaled_gradients_match_plain_backward() {
        let device = Default::default();
        let model = LinearConfig::new(2, 3).init::<AD>(&device);
        let (plain, _) = weight_grad(&LossScaler::new(false), &model, 0.5);
        let (scaled, found_inf) = weight_grad(&LossScaler::new(true), &model, 0.5);
        assert!(!found_inf);
        for (a, b) in plain.iter().zip(&scaled) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn overflow_is_reported_and_backs_off() {
        let device = Default::default();
        let model = LinearConfig::new(2, 1).init::<AD>(&device);
        let mut scaler = LossScaler::new(true).with_init_scale(f32::MAX);
        let (_, found_inf) = weight_grad(&scaler, &model, 10.0);
        assert!(found_inf);
        scaler.update(found_inf);
        assert_eq!(scaler.scale_factor(), f32::MAX * 0.5);
    }

    #[test]
    fn scale_grows_after_finite_run() {
        let mut scaler = LossScaler::new(true).with_growth_interval(3);
        for _ in 0..2 {
            scaler.update(false);
        }
        assert_eq!(scaler.scale_factor(), 65536.0);
        scaler.update(false);
        assert_eq!(scaler.scale_factor(), 131072.0);
        scaler.update(true);
        assert_eq!(scaler.scale_factor(), 65536.0);
    }

    #[test]
    fn disabled_scaler_is_a_passthrough() {
        let mut scaler = LossScaler::new(false);
        let loss = Tensor::<NdArray<f32>, 1>::from_floats([0.25], &Default::default());
        let out = scaler.scale(loss).into_data().to_vec::<f32>().unwrap();
        assert_eq!(out, vec![0.25]);
        scaler.update(true);
        assert_eq!(scaler.scale_factor(), 1.0);
        assert!(!scaler.is_enabled());
    }
}
