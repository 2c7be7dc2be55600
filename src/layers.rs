//! Parameter-owning layers over the flex operators.
//!
//! The functions in [`crate::backprop`] are pure; these layers bundle the
//! trainable parameters (theta, position bias, optional per-channel feature
//! bias) with the op call and a gradient-accumulation step, which is all a
//! manual training loop needs.
//!
//! In contrast to a traditional convolution layer there are two bias terms:
//! a bias inside the dynamically computed weight (`position_bias`, shape
//! `[Din, Dout]`) and a bias added to the output features (`feature_bias`,
//! shape `[Dout]`).

use crate::backprop::{self, OpError};
use crate::ops::dispatch::ConvBack;
use crate::tensors::{Ten32, Tensor, WithGrad};

/// Activation applied to the layer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// No activation.
    #[default]
    Linear,
    /// `max(0, x)` element-wise.
    Relu,
}

/// Gradients produced by one layer backward pass.
#[derive(Debug, Clone)]
pub struct FlexConvGrads {
    /// `dL/d(features)`, for chaining into an upstream layer.
    pub features: Ten32,
    pub theta: Ten32,
    pub position_bias: Ten32,
    /// Present when the layer has a feature bias.
    pub feature_bias: Option<Ten32>,
}

/// Trainable parameters shared by both convolution layers.
#[derive(Debug, Clone)]
pub struct FlexConvolution {
    /// Degree-1 term of the position transform, `[Dp, Din, Dout]`.
    pub theta: WithGrad<Ten32>,
    /// Degree-0 term of the position transform, `[Din, Dout]`.
    pub position_bias: WithGrad<Ten32>,
    /// Bias added to the output features, `[Dout]`.
    pub feature_bias: Option<WithGrad<Ten32>>,
    pub activation: Activation,
}

impl FlexConvolution {
    /// Creates a layer with `theta` drawn from `init` and zeroed biases.
    ///
    /// `dp` is the coordinate dimensionality, `din`/`dout` the input/output
    /// channel counts.
    pub fn new(dp: usize, din: usize, dout: usize, mut init: impl FnMut() -> f32) -> Self {
        let theta = Tensor::new(
            vec![dp, din, dout],
            (0..dp * din * dout).map(|_| init()).collect(),
        );
        Self {
            theta: WithGrad::new(theta),
            position_bias: WithGrad::new(Tensor::zeros(vec![din, dout])),
            feature_bias: Some(WithGrad::new(Tensor::zeros(vec![dout]))),
            activation: Activation::Linear,
        }
    }

    /// Sets the activation applied to the layer output.
    #[must_use]
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Removes the per-channel feature bias.
    #[must_use]
    pub fn without_feature_bias(mut self) -> Self {
        self.feature_bias = None;
        self
    }

    /// Runs the layer: flex convolution, feature bias, activation.
    ///
    /// # Returns
    /// - Output tensor `[B, Dout, N]`
    /// - Closure mapping `dL/d(out)` to a [`FlexConvGrads`] bundle
    ///
    /// # Errors
    /// Propagates [`OpError`] from the underlying op.
    pub fn forward(
        &self,
        features: &WithGrad<Ten32>,
        positions: &Ten32,
        neighborhood: &Tensor<u32>,
    ) -> Result<(Ten32, Box<dyn Fn(&Ten32) -> FlexConvGrads>), OpError> {
        let (out, back) = backprop::flex_convolution(
            features,
            &self.theta,
            &self.position_bias,
            neighborhood,
            positions,
        )?;
        Ok(finish_forward(out, back, self.feature_bias.as_ref(), self.activation))
    }

    /// Adds a backward pass's parameter gradients into this layer's
    /// gradient buffers. The `features` gradient is left to the caller for
    /// upstream chaining.
    pub fn apply_grads(&mut self, grads: &FlexConvGrads) {
        self.theta.accumulate(&grads.theta);
        self.position_bias.accumulate(&grads.position_bias);
        if let (Some(fb), Some(g)) = (self.feature_bias.as_mut(), grads.feature_bias.as_ref()) {
            fb.accumulate(g);
        }
    }

    /// Applies one SGD step to every parameter and zeros the gradients.
    pub fn sgd_step(&mut self, lr: f32) {
        backprop::sgd(&mut self.theta, lr);
        backprop::sgd(&mut self.position_bias, lr);
        if let Some(fb) = self.feature_bias.as_mut() {
            backprop::sgd(fb, lr);
        }
    }
}

/// Transposed flex convolution layer: same parameters, scatter semantics.
///
/// Used to push features from a coarse point set back onto a denser one;
/// see [`backprop::flex_convolution_transpose`].
#[derive(Debug, Clone)]
pub struct FlexConvolutionTranspose {
    pub theta: WithGrad<Ten32>,
    pub position_bias: WithGrad<Ten32>,
    pub feature_bias: Option<WithGrad<Ten32>>,
    pub activation: Activation,
}

impl FlexConvolutionTranspose {
    /// Creates a layer with `theta` drawn from `init` and zeroed biases.
    pub fn new(dp: usize, din: usize, dout: usize, mut init: impl FnMut() -> f32) -> Self {
        let theta = Tensor::new(
            vec![dp, din, dout],
            (0..dp * din * dout).map(|_| init()).collect(),
        );
        Self {
            theta: WithGrad::new(theta),
            position_bias: WithGrad::new(Tensor::zeros(vec![din, dout])),
            feature_bias: Some(WithGrad::new(Tensor::zeros(vec![dout]))),
            activation: Activation::Linear,
        }
    }

    /// Sets the activation applied to the layer output.
    #[must_use]
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Removes the per-channel feature bias.
    #[must_use]
    pub fn without_feature_bias(mut self) -> Self {
        self.feature_bias = None;
        self
    }

    /// Runs the layer: transposed flex convolution, feature bias, activation.
    ///
    /// # Errors
    /// Propagates [`OpError`] from the underlying op.
    pub fn forward(
        &self,
        features: &WithGrad<Ten32>,
        positions: &Ten32,
        neighborhood: &Tensor<u32>,
    ) -> Result<(Ten32, Box<dyn Fn(&Ten32) -> FlexConvGrads>), OpError> {
        let (out, back) = backprop::flex_convolution_transpose(
            features,
            &self.theta,
            &self.position_bias,
            neighborhood,
            positions,
        )?;
        Ok(finish_forward(out, back, self.feature_bias.as_ref(), self.activation))
    }

    /// Adds a backward pass's parameter gradients into this layer's
    /// gradient buffers.
    pub fn apply_grads(&mut self, grads: &FlexConvGrads) {
        self.theta.accumulate(&grads.theta);
        self.position_bias.accumulate(&grads.position_bias);
        if let (Some(fb), Some(g)) = (self.feature_bias.as_mut(), grads.feature_bias.as_ref()) {
            fb.accumulate(g);
        }
    }

    /// Applies one SGD step to every parameter and zeros the gradients.
    pub fn sgd_step(&mut self, lr: f32) {
        backprop::sgd(&mut self.theta, lr);
        backprop::sgd(&mut self.position_bias, lr);
        if let Some(fb) = self.feature_bias.as_mut() {
            backprop::sgd(fb, lr);
        }
    }
}

/// Applies feature bias and activation on top of a convolution output and
/// wraps the op backward into a [`FlexConvGrads`]-producing closure.
fn finish_forward(
    mut out: Ten32,
    back: Box<ConvBack>,
    feature_bias: Option<&WithGrad<Ten32>>,
    activation: Activation,
) -> (Ten32, Box<dyn Fn(&Ten32) -> FlexConvGrads>) {
    let b_count = out.shape[0];
    let dout = out.shape[1];
    let n = out.shape[2];

    let has_feature_bias = feature_bias.is_some();
    if let Some(fb) = feature_bias {
        for b in 0..b_count {
            for o in 0..dout {
                let bias = fb.value.data[o];
                for v in &mut out.data[(b * dout + o) * n..(b * dout + o + 1) * n] {
                    *v += bias;
                }
            }
        }
    }

    // pre-activation values, needed for the ReLU gradient mask
    let pre_act = (activation == Activation::Relu).then(|| out.data.clone());
    if activation == Activation::Relu {
        for v in &mut out.data {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
    }

    let layer_back = Box::new(move |topdiff: &Ten32| {
        let mut g = topdiff.clone();
        if let Some(z) = &pre_act {
            for (gv, &zv) in g.data.iter_mut().zip(z) {
                if zv <= 0.0 {
                    *gv = 0.0;
                }
            }
        }

        let fb_grad = has_feature_bias.then(|| {
            let mut acc = vec![0.0f32; dout];
            for b in 0..b_count {
                for (o, slot) in acc.iter_mut().enumerate() {
                    for j in 0..n {
                        *slot += g.data[(b * dout + o) * n + j];
                    }
                }
            }
            Tensor::new(vec![dout], acc)
        });

        let (grad_features, grad_theta, grad_bias) = back(&g);
        FlexConvGrads {
            features: grad_features,
            theta: grad_theta,
            position_bias: grad_bias,
            feature_bias: fb_grad,
        }
    });

    (out, layer_back)
}

/// Stateless neighborhood max-pooling layer.
///
/// In contrast to traditional pooling this operation has no sub-sampling
/// option; use [`backprop::flex_pooling`] directly when the argmax tensor is
/// not needed beyond the backward pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlexPooling;

impl FlexPooling {
    /// Runs the pooling op.
    ///
    /// # Errors
    /// Propagates [`OpError`] from the underlying op.
    pub fn forward(
        &self,
        features: &WithGrad<Ten32>,
        neighborhood: &Tensor<u32>,
    ) -> Result<(Ten32, Tensor<u32>, Box<crate::ops::dispatch::PoolBack>), OpError> {
        backprop::flex_pooling(features, neighborhood)
    }
}
