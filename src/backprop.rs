//! Differentiable flex operators with input validation.
//!
//! # Operator Front-Ends
//!
//! This module is the public surface of the crate: one function per operator,
//! each checking its shape and index preconditions once, then dispatching
//! into the active compute backend.
//!
//! **Operators:**
//! - **Flex convolution:** per-neighbor weights from a learned affine
//!   transform of relative positions, reduced over the neighborhood.
//! - **Transposed flex convolution:** the scatter form, sending each point's
//!   features out to its neighbors.
//! - **Flex pooling:** element-wise maximum over the neighborhood, with an
//!   argmax tensor for gradient routing.
//! - **SGD:** in-place parameter update with gradient reset.
//!
//! ## Backprop Pattern
//!
//! Each operation follows the same pattern:
//! 1. **Inputs** are references to `WithGrad<Ten32>` for differentiable
//!    tensors and plain tensors for the rest.
//! 2. **Validation** rejects malformed inputs with a structured [`OpError`]
//!    before any kernel runs.
//! 3. **Forward pass** computes a freshly allocated output.
//! 4. **Backward pass** is a closure capturing cloned inputs; it may be
//!    invoked any number of times.
//!
//! Every call is a pure function of its inputs; no state is shared between
//! invocations. An `Err` is fatal to the single invocation only.

use crate::ops::dispatch::{self, ConvBack, PoolBack};
use crate::tensors::{Ten32, Tensor, WithGrad};

/// Structured failure raised when an operator's preconditions are violated.
///
/// All variants are fatal to the single op invocation; nothing is retried
/// and no output is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// A tensor does not have the required number of dimensions.
    Rank {
        /// Which input was malformed.
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A named dimension disagrees between two inputs.
    Dim {
        /// Which dimension disagrees (e.g. `"batch"`, `"points"`).
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A neighborhood entry indexes past the point dimension.
    NeighborOutOfRange { index: u32, points: usize },
    /// The neighborhood has `K == 0`; there is nothing to reduce over.
    EmptyNeighborhood,
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::Rank { what, expected, got } => {
                write!(f, "{what}: expected rank {expected}, got rank {got}")
            }
            OpError::Dim { what, expected, got } => {
                write!(f, "{what} dimension mismatch: expected {expected}, got {got}")
            }
            OpError::NeighborOutOfRange { index, points } => {
                write!(f, "neighbor index {index} out of range for {points} points")
            }
            OpError::EmptyNeighborhood => {
                write!(f, "neighborhood has K == 0 neighbors")
            }
        }
    }
}

impl std::error::Error for OpError {}

fn check_rank(what: &'static str, t: &[usize], expected: usize) -> Result<(), OpError> {
    if t.len() != expected {
        return Err(OpError::Rank {
            what,
            expected,
            got: t.len(),
        });
    }
    Ok(())
}

fn check_dim(what: &'static str, expected: usize, got: usize) -> Result<(), OpError> {
    if expected != got {
        return Err(OpError::Dim { what, expected, got });
    }
    Ok(())
}

/// Validates the inputs shared by both convolution variants.
fn check_conv_inputs(
    features: &Ten32,
    theta: &Ten32,
    bias: &Ten32,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> Result<(), OpError> {
    check_rank("features", &features.shape, 3)?;
    check_rank("theta", &theta.shape, 3)?;
    check_rank("bias", &bias.shape, 2)?;
    check_rank("neighborhood", &neighborhood.shape, 3)?;
    check_rank("positions", &positions.shape, 3)?;

    let (b, din, n) = (features.shape[0], features.shape[1], features.shape[2]);
    let (dp, dout) = (theta.shape[0], theta.shape[2]);

    check_dim("neighborhood batch", b, neighborhood.shape[0])?;
    check_dim("positions batch", b, positions.shape[0])?;
    check_dim("neighborhood points", n, neighborhood.shape[2])?;
    check_dim("positions points", n, positions.shape[2])?;
    check_dim("positions coordinate", dp, positions.shape[1])?;
    check_dim("theta input channels", din, theta.shape[1])?;
    check_dim("bias input channels", din, bias.shape[0])?;
    check_dim("bias output channels", dout, bias.shape[1])?;

    check_neighborhood(neighborhood, n)
}

/// Rejects empty neighborhoods and out-of-range indices up front, so the
/// device kernels can index without bounds checks.
fn check_neighborhood(neighborhood: &Tensor<u32>, points: usize) -> Result<(), OpError> {
    if neighborhood.shape[1] == 0 {
        return Err(OpError::EmptyNeighborhood);
    }
    if let Some(&bad) = neighborhood.data.iter().find(|&&i| i as usize >= points) {
        return Err(OpError::NeighborOutOfRange { index: bad, points });
    }
    Ok(())
}

/// Computes a flex convolution over point neighborhoods.
///
/// For each point, iterates its `K` neighbors, weights each neighbor's
/// features by `bias + theta · (neighbor position − point position)`, and
/// sums the result into the output channels.
///
/// # Shapes
/// - `features`: `[B, Din, N]`, `theta`: `[Dp, Din, Dout]`,
///   `bias`: `[Din, Dout]`, `neighborhood`: `[B, K, N]`,
///   `positions`: `[B, Dp, N]` → output `[B, Dout, N]`
///
/// # Returns
/// - Output tensor
/// - Closure mapping `dL/d(out)` to
///   `(dL/d(features), dL/d(theta), dL/d(bias))`
///
/// # Errors
/// Returns [`OpError`] on rank or dimension mismatches, a neighbor index
/// `≥ N`, or `K == 0`.
///
/// # Example
/// ```rust
/// use flexconv::backprop::flex_convolution;
/// use flexconv::tensors::{Tensor, WithGrad};
/// use flexconv::tensor;
///
/// let features = WithGrad::new(tensor!([[[2.0, 3.0]]]));
/// let theta = WithGrad::new(tensor!([[[0.5]]]));
/// let bias = WithGrad::new(tensor!([[0.25]]));
/// let neighborhood = Tensor::new(vec![1, 1, 2], vec![1u32, 0]);
/// let positions = tensor!([[[0.0, 1.0]]]);
/// let (out, back) =
///     flex_convolution(&features, &theta, &bias, &neighborhood, &positions).unwrap();
/// let (grad_f, grad_theta, grad_bias) = back(&out.zeros_like());
/// ```
pub fn flex_convolution(
    features: &WithGrad<Ten32>,
    theta: &WithGrad<Ten32>,
    bias: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> Result<(Ten32, Box<ConvBack>), OpError> {
    check_conv_inputs(&features.value, &theta.value, &bias.value, neighborhood, positions)?;
    Ok(dispatch::flex_conv(features, theta, bias, neighborhood, positions))
}

/// Computes a transposed flex convolution (the scatter form).
///
/// Each point sends `weight · own features` to every one of its neighbors;
/// the weight function is identical to [`flex_convolution`]. Upsampling
/// layers use this to push coarse features back onto a denser point set.
///
/// Shapes, returns, and errors match [`flex_convolution`].
pub fn flex_convolution_transpose(
    features: &WithGrad<Ten32>,
    theta: &WithGrad<Ten32>,
    bias: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> Result<(Ten32, Box<ConvBack>), OpError> {
    check_conv_inputs(&features.value, &theta.value, &bias.value, neighborhood, positions)?;
    Ok(dispatch::flex_deconv(features, theta, bias, neighborhood, positions))
}

/// Computes a max-pool over point neighborhoods.
///
/// `out[b, d, n] = max_k features[b, d, neighborhood[b, k, n]]`. The argmax
/// tensor records, per output cell, the absolute point index that won; ties
/// resolve to the first-encountered neighbor, so results are deterministic.
///
/// # Returns
/// - Output tensor `[B, Din, N]`
/// - Argmax tensor `[B, Din, N]`
/// - Closure mapping `dL/d(out)` to `dL/d(features)` by routing each cell's
///   gradient to its argmax source
///
/// # Errors
/// Returns [`OpError`] on rank or dimension mismatches, a neighbor index
/// `≥ N`, or `K == 0` (an empty neighborhood has no maximum).
pub fn flex_pooling(
    features: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
) -> Result<(Ten32, Tensor<u32>, Box<PoolBack>), OpError> {
    check_rank("features", &features.value.shape, 3)?;
    check_rank("neighborhood", &neighborhood.shape, 3)?;

    let (b, n) = (features.value.shape[0], features.value.shape[2]);
    check_dim("neighborhood batch", b, neighborhood.shape[0])?;
    check_dim("neighborhood points", n, neighborhood.shape[2])?;
    check_neighborhood(neighborhood, n)?;

    Ok(dispatch::flex_pool(features, neighborhood))
}

/// Performs an in-place stochastic gradient descent update.
///
/// Applies `param = param - learning_rate * gradient`, then zeros the
/// gradient.
pub fn sgd(w: &mut WithGrad<Ten32>, lr: f32) {
    dispatch::sgd(w, lr)
}
