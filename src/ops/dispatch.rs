//! Operation Dispatch Layer
//!
//! This module selects the correct backend (CPU, WGPU, CUDA) at runtime for
//! each operator, based on the global `Backend`.
//!
//! Each function attempts backend-specific implementations in priority order:
//! 1. `Cuda` (if enabled)
//! 2. `Wgpu` (if enabled)
//! 3. Falls back to `Cpu`
//!
//! GPU implementations return `Option`: `None` means the kernel declined the
//! call (unsupported configuration or device failure) and the CPU reference
//! path runs instead, so a result is always produced.
//!
//! The transposed convolution has no GPU forward: its scatter writes would
//! need floating-point atomics, which WGSL does not provide, so it always
//! runs on the CPU.

use crate::backend::{Backend, get_backend};
use crate::tensors::{Ten32, Tensor, WithGrad};

/// Backward closure of the convolution ops: maps upstream `dL/d(out)` to
/// `(dL/d(features), dL/d(theta), dL/d(bias))`.
pub type ConvBack = dyn Fn(&Ten32) -> (Ten32, Ten32, Ten32);
/// Backward closure of the pooling op: maps upstream `dL/d(out)` to
/// `dL/d(features)`.
pub type PoolBack = dyn Fn(&Ten32) -> Ten32;

/// Dispatches the flex convolution to the selected backend.
///
/// # Behavior
/// Attempts CUDA → WGPU → CPU, depending on availability and features. The
/// backward closure always evaluates on the CPU.
pub fn flex_conv(
    features: &WithGrad<Ten32>,
    theta: &WithGrad<Ten32>,
    bias: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> (Ten32, Box<ConvBack>) {
    match get_backend() {
        Backend::Cuda => {
            #[cfg(feature = "cuda")]
            {
                if let Some(result) =
                    super::cuda::cuda_flex_conv(features, theta, bias, neighborhood, positions)
                {
                    return result;
                }
            }
        }
        Backend::Wgpu => {
            #[cfg(feature = "wgpu")]
            {
                if let Some(result) =
                    super::wgpu::wgpu_flex_conv(features, theta, bias, neighborhood, positions)
                {
                    return result;
                }
            }
        }
        _ => {}
    }

    super::cpu::flex_conv(features, theta, bias, neighborhood, positions)
}

/// Dispatches the transposed flex convolution.
///
/// # Behavior
/// Always runs on the CPU: the forward pass scatters into the output and
/// WGSL offers no floating-point atomics to make that race-free on the GPU.
pub fn flex_deconv(
    features: &WithGrad<Ten32>,
    theta: &WithGrad<Ten32>,
    bias: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> (Ten32, Box<ConvBack>) {
    super::cpu::flex_deconv(features, theta, bias, neighborhood, positions)
}

/// Dispatches the neighborhood max-pool to the selected backend.
///
/// # Returns
/// - Output tensor
/// - Argmax tensor recording the winning point index per output cell
/// - Backward closure routing gradients to the argmax sources
///
/// # Behavior
/// Attempts CUDA → WGPU → CPU, depending on availability and features.
pub fn flex_pool(
    features: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
) -> (Ten32, Tensor<u32>, Box<PoolBack>) {
    match get_backend() {
        Backend::Cuda => {
            #[cfg(feature = "cuda")]
            {
                if let Some(result) = super::cuda::cuda_flex_pool(features, neighborhood) {
                    return result;
                }
            }
        }
        Backend::Wgpu => {
            #[cfg(feature = "wgpu")]
            {
                if let Some(result) = super::wgpu::wgpu_flex_pool(features, neighborhood) {
                    return result;
                }
            }
        }
        _ => {}
    }

    super::cpu::flex_pool(features, neighborhood)
}

/// Dispatches a stochastic gradient descent step.
///
/// Parameter tensors are small compared to the per-point tensors, so the
/// update always runs on the CPU.
pub fn sgd(w: &mut WithGrad<Ten32>, lr: f32) {
    super::cpu::sgd(w, lr)
}
