//! Parallel CPU backend operator kernels.
//!
//! # CPU Backend
//!
//! This module provides the reference implementations of the flex operators:
//! convolution, transposed convolution, and max-pooling over irregular
//! point-set neighborhoods, each returning its forward result together with a
//! backward closure.
//!
//! These CPU functions are the default when calling `backprop::xyz`; the
//! dispatch layer falls back here whenever no GPU backend is active or a GPU
//! kernel declines the call.
//!
//! ## Parallelism
//!
//! All kernels are data-parallel with [`rayon`](https://docs.rs/rayon):
//!
//! - Gather-style passes (conv forward, pool forward/backward) parallelize
//!   over contiguous output rows, so no two threads ever write the same cell.
//! - Scatter-style passes (deconv forward, all gradient accumulations into
//!   the feature tensor) parallelize over batch entries, whose output slices
//!   are disjoint.
//! - Parameter gradients (theta, bias) are shared across the whole batch;
//!   each batch entry produces a private partial which is summed sequentially
//!   afterwards, keeping accumulation deterministic.
//!
//! ## Preconditions
//!
//! Shape and index validation happens once in [`crate::backprop`]; kernels
//! here assume validated inputs and index without further checks.

use crate::ops::dispatch::{ConvBack, PoolBack};
use crate::tensors::{Ten32, Tensor, WithGrad};
use rayon::prelude::*;

/// Per-neighbor weight: `bias[di, o] + Σ_p theta[p, di, o] * delta[p]`.
#[inline]
fn flex_weight(theta: &[f32], bias: &[f32], delta: &[f32], din: usize, dout: usize, di: usize, o: usize) -> f32 {
    let mut w = bias[di * dout + o];
    for (p, &d) in delta.iter().enumerate() {
        w += theta[(p * din + di) * dout + o] * d;
    }
    w
}

/// Computes a flex convolution over point neighborhoods.
///
/// For each point `j`, iterates its `K` neighbors `nk`, forms a weight from
/// the relative position `positions[:, nk] - positions[:, j]` through the
/// affine transform `(theta, bias)`, and accumulates
/// `w · features[:, nk]` into `output[:, j]`.
///
/// # Shapes
/// - `features`: `[B, Din, N]`
/// - `theta`: `[Dp, Din, Dout]`, `bias`: `[Din, Dout]`
/// - `neighborhood`: `[B, K, N]` (`u32` point indices)
/// - `positions`: `[B, Dp, N]`
/// - output: `[B, Dout, N]`
///
/// # Returns
/// - Output tensor
/// - Backward closure mapping upstream `dL/d(out)` to
///   `(dL/d(features), dL/d(theta), dL/d(bias))`
pub fn flex_conv(
    features: &WithGrad<Ten32>,
    theta: &WithGrad<Ten32>,
    bias: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> (Ten32, Box<ConvBack>) {
    let b_count = neighborhood.shape[0];
    let k = neighborhood.shape[1];
    let n = neighborhood.shape[2];
    let dp = theta.value.shape[0];
    let din = theta.value.shape[1];
    let dout = theta.value.shape[2];

    let feat = &features.value.data;
    let th = &theta.value.data;
    let bi = &bias.value.data;
    let neigh = &neighborhood.data;
    let pos = &positions.data;

    let mut out_data = vec![0.0f32; b_count * dout * n];

    // one contiguous row of length N per (batch, dout) pair
    out_data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(row, out_row)| {
            let b = row / dout;
            let o = row % dout;
            let mut delta = vec![0.0f32; dp];
            for j in 0..n {
                let mut acc = 0.0f32;
                for kk in 0..k {
                    let nk = neigh[(b * k + kk) * n + j] as usize;
                    for (p, d) in delta.iter_mut().enumerate() {
                        *d = pos[(b * dp + p) * n + nk] - pos[(b * dp + p) * n + j];
                    }
                    for di in 0..din {
                        let w = flex_weight(th, bi, &delta, din, dout, di, o);
                        acc += w * feat[(b * din + di) * n + nk];
                    }
                }
                out_row[j] = acc;
            }
        });

    let out = Tensor::new(vec![b_count, dout, n], out_data);

    let feat_val = features.value.clone();
    let theta_val = theta.value.clone();
    let bias_val = bias.value.clone();
    let neigh_val = neighborhood.clone();
    let pos_val = positions.clone();

    let back = Box::new(move |topdiff: &Ten32| {
        flex_conv_grads(&feat_val, &theta_val, &bias_val, &neigh_val, &pos_val, topdiff)
    });

    (out, back)
}

/// Backward pass of [`flex_conv`], shared with the GPU dispatch paths.
///
/// Mirrors the forward reduction exactly: every forward read of
/// `features[b, di, nk]` produces one accumulate into
/// `grad_features[b, di, nk]`, and every weight evaluation contributes to
/// `grad_theta` / `grad_bias`.
pub(crate) fn flex_conv_grads(
    features: &Ten32,
    theta: &Ten32,
    bias: &Ten32,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
    topdiff: &Ten32,
) -> (Ten32, Ten32, Ten32) {
    let b_count = neighborhood.shape[0];
    let k = neighborhood.shape[1];
    let n = neighborhood.shape[2];
    let dp = theta.shape[0];
    let din = theta.shape[1];
    let dout = theta.shape[2];

    let feat = &features.data;
    let th = &theta.data;
    let bi = &bias.data;
    let neigh = &neighborhood.data;
    let pos = &positions.data;
    let g = &topdiff.data;

    let mut grad_f = vec![0.0f32; b_count * din * n];

    // Feature gradients per batch entry are disjoint; theta/bias gradients
    // are shared, so each batch entry emits a partial summed afterwards.
    let partials: Vec<(Vec<f32>, Vec<f32>)> = grad_f
        .par_chunks_mut(din * n)
        .enumerate()
        .map(|(b, gf)| {
            let mut gt = vec![0.0f32; dp * din * dout];
            let mut gb = vec![0.0f32; din * dout];
            let mut delta = vec![0.0f32; dp];
            for j in 0..n {
                for kk in 0..k {
                    let nk = neigh[(b * k + kk) * n + j] as usize;
                    for (p, d) in delta.iter_mut().enumerate() {
                        *d = pos[(b * dp + p) * n + nk] - pos[(b * dp + p) * n + j];
                    }
                    for di in 0..din {
                        let f_nk = feat[(b * din + di) * n + nk];
                        for o in 0..dout {
                            let gv = g[(b * dout + o) * n + j];
                            let w = flex_weight(th, bi, &delta, din, dout, di, o);
                            gf[di * n + nk] += w * gv;
                            gb[di * dout + o] += f_nk * gv;
                            for (p, &d) in delta.iter().enumerate() {
                                gt[(p * din + di) * dout + o] += d * f_nk * gv;
                            }
                        }
                    }
                }
            }
            (gt, gb)
        })
        .collect();

    let mut grad_t = vec![0.0f32; dp * din * dout];
    let mut grad_b = vec![0.0f32; din * dout];
    for (gt, gb) in partials {
        for (acc, v) in grad_t.iter_mut().zip(gt) {
            *acc += v;
        }
        for (acc, v) in grad_b.iter_mut().zip(gb) {
            *acc += v;
        }
    }

    (
        Tensor::new(features.shape.clone(), grad_f),
        Tensor::new(theta.shape.clone(), grad_t),
        Tensor::new(bias.shape.clone(), grad_b),
    )
}

/// Computes a transposed flex convolution (scatter form of [`flex_conv`]).
///
/// Instead of gathering neighbor features into each point, every point
/// scatters its own features to its neighbors:
/// `output[:, nk] += w · features[:, j]` with the same
/// relative-position-conditioned weight as the forward convolution.
///
/// Shapes match [`flex_conv`]; the output is `[B, Dout, N]`.
///
/// # Returns
/// - Output tensor
/// - Backward closure mapping upstream `dL/d(out)` to
///   `(dL/d(features), dL/d(theta), dL/d(bias))`
pub fn flex_deconv(
    features: &WithGrad<Ten32>,
    theta: &WithGrad<Ten32>,
    bias: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> (Ten32, Box<ConvBack>) {
    let b_count = neighborhood.shape[0];
    let k = neighborhood.shape[1];
    let n = neighborhood.shape[2];
    let dp = theta.value.shape[0];
    let din = theta.value.shape[1];
    let dout = theta.value.shape[2];

    let feat = &features.value.data;
    let th = &theta.value.data;
    let bi = &bias.value.data;
    let neigh = &neighborhood.data;
    let pos = &positions.data;

    let mut out_data = vec![0.0f32; b_count * dout * n];

    // scatter writes stay inside one batch slice, so batch is the parallel axis
    out_data
        .par_chunks_mut(dout * n)
        .enumerate()
        .for_each(|(b, out_b)| {
            let mut delta = vec![0.0f32; dp];
            for j in 0..n {
                for kk in 0..k {
                    let nk = neigh[(b * k + kk) * n + j] as usize;
                    for (p, d) in delta.iter_mut().enumerate() {
                        *d = pos[(b * dp + p) * n + nk] - pos[(b * dp + p) * n + j];
                    }
                    for di in 0..din {
                        let f_j = feat[(b * din + di) * n + j];
                        for o in 0..dout {
                            let w = flex_weight(th, bi, &delta, din, dout, di, o);
                            out_b[o * n + nk] += w * f_j;
                        }
                    }
                }
            }
        });

    let out = Tensor::new(vec![b_count, dout, n], out_data);

    let feat_val = features.value.clone();
    let theta_val = theta.value.clone();
    let bias_val = bias.value.clone();
    let neigh_val = neighborhood.clone();
    let pos_val = positions.clone();

    let back = Box::new(move |topdiff: &Ten32| {
        flex_deconv_grads(&feat_val, &theta_val, &bias_val, &neigh_val, &pos_val, topdiff)
    });

    (out, back)
}

/// Backward pass of [`flex_deconv`].
///
/// The forward scatter `out[o, nk] += w · f[di, j]` turns into the gather
/// `grad_f[di, j] += w · g[o, nk]`, with parameter gradients accumulated at
/// the same `(j, nk)` pairs the forward pass visited.
pub(crate) fn flex_deconv_grads(
    features: &Ten32,
    theta: &Ten32,
    bias: &Ten32,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
    topdiff: &Ten32,
) -> (Ten32, Ten32, Ten32) {
    let b_count = neighborhood.shape[0];
    let k = neighborhood.shape[1];
    let n = neighborhood.shape[2];
    let dp = theta.shape[0];
    let din = theta.shape[1];
    let dout = theta.shape[2];

    let feat = &features.data;
    let th = &theta.data;
    let bi = &bias.data;
    let neigh = &neighborhood.data;
    let pos = &positions.data;
    let g = &topdiff.data;

    let mut grad_f = vec![0.0f32; b_count * din * n];

    let partials: Vec<(Vec<f32>, Vec<f32>)> = grad_f
        .par_chunks_mut(din * n)
        .enumerate()
        .map(|(b, gf)| {
            let mut gt = vec![0.0f32; dp * din * dout];
            let mut gb = vec![0.0f32; din * dout];
            let mut delta = vec![0.0f32; dp];
            for j in 0..n {
                for kk in 0..k {
                    let nk = neigh[(b * k + kk) * n + j] as usize;
                    for (p, d) in delta.iter_mut().enumerate() {
                        *d = pos[(b * dp + p) * n + nk] - pos[(b * dp + p) * n + j];
                    }
                    for di in 0..din {
                        let f_j = feat[(b * din + di) * n + j];
                        for o in 0..dout {
                            let gv = g[(b * dout + o) * n + nk];
                            let w = flex_weight(th, bi, &delta, din, dout, di, o);
                            gf[di * n + j] += w * gv;
                            gb[di * dout + o] += f_j * gv;
                            for (p, &d) in delta.iter().enumerate() {
                                gt[(p * din + di) * dout + o] += d * f_j * gv;
                            }
                        }
                    }
                }
            }
            (gt, gb)
        })
        .collect();

    let mut grad_t = vec![0.0f32; dp * din * dout];
    let mut grad_b = vec![0.0f32; din * dout];
    for (gt, gb) in partials {
        for (acc, v) in grad_t.iter_mut().zip(gt) {
            *acc += v;
        }
        for (acc, v) in grad_b.iter_mut().zip(gb) {
            *acc += v;
        }
    }

    (
        Tensor::new(features.shape.clone(), grad_f),
        Tensor::new(theta.shape.clone(), grad_t),
        Tensor::new(bias.shape.clone(), grad_b),
    )
}

/// Computes a max-pool over point neighborhoods.
///
/// For each point `j` and channel `d`,
/// `out[b, d, j] = max_k features[b, d, neighborhood[b, k, j]]`, recording
/// the absolute point index that produced the maximum. Ties resolve to the
/// first-encountered neighbor (ascending `k`), making the argmax
/// deterministic.
///
/// # Returns
/// - Output tensor `[B, Din, N]`
/// - Argmax tensor `[B, Din, N]` (`u32` point indices)
/// - Backward closure routing upstream gradients to the argmax sources
pub fn flex_pool(
    features: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
) -> (Ten32, Tensor<u32>, Box<PoolBack>) {
    let b_count = neighborhood.shape[0];
    let k = neighborhood.shape[1];
    let n = neighborhood.shape[2];
    let din = features.value.shape[1];

    let feat = &features.value.data;
    let neigh = &neighborhood.data;

    let mut out_data = vec![0.0f32; b_count * din * n];
    let mut arg_data = vec![0u32; b_count * din * n];

    out_data
        .par_chunks_mut(n)
        .zip(arg_data.par_chunks_mut(n))
        .enumerate()
        .for_each(|(row, (out_row, arg_row))| {
            let b = row / din;
            let d = row % din;
            for j in 0..n {
                let mut best = f32::NEG_INFINITY;
                let mut best_idx = 0u32;
                for kk in 0..k {
                    let nk = neigh[(b * k + kk) * n + j];
                    let v = feat[(b * din + d) * n + nk as usize];
                    // strict comparison keeps the first-encountered index on ties
                    if v > best {
                        best = v;
                        best_idx = nk;
                    }
                }
                out_row[j] = best;
                arg_row[j] = best_idx;
            }
        });

    let out = Tensor::new(vec![b_count, din, n], out_data);
    let argmax = Tensor::new(vec![b_count, din, n], arg_data);

    let feat_shape = features.value.shape.clone();
    let arg_val = argmax.clone();

    let back = Box::new(move |topdiff: &Ten32| flex_pool_grads(&feat_shape, &arg_val, topdiff));

    (out, argmax, back)
}

/// Backward pass of [`flex_pool`]: routes each upstream gradient cell to the
/// recorded argmax source, accumulating additively because several pooled
/// outputs may share one source point.
pub(crate) fn flex_pool_grads(
    features_shape: &[usize],
    argmax: &Tensor<u32>,
    topdiff: &Ten32,
) -> Ten32 {
    let n = features_shape[2];
    let g = &topdiff.data;
    let arg = &argmax.data;

    let mut grad_f = vec![0.0f32; features_shape.iter().product()];

    // argmax indices stay within their own (batch, channel) row
    grad_f
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(row, gf_row)| {
            for j in 0..n {
                let src = arg[row * n + j] as usize;
                gf_row[src] += g[row * n + j];
            }
        });

    Tensor::new(features_shape.to_vec(), grad_f)
}

/// Performs one step of stochastic gradient descent on a parameter tensor.
///
/// # Behavior
/// - Updates `w.value` in-place: `w := w - lr · grad`
/// - Zeros out `w.grad` after the update
pub fn sgd(w: &mut WithGrad<Ten32>, lr: f32) {
    for (param, grad) in w.value.data.iter_mut().zip(&w.grad.data) {
        *param -= lr * *grad;
    }
    for grad in &mut w.grad.data {
        *grad = 0.0;
    }
}
