//! Neighborhood construction for point clouds.
//!
//! The flex operators consume a precomputed `[B, K, N]` index tensor; this
//! module builds one with a brute-force K-nearest-neighbor search over
//! squared Euclidean distance. Brute force is quadratic in the point count
//! but exact, deterministic, and batch-parallel, which is all the operator
//! tests and demos need.

use crate::backprop::OpError;
use crate::tensors::{Ten32, Tensor};
use rayon::prelude::*;

/// Builds a `[B, K, N]` neighborhood tensor by brute-force KNN over the
/// positions `[B, Dp, N]`.
///
/// Convention: each point is its own first neighbor (`k = 0`), followed by
/// the remaining points in ascending squared distance; distance ties resolve
/// to the lower point index, so the output is fully deterministic.
///
/// # Errors
/// Returns [`OpError`] if `positions` is not rank 3, `k == 0`, or `k > N`.
///
/// # Example
/// ```rust
/// use flexconv::neighborhood::knn_bruteforce;
/// use flexconv::tensor;
///
/// let positions = tensor!([[[0.0, 1.0, 5.0]]]);
/// let neigh = knn_bruteforce(&positions, 2).unwrap();
/// assert_eq!(neigh.shape, vec![1, 2, 3]);
/// // point 0 is its own first neighbor, point 1 its nearest other point
/// assert_eq!(neigh.data[0], 0);
/// assert_eq!(neigh.data[3], 1);
/// ```
pub fn knn_bruteforce(positions: &Ten32, k: usize) -> Result<Tensor<u32>, OpError> {
    if positions.shape.len() != 3 {
        return Err(OpError::Rank {
            what: "positions",
            expected: 3,
            got: positions.shape.len(),
        });
    }
    let b_count = positions.shape[0];
    let dp = positions.shape[1];
    let n = positions.shape[2];

    if k == 0 {
        return Err(OpError::EmptyNeighborhood);
    }
    if k > n {
        return Err(OpError::Dim {
            what: "neighborhood size",
            expected: n,
            got: k,
        });
    }

    let pos = &positions.data;
    let mut neigh = vec![0u32; b_count * k * n];

    neigh.par_chunks_mut(k * n).enumerate().for_each(|(b, nb)| {
        let mut order: Vec<(f32, u32)> = Vec::with_capacity(n - 1);
        for j in 0..n {
            order.clear();
            for i in 0..n {
                if i == j {
                    continue;
                }
                let mut d2 = 0.0f32;
                for p in 0..dp {
                    let diff = pos[(b * dp + p) * n + i] - pos[(b * dp + p) * n + j];
                    d2 += diff * diff;
                }
                order.push((d2, i as u32));
            }
            order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            nb[j] = j as u32;
            for kk in 1..k {
                nb[kk * n + j] = order[kk - 1].1;
            }
        }
    });

    Ok(Tensor::new(vec![b_count, k, n], neigh))
}
