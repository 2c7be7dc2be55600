//! flexconv: flexible convolution operators for point clouds in Rust.
//!
//! Point clouds have no grid, so a regular convolution does not apply.
//! Instead, each point carries a list of its K nearest neighbors, and every
//! operator in this crate reduces over that irregular neighborhood: the flex
//! convolution weights each neighbor's features by a learned affine transform
//! of the relative position, the transposed variant scatters features out to
//! the neighbors, and flex pooling takes an element-wise maximum while
//! recording the winning neighbor for gradient routing.
//!
//! # Features
//!
//! - Forward kernels paired with manual backward closures for every operator.
//! - Structured precondition errors — malformed shapes or neighbor indices
//!   are rejected before any kernel runs.
//! - Rayon-parallel CPU kernels, with optional GPU forward passes via `wgpu`.
//! - Brute-force KNN neighborhood construction and parameter-owning layers
//!   for manual training loops.
//!
//! # Modules
//!
//! - [`tensors`] — Core tensor data structures and the `tensor!` macro.
//! - [`backprop`] — Validated operator fronts with backward closures.
//! - [`layers`] — Parameter-owning convolution and pooling layers.
//! - [`neighborhood`] — Brute-force KNN index construction.
//! - [`backend`] — Runtime compute-backend selection.
//! - [`ops`] — Per-backend kernel implementations and dispatch.
//!
//! # Example
//!
//! ```rust
//! use flexconv::backprop::flex_pooling;
//! use flexconv::neighborhood::knn_bruteforce;
//! use flexconv::tensor;
//! use flexconv::tensors::WithGrad;
//!
//! let positions = tensor!([[[0.0, 1.0, 2.0]]]);
//! let features = WithGrad::new(tensor!([[[5.0, 1.0, 3.0]]]));
//! let neigh = knn_bruteforce(&positions, 2).unwrap();
//! let (pooled, argmax, back) = flex_pooling(&features, &neigh).unwrap();
//! assert_eq!(pooled.data, vec![5.0, 5.0, 3.0]);
//! assert_eq!(argmax.data, vec![0, 0, 2]);
//! let grad = back(&pooled.zeros_like());
//! assert!(grad.data.iter().all(|&g| g == 0.0));
//! ```

pub mod backend;
pub mod backprop;
pub mod layers;
pub mod neighborhood;
pub mod ops;
pub mod tensors;
