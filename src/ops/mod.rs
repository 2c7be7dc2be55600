//! # Operator Backends
//!
//! This module implements the flex operators across compute backends and the
//! dispatch logic that picks one per call.
//!
//! ## Submodules
//!
//! - [`cpu`] — rayon-parallel reference kernels (default fallback backend)
//! - [`wgpu`] *(opt-in)* — GPU compute shader pipelines using `wgpu`
//! - [`cuda`] *(planned)* — CUDA backend for NVIDIA (dispatches to WGPU)
//! - [`dispatch`] — runtime backend switching and unified operator interfaces
//!
//! ## Backend Selection
//!
//! Operators are backend-agnostic from the caller's perspective: the fronts
//! in [`crate::backprop`] validate inputs once and forward into [`dispatch`],
//! which consults the global [`crate::backend::Backend`] and falls back to
//! the CPU whenever a GPU kernel is unavailable or declines the call.
//!
//! ## Extending the Backend
//!
//! To add a new operator:
//!
//! 1. Implement it in one or more backends (e.g. `cpu::my_op`, `wgpu::my_op`)
//! 2. Add it to the `dispatch` module for unified access
//! 3. Add shape/consistency checks in `backprop` before the dispatch call
//!
//! ## Notes
//!
//! - GPU acceleration is only used when the feature flags are enabled
//! - CUDA support is not implemented yet; the module dispatches to WebGPU
//! - Forward kernels return both output tensors and backward closures

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod dispatch;
#[cfg(any(feature = "wgpu", feature = "cuda"))]
pub mod wgpu;
