//! Backend selection module.
//!
//! This module defines the available compute backends for the operator
//! kernels and provides functions to set and get the current backend.
//!
//! # Supported Backends
//!
//! - `Cpu` — Pure Rust backend parallelized with rayon (default).
//! - `Wgpu` — GPU-accelerated backend using `wgpu` (if the feature is on).
//! - `Cuda` — Placeholder; currently dispatches through the wgpu path.
//!
//! The backend is stored globally in an `AtomicU8`, so it can be switched at
//! runtime between op invocations. Backend choice only affects where a kernel
//! runs; the numeric contract of every operator is identical across backends.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported compute backends.
///
/// Only `Cpu` and `Wgpu` carry real kernels. `Cuda` is reserved and falls
/// through to the wgpu implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Rayon-parallel CPU kernels (default).
    #[default]
    Cpu = 0,
    /// GPU compute shaders via `wgpu`.
    Wgpu,
    /// Reserved for a future CUDA backend.
    Cuda,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            2 => Ok(Self::Cuda),
            _ => Err(()),
        }
    }
}

/// Process-wide active backend, encoded as the enum's `u8` value.
///
/// Release/acquire ordering is enough here: the backend is expected
/// to change rarely and never mid-kernel.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the active backend to use for operator computation.
///
/// # Example
///
/// ```
/// use flexconv::backend::{set_backend, Backend};
/// set_backend(Backend::Wgpu);
/// # set_backend(Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the currently active compute backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
///
/// # Example
///
/// ```
/// use flexconv::backend::get_backend;
/// let backend = get_backend();
/// ```
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}
