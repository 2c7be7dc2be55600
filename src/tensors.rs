//! Core tensor data structures.
//!
//! This module defines the plain data containers every operator in this crate
//! works on: dense N-dimensional tensors with a runtime shape and flat
//! row-major storage.
//!
//! It supports:
//! - Dense tensors built from a shape plus row-major data
//! - Zero-filled allocation matching a given shape
//! - `WithGrad` wrappers pairing a value with its gradient for manual backprop
//! - Nested-array tensor literals via the `tensor!` macro
//!
//! ## Design Highlights
//! - Tensors are strongly typed: `Tensor<T>` for any element type. Numeric
//!   tensors in this crate are `f32` (see [`Ten32`]); neighborhood and argmax
//!   tensors are `Tensor<u32>`.
//! - Shape is stored as a `Vec<usize>` and enforced at construction.
//! - All operator inputs are read-only; every op allocates fresh outputs, so a
//!   `Tensor` never aliases another.
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting, slicing, or shape inference
//!
//! ## Example
//!
//! ```rust
//! use flexconv::tensors::Ten32;
//! let t = Ten32::new(vec![1, 2, 3], vec![0.5; 6]);
//! assert_eq!(t.shape, vec![1, 2, 3]);
//! ```

/// An N-dimensional tensor: a shape plus flat row-major data.
///
/// `shape` defines the structure (`[2, 3]` for a 2×3 matrix) and `data`
/// holds the flattened elements in row-major order. The fields are public
/// so kernels can index the raw storage directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

/// Alias for the `f32` tensors every numeric operator in this crate consumes.
pub type Ten32 = Tensor<f32>;

impl<T> Tensor<T> {
    /// Creates a tensor from a shape and its flat row-major data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape
    /// product. A mismatched literal is a programming error, not a runtime
    /// condition, so it is not reported through [`OpError`].
    ///
    /// [`OpError`]: crate::backprop::OpError
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// Replaces this tensor's data with another tensor of the same shape.
    ///
    /// # Panics
    /// Panics if shapes do not match.
    pub fn update(&mut self, mut other: Tensor<T>) {
        assert_eq!(self.shape, other.shape, "shape mismatch");
        std::mem::swap(&mut self.data, &mut other.data);
    }
}

impl<T: Clone + Default> Tensor<T> {
    /// Creates a tensor of the given shape filled with `T::default()`.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product::<usize>();
        Self {
            shape,
            data: vec![T::default(); len],
        }
    }

    /// Creates a zero tensor with the same shape as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }
}

/// A container for tracking gradients of values (used in manual backprop).
///
/// Typically used as `WithGrad<Ten32>` for trainable operator parameters.
#[derive(Debug, Clone)]
pub struct WithGrad<T> {
    pub value: T,
    pub grad: T,
}

impl<T: Clone + Default> WithGrad<Tensor<T>> {
    /// Wraps a tensor together with a zero-initialized gradient of the same
    /// shape.
    pub fn new(value: Tensor<T>) -> Self {
        let grad = value.zeros_like();
        Self { value, grad }
    }

    /// Adds `delta` element-wise into the stored gradient.
    ///
    /// # Panics
    /// Panics if shapes do not match.
    pub fn accumulate(&mut self, delta: &Tensor<T>)
    where
        T: std::ops::AddAssign + Copy,
    {
        assert_eq!(self.grad.shape, delta.shape, "gradient shape mismatch");
        for (g, d) in self.grad.data.iter_mut().zip(&delta.data) {
            *g += *d;
        }
    }
}

/// Builds a tensor from nested array literals.
///
/// Any nesting depth works as long as the sublists agree in shape.
///
/// # Example
/// ```
/// use flexconv::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let rows = vec![ $( tensor!($inner) ),+ ];
        let inner_shape = rows[0].shape.clone();
        let mut shape = vec![rows.len()];
        shape.extend_from_slice(&inner_shape);
        let mut data = Vec::with_capacity(rows.len() * rows[0].data.len());
        for row in rows {
            assert_eq!(row.shape, inner_shape, "ragged tensor literal");
            data.extend(row.data);
        }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
