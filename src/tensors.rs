//! Core tensor data structure.
//!
//! # Tensors
//!
//! A [`Tensor`] is an N-dimensional, row-major `f32` buffer plus an optional
//! link into the autograd tape.
//!
//! - Cloning a tensor is cheap and aliases both the storage and the graph link,
//!   so registering a clone as a variable registers every alias.
//! - [`Tensor::detach`] aliases the storage only; the result starts a fresh
//!   subgraph.
//! - Storage is only written through [`Tensor::fill`], [`Tensor::copy_from`]
//!   and by the backward engine when it writes gradient buffers.
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting; binary operations require equal shapes
//! - Single element type (`f32`)
//!
//! ## Example
//!
//! ```rust
//! use briny_autograd::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape(), &[2, 3]);
//! ```

use crate::tape::Edge;
use core::cell::{Ref, RefCell, RefMut};
use core::fmt;
use std::rc::Rc;

/// An N-dimensional `f32` tensor with shared storage.
#[derive(Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Rc<RefCell<Vec<f32>>>,
    entry: Rc<RefCell<Option<Edge>>>,
}

impl Tensor {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            shape,
            data: Rc::new(RefCell::new(data)),
            entry: Rc::new(RefCell::new(None)),
        }
    }

    /// A tensor of the given shape filled with `value`.
    pub fn full(shape: impl Into<Vec<usize>>, value: f32) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self::new(shape, vec![value; len])
    }

    /// A tensor of zeros.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::full(shape, 0.0)
    }

    /// A tensor of ones.
    pub fn ones(shape: impl Into<Vec<usize>>) -> Self {
        Self::full(shape, 1.0)
    }

    /// A one-dimensional tensor holding `data`.
    pub fn from_slice(data: &[f32]) -> Self {
        Self::new(vec![data.len()], data.to_vec())
    }

    /// A tensor with values drawn uniformly from `[low, high)` using the
    /// thread's seeded generator (see [`crate::backprop::seed`]).
    pub fn random_uniform(shape: impl Into<Vec<usize>>, low: f32, high: f32) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        let data = crate::ops::cpu::uniform(len, low, high);
        Self::new(shape, data)
    }

    /// Zeros with the shape of `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    /// Ones with the shape of `self`.
    pub fn ones_like(&self) -> Self {
        Self::ones(self.shape.clone())
    }

    /// The shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the flat data.
    ///
    /// # Panics
    /// Panics if the storage is being written at the same time.
    pub fn data(&self) -> Ref<'_, Vec<f32>> {
        self.data.borrow()
    }

    pub(crate) fn data_mut(&self) -> RefMut<'_, Vec<f32>> {
        self.data.borrow_mut()
    }

    /// Copies the flat data out.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data().clone()
    }

    /// Overwrites every element with `value`, through every alias.
    pub fn fill(&self, value: f32) {
        self.data_mut().iter_mut().for_each(|x| *x = value);
    }

    /// Replaces this tensor's data with the data of another tensor of the same shape.
    ///
    /// # Panics
    /// Panics if shapes do not match.
    pub fn copy_from(&self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "shape mismatch");
        if Rc::ptr_eq(&self.data, &other.data) {
            return;
        }
        self.data_mut().copy_from_slice(&other.data());
    }

    /// A new tensor with its own copy of the data and no graph link.
    pub fn deep_clone(&self) -> Self {
        Self::new(self.shape.clone(), self.to_vec())
    }

    /// A tensor sharing this tensor's storage but not its graph link.
    ///
    /// Operations on the result start a new subgraph; no gradient flows back
    /// through it into whatever produced `self`.
    pub fn detach(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            data: Rc::clone(&self.data),
            entry: Rc::new(RefCell::new(None)),
        }
    }

    /// Whether both tensors alias the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// The graph link, if this value was recorded or registered.
    pub(crate) fn entry(&self) -> Option<Edge> {
        self.entry.borrow().clone()
    }

    /// Replaces the graph link of every alias of this tensor.
    pub(crate) fn set_entry(&self, edge: Option<Edge>) {
        let previous = self.entry.replace(edge);
        drop(previous);
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data", &*self.data())
            .field("recorded", &self.entry.borrow().is_some())
            .finish()
    }
}

/// Tensors compare by shape and contents.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && *self.data() == *other.data()
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use briny_autograd::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit as f32])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape.as_slice()),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].len());
        for c in &children { data.extend(c.to_vec()); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
