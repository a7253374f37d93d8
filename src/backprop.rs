//! Differentiable operations.
//!
//! # Recorded Primitives
//!
//! Every function here computes its forward value immediately and, while the
//! calling thread is recording (see [`crate::mode::record`]), appends a node to
//! the tape holding the matching backward closure.
//!
//! **Key Features:**
//! - **Elementwise arithmetic:** `+ - * /` between same-shaped tensors and with `f32` scalars.
//! - **Activations:** `exp`, `relu`, `square`, `powf`.
//! - **Reductions and layout:** `sum`, `split`.
//! - **Layers:** `matmul`, `fully_connected`, `dropout`.
//!
//! ## Usage Guidelines
//!
//! - Operations **panic** on shape mismatches; there is no broadcasting.
//! - `dropout` reads [`crate::mode::is_training`] when it runs, not when the
//!   graph is differentiated.
//! - Values computed outside a recording scope can never be differentiated.
//!
//! ## Example
//!
//! ```rust
//! use briny_autograd::{backprop, mode, tensor};
//!
//! let x = tensor!([1.0, -2.0, 3.0]);
//! x.attach_grad();
//! {
//!     let _rec = mode::record(None);
//!     let y = backprop::sum(&backprop::relu(&x));
//!     y.backward().unwrap();
//! }
//! assert_eq!(x.grad().unwrap().to_vec(), vec![1.0, 0.0, 1.0]);
//! ```

use crate::ops::{cpu, dispatch};
use crate::tensors::Tensor;
use core::ops::{Add, Div, Mul, Neg, Sub};

/// Elementwise `e^x`.
pub fn exp(x: &Tensor) -> Tensor {
    dispatch::exp(x)
}

/// Applies the ReLU activation: `max(0, x)` elementwise.
///
/// Gradients pass only where the input is positive.
pub fn relu(x: &Tensor) -> Tensor {
    dispatch::relu(x)
}

/// Elementwise `x^2`.
pub fn square(x: &Tensor) -> Tensor {
    dispatch::square(x)
}

/// Elementwise `x^p`.
pub fn powf(x: &Tensor, p: f32) -> Tensor {
    dispatch::powf(x, p)
}

/// Sum of every element, as a tensor of shape `[1]`.
pub fn sum(x: &Tensor) -> Tensor {
    dispatch::sum(x)
}

/// Zeroes each element with probability `p` while training and scales the
/// survivors by `1 / (1 - p)`; the identity otherwise.
///
/// # Panics
/// Panics if `p` is outside `[0, 1]`.
pub fn dropout(x: &Tensor, p: f32) -> Tensor {
    dispatch::dropout(x, p)
}

/// Splits `x` into `num_outputs` equal parts along the first axis.
///
/// With `squeeze`, parts of length one along that axis drop it.
///
/// # Panics
/// Panics if the first axis is not divisible by `num_outputs`.
pub fn split(x: &Tensor, num_outputs: usize, squeeze: bool) -> Vec<Tensor> {
    dispatch::split(x, num_outputs, squeeze)
}

/// Multiplies two 2D tensors: `a` (m×k) · `b` (k×n).
///
/// # Panics
/// Panics if the inner dimensions do not match.
///
/// # Performance
/// Rows are computed in parallel with Rayon above
/// [`crate::config::parallel_threshold`] elements.
pub fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
    dispatch::matmul(a, b)
}

/// Dense layer `x · wᵀ + bias` with `x` (n×k), `w` (h×k) and `bias` (h).
///
/// # Panics
/// Panics on inconsistent shapes.
pub fn fully_connected(x: &Tensor, w: &Tensor, bias: &Tensor) -> Tensor {
    dispatch::fully_connected(x, w, bias)
}

/// Reseeds this thread's dropout generator.
pub fn seed(seed: u64) {
    cpu::reseed(seed);
}

macro_rules! tensor_binop {
    ($trait:ident, $method:ident, $op:path) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;

            fn $method(self, rhs: &Tensor) -> Tensor {
                $op(self, rhs)
            }
        }

        impl $trait<Tensor> for Tensor {
            type Output = Tensor;

            fn $method(self, rhs: Tensor) -> Tensor {
                $op(&self, &rhs)
            }
        }
    };
}

tensor_binop!(Add, add, dispatch::add);
tensor_binop!(Sub, sub, dispatch::sub);
tensor_binop!(Mul, mul, dispatch::mul);
tensor_binop!(Div, div, dispatch::div);

impl Add<f32> for &Tensor {
    type Output = Tensor;

    fn add(self, rhs: f32) -> Tensor {
        dispatch::add_scalar(self, rhs)
    }
}

impl Add<&Tensor> for f32 {
    type Output = Tensor;

    fn add(self, rhs: &Tensor) -> Tensor {
        dispatch::add_scalar(rhs, self)
    }
}

impl Sub<f32> for &Tensor {
    type Output = Tensor;

    fn sub(self, rhs: f32) -> Tensor {
        dispatch::add_scalar(self, -rhs)
    }
}

impl Sub<&Tensor> for f32 {
    type Output = Tensor;

    fn sub(self, rhs: &Tensor) -> Tensor {
        dispatch::rsub_scalar(self, rhs)
    }
}

impl Mul<f32> for &Tensor {
    type Output = Tensor;

    fn mul(self, rhs: f32) -> Tensor {
        dispatch::mul_scalar(self, rhs)
    }
}

impl Mul<&Tensor> for f32 {
    type Output = Tensor;

    fn mul(self, rhs: &Tensor) -> Tensor {
        dispatch::mul_scalar(rhs, self)
    }
}

impl Div<f32> for &Tensor {
    type Output = Tensor;

    fn div(self, rhs: f32) -> Tensor {
        dispatch::mul_scalar(self, 1.0 / rhs)
    }
}

impl Div<&Tensor> for f32 {
    type Output = Tensor;

    fn div(self, rhs: &Tensor) -> Tensor {
        dispatch::rdiv_scalar(self, rhs)
    }
}

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        dispatch::mul_scalar(self, -1.0)
    }
}

impl Tensor {
    /// See [`exp`].
    pub fn exp(&self) -> Tensor {
        exp(self)
    }

    /// See [`relu`].
    pub fn relu(&self) -> Tensor {
        relu(self)
    }

    /// See [`square`].
    pub fn square(&self) -> Tensor {
        square(self)
    }

    /// See [`powf`].
    pub fn powf(&self, p: f32) -> Tensor {
        powf(self, p)
    }

    /// See [`sum`].
    pub fn sum(&self) -> Tensor {
        sum(self)
    }

    /// See [`matmul`].
    pub fn matmul(&self, rhs: &Tensor) -> Tensor {
        matmul(self, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn scalar_operators() {
        let x = tensor!([1.0, 2.0, 4.0]);
        assert_eq!((&x + 1.0).to_vec(), vec![2.0, 3.0, 5.0]);
        assert_eq!((1.0 + &x).to_vec(), vec![2.0, 3.0, 5.0]);
        assert_eq!((&x - 1.0).to_vec(), vec![0.0, 1.0, 3.0]);
        assert_eq!((1.0 - &x).to_vec(), vec![0.0, -1.0, -3.0]);
        assert_eq!((2.0 * &x).to_vec(), vec![2.0, 4.0, 8.0]);
        assert_eq!((&x / 2.0).to_vec(), vec![0.5, 1.0, 2.0]);
        assert_eq!((4.0 / &x).to_vec(), vec![4.0, 2.0, 1.0]);
        assert_eq!((-&x).to_vec(), vec![-1.0, -2.0, -4.0]);
    }

    #[test]
    fn tensor_operators() {
        let a = tensor!([1.0, 2.0]);
        let b = tensor!([4.0, 8.0]);
        assert_eq!((&a + &b).to_vec(), vec![5.0, 10.0]);
        assert_eq!((&b - &a).to_vec(), vec![3.0, 6.0]);
        assert_eq!((&a * &b).to_vec(), vec![4.0, 16.0]);
        assert_eq!((&b / &a).to_vec(), vec![4.0, 4.0]);
        assert_eq!((a.clone() + b.clone()).to_vec(), vec![5.0, 10.0]);
    }

    #[test]
    fn seeded_dropout_is_reproducible() {
        let x = Tensor::ones([64]);
        let _train = crate::mode::train_mode();
        seed(7);
        let a = dropout(&x, 0.5);
        seed(7);
        let b = dropout(&x, 0.5);
        assert_eq!(a, b);
    }
}
