//! Parallel CPU tensor kernels
//!
//! # CPU Backend
//!
//! Every kernel here computes a forward value and returns a closure that maps
//! the gradient of that value to gradients of the kernel's inputs. Kernels know
//! nothing about the tape: [`super::dispatch`] decides whether the closure is
//! recorded.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon) once a buffer
//!   reaches [`crate::config::parallel_threshold`] elements
//! - Deterministic results for a given input and seed
//!
//! ## Captures
//!
//! Backward closures capture detached aliases of their inputs (never graph
//! links), so a recorded node only references its producers through its
//! input edges.
//!
//! ## Panics
//!
//! Kernels panic on malformed shapes, like any tensor-library call.

use crate::config::use_parallel;
use crate::tensors::Tensor;
use core::cell::RefCell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_os_rng());
}

/// Reseeds this thread's generator.
pub(crate) fn reseed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// `len` samples from `[low, high)`.
pub(crate) fn uniform(len: usize, low: f32, high: f32) -> Vec<f32> {
    RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        (0..len).map(|_| rng.random_range(low..high)).collect()
    })
}

fn map(x: &[f32], f: impl Fn(f32) -> f32 + Sync + Send) -> Vec<f32> {
    if use_parallel(x.len()) {
        x.par_iter().map(|&v| f(v)).collect()
    } else {
        x.iter().map(|&v| f(v)).collect()
    }
}

fn zip_map(a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32 + Sync + Send) -> Vec<f32> {
    if use_parallel(a.len()) {
        a.par_iter().zip(b.par_iter()).map(|(&x, &y)| f(x, y)).collect()
    } else {
        a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
    }
}

fn unary_map(x: &Tensor, f: impl Fn(f32) -> f32 + Sync + Send) -> Tensor {
    Tensor::new(x.shape(), map(&x.data(), f))
}

fn binary_map(a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32 + Sync + Send) -> Tensor {
    assert_eq!(
        a.shape(),
        b.shape(),
        "elementwise operands must have equal shapes"
    );
    Tensor::new(a.shape(), zip_map(&a.data(), &b.data(), f))
}

/// Out-of-place `a + b` with no recording.
pub(crate) fn add_values(a: &Tensor, b: &Tensor) -> Tensor {
    binary_map(a, b, |x, y| x + y)
}

/// In-place `dst += src` through every alias of `dst`.
pub(crate) fn add_assign(dst: &Tensor, src: &Tensor) {
    assert_eq!(dst.shape(), src.shape(), "shape mismatch");
    let sum = add_values(dst, src);
    dst.copy_from(&sum);
}

/// Elementwise `a + b`.
pub fn add(a: &Tensor, b: &Tensor) -> (Tensor, impl Fn(&Tensor) -> (Tensor, Tensor) + 'static) {
    let out = binary_map(a, b, |x, y| x + y);
    let back = |grad: &Tensor| (grad.clone(), grad.clone());
    (out, back)
}

/// Elementwise `a - b`.
pub fn sub(a: &Tensor, b: &Tensor) -> (Tensor, impl Fn(&Tensor) -> (Tensor, Tensor) + 'static) {
    let out = binary_map(a, b, |x, y| x - y);
    let back = |grad: &Tensor| (grad.clone(), unary_map(grad, |g| -g));
    (out, back)
}

/// Elementwise `a * b`.
pub fn mul(a: &Tensor, b: &Tensor) -> (Tensor, impl Fn(&Tensor) -> (Tensor, Tensor) + 'static) {
    let out = binary_map(a, b, |x, y| x * y);
    let (a, b) = (a.detach(), b.detach());
    let back = move |grad: &Tensor| {
        (
            binary_map(grad, &b, |g, y| g * y),
            binary_map(grad, &a, |g, x| g * x),
        )
    };
    (out, back)
}

/// Elementwise `a / b`.
pub fn div(a: &Tensor, b: &Tensor) -> (Tensor, impl Fn(&Tensor) -> (Tensor, Tensor) + 'static) {
    let out = binary_map(a, b, |x, y| x / y);
    let (a, b) = (a.detach(), b.detach());
    let back = move |grad: &Tensor| {
        let da = binary_map(grad, &b, |g, y| g / y);
        let quotient = binary_map(&a, &b, |x, y| x / (y * y));
        let db = binary_map(grad, &quotient, |g, q| -g * q);
        (da, db)
    };
    (out, back)
}

/// `x + s`.
pub fn add_scalar(x: &Tensor, s: f32) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    (unary_map(x, move |v| v + s), |grad: &Tensor| grad.clone())
}

/// `s - x`.
pub fn rsub_scalar(s: f32, x: &Tensor) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    (unary_map(x, move |v| s - v), |grad: &Tensor| unary_map(grad, |g| -g))
}

/// `x * s`.
pub fn mul_scalar(x: &Tensor, s: f32) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    let back = move |grad: &Tensor| unary_map(grad, move |g| g * s);
    (unary_map(x, move |v| v * s), back)
}

/// `s / x`.
pub fn rdiv_scalar(s: f32, x: &Tensor) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    let out = unary_map(x, move |v| s / v);
    let x = x.detach();
    let back = move |grad: &Tensor| binary_map(grad, &x, move |g, v| -g * s / (v * v));
    (out, back)
}

/// `x^p` elementwise.
pub fn powf(x: &Tensor, p: f32) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    let out = unary_map(x, move |v| v.powf(p));
    let x = x.detach();
    let back = move |grad: &Tensor| binary_map(grad, &x, move |g, v| g * p * v.powf(p - 1.0));
    (out, back)
}

/// `x^2` elementwise.
pub fn square(x: &Tensor) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    let out = unary_map(x, |v| v * v);
    let x = x.detach();
    let back = move |grad: &Tensor| binary_map(grad, &x, |g, v| 2.0 * g * v);
    (out, back)
}

/// `e^x` elementwise. The backward pass reuses the forward output.
pub fn exp(x: &Tensor) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    let out = unary_map(x, f32::exp);
    let saved = out.detach();
    let back = move |grad: &Tensor| binary_map(grad, &saved, |g, y| g * y);
    (out, back)
}

/// `ReLU`: `max(0, x)` elementwise.
///
/// # Returns
/// - Output tensor of same shape
/// - Backward function passing gradients only where the input is positive
pub fn relu(x: &Tensor) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    let out = unary_map(x, |v| v.max(0.0));
    let x = x.detach();
    let back = move |grad: &Tensor| binary_map(grad, &x, |g, v| if v > 0.0 { g } else { 0.0 });
    (out, back)
}

/// Sum of all elements, as a tensor of shape `[1]`.
pub fn sum(x: &Tensor) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    let total: f32 = if use_parallel(x.len()) {
        x.data().par_iter().sum()
    } else {
        x.data().iter().sum()
    };
    let shape = x.shape().to_vec();
    let back = move |grad: &Tensor| Tensor::full(shape.clone(), grad.data()[0]);
    (Tensor::new(vec![1], vec![total]), back)
}

/// Inverted dropout.
///
/// In training, each element is zeroed with probability `p` and survivors are
/// scaled by `1 / (1 - p)`; the backward pass applies the same mask. Outside
/// training the kernel is the identity.
///
/// # Panics
/// Panics if `p` is outside `[0, 1]`.
pub fn dropout(
    x: &Tensor,
    p: f32,
    training: bool,
) -> (Tensor, impl Fn(&Tensor) -> Tensor + 'static) {
    assert!((0.0..=1.0).contains(&p), "dropout probability {p} outside [0, 1]");
    let mask = if training && p > 0.0 {
        let scale = if p < 1.0 { 1.0 / (1.0 - p) } else { 0.0 };
        let draws = uniform(x.len(), 0.0, 1.0);
        Some(Tensor::new(
            x.shape(),
            draws
                .into_iter()
                .map(|r| if r < p { 0.0 } else { scale })
                .collect(),
        ))
    } else {
        None
    };
    let out = match &mask {
        Some(mask) => binary_map(x, mask, |v, m| v * m),
        None => x.deep_clone(),
    };
    let back = move |grad: &Tensor| match &mask {
        Some(mask) => binary_map(grad, mask, |g, m| g * m),
        None => grad.clone(),
    };
    (out, back)
}

/// Splits `x` into `num_outputs` equal parts along the first axis.
///
/// With `squeeze`, parts of extent one drop that axis.
///
/// # Panics
/// Panics if `x` is a scalar or its first axis is not divisible by `num_outputs`.
pub fn split(
    x: &Tensor,
    num_outputs: usize,
    squeeze: bool,
) -> (Vec<Tensor>, impl Fn(&[Tensor]) -> Tensor + 'static) {
    assert!(x.ndim() > 0, "cannot split a scalar");
    assert!(
        num_outputs > 0 && x.shape()[0] % num_outputs == 0,
        "axis of extent {} cannot be split into {} parts",
        x.shape()[0],
        num_outputs
    );
    let rows = x.shape()[0] / num_outputs;
    let inner: Vec<usize> = x.shape()[1..].to_vec();
    let part_len = rows * inner.iter().product::<usize>();
    let part_shape = if squeeze && rows == 1 {
        inner
    } else {
        let mut shape = vec![rows];
        shape.extend_from_slice(&inner);
        shape
    };

    let data = x.data();
    let outputs = (0..num_outputs)
        .map(|i| {
            let chunk = &data[i * part_len..(i + 1) * part_len];
            Tensor::new(part_shape.clone(), chunk.to_vec())
        })
        .collect();

    let shape = x.shape().to_vec();
    let back = move |grads: &[Tensor]| {
        let mut joined = Vec::with_capacity(shape.iter().product());
        for grad in grads {
            joined.extend_from_slice(&grad.data());
        }
        Tensor::new(shape.clone(), joined)
    };
    (outputs, back)
}

fn matmul_raw(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0; m * n];
    let row = |(i, row): (usize, &mut [f32])| {
        for (j, cell) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for l in 0..k {
                sum += a[i * k + l] * b[l * n + j];
            }
            *cell = sum;
        }
    };
    if n == 0 {
        return out;
    }
    if use_parallel(m * n * k) {
        out.par_chunks_mut(n).enumerate().for_each(row);
    } else {
        out.chunks_mut(n).enumerate().for_each(row);
    }
    out
}

fn transpose_raw(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = x[i * cols + j];
        }
    }
    out
}

fn matrix_dims(t: &Tensor, name: &str) -> (usize, usize) {
    assert_eq!(t.ndim(), 2, "{name} must be a matrix, got shape {:?}", t.shape());
    (t.shape()[0], t.shape()[1])
}

/// Matrix multiplication `C = A × B` of `A: m×k` and `B: k×n`.
///
/// # Returns
/// - Output tensor of shape `[m, n]`
/// - Backward function computing gradients w.r.t. `A` and `B`
///
/// # Panics
/// - If the inner dimensions of `A` and `B` do not match.
pub fn matmul(a: &Tensor, b: &Tensor) -> (Tensor, impl Fn(&Tensor) -> (Tensor, Tensor) + 'static) {
    let (m, k) = matrix_dims(a, "lhs");
    let (k2, n) = matrix_dims(b, "rhs");
    assert_eq!(k, k2, "inner dimensions must match for matmul");

    let out = Tensor::new(vec![m, n], matmul_raw(&a.data(), &b.data(), m, k, n));

    let (a, b) = (a.detach(), b.detach());
    let back = move |grad: &Tensor| {
        let g = grad.data();
        let bt = transpose_raw(&b.data(), k, n);
        let at = transpose_raw(&a.data(), m, k);
        (
            Tensor::new(vec![m, k], matmul_raw(&g, &bt, m, n, k)),
            Tensor::new(vec![k, n], matmul_raw(&at, &g, k, m, n)),
        )
    };
    (out, back)
}

/// Fully connected layer: `x · wᵀ + bias` for `x: n×k`, `w: h×k`, `bias: h`.
///
/// # Returns
/// - Output tensor of shape `[n, h]`
/// - Backward function computing gradients w.r.t. `x`, `w` and `bias`
///
/// # Panics
/// - If the feature dimensions of `x` and `w` differ, or `bias` is not of length `h`.
pub fn fully_connected(
    x: &Tensor,
    w: &Tensor,
    bias: &Tensor,
) -> (
    Tensor,
    impl Fn(&Tensor) -> (Tensor, Tensor, Tensor) + 'static,
) {
    let (n, k) = matrix_dims(x, "data");
    let (h, k2) = matrix_dims(w, "weight");
    assert_eq!(k, k2, "data and weight feature dimensions must match");
    assert_eq!(bias.shape(), &[h], "bias must have one entry per hidden unit");

    let wt = transpose_raw(&w.data(), h, k);
    let mut out = matmul_raw(&x.data(), &wt, n, k, h);
    let b = bias.data();
    out.chunks_mut(h.max(1))
        .for_each(|row| row.iter_mut().zip(b.iter()).for_each(|(y, &c)| *y += c));
    drop(b);

    let (x, w) = (x.detach(), w.detach());
    let back = move |grad: &Tensor| {
        let g = grad.data();
        let dx = matmul_raw(&g, &w.data(), n, h, k);
        let gt = transpose_raw(&g, n, h);
        let dw = matmul_raw(&gt, &x.data(), h, n, k);
        let mut db = vec![0.0; h];
        g.chunks(h.max(1))
            .for_each(|row| db.iter_mut().zip(row).for_each(|(d, &v)| *d += v));
        (
            Tensor::new(vec![n, k], dx),
            Tensor::new(vec![h, k], dw),
            Tensor::new(vec![h], db),
        )
    };
    (Tensor::new(vec![n, h], out), back)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_forward_and_backward_produces_correct_shapes_and_values() {
        let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = Tensor::new(vec![3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);

        let (out, back) = matmul(&a, &b);
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.to_vec(), vec![58.0, 64.0, 139.0, 154.0]);

        let (grad_a, grad_b) = back(&Tensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]));
        assert_eq!(grad_a.shape(), &[2, 3]);
        assert_eq!(grad_b.shape(), &[3, 2]);
        // dA = G · Bᵀ
        assert_eq!(grad_a.to_vec(), vec![7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
        // dB = Aᵀ · G
        assert_eq!(grad_b.to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "inner dimensions must match for matmul")]
    fn matmul_panics_on_invalid_shape() {
        let a = Tensor::ones([2, 3]);
        let b = Tensor::ones([4, 2]);
        let _ = matmul(&a, &b);
    }

    #[test]
    fn relu_forward_and_backward() {
        let input = Tensor::from_slice(&[-1.0, 0.0, 1.0, 2.0]);
        let (out, back) = relu(&input);
        assert_eq!(out.to_vec(), vec![0.0, 0.0, 1.0, 2.0]);

        let grad_input = back(&Tensor::ones([4]));
        assert_eq!(grad_input.to_vec(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn div_backward_matches_quotient_rule() {
        let a = Tensor::from_slice(&[1.0, 4.0]);
        let b = Tensor::from_slice(&[2.0, 2.0]);
        let (out, back) = div(&a, &b);
        assert_eq!(out.to_vec(), vec![0.5, 2.0]);
        let (da, db) = back(&Tensor::ones([2]));
        assert_eq!(da.to_vec(), vec![0.5, 0.5]);
        assert_eq!(db.to_vec(), vec![-0.25, -1.0]);
    }

    #[test]
    fn fully_connected_matches_manual_computation() {
        let x = Tensor::new(vec![1, 2], vec![1.0, 2.0]);
        let w = Tensor::new(vec![3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let b = Tensor::from_slice(&[0.5, 0.5, 0.5]);
        let (out, back) = fully_connected(&x, &w, &b);
        assert_eq!(out.to_vec(), vec![1.5, 2.5, 3.5]);

        let (dx, dw, db) = back(&Tensor::ones([1, 3]));
        assert_eq!(dx.to_vec(), vec![2.0, 2.0]);
        assert_eq!(dw.to_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert_eq!(db.to_vec(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn split_squeezes_unit_parts_and_joins_gradients() {
        let x = Tensor::new(vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let (parts, back) = split(&x, 3, true);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].shape(), &[2]);
        assert_eq!(parts[2].to_vec(), vec![5.0, 6.0]);

        let grads = vec![Tensor::zeros([2]), Tensor::ones([2]), Tensor::full([2], 2.0)];
        assert_eq!(back(&grads).to_vec(), vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn dropout_is_identity_outside_training() {
        let x = Tensor::ones([4, 4]);
        let (out, back) = dropout(&x, 0.5, false);
        assert_eq!(out, x);
        assert_eq!(back(&x).to_vec(), vec![1.0; 16]);
    }

    #[test]
    fn dropout_scales_survivors_in_training() {
        reseed(7);
        let x = Tensor::ones([10, 10]);
        let (out, back) = dropout(&x, 0.5, true);
        let values = out.to_vec();
        assert!(values.iter().all(|&v| v == 0.0 || v == 2.0));
        assert!(values.contains(&0.0) && values.contains(&2.0));
        assert_eq!(back(&x), out);
    }

    #[test]
    fn parallel_and_serial_paths_agree() {
        let x = Tensor::new(vec![64], (0..64).map(|i| i as f32).collect());
        crate::config::set_parallel_threshold(usize::MAX);
        let (serial, _) = square(&x);
        crate::config::set_parallel_threshold(0);
        let (parallel, _) = square(&x);
        crate::config::set_parallel_threshold(crate::config::DEFAULT_PARALLEL_THRESHOLD);
        assert_eq!(serial, parallel);
    }
}
