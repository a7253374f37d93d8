//! Operation Dispatch Layer
//!
//! Runs a kernel and, when the calling thread is recording, appends a node to
//! the tape that owns the kernel's backward closure.
//!
//! The decision is taken here, once, at execution time: a value computed while
//! not recording carries no graph link and can never be differentiated, even if
//! it is later used inside a recording scope.
//!
//! # Design Highlights
//! - **Uniform nodes**: typed kernel closures are erased into one
//!   [`BackwardFn`] shape, `&[output grads] -> [input grads]`
//! - **Mode sampled at call time**: mode-dependent kernels receive
//!   [`is_training`] as it is when they run
//! - **Fresh outputs**: recorded outputs are detached before their graph link
//!   is installed, so an output never hijacks the link of an input it aliases

use crate::mode::{is_recording, is_training};
use crate::ops::cpu;
use crate::tape::{self, BackwardFn, Edge, Node};
use crate::tensors::Tensor;
use log::debug;
use std::borrow::Cow;
use std::rc::Rc;

/// Records one operation over `inputs` producing `outputs`, if recording.
pub(crate) fn record(
    op: impl Into<Cow<'static, str>>,
    inputs: &[&Tensor],
    outputs: Vec<Tensor>,
    backward: Rc<BackwardFn>,
) -> Vec<Tensor> {
    if !is_recording() {
        return outputs;
    }
    let op = op.into();
    let edges: Vec<Option<Edge>> = inputs.iter().map(|t| t.entry()).collect();
    let shapes = outputs.iter().map(|t| t.shape().to_vec()).collect();
    debug!(
        "record `{op}`: {} inputs ({} tracked), {} outputs",
        inputs.len(),
        edges.iter().flatten().count(),
        outputs.len()
    );
    let handle = tape::push(Node::op(op, edges, shapes, backward, is_training()));
    outputs
        .into_iter()
        .enumerate()
        .map(|(output, value)| {
            let value = value.detach();
            value.set_entry(Some(Edge {
                node: handle.clone(),
                output,
            }));
            value
        })
        .collect()
}

fn single(mut outputs: Vec<Tensor>) -> Tensor {
    outputs.swap_remove(0)
}

fn unary<B>(op: &'static str, x: &Tensor, (out, back): (Tensor, B)) -> Tensor
where
    B: Fn(&Tensor) -> Tensor + 'static,
{
    if !is_recording() {
        return out;
    }
    let backward = tape::backward_fn(move |grads: &[Tensor]| Ok(vec![Some(back(&grads[0]))]));
    single(record(op, &[x], vec![out], backward))
}

fn binary<B>(op: &'static str, a: &Tensor, b: &Tensor, (out, back): (Tensor, B)) -> Tensor
where
    B: Fn(&Tensor) -> (Tensor, Tensor) + 'static,
{
    if !is_recording() {
        return out;
    }
    let backward = tape::backward_fn(move |grads: &[Tensor]| {
        let (da, db) = back(&grads[0]);
        Ok(vec![Some(da), Some(db)])
    });
    single(record(op, &[a, b], vec![out], backward))
}

/// Elementwise addition.
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    binary("add", a, b, cpu::add(a, b))
}

/// Elementwise subtraction.
pub fn sub(a: &Tensor, b: &Tensor) -> Tensor {
    binary("sub", a, b, cpu::sub(a, b))
}

/// Elementwise multiplication.
pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    binary("mul", a, b, cpu::mul(a, b))
}

/// Elementwise division.
pub fn div(a: &Tensor, b: &Tensor) -> Tensor {
    binary("div", a, b, cpu::div(a, b))
}

/// Matrix multiplication.
pub fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
    binary("matmul", a, b, cpu::matmul(a, b))
}

/// `x + s`.
pub fn add_scalar(x: &Tensor, s: f32) -> Tensor {
    unary("add_scalar", x, cpu::add_scalar(x, s))
}

/// `s - x`.
pub fn rsub_scalar(s: f32, x: &Tensor) -> Tensor {
    unary("rsub_scalar", x, cpu::rsub_scalar(s, x))
}

/// `x * s`.
pub fn mul_scalar(x: &Tensor, s: f32) -> Tensor {
    unary("mul_scalar", x, cpu::mul_scalar(x, s))
}

/// `s / x`.
pub fn rdiv_scalar(s: f32, x: &Tensor) -> Tensor {
    unary("rdiv_scalar", x, cpu::rdiv_scalar(s, x))
}

/// `x^p`.
pub fn powf(x: &Tensor, p: f32) -> Tensor {
    unary("power_scalar", x, cpu::powf(x, p))
}

/// `x^2`.
pub fn square(x: &Tensor) -> Tensor {
    unary("square", x, cpu::square(x))
}

/// `e^x`.
pub fn exp(x: &Tensor) -> Tensor {
    unary("exp", x, cpu::exp(x))
}

/// `max(0, x)`.
pub fn relu(x: &Tensor) -> Tensor {
    unary("relu", x, cpu::relu(x))
}

/// Sum of all elements.
pub fn sum(x: &Tensor) -> Tensor {
    unary("sum", x, cpu::sum(x))
}

/// Dropout, stochastic only while training.
pub fn dropout(x: &Tensor, p: f32) -> Tensor {
    unary("dropout", x, cpu::dropout(x, p, is_training()))
}

/// Fully connected layer.
pub fn fully_connected(x: &Tensor, w: &Tensor, bias: &Tensor) -> Tensor {
    let (out, back) = cpu::fully_connected(x, w, bias);
    if !is_recording() {
        return out;
    }
    let backward = tape::backward_fn(move |grads: &[Tensor]| {
        let (dx, dw, db) = back(&grads[0]);
        Ok(vec![Some(dx), Some(dw), Some(db)])
    });
    single(record("fully_connected", &[x, w, bias], vec![out], backward))
}

/// Equal split along the first axis.
pub fn split(x: &Tensor, num_outputs: usize, squeeze: bool) -> Vec<Tensor> {
    let (outputs, back) = cpu::split(x, num_outputs, squeeze);
    if !is_recording() {
        return outputs;
    }
    let backward = tape::backward_fn(move |grads: &[Tensor]| Ok(vec![Some(back(grads))]));
    record("split", &[x], outputs, backward)
}
