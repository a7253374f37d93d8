//! Variable registration.
//!
//! Marking a tensor as a variable pairs it with a gradient buffer of the same
//! shape and a [`GradReq`] that decides how the backward engine writes into
//! that buffer. The pairing is a leaf node on the tape; the tensor (and every
//! alias of it) links to that leaf, so operations recorded on the tensor route
//! their gradient contributions into the buffer.

use crate::error::{AutogradError, Result};
use crate::tape::{self, Edge, Node, VariableInfo, with_tape};
use crate::tensors::Tensor;
use core::fmt;
use core::str::FromStr;
use log::debug;

/// How a backward pass writes a variable's gradient buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GradReq {
    /// Overwrite the buffer with the new gradient (default).
    #[default]
    Write,
    /// Add the new gradient to the buffer.
    Add,
    /// Never write the buffer.
    Null,
}

impl FromStr for GradReq {
    type Err = AutogradError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "write" => Ok(Self::Write),
            "add" => Ok(Self::Add),
            "null" => Ok(Self::Null),
            other => Err(AutogradError::InvalidGradReq(other.to_owned())),
        }
    }
}

impl fmt::Display for GradReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Write => "write",
            Self::Add => "add",
            Self::Null => "null",
        })
    }
}

/// Registers each tensor in `vars` as a variable whose gradient goes to the
/// matching buffer in `grads`, all with the same request.
///
/// # Errors
/// - [`AutogradError::LengthMismatch`] if `vars` and `grads` differ in length
/// - [`AutogradError::ShapeMismatch`] if any pair differs in shape
///
/// Nothing is registered when an error is returned.
pub fn mark_variables(vars: &[Tensor], grads: &[Tensor], req: GradReq) -> Result<()> {
    mark_variables_with(vars, grads, &[req])
}

/// Like [`mark_variables`], with one request per variable.
///
/// A single request applies to every variable.
pub fn mark_variables_with(vars: &[Tensor], grads: &[Tensor], reqs: &[GradReq]) -> Result<()> {
    if vars.len() != grads.len() {
        return Err(AutogradError::LengthMismatch {
            what: "gradient buffers",
            expected: vars.len(),
            got: grads.len(),
        });
    }
    if reqs.len() != 1 && reqs.len() != vars.len() {
        return Err(AutogradError::LengthMismatch {
            what: "gradient requests",
            expected: vars.len(),
            got: reqs.len(),
        });
    }
    for (var, grad) in vars.iter().zip(grads) {
        if var.shape() != grad.shape() {
            return Err(AutogradError::ShapeMismatch {
                expected: var.shape().to_vec(),
                got: grad.shape().to_vec(),
            });
        }
    }

    for (i, (var, grad)) in vars.iter().zip(grads).enumerate() {
        register(var, grad, reqs[if reqs.len() == 1 { 0 } else { i }]);
    }
    Ok(())
}

/// Registers one already validated pair.
fn register(var: &Tensor, grad: &Tensor, req: GradReq) {
    let name = with_tape(|tape| tape.next_variable_name());
    debug!("mark `{name}` {:?} with grad_req {req}", var.shape());
    let info = VariableInfo {
        grad: grad.detach(),
        req,
        fresh: false,
        name,
    };
    let handle = tape::push(Node::variable(info, var.shape().to_vec()));
    var.set_entry(Some(Edge {
        node: handle,
        output: 0,
    }));
}

impl Tensor {
    /// Registers this tensor as a variable with a zeroed gradient buffer.
    pub fn attach_grad(&self) {
        self.attach_grad_with(GradReq::Write);
    }

    /// Registers this tensor as a variable with a zeroed gradient buffer and
    /// the given request.
    pub fn attach_grad_with(&self, req: GradReq) {
        register(self, &self.zeros_like(), req);
    }

    /// The gradient buffer, or `None` if this tensor is not a variable.
    pub fn grad(&self) -> Option<Tensor> {
        let edge = self.entry()?;
        let grad = with_tape(|tape| {
            tape.node(edge.node.id())
                .variable_info()
                .map(|info| info.grad.clone())
        });
        drop(edge);
        grad
    }

    /// Whether this tensor is a registered variable.
    pub fn is_variable(&self) -> bool {
        self.entry().is_some_and(|edge| {
            with_tape(|tape| tape.node(edge.node.id()).variable_info().is_some())
        })
    }

    /// The gradient request of this variable, if it is one.
    pub fn grad_req(&self) -> Option<GradReq> {
        let edge = self.entry()?;
        with_tape(|tape| tape.node(edge.node.id()).variable_info().map(|info| info.req))
    }

    /// Whether the last backward pass that reached this variable wrote its
    /// gradient buffer. `false` for non-variables.
    ///
    /// The flag is only cleared by [`Tensor::set_fresh_grad`].
    pub fn fresh_grad(&self) -> bool {
        self.entry().is_some_and(|edge| {
            with_tape(|tape| {
                tape.node(edge.node.id())
                    .variable_info()
                    .is_some_and(|info| info.fresh)
            })
        })
    }

    /// Sets the fresh-gradient flag of this variable.
    ///
    /// # Errors
    /// [`AutogradError::NotAVariable`] if this tensor is not registered.
    pub fn set_fresh_grad(&self, fresh: bool) -> Result<()> {
        let edge = self.entry().ok_or(AutogradError::NotAVariable)?;
        with_tape(|tape| match tape.node_mut(edge.node.id()).variable_info_mut() {
            Some(info) => {
                info.fresh = fresh;
                Ok(())
            }
            None => Err(AutogradError::NotAVariable),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grad_req_parses_known_strings() {
        assert_eq!("write".parse::<GradReq>(), Ok(GradReq::Write));
        assert_eq!("add".parse::<GradReq>(), Ok(GradReq::Add));
        assert_eq!("null".parse::<GradReq>(), Ok(GradReq::Null));
        assert_eq!(
            "accumulate".parse::<GradReq>(),
            Err(AutogradError::InvalidGradReq("accumulate".into()))
        );
    }

    #[test]
    fn unregistered_tensor_has_no_grad() {
        let x = Tensor::zeros([10]);
        assert!(x.grad().is_none());
        assert!(!x.is_variable());
        assert!(!x.fresh_grad());
        assert_eq!(x.set_fresh_grad(true), Err(AutogradError::NotAVariable));
    }

    #[test]
    fn attach_grad_allocates_zeroed_buffer() {
        let x = Tensor::ones([2, 3]);
        x.attach_grad();
        let grad = x.grad().expect("variable has a buffer");
        assert_eq!(grad, Tensor::zeros([2, 3]));
        assert_eq!(x.grad_req(), Some(GradReq::Write));
    }

    #[test]
    fn attach_grad_with_keeps_request_and_replaces_entry() {
        let x = Tensor::ones([3]);
        x.attach_grad();
        x.attach_grad_with(GradReq::Add);
        assert_eq!(x.grad_req(), Some(GradReq::Add));
        assert_eq!(x.grad().unwrap(), Tensor::zeros([3]));
        assert!(!x.fresh_grad());
    }

    #[test]
    fn registration_is_visible_through_aliases() {
        let x = Tensor::ones([2]);
        let alias = x.clone();
        x.attach_grad();
        assert!(alias.is_variable());
        assert!(!x.detach().is_variable());
    }

    #[test]
    fn grad_buffer_shares_caller_storage() {
        let x = Tensor::ones([2]);
        let dx = Tensor::zeros([2]);
        mark_variables(&[x.clone()], &[dx.clone()], GradReq::Add).unwrap();
        assert!(x.grad().unwrap().shares_storage(&dx));
    }

    #[test]
    fn mismatched_lengths_register_nothing() {
        let x = Tensor::ones([2]);
        let y = Tensor::ones([2]);
        let err = mark_variables(&[x.clone(), y.clone()], &[Tensor::zeros([2])], GradReq::Write);
        assert!(matches!(err, Err(AutogradError::LengthMismatch { .. })));
        assert!(!x.is_variable() && !y.is_variable());
    }

    #[test]
    fn mismatched_shapes_register_nothing() {
        let x = Tensor::ones([2]);
        let y = Tensor::ones([3]);
        let err = mark_variables(
            &[x.clone(), y.clone()],
            &[Tensor::zeros([2]), Tensor::zeros([2])],
            GradReq::Write,
        );
        assert_eq!(
            err,
            Err(AutogradError::ShapeMismatch {
                expected: vec![3],
                got: vec![2]
            })
        );
        assert!(!x.is_variable());
    }

    #[test]
    fn fresh_flag_is_caller_controlled() {
        let x = Tensor::ones([1]);
        x.attach_grad();
        assert!(!x.fresh_grad());
        x.set_fresh_grad(true).unwrap();
        assert!(x.fresh_grad());
        x.set_fresh_grad(false).unwrap();
        assert!(!x.fresh_grad());
    }
}
