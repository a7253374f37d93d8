//! Function-level gradient helpers.
//!
//! These wrap the record / mark / backward sequence for closures over tensors:
//! selected arguments become fresh variables, the closure runs under a
//! recording scope, and the outputs are back-propagated with unit seeds.

use crate::engine::backward;
use crate::error::{AutogradError, Result};
use crate::mode;
use crate::tensors::Tensor;
use crate::variable::{GradReq, mark_variables};
use log::debug;

/// Runs `func` on `args` and returns the gradients of its outputs with
/// respect to the arguments selected by `argnum`, along with the outputs.
///
/// `argnum` defaults to every argument. Selected arguments are passed to
/// `func` as detached variables, so the caller's tensors are left untouched.
///
/// # Errors
/// [`AutogradError::Function`] if an index in `argnum` is out of range, plus
/// whatever the backward pass reports.
///
/// # Example
/// ```rust
/// use briny_autograd::{functional, tensor};
///
/// let x = tensor!([1.0, 2.0, 3.0]);
/// let (grads, outputs) =
///     functional::grad_and_loss(|args| vec![&args[0] * &args[0]], &[x], None).unwrap();
/// assert_eq!(grads[0].to_vec(), vec![2.0, 4.0, 6.0]);
/// assert_eq!(outputs[0].to_vec(), vec![1.0, 4.0, 9.0]);
/// ```
pub fn grad_and_loss<F>(
    func: F,
    args: &[Tensor],
    argnum: Option<&[usize]>,
) -> Result<(Vec<Tensor>, Vec<Tensor>)>
where
    F: FnOnce(&[Tensor]) -> Vec<Tensor>,
{
    let selected: Vec<usize> = match argnum {
        Some(indices) => indices.to_vec(),
        None => (0..args.len()).collect(),
    };
    if let Some(&bad) = selected.iter().find(|&&i| i >= args.len()) {
        return Err(AutogradError::Function(format!(
            "argnum {bad} is out of range for {} arguments",
            args.len()
        )));
    }

    let variables: Vec<Tensor> = selected.iter().map(|&i| args[i].detach()).collect();
    let grads: Vec<Tensor> = variables.iter().map(Tensor::zeros_like).collect();
    mark_variables(&variables, &grads, GradReq::Write)?;
    debug!("grad_and_loss: {} of {} arguments tracked", selected.len(), args.len());

    let inputs: Vec<Tensor> = args
        .iter()
        .enumerate()
        .map(|(i, arg)| match selected.iter().position(|&s| s == i) {
            Some(slot) => variables[slot].clone(),
            None => arg.clone(),
        })
        .collect();
    let outputs = mode::with_record(None, || func(&inputs));
    let heads: Vec<&Tensor> = outputs.iter().collect();
    backward(&heads)?;
    Ok((grads, outputs))
}

/// Like [`grad_and_loss`], returning only the gradients.
pub fn grad<F>(func: F, args: &[Tensor], argnum: Option<&[usize]>) -> Result<Vec<Tensor>>
where
    F: FnOnce(&[Tensor]) -> Vec<Tensor>,
{
    grad_and_loss(func, args, argnum).map(|(grads, _)| grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn unselected_arguments_get_no_gradient() {
        let x = tensor!([1.0, 2.0]);
        let y = tensor!([3.0, 4.0]);
        let grads = grad(|args| vec![&args[0] * &args[1]], &[x.clone(), y.clone()], Some(&[1])).unwrap();
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0], x);
    }

    #[test]
    fn caller_tensors_stay_untracked() {
        let x = tensor!([1.0]);
        grad(|args| vec![crate::backprop::exp(&args[0])], &[x.clone()], None).unwrap();
        assert!(!x.is_variable());
    }

    #[test]
    fn out_of_range_argnum_fails() {
        let x = tensor!([1.0]);
        let err = grad(|args| args.to_vec(), &[x], Some(&[1])).unwrap_err();
        assert!(matches!(err, AutogradError::Function(_)));
    }
}
