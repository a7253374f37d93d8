//! User-defined differentiable functions.
//!
//! A [`Function`] supplies its own forward and backward computations and is
//! recorded as a single opaque tape node, whatever operations its forward
//! pass runs internally.
//!
//! # Example
//! ```rust
//! use briny_autograd::{Function, Result, SavedTensors, Tensor, mode, tensor};
//!
//! #[derive(Clone, Default)]
//! struct Scale {
//!     saved: SavedTensors,
//! }
//!
//! impl Function for Scale {
//!     fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
//!         self.saved.save_for_backward(&[&inputs[1]]);
//!         Ok(vec![&inputs[0] * &inputs[1]])
//!     }
//!
//!     fn backward(&self, grads: &[Tensor]) -> Result<Vec<Tensor>> {
//!         let scale = &self.saved.saved_tensors()[0];
//!         Ok(vec![&grads[0] * scale, grads[0].zeros_like()])
//!     }
//! }
//!
//! let x = tensor!([1.0, 2.0]);
//! x.attach_grad();
//! let s = tensor!([3.0, 3.0]);
//! {
//!     let _rec = mode::record(None);
//!     let y = Scale::default().call(&[&x, &s]).unwrap();
//!     y[0].backward().unwrap();
//! }
//! assert_eq!(x.grad().unwrap().to_vec(), vec![3.0, 3.0]);
//! ```

use crate::error::{AutogradError, Result};
use crate::mode;
use crate::ops::dispatch;
use crate::tape;
use crate::tensors::Tensor;
use log::debug;

/// Tensors a [`Function`] keeps between its forward and backward pass.
///
/// Saved tensors are detached, so holding them never keeps graph nodes alive.
#[derive(Debug, Clone, Default)]
pub struct SavedTensors {
    tensors: Vec<Tensor>,
}

impl SavedTensors {
    /// Replaces the saved tensors.
    pub fn save_for_backward(&mut self, tensors: &[&Tensor]) {
        self.tensors = tensors.iter().map(|t| t.detach()).collect();
    }

    pub fn saved_tensors(&self) -> &[Tensor] {
        &self.tensors
    }
}

/// A differentiable computation with a hand-written backward pass.
///
/// `forward` runs with recording paused and receives detached inputs.
/// `backward` receives one gradient per output and returns one gradient per
/// input, in input order.
pub trait Function: Clone + 'static {
    fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;

    fn backward(&self, output_grads: &[Tensor]) -> Result<Vec<Tensor>>;

    /// Runs a fresh copy of this function on `inputs`.
    fn call(&self, inputs: &[&Tensor]) -> Result<Vec<Tensor>> {
        apply(self.clone(), inputs)
    }
}

/// Runs `function` on `inputs`, recording it as one node when recording.
///
/// # Errors
/// Whatever `forward` returns. A backward pass through the node fails with
/// [`AutogradError::Function`] if `backward` returns the wrong number of
/// gradients.
pub fn apply<F: Function>(mut function: F, inputs: &[&Tensor]) -> Result<Vec<Tensor>> {
    let recording = mode::is_recording();
    let detached: Vec<Tensor> = inputs.iter().map(|t| t.detach()).collect();
    let outputs = mode::with_pause(None, || function.forward(&detached))?;
    if !recording {
        return Ok(outputs);
    }

    let op = short_type_name::<F>();
    debug!("function `{op}`: {} inputs, {} outputs", inputs.len(), outputs.len());
    let arity = inputs.len();
    let name = op.clone();
    let backward = tape::backward_fn(move |grads: &[Tensor]| {
        let input_grads = function.backward(grads)?;
        if input_grads.len() != arity {
            return Err(AutogradError::Function(format!(
                "backward of `{name}` returned {} gradients for {arity} inputs",
                input_grads.len()
            )));
        }
        Ok(input_grads.into_iter().map(Some).collect())
    });
    Ok(dispatch::record(op, inputs, outputs, backward))
}

fn short_type_name<F>() -> String {
    let full = core::any::type_name::<F>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tape::live_nodes;

    #[derive(Clone, Default)]
    struct Double;

    impl Function for Double {
        fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            assert!(!mode::is_recording());
            Ok(vec![&inputs[0] * 2.0])
        }

        fn backward(&self, grads: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(vec![&grads[0] * 2.0])
        }
    }

    #[derive(Clone, Default)]
    struct Broken;

    impl Function for Broken {
        fn forward(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(vec![inputs[0].clone()])
        }

        fn backward(&self, _grads: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn type_name_is_shortened() {
        assert_eq!(short_type_name::<Double>(), "Double");
    }

    #[test]
    fn records_one_node() {
        let x = Tensor::ones([3]);
        x.attach_grad();
        let before = live_nodes();
        let _rec = mode::record(None);
        let y = Double.call(&[&x]).unwrap();
        assert_eq!(live_nodes(), before + 1);
        y[0].backward().unwrap();
        assert_eq!(x.grad().unwrap().to_vec(), vec![2.0; 3]);
    }

    #[test]
    fn not_recorded_outside_record_scope() {
        let x = Tensor::ones([3]);
        let before = live_nodes();
        let y = Double.call(&[&x]).unwrap();
        assert_eq!(live_nodes(), before);
        assert_eq!(y[0].to_vec(), vec![2.0; 3]);
    }

    #[test]
    fn wrong_gradient_count_is_reported() {
        let x = Tensor::ones([2]);
        x.attach_grad();
        let _rec = mode::record(None);
        let y = Broken.call(&[&x]).unwrap();
        let err = y[0].backward().unwrap_err();
        assert!(matches!(err, AutogradError::Function(_)));
        assert_eq!(x.grad().unwrap().to_vec(), vec![0.0; 2]);
    }
}
