//! # `briny_autograd`
//!
//! Dynamic-graph, reverse-mode automatic differentiation over a small `f32`
//! tensor library.
//!
//! Operations run eagerly. While a thread is inside a recording scope, each
//! operation also appends a node to that thread's tape; a backward pass then
//! walks the tape from chosen outputs and writes gradients into the buffers
//! of marked variables.
//!
//! ## Features
//!
//! - **Modes**: nested recording and training scopes as RAII guards ([`mode`])
//! - **Variables**: gradient buffers with write, add or null requests ([`variable`])
//! - **Tape**: reference-counted arena of recorded nodes ([`tape`])
//! - **Backward**: one-shot or retained passes, custom seeds, functional
//!   gradient queries ([`engine`], [`functional`])
//! - **Custom functions**: hand-written forward/backward pairs recorded as one
//!   node ([`function`])
//! - **Introspection**: structural snapshots of recorded graphs ([`symbol`])
//!
//! ## Example
//!
//! ```rust
//! use briny_autograd::{mode, tensor};
//!
//! let x = tensor!([1.0, 2.0, 3.0]);
//! x.attach_grad();
//! {
//!     let _rec = mode::record(None);
//!     let y = &(&x * &x) + 1.0;
//!     y.backward().unwrap();
//! }
//! assert_eq!(x.grad().unwrap().to_vec(), vec![2.0, 4.0, 6.0]);
//! ```
//!
//! ## Threads
//!
//! Mode stacks and tapes are per thread. Tensors are neither `Send` nor
//! `Sync`; each thread builds and differentiates its own graphs.

#![warn(clippy::all)]
#![allow(clippy::type_complexity)]
#![deny(unsafe_code)]

pub mod approx;
pub mod backprop;
pub mod config;
pub mod engine;
pub mod error;
pub mod function;
pub mod functional;
pub mod mode;
pub mod ops;
pub mod symbol;
pub mod tape;
pub mod tensors;
pub mod variable;

pub use engine::{BackwardOptions, backward, backward_with, grad};
pub use error::{AutogradError, Result};
pub use function::{Function, SavedTensors};
pub use mode::{
    ModeGuard, ModeState, is_recording, is_training, pause, predict_mode, record, set_recording,
    set_training, train_mode,
};
pub use symbol::{Symbol, SymbolNode, get_symbol};
pub use tape::live_nodes;
pub use tensors::Tensor;
pub use variable::{GradReq, mark_variables, mark_variables_with};
