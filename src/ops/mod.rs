//! # Operation Layer
//!
//! Tensor kernels and the layer that records them.
//!
//! ## Submodules
//!
//! - [`cpu`]: Multi-threaded CPU kernels returning forward values and backward closures
//! - [`dispatch`]: Runs kernels and records them on the tape while recording is active
//!
//! ## Extending
//!
//! To add a new operation:
//!
//! 1. Implement the kernel in `cpu`, returning `(output, backward closure)`
//! 2. Add it to `dispatch`, which erases the closure into a tape node
//! 3. Expose it from [`crate::backprop`]
//!
//! ## Notes
//!
//! - Kernels must return both forward values and backward closures
//! - Backward closures must not capture graph links (detach what they keep)

pub mod cpu;
pub mod dispatch;
