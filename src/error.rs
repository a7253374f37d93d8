//! Error types for the autograd engine.

use thiserror::Error;

/// Result type alias using [`AutogradError`].
pub type Result<T> = std::result::Result<T, AutogradError>;

/// Errors raised by the recording, registration and backward machinery.
///
/// Every error is reported synchronously by the call that broke the contract,
/// and no gradient buffer is modified by a call that fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutogradError {
    /// Two tensors that must agree in shape do not.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        got: Vec<usize>,
    },

    /// Two parallel sequences have different lengths.
    #[error("length mismatch for {what}: expected {expected}, got {got}")]
    LengthMismatch {
        /// What was being paired up
        what: &'static str,
        /// Expected length
        expected: usize,
        /// Actual length
        got: usize,
    },

    /// A head passed to `backward` was never recorded and is not a variable.
    #[error("cannot differentiate a value that is not part of a recorded graph")]
    NotInGraph,

    /// The graph below a head was freed by an earlier non-retained backward pass.
    #[error(
        "graph already consumed at `{op}`: a previous backward pass freed it, \
         pass `retain_graph = true` to differentiate the same graph twice"
    )]
    GraphAlreadyConsumed {
        /// Name of the first freed operation reached
        op: String,
    },

    /// An operation that needs a registered variable was given a plain value.
    #[error("value is not a registered variable")]
    NotAVariable,

    /// A gradient request string other than `write`, `add` or `null`.
    #[error("invalid gradient request `{0}`, expected one of `write`, `add`, `null`")]
    InvalidGradReq(String),

    /// A custom function broke its forward/backward contract.
    #[error("custom function error: {0}")]
    Function(String),
}
