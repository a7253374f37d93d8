//! Runtime configuration.
//!
//! Process-wide knobs that tune how the CPU kernels execute. They are stored
//! in atomics so they can be changed at any time from any thread; the kernels
//! read them on every call.
//!
//! # Knobs
//!
//! - `parallel_threshold`: element count from which elementwise kernels
//!   switch from a serial loop to `rayon` parallel iteration (default `4096`).
//!
//! Per-thread state (recording/training modes, the tape, the dropout RNG) is
//! not configured here; see [`crate::mode`], [`crate::tape`] and
//! [`crate::backprop::seed`].

use core::sync::atomic::{AtomicUsize, Ordering};

/// Default element count at which kernels go parallel.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 4096;

static PARALLEL_THRESHOLD: AtomicUsize = AtomicUsize::new(DEFAULT_PARALLEL_THRESHOLD);

/// Sets the element count from which CPU kernels use `rayon`.
///
/// `0` makes every kernel parallel, `usize::MAX` makes every kernel serial.
///
/// # Example
///
/// ```
/// use briny_autograd::config::{parallel_threshold, set_parallel_threshold};
/// set_parallel_threshold(1 << 16);
/// assert_eq!(parallel_threshold(), 1 << 16);
/// ```
pub fn set_parallel_threshold(elements: usize) {
    PARALLEL_THRESHOLD.store(elements, Ordering::Relaxed);
}

/// Returns the element count from which CPU kernels use `rayon`.
pub fn parallel_threshold() -> usize {
    PARALLEL_THRESHOLD.load(Ordering::Relaxed)
}

/// Whether a kernel over `len` elements should run in parallel.
pub(crate) fn use_parallel(len: usize) -> bool {
    len >= parallel_threshold()
}
