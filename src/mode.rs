//! Recording and training modes.
//!
//! Every thread owns a stack of mode scopes on top of a base state. Each scope
//! fixes both flags; the effective mode is the top of the stack, or the base
//! state (`recording = false`, `training = false`) when no scope is open.
//!
//! Scopes are opened through guards and closed when the guard drops, so a
//! panic inside a scope still restores whatever mode was active before it:
//!
//! ```
//! use briny_autograd::mode::{is_recording, is_training, predict_mode, record};
//!
//! {
//!     let _rec = record(None);
//!     assert!(is_recording() && is_training());
//!     {
//!         let _predict = predict_mode();
//!         assert!(is_recording() && !is_training());
//!     }
//!     assert!(is_training());
//! }
//! assert!(!is_recording() && !is_training());
//! ```
//!
//! Operations that behave differently in training (dropout) read
//! [`is_training`] when they execute, never when a graph is replayed.

use core::cell::RefCell;
use core::marker::PhantomData;

/// The pair of flags consulted by every executing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeState {
    /// Operations append nodes to the tape.
    pub recording: bool,
    /// Mode-dependent operations use their training behavior.
    pub training: bool,
}

#[derive(Debug, Default)]
struct ModeStack {
    base: ModeState,
    scopes: Vec<(u64, ModeState)>,
    next_id: u64,
}

impl ModeStack {
    fn current(&self) -> ModeState {
        self.scopes.last().map_or(self.base, |&(_, state)| state)
    }

    fn current_mut(&mut self) -> &mut ModeState {
        match self.scopes.last_mut() {
            Some((_, top)) => top,
            None => &mut self.base,
        }
    }
}

thread_local! {
    static MODES: RefCell<ModeStack> = RefCell::new(ModeStack::default());
}

/// Restores the previous mode scope when dropped.
///
/// Guards are tied to the thread that created them.
#[must_use = "the mode scope ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ModeGuard {
    id: u64,
    _thread: PhantomData<*const ()>,
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        // out-of-order drops close every scope opened after this one too;
        // a scope already closed that way leaves the stack alone
        let _ = MODES.try_with(|modes| {
            let mut modes = modes.borrow_mut();
            if let Some(pos) = modes.scopes.iter().rposition(|&(id, _)| id == self.id) {
                modes.scopes.truncate(pos);
            }
        });
    }
}

/// Opens a scope with an explicit mode.
pub fn scope(state: ModeState) -> ModeGuard {
    let id = MODES.with(|modes| {
        let mut modes = modes.borrow_mut();
        let id = modes.next_id;
        modes.next_id += 1;
        modes.scopes.push((id, state));
        id
    });
    ModeGuard {
        id,
        _thread: PhantomData,
    }
}

/// Returns the effective mode of this thread.
pub fn current() -> ModeState {
    MODES.with(|modes| modes.borrow().current())
}

/// Opens a recording scope.
///
/// Training is `train_mode` when given, otherwise `true`.
pub fn record(train_mode: Option<bool>) -> ModeGuard {
    scope(ModeState {
        recording: true,
        training: train_mode.unwrap_or(true),
    })
}

/// Opens a scope in which nothing is recorded.
///
/// Training is `train_mode` when given, otherwise left as it was.
pub fn pause(train_mode: Option<bool>) -> ModeGuard {
    let training = train_mode.unwrap_or_else(is_training);
    scope(ModeState {
        recording: false,
        training,
    })
}

/// Opens a scope with training enabled, recording unchanged.
pub fn train_mode() -> ModeGuard {
    scope(ModeState {
        recording: is_recording(),
        training: true,
    })
}

/// Opens a scope with training disabled, recording unchanged.
pub fn predict_mode() -> ModeGuard {
    scope(ModeState {
        recording: is_recording(),
        training: false,
    })
}

/// Whether operations executed now are recorded.
pub fn is_recording() -> bool {
    current().recording
}

/// Whether mode-dependent operations executed now use training behavior.
pub fn is_training() -> bool {
    current().training
}

/// Sets the recording flag of the innermost scope and returns its previous value.
pub fn set_recording(recording: bool) -> bool {
    MODES.with(|modes| {
        let mut modes = modes.borrow_mut();
        let state = modes.current_mut();
        core::mem::replace(&mut state.recording, recording)
    })
}

/// Sets the training flag of the innermost scope and returns its previous value.
pub fn set_training(training: bool) -> bool {
    MODES.with(|modes| {
        let mut modes = modes.borrow_mut();
        let state = modes.current_mut();
        core::mem::replace(&mut state.training, training)
    })
}

/// Runs `f` inside a recording scope.
pub fn with_record<R>(train_mode: Option<bool>, f: impl FnOnce() -> R) -> R {
    let _guard = record(train_mode);
    f()
}

/// Runs `f` with recording paused.
pub fn with_pause<R>(train_mode: Option<bool>, f: impl FnOnce() -> R) -> R {
    let _guard = pause(train_mode);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_state_is_idle() {
        assert_eq!(current(), ModeState::default());
    }

    #[test]
    fn record_defaults_to_training() {
        let _rec = record(None);
        assert!(is_recording());
        assert!(is_training());
    }

    #[test]
    fn nested_scopes_restore_in_order() {
        let rec = record(Some(false));
        assert!(is_recording() && !is_training());
        {
            let _train = train_mode();
            assert!(is_recording() && is_training());
            {
                let _paused = pause(None);
                assert!(!is_recording() && is_training());
            }
            assert!(is_recording());
        }
        assert!(!is_training());
        drop(rec);
        assert_eq!(current(), ModeState::default());
    }

    #[test]
    fn pause_can_force_training_off() {
        let _rec = record(None);
        let _paused = pause(Some(false));
        assert!(!is_recording());
        assert!(!is_training());
    }

    #[test]
    fn out_of_order_drop_closes_inner_scopes() {
        let outer = record(None);
        let inner = predict_mode();
        drop(outer);
        assert_eq!(current(), ModeState::default());
        drop(inner);
        assert_eq!(current(), ModeState::default());
    }

    #[test]
    fn closed_guard_leaves_later_scopes_open() {
        let outer = record(None);
        let inner = predict_mode();
        drop(outer);
        let _rec = record(Some(true));
        let paused = pause(None);
        drop(inner);
        assert!(!is_recording());
        assert!(is_training());
        drop(paused);
        assert!(is_recording());
    }

    #[test]
    fn setters_return_previous_flag() {
        let _rec = record(Some(true));
        assert!(set_training(false));
        assert!(!is_training());
        assert!(set_recording(false));
        assert!(!is_recording());
    }

    #[test]
    fn panics_inside_scope_restore_mode() {
        let result = std::panic::catch_unwind(|| {
            let _rec = record(None);
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!is_recording());
    }

    #[test]
    fn threads_have_independent_modes() {
        let _rec = record(None);
        let other = std::thread::spawn(is_recording).join().unwrap_or(true);
        assert!(!other);
        assert!(is_recording());
    }
}
