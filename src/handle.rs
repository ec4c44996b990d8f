use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};
use uuid::Uuid;

type CloseAction = Box<dyn FnOnce() + Send>;

/// Disposable token for one outstanding asynchronous operation.
///
/// A handle is held jointly by the side that initiated the operation and
/// the side that drives it to completion; whichever closes it first wins.
/// Closing an already-closed handle is a no-op and the close action runs
/// at most once, outside the internal lock.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: Uuid,
    state: Mutex<HandleState>,
}

struct HandleState {
    closed: bool,
    on_close: Option<CloseAction>,
}

impl Handle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                state: Mutex::new(HandleState {
                    closed: false,
                    on_close: None,
                }),
            }),
        }
    }

    pub fn with_close<F: FnOnce() + Send + 'static>(action: F) -> Self {
        let handle = Self::new();
        handle.set_on_close(action);
        handle
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether the handle still represents a live operation.
    pub fn is_valid(&self) -> bool {
        !self.inner.state.lock().closed
    }

    /// Attach (or replace) the close action. If the handle was already
    /// closed the action runs immediately, so the attaching side always
    /// observes the cancellation.
    pub fn set_on_close<F: FnOnce() + Send + 'static>(&self, action: F) {
        let run_now = {
            let mut state = self.inner.state.lock();
            if state.closed {
                true
            } else {
                state.on_close = Some(Box::new(action));
                return;
            }
        };
        if run_now {
            Self::run_action(self.inner.id, Box::new(action));
        }
    }

    /// Close the handle. Idempotent and thread-safe; the close action is
    /// invoked outside the lock and at most once across all callers.
    pub fn close(&self) {
        let action = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.on_close.take()
        };

        trace!("Closing handle {}", self.inner.id);
        if let Some(action) = action {
            Self::run_action(self.inner.id, action);
        }
    }

    // Close actions come from foreign code; a panic there must not take
    // down the closing thread's state machine.
    fn run_action(id: Uuid, action: CloseAction) {
        if catch_unwind(AssertUnwindSafe(action)).is_err() {
            error!("Close action for handle {} panicked", id);
        }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Handle {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn close_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let handle = Handle::with_close(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.is_valid());
        handle.close();
        handle.close();
        handle.close();

        assert!(!handle.is_valid());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_close_runs_action_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let handle = Handle::with_close(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut threads = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            threads.push(std::thread::spawn(move || handle.close()));
        }
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_after_close_runs_immediately() {
        let handle = Handle::new();
        handle.close();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        handle.set_on_close(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_action_does_not_poison_the_handle() {
        let handle = Handle::with_close(|| panic!("action failed"));
        handle.close();
        assert!(!handle.is_valid());

        // Subsequent closes stay no-ops
        handle.close();
    }

    #[test]
    fn clones_share_identity_and_state() {
        let handle = Handle::new();
        let other = handle.clone();
        assert_eq!(handle, other);

        other.close();
        assert!(!handle.is_valid());
    }
}
