//! Cancellation Handles
//!
//! Each stream session owns exactly one [`AbortHandle`]. The handle holds an
//! explicit lifecycle state instead of a "maybe set" callback:
//!
//! ```text
//!            cancel()
//!   Active ───────────► Cancelled
//!     │
//!     │ complete()
//!     ▼
//!   Completed
//! ```
//!
//! Both transitions are one-shot. Cancelling aborts the reader task, which
//! drops the transport's byte stream and with it the underlying request.

use std::sync::Arc;

use parking_lot::Mutex;

/// Lifecycle of a cancellation handle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    /// The request is in flight
    Active,
    /// The request was cancelled by the user or programmatically
    Cancelled,
    /// The request finished on its own (done, error, or end of stream)
    Completed,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<HandleState>,
    task: Mutex<Option<tokio::task::AbortHandle>>,
}

/// Cancellation handle for one in-flight request
///
/// Cheap to clone; all clones control the same request.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    inner: Arc<Inner>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    /// Create an active handle with no task attached yet
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HandleState::Active),
                task: Mutex::new(None),
            }),
        }
    }

    /// Attach the task that performs the request
    ///
    /// If the handle was already cancelled the task is aborted immediately.
    pub(crate) fn attach(&self, task: tokio::task::AbortHandle) {
        let state = self.inner.state.lock();
        match *state {
            HandleState::Active => *self.inner.task.lock() = Some(task),
            HandleState::Cancelled => task.abort(),
            HandleState::Completed => {}
        }
    }

    /// Cancel the request
    ///
    /// Idempotent and infallible. Returns `true` only for the call that
    /// actually moved the handle from `Active` to `Cancelled`.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state != HandleState::Active {
                return false;
            }
            *state = HandleState::Cancelled;
        }

        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        true
    }

    /// Mark the request as finished on its own
    ///
    /// The reader task is released; anything it would still read after a
    /// terminal event is of no interest. Returns `false` if the handle was
    /// already cancelled or completed.
    pub(crate) fn complete(&self) -> bool {
        let mut state = self.inner.state.lock();
        if *state != HandleState::Active {
            return false;
        }
        *state = HandleState::Completed;
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        true
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HandleState {
        *self.inner.state.lock()
    }

    /// Whether the request is still in flight
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == HandleState::Active
    }

    /// Whether the request was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == HandleState::Cancelled
    }

    /// Whether two handles control the same request
    #[must_use]
    pub fn same_as(&self, other: &AbortHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = AbortHandle::new();
        assert!(handle.is_active());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_complete_then_cancel_is_noop() {
        let handle = AbortHandle::new();
        assert!(handle.complete());
        assert!(!handle.cancel());
        assert_eq!(handle.state(), HandleState::Completed);
    }

    #[test]
    fn test_cancel_then_complete_keeps_cancelled() {
        let handle = AbortHandle::new();
        handle.cancel();
        assert!(!handle.complete());
        assert_eq!(handle.state(), HandleState::Cancelled);
    }

    #[test]
    fn test_clones_share_state() {
        let handle = AbortHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.same_as(&clone));
        assert!(!handle.same_as(&AbortHandle::new()));
    }

    #[tokio::test]
    async fn test_cancel_aborts_attached_task() {
        let handle = AbortHandle::new();
        let task = tokio::spawn(std::future::pending::<()>());
        handle.attach(task.abort_handle());

        handle.cancel();
        let result = task.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_attach_after_cancel_aborts_immediately() {
        let handle = AbortHandle::new();
        handle.cancel();

        let task = tokio::spawn(std::future::pending::<()>());
        handle.attach(task.abort_handle());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
