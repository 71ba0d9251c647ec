//! Cancellable scheduled tasks.
//!
//! A [`TimerSlot`] holds at most one pending task. Scheduling replaces (and
//! aborts) whatever was pending, so a superseded timer can never fire.
//!
//! A fired task must call [`TimerSlot::disarm`] with its token before acting:
//! if the slot has been cancelled or rescheduled since, `disarm` returns
//! `false` and the task must do nothing. Disarming also detaches the task from
//! the slot, so code it runs may cancel or reschedule the same slot without
//! aborting itself.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A slot holding at most one pending delayed task.
#[derive(Debug, Default)]
pub struct TimerSlot {
    token: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to run after `delay`, cancelling any pending task.
    ///
    /// `task` receives the token it must pass to [`disarm`](Self::disarm).
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&mut self, delay: Duration, task: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.token = self.token.wrapping_add(1);
        let token = self.token;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task(token).await;
        }));
        token
    }

    /// Claim a fired timer. Returns `false` if `token` is stale.
    pub fn disarm(&mut self, token: u64) -> bool {
        if self.token != token || self.handle.is_none() {
            return false;
        }
        // Dropping a JoinHandle detaches the task instead of aborting it.
        self.handle = None;
        true
    }

    /// Cancel the pending task, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a task is scheduled and has not been claimed or cancelled.
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
