use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct SupervisorState {
    running: AtomicU64,
    stop_requested: AtomicBool,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once stop was requested and every task has returned.
    stopped: CancellationToken,
}

impl SupervisorState {
    fn finish_task(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.stopped.cancel();
        }
    }
}

/// Tracks the background tasks of one owner (a connection or a listener)
/// so they can be stopped together and awaited.
///
/// The supervisor holds one task slot of its own that is only released by
/// [`stop`](Self::stop), so [`all_stopped`](Self::all_stopped) never fires
/// before a stop was requested.
#[derive(Debug)]
pub struct TaskSupervisor(Arc<SupervisorState>);

#[derive(Debug)]
pub struct TaskGuard(Arc<SupervisorState>);

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        let state = Arc::new(SupervisorState::default());
        state.running.store(1, Ordering::Release);
        Self(state)
    }

    /// Requests every supervised task to stop. Idempotent.
    pub fn stop(&self) {
        if !self.0.stop_requested.swap(true, Ordering::AcqRel) {
            self.0.stop.cancel();
            self.0.finish_task();
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    #[must_use]
    pub fn start_task(&self) -> TaskGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskGuard(self.0.clone())
    }

    /// Spawns `fut`, dropping it as soon as stop is requested.
    ///
    /// The returned handle resolves to `None` when the task was cut short.
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.start_task();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = guard.stopped() => None,
                output = fut => Some(output),
            }
        })
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.finish_task();
    }
}
