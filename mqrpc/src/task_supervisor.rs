use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct TaskSupervisorState {
    running: AtomicU64,
    /// Cancelled when stop is requested.
    stop: CancellationToken,
    /// Cancelled once the last task finished.
    stopped: CancellationToken,
}

/// Owner of the background tasks of a connection or server: the reaper, the
/// connection watcher, dispatch workers and stream forwarders.
///
/// Stopping the supervisor asks every task to finish; `all_stopped` resolves
/// once they did. Dropping it requests stop.
///
/// ```rust,no_run
/// # use mqrpc::TaskSupervisor;
/// # #[tokio::main]
/// # async fn main() {
/// let supervisor = TaskSupervisor::create();
/// supervisor.spawn(async {
///     // runs until done or until the supervisor stops.
/// });
/// supervisor.stop();
/// supervisor.all_stopped().await;
/// # }
/// ```
#[derive(Debug)]
pub struct TaskSupervisor(Arc<TaskSupervisorState>);

/// Keeps the running count up while a task is alive.
#[derive(Debug)]
pub struct TaskSupervisorGuard(Arc<TaskSupervisorState>);

impl TaskSupervisorState {
    fn finish_async_task(&self) {
        let running = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.stopped.cancel();
        }
    }
}

impl TaskSupervisor {
    /// Creates a running supervisor. Must be called within a tokio runtime.
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        // held until stop, so `all_stopped` cannot fire before it.
        let guard = supervisor.start_async_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    /// Requests every task to finish. Idempotent.
    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    /// True once stop was requested, even if tasks are still winding down.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.stop.is_cancelled()
    }

    /// Returns a guard that stops the supervisor when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.0.stop.clone().drop_guard()
    }

    /// Resolves when stop is requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    /// Resolves after stop, once the last task has finished.
    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    /// Counts a task as running until the returned guard is dropped. Use it
    /// for tasks spawned outside [`spawn`](Self::spawn).
    #[must_use]
    pub fn start_async_task(&self) -> TaskSupervisorGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskSupervisorGuard(self.0.clone())
    }

    /// Spawns `task`, abandoning it as soon as stop is requested.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.start_async_task();
        tokio::spawn(async move {
            tokio::select! {
                () = guard.stopped() => {}
                () = task => {}
            }
            drop(guard);
        });
    }

    /// Tasks still running, plus one until stop is requested.
    #[must_use]
    pub fn running(&self) -> u64 {
        self.0.running.load(Ordering::Acquire)
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskSupervisorGuard {
    /// Resolves when the owning supervisor is asked to stop.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskSupervisorGuard {
    fn drop(&mut self) {
        self.0.finish_async_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_supervisor() {
        let task_supervisor = TaskSupervisor::create();
        assert_eq!(task_supervisor.running(), 1);

        task_supervisor.stop();
        task_supervisor.stopped().await;
        task_supervisor.all_stopped().await;
        assert_eq!(task_supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_spawn_abandons_on_stop() {
        let task_supervisor = TaskSupervisor::create();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        task_supervisor.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let _ = tx.send(());
        });
        assert_eq!(task_supervisor.running(), 2);

        task_supervisor.stop();
        tokio::time::timeout(Duration::from_secs(1), task_supervisor.all_stopped())
            .await
            .unwrap();
        // the task was dropped before it could send.
        assert!(rx.await.is_err());
    }
}
