use std::sync::OnceLock;

use tokio::sync::mpsc;

use crate::TaskSupervisor;

type Job = Box<dyn FnOnce() + Send>;

/// Fixed set of lazily started workers. Jobs with the same key always run on
/// the same worker, one after another, so observations of one reply queue are
/// processed in arrival order.
pub(crate) struct StickyPool {
    workers: Vec<OnceLock<mpsc::UnboundedSender<Job>>>,
    supervisor: TaskSupervisor,
}

impl StickyPool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            workers: (0..size.max(1)).map(|_| OnceLock::new()).collect(),
            supervisor: TaskSupervisor::create(),
        }
    }

    pub(crate) fn run(&self, key: u64, job: impl FnOnce() + Send + 'static) {
        let len = self.workers.len() as u64;
        let index = usize::try_from(key % len).unwrap_or_default();
        let sender = self.workers[index].get_or_init(|| self.start_worker(index));
        if sender.send(Box::new(job)).is_err() {
            tracing::debug!("dispatch worker {index} is stopped, dropping job");
        }
    }

    fn start_worker(&self, index: usize) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        self.supervisor.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        tracing::debug!("started dispatch worker {index}");
        tx
    }

    pub(crate) fn started(&self) -> usize {
        self.workers.iter().filter(|w| w.get().is_some()).count()
    }

    pub(crate) fn stop(&self) {
        self.supervisor.stop();
    }
}

impl std::fmt::Debug for StickyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StickyPool")
            .field("size", &self.workers.len())
            .field("started", &self.started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_same_key_keeps_order() {
        let pool = StickyPool::new(4);
        assert_eq!(pool.started(), 0);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..100 {
            let seen = seen.clone();
            let tx = tx.clone();
            pool.run(7, move || {
                seen.lock().unwrap().push(i);
                let _ = tx.send(());
            });
        }
        for _ in 0..100 {
            rx.recv().await.unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
        assert_eq!(pool.started(), 1);

        pool.run(8, || {});
        assert_eq!(pool.started(), 2);
        pool.stop();
    }
}
