//! Bounded worker pool that keeps user logic off the transport threads.
//!
//! The pool owns `worker_threads` OS threads, each driving its own monoio
//! runtime. Tasks are queued on one bounded MPMC channel, so whichever worker
//! is idle picks up the next task; tasks are not ordered relative to each
//! other. A worker runs one task at a time and only takes the next one from
//! the queue when it is done, so a task that blocks holds up its own worker
//! and nothing else. Every task runs under the configured maximum execution
//! time and is abandoned (and logged) once it exceeds it. Work a task spawns
//! onto the worker's runtime keeps running between tasks.
//!
//! Submission through [`Spawn::spawn`] never blocks the caller: a full queue or
//! a pool that is shutting down rejects the task instead.
use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use async_channel::{Receiver, Sender, TrySendError};
use futures::{future::BoxFuture, FutureExt};
use monoio::utils::bind_to_cpu_set;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use self::runtime::RuntimeWrapper;
use crate::config::RuntimeConfig;

mod runtime;

pub type Task = BoxFuture<'static, ()>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    #[error("worker queue is full")]
    Full,
    #[error("worker pool is shut down")]
    Closed,
}

/// Something that can run a detached task.
pub trait Spawn: Send + Sync {
    fn spawn(&self, task: Task) -> Result<(), Rejected>;
}

impl<T: Spawn + ?Sized> Spawn for Arc<T> {
    #[inline]
    fn spawn(&self, task: Task) -> Result<(), Rejected> {
        (**self).spawn(task)
    }
}

pub struct WorkerPool {
    sender: Sender<Task>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn the worker threads described by `config`.
    pub fn start(config: &RuntimeConfig) -> std::io::Result<Arc<Self>> {
        let size = config.worker_threads.max(1);
        let (sender, receiver) = async_channel::bounded(config.queue_size.max(1));
        let cores = if config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };

        let config = Arc::new(config.clone());
        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = receiver.clone();
            let config = config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rpcbridge-worker-{worker_id}"))
                .spawn(move || {
                    // bind thread to cpu core
                    if let Some(cores) = cores {
                        let core = worker_id % cores;
                        if let Err(e) = bind_to_cpu_set([core]) {
                            warn!("bind thread {worker_id} to core {core} failed: {e}");
                        }
                    }
                    run_worker(worker_id, &config, receiver);
                })?;
            workers.push(handle);
        }
        info!("{size} workers started");

        Ok(Arc::new(Self {
            sender,
            workers: Mutex::new(workers),
            size,
        }))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Stop accepting tasks and wait for every worker to exit.
    ///
    /// Must not be called from a worker thread.
    pub fn shutdown(&self) {
        self.sender.close();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in workers {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Spawn for WorkerPool {
    fn spawn(&self, task: Task) -> Result<(), Rejected> {
        self.sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => Rejected::Full,
            TrySendError::Closed(_) => Rejected::Closed,
        })
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.close();
    }
}

fn run_worker(worker_id: usize, config: &RuntimeConfig, receiver: Receiver<Task>) {
    let mut runtime = match RuntimeWrapper::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("worker {worker_id} failed to build runtime: {e}");
            return;
        }
    };
    let max_task_time = config.max_task_time();
    runtime.block_on(async move {
        while let Ok(task) = receiver.recv().await {
            match monoio::time::timeout(max_task_time, AssertUnwindSafe(task).catch_unwind()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("worker {worker_id}: task panicked"),
                Err(_) => {
                    warn!("worker {worker_id}: task exceeded {max_task_time:?} and was abandoned")
                }
            }
        }
        debug!("worker {worker_id} stopped");
    });
}

/// Runs each task to completion on the calling thread.
///
/// Useful when embedding a pipeline where the caller already sits on a worker,
/// and for deterministic tests. Tasks needing a monoio timer cannot run here.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingSpawner;

impl Spawn for BlockingSpawner {
    fn spawn(&self, task: Task) -> Result<(), Rejected> {
        if futures::executor::block_on(AssertUnwindSafe(task).catch_unwind()).is_err() {
            error!("inline task panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use super::*;
    use crate::config::RuntimeType;

    fn config(workers: usize, queue: usize, max_task_time_ms: u64) -> RuntimeConfig {
        RuntimeConfig {
            worker_threads: workers,
            queue_size: queue,
            max_task_time_ms,
            runtime_type: RuntimeType::Legacy,
            ..Default::default()
        }
    }

    #[test]
    fn test_pool_runs_tasks_on_workers() {
        let pool = WorkerPool::start(&config(2, 16, 1000)).unwrap();
        assert_eq!(pool.size(), 2);
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.spawn(Box::pin(async move {
                let name = std::thread::current().name().unwrap_or_default().to_string();
                tx.send((i, name)).unwrap();
            }))
            .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(name.starts_with("rpcbridge-worker-"));
            seen.push(i);
        }
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_blocking_task_holds_only_its_worker() {
        let pool = WorkerPool::start(&config(2, 32, 5000)).unwrap();
        let blocked_done = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::channel();
        let done = blocked_done.clone();
        pool.spawn(Box::pin(async move {
            started_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(500));
            done.store(true, Ordering::SeqCst);
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..19 {
            let tx = tx.clone();
            pool.spawn(Box::pin(async move {
                tx.send(i).unwrap();
            }))
            .unwrap();
        }
        for _ in 0..19 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(!blocked_done.load(Ordering::SeqCst));
        pool.shutdown();
        assert!(blocked_done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timed_out_task_is_abandoned() {
        let pool = WorkerPool::start(&config(1, 4, 50)).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        pool.spawn(Box::pin(async move {
            futures::future::pending::<()>().await;
            flag.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        // The worker stays usable after the abandoned task.
        let (tx, rx) = mpsc::channel();
        pool.spawn(Box::pin(async move {
            tx.send(()).unwrap();
        }))
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::start(&config(1, 4, 1000)).unwrap();
        pool.spawn(Box::pin(async { panic!("task failure") })).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.spawn(Box::pin(async move {
            tx.send(()).unwrap();
        }))
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let pool = WorkerPool::start(&config(1, 4, 1000)).unwrap();
        pool.shutdown();
        assert!(pool.is_closed());
        assert_eq!(pool.spawn(Box::pin(async {})), Err(Rejected::Closed));
    }

    #[test]
    fn test_rejects_when_queue_full() {
        let pool = WorkerPool::start(&config(1, 1, 1000)).unwrap();
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        // Park the only worker thread synchronously so the queue backs up.
        pool.spawn(Box::pin(async move {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv_timeout(Duration::from_secs(5));
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.spawn(Box::pin(async {})).unwrap();
        assert_eq!(pool.spawn(Box::pin(async {})), Err(Rejected::Full));
        block_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn test_blocking_spawner_runs_inline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        BlockingSpawner
            .spawn(Box::pin(async move {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
