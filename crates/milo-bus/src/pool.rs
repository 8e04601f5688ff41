// Fixed-size worker pool backing the subscriber's compute stage.
use crossbeam::channel;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Pool of worker threads draining one shared task queue.
///
/// Tasks are picked up in submission order in aggregate, but nothing is
/// guaranteed across workers. `stop` closes the queue; workers finish the
/// pending tasks and exit, and `join` waits for them. The pool is not
/// reusable after `stop` + `join`.
pub struct WorkerPool {
    tx: Option<channel::Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = channel::unbounded::<Task>();
        let handles = (0..workers)
            .map(|index| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("milo-worker-{index}"))
                    .spawn(move || worker_loop(rx))
                    .expect("spawn worker thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers: handles,
        }
    }

    /// Submit a task. Ignored with a warning once the pool is stopped.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.tx {
            Some(tx) => {
                // Unbounded queue: send only fails when every worker is gone.
                if tx.send(Box::new(task)).is_err() {
                    tracing::warn!("worker pool queue closed; task dropped");
                }
            }
            None => tracing::warn!("post on a stopped worker pool; task dropped"),
        }
    }

    /// Pending tasks not yet picked up by a worker.
    pub fn queue_depth(&self) -> usize {
        self.tx.as_ref().map(channel::Sender::len).unwrap_or(0)
    }

    /// Hand the subscriber's I/O thread its own sender so posting does not
    /// go through the bus lock.
    pub(crate) fn task_sender(&self) -> Option<channel::Sender<Task>> {
        self.tx.clone()
    }

    /// Close the queue. Workers drain what is already queued and exit.
    pub fn stop(&mut self) {
        self.tx.take();
    }

    /// Wait for every worker to exit.
    pub fn join(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread exited via panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn worker_loop(rx: channel::Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            tracing::error!(panic = panic_message(&payload), "worker task panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<opaque panic payload>"
    }
}
