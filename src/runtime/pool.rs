//! Bounded worker pool.
//!
//! A fixed set of named worker threads pulls jobs from a bounded queue.
//! `submit` blocks while the queue is full, which pushes back on the accept
//! loop instead of growing without bound. `shutdown` stops intake, lets the
//! workers finish every queued job and joins them.

use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Unit of work executed on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Returned by `submit` after the pool has shut down.
#[derive(Debug, thiserror::Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Fixed-size thread pool with a bounded work queue.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `queue_depth` pending jobs.
    ///
    /// A depth of 0 hands each job directly to an idle worker.
    pub fn new(size: usize, queue_depth: usize) -> io::Result<Self> {
        let (sender, receiver) = channel::bounded::<Job>(queue_depth);
        let mut workers = Vec::with_capacity(size);

        for worker_id in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job, blocking while the queue is full.
    pub fn submit(&self, job: Job) -> Result<(), PoolClosed> {
        let sender = self.sender.as_ref().ok_or(PoolClosed)?;
        sender.send(job).map_err(|_| PoolClosed)
    }

    /// Stop accepting jobs, run everything already queued, join the workers.
    pub fn shutdown(&mut self) {
        // Closing the channel ends each worker once the queue is empty.
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Job>) {
    debug!(worker = worker_id, "Worker started");
    for job in receiver.iter() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                worker = worker_id,
                panic = panic_message(&*payload),
                "Job panicked"
            );
        }
    }
    debug!(worker = worker_id, "Worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
