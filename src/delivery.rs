//! Delivery queue: a single worker thread that serializes user callbacks.
//!
//! Every user-observable callback (connect, disconnect, error, received,
//! invoked, result, completion, log) runs on this thread, in the order
//! it was enqueued. User code therefore cannot stall the I/O loop,
//! callback ordering is deterministic per session, and user handlers
//! never race with each other.
//!
//! Stopping drains the work already queued, then joins the thread.

use std::sync::Mutex;
use std::thread;

use tokio::sync::mpsc;

/// A unit of user-facing work.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-consumer callback queue backed by a dedicated thread.
pub(crate) struct DeliveryQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = thread::Builder::new()
            .name("framewire-delivery".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
            })
            .ok();

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }

    /// Enqueue a callback. A no-op once the queue has been stopped.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Drain remaining work and join the worker thread.
    pub fn stop(&self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(tx);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
