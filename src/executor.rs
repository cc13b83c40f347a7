//! The shared listener-delivery executor.
//!
//! Every status transition a state machine computes is posted here instead
//! of being delivered inline under the service's own mutex — this is what
//! lets a sub-service's status callback reach back into its parent without
//! re-entering a lock the parent might already be holding.
//!
//! A cloneable handle around a shared queue, drained by one dedicated
//! worker thread, backed by `crossbeam_channel` for the `Send` multi-
//! producer-single-consumer queue itself.

use std::sync::Arc;
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single background worker draining posted jobs in the order they were
/// submitted.
pub struct Executor {
    tx: crossbeam_channel::Sender<Job>,
}

impl Executor {
    pub fn new() -> Arc<Executor> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        thread::Builder::new()
            .name("netfabric-listener".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn listener executor thread");
        Arc::new(Executor { tx })
    }

    /// Enqueues `job` for execution on the background thread. Jobs posted
    /// by the same caller run in the order they were submitted; jobs from
    /// different callers may interleave.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            log::warn!("listener executor is no longer running; dropping a status notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_in_submission_order() {
        let exec = Executor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..10 {
            let counter = counter.clone();
            let order = order.clone();
            exec.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().push(i);
            });
        }
        // give the background thread a moment to drain.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }
}
