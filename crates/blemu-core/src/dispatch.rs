//! Delegate delivery queues
//!
//! Every application callback is dispatched on a queue supplied at façade
//! construction. A queue is a cooperative FIFO worker: jobs submitted to the
//! same queue run one at a time in submission order, and each callback is a
//! separately scheduled job, so application code re-entering a façade from a
//! callback never deadlocks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO callback queue; clones submit to the same worker.
#[derive(Clone)]
pub struct DeliveryQueue {
    label: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl DeliveryQueue {
    /// Create a queue and spawn its worker on the current runtime
    pub fn new(label: impl Into<String>) -> Self {
        let label: Arc<str> = label.into().into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_label = Arc::clone(&label);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                trace!(queue = %worker_label, "running delegate callback");
                job();
            }
        });
        Self { label, tx }
    }

    /// Schedule a job; order is preserved per queue. Jobs submitted after
    /// every handle and the worker are gone are silently dropped.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(job));
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue").field("label", &self.label).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let queue = DeliveryQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let log = Arc::clone(&log);
            queue.submit(move || log.lock().unwrap().push(i));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let log = log.lock().unwrap();
        assert_eq!(*log, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn resubmitting_from_a_job_does_not_deadlock() {
        let queue = DeliveryQueue::new("reentrant");
        let (tx, rx) = tokio::sync::oneshot::channel();

        let inner_queue = queue.clone();
        queue.submit(move || {
            inner_queue.submit(move || {
                let _ = tx.send(());
            });
        });

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("nested job ran")
            .unwrap();
    }
}
