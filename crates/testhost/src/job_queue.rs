//! Submission-ordered queue of deferred host work
//!
//! The dispatcher submits one job per execution or discovery request. The
//! worker drives them strictly in submission order; a job that fails or
//! panics is logged and the next one proceeds.

use crate::result::{JobError, TestHostError, TestHostResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info_span, warn, Instrument};

/// A queued request
pub type QueuedJob = BoxFuture<'static, TestHostResult<()>>;

struct Queued {
    label: String,
    job: QueuedJob,
}

/// Submitting side of the queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Queued>,
    submitted: Arc<AtomicU64>,
}

/// Consuming side of the queue
#[derive(Debug)]
pub struct JobQueueWorker {
    rx: mpsc::UnboundedReceiver<Queued>,
}

impl JobQueue {
    /// Create a queue and its worker
    #[must_use]
    pub fn new() -> (Self, JobQueueWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                submitted: Arc::new(AtomicU64::new(0)),
            },
            JobQueueWorker { rx },
        )
    }

    /// Queue a job behind everything submitted so far
    pub fn submit(&self, label: impl Into<String>, job: QueuedJob) -> TestHostResult<()> {
        let label = label.into();
        debug!(job = %label, "queueing job");
        self.tx
            .send(Queued { label, job })
            .map_err(|_| TestHostError::invalid_state("job queue worker has stopped"))?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Jobs accepted so far
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl JobQueueWorker {
    /// Drive jobs until every [`JobQueue`] handle is dropped.
    ///
    /// Returns the number of jobs processed.
    pub async fn run(mut self) -> u64 {
        let mut processed = 0;
        while let Some(Queued { label, job }) = self.rx.recv().await {
            let span = info_span!("job", job = %label);
            match AssertUnwindSafe(job).catch_unwind().instrument(span).await {
                Ok(Ok(())) => debug!(job = %label, "job finished"),
                Ok(Err(e)) => warn!(job = %label, error = %e, "job failed"),
                Err(payload) => {
                    let fault = JobError::from_panic(payload.as_ref());
                    error!(job = %label, error = %fault, "job panicked");
                }
            }
            processed += 1;
        }
        processed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str, delay_ms: u64) -> QueuedJob {
        let log = log.clone();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().unwrap().push(name);
            Ok(())
        })
    }

    async fn explode() -> TestHostResult<()> {
        panic!("exploded")
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let (queue, worker) = JobQueue::new();
        let log = recorder();
        queue.submit("slow", push(&log, "slow", 20)).unwrap();
        queue.submit("fast", push(&log, "fast", 0)).unwrap();
        queue.submit("mid", push(&log, "mid", 5)).unwrap();
        assert_eq!(queue.submitted(), 3);
        drop(queue);

        assert_eq!(worker.run().await, 3);
        assert_eq!(*log.lock().unwrap(), vec!["slow", "fast", "mid"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_drop_later_jobs() {
        let (queue, worker) = JobQueue::new();
        let log = recorder();
        queue.submit("first", push(&log, "first", 0)).unwrap();
        queue
            .submit("broken", Box::pin(async { Err(TestHostError::framework("boom")) }))
            .unwrap();
        queue
            .submit("panics", Box::pin(explode()))
            .unwrap();
        queue.submit("last", push(&log, "last", 0)).unwrap();
        drop(queue);

        assert_eq!(worker.run().await, 4);
        assert_eq!(*log.lock().unwrap(), vec!["first", "last"]);
    }

    #[tokio::test]
    async fn test_submit_after_worker_stops_fails() {
        let (queue, worker) = JobQueue::new();
        drop(worker);
        let result = queue.submit("late", Box::pin(async { Ok(()) }));
        assert!(matches!(result, Err(TestHostError::InvalidState { .. })));
        assert_eq!(queue.submitted(), 0);
    }
}
