//! Serial job executor.
//!
//! Every engine operation of a client (connects and request exchanges) runs
//! on one tokio task, in submission order. Callers wait on a oneshot and may
//! give up early; a job whose caller is already gone when it reaches the
//! front of the line is skipped, but a job that has started always runs to
//! completion.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::core::{ClientError, ClientResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to the executor task.
#[derive(Debug)]
pub(crate) struct Worker {
    jobs: mpsc::UnboundedSender<Job>,
    task: JoinHandle<()>,
}

impl Worker {
    /// Spawn the executor on the current runtime.
    pub(crate) fn spawn(label: &str) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let span = tracing::debug_span!("worker", client = %label);
        let task = tokio::spawn(
            async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                tracing::trace!("worker stopped");
            }
            .instrument(span),
        );
        Self { jobs, task }
    }

    /// Queue `job` and return a receiver for its output.
    pub(crate) fn submit<F, T>(&self, job: F) -> ClientResult<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped = Box::pin(async move {
            if tx.is_closed() {
                tracing::trace!("caller gone, job skipped");
                return;
            }
            let _ = tx.send(job.await);
        });
        self.jobs
            .send(wrapped)
            .map_err(|_| ClientError::ClientClosed)?;
        Ok(rx)
    }

    /// Stop the executor. Queued jobs are dropped; their callers see a
    /// closed channel.
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let worker = Worker::spawn("test");
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..5 {
            let log = Arc::clone(&log);
            receivers.push(
                worker
                    .submit(async move {
                        tokio::time::sleep(Duration::from_millis(5 - i)).await;
                        log.lock().push(i);
                        i
                    })
                    .unwrap(),
            );
        }
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), i as u64);
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_abandoned_job_is_skipped() {
        let worker = Worker::spawn("test");
        let ran = Arc::new(AtomicUsize::new(0));

        let gate = worker
            .submit(tokio::time::sleep(Duration::from_millis(20)))
            .unwrap();
        let counter = Arc::clone(&ran);
        let abandoned = worker
            .submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(abandoned);

        gate.await.unwrap();
        let after = worker.submit(async {}).unwrap();
        after.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_abort_closes_pending_receivers() {
        let worker = Worker::spawn("test");
        let pending = worker
            .submit(tokio::time::sleep(Duration::from_secs(60)))
            .unwrap();
        worker.abort();
        assert!(pending.await.is_err());
    }
}
