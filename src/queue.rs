//! Per-peer job serialization.
//!
//! A process-wide map of buckets, each holding a FIFO mailbox and a
//! worker task. Jobs submitted for the same bucket run strictly in
//! submission order, one at a time; jobs for different buckets run
//! independently. A worker tears itself down once its mailbox drains;
//! the next submission starts a fresh one.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, OnceLock};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

type BucketMap = Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>;

fn buckets() -> &'static BucketMap {
    static BUCKETS: OnceLock<BucketMap> = OnceLock::new();
    BUCKETS.get_or_init(BucketMap::default)
}

/// Runs `job` under the named bucket, after every previously submitted
/// job for that bucket has completed. The outcome is delivered back to
/// this caller only.
pub(crate) async fn run<F, T>(bucket: &str, job: F) -> T
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();
    let wrapped: Job = Box::pin(async move {
        let outcome = job.await;
        // Receiver may have been dropped; the job still ran to completion.
        let _ = done_tx.send(outcome);
    });
    submit(bucket, wrapped);
    done_rx
        .await
        .expect("bucket worker completed without delivering a job outcome")
}

fn submit(bucket: &str, mut job: Job) {
    let mut map = buckets().lock().expect("bucket map lock poisoned");
    if let Some(sender) = map.get(bucket) {
        match sender.send(job) {
            Ok(()) => return,
            // The worker behind this entry was torn down with its
            // runtime before it could deregister; replace it.
            Err(returned) => {
                job = returned.0;
                map.remove(bucket);
            }
        }
    }
    let (sender, receiver) = mpsc::unbounded_channel();
    sender
        .send(job)
        .expect("freshly created mailbox cannot be closed");
    map.insert(bucket.to_string(), sender);
    spawn_worker(bucket.to_string(), receiver);
}

fn spawn_worker(bucket: String, mut mailbox: mpsc::UnboundedReceiver<Job>) {
    tokio::spawn(async move {
        debug!(bucket = %bucket, "bucket worker started");
        loop {
            let job = match mailbox.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    // Deregister under the map lock: submitters hold the
                    // same lock while sending, so an entry present in the
                    // map always has a live worker behind it.
                    let mut map = buckets().lock().expect("bucket map lock poisoned");
                    match mailbox.try_recv() {
                        Ok(job) => {
                            drop(map);
                            job
                        }
                        Err(_) => {
                            map.remove(&bucket);
                            break;
                        }
                    }
                }
            };
            job.await;
        }
        debug!(bucket = %bucket, "bucket worker drained");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_bucket_runs_in_submission_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        // join_all polls (and thereby submits) the jobs in index order.
        let jobs: Vec<_> = (0..16u32)
            .map(|i| {
                let log = log.clone();
                run("peer-order", async move {
                    // Stagger so later jobs would overtake earlier ones
                    // if the bucket allowed interleaving.
                    tokio::time::sleep(Duration::from_millis(u64::from(16 - i))).await;
                    log.lock().unwrap().push(i);
                })
            })
            .collect();
        futures::future::join_all(jobs).await;
        let log = log.lock().unwrap();
        assert_eq!(*log, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_buckets_run_concurrently() {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = tokio::spawn(run("peer-slow", async move {
            started_tx.send(()).unwrap();
            release_rx.await.unwrap();
        }));

        started_rx.await.unwrap();
        // While peer-slow is blocked, a different bucket must make progress.
        let value = run("peer-fast", async { 42 }).await;
        assert_eq!(value, 42);

        release_tx.send(()).unwrap();
        slow.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bucket_restarts_after_drain() {
        run("peer-restart", async {}).await;
        // Give the worker a moment to tear itself down, then reuse.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!buckets().lock().unwrap().contains_key("peer-restart"));
        let value = run("peer-restart", async { 7 }).await;
        assert_eq!(value, 7);
    }
}
