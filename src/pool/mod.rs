//! Bounded worker pool for bulk submission.
//!
//! Jobs go in through one queue and results come out of another. At most
//! `workers` requests run at once; results arrive in completion order, so
//! callers match them up by `request_id`.

use std::sync::Arc;

use http::Method;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

use crate::client::Client;
use crate::config::RequestOptions;
use crate::error::{Error, Result};
use crate::response::Response;

/// Concurrent workers when none is configured.
pub const DEFAULT_WORKERS: usize = 100;

/// One queued request.
#[derive(Debug, Clone)]
pub struct Job {
    pub request_id: String,
    pub url: String,
    pub method: Method,
    pub options: RequestOptions,
}

impl Job {
    pub fn new(request_id: impl Into<String>, url: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            request_id: request_id.into(),
            url: url.into(),
            method: Method::GET,
            options,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }
}

/// Outcome of one job. `result` is `Err` only for compilation failures.
#[derive(Debug)]
pub struct JobResult {
    pub request_id: String,
    pub result: Result<Response>,
}

/// Input queue, output queue, and a dispatcher task between them.
#[derive(Debug)]
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    results: mpsc::Receiver<JobResult>,
}

impl WorkerPool {
    pub fn new(client: Client, workers: usize) -> Self {
        let workers = workers.max(1);
        let (job_tx, job_rx) = mpsc::channel(workers);
        let (result_tx, result_rx) = mpsc::channel(workers);
        tokio::spawn(dispatch(client, workers, job_rx, result_tx));
        Self {
            jobs: job_tx,
            results: result_rx,
        }
    }

    /// Enqueue a job; waits while the input queue is full.
    pub async fn submit(&self, mut job: Job) -> Result<()> {
        if job.options.request_id.is_none() {
            job.options.request_id = Some(job.request_id.clone());
        }
        self.jobs
            .send(job)
            .await
            .map_err(|_| Error::connection("worker pool has shut down"))
    }

    /// Sender half for submitting from other tasks.
    pub fn sender(&self) -> mpsc::Sender<Job> {
        self.jobs.clone()
    }

    /// Next finished job, or `None` once every sender is gone and the queue drained.
    pub async fn recv(&mut self) -> Option<JobResult> {
        self.results.recv().await
    }

    /// Stop accepting jobs; results already in flight can still be received.
    pub fn close(self) -> mpsc::Receiver<JobResult> {
        self.results
    }
}

async fn dispatch(
    client: Client,
    workers: usize,
    mut jobs: mpsc::Receiver<Job>,
    results: mpsc::Sender<JobResult>,
) {
    let permits = Arc::new(Semaphore::new(workers));
    while let Some(job) = jobs.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let client = client.clone();
        let results = results.clone();
        tokio::spawn(async move {
            trace!("worker starting {} {}", job.method, job.url);
            let result = client.execute(&job.url, &job.options, job.method).await;
            drop(permit);
            let done = JobResult {
                request_id: job.request_id,
                result,
            };
            if results.send(done).await.is_err() {
                debug!("worker pool result dropped: receiver gone");
            }
        });
    }
    debug!("worker pool input closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_results_tagged_by_request_id() {
        let client = Client::builder().workers(4).build();
        let mut pool = client.queue();

        let bad = RequestOptions {
            ja3: "771,4865,0-111111,29,0".into(),
            ..Default::default()
        };
        for i in 0..6 {
            pool.submit(Job::new(format!("job-{i}"), "https://127.0.0.1:1/", bad.clone()))
                .await
                .unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..6 {
            let r = pool.recv().await.unwrap();
            assert!(r.result.unwrap_err().is_compilation());
            seen.insert(r.request_id);
        }
        assert_eq!(seen.len(), 6);
    }

    #[tokio::test]
    async fn test_sender_close_drains() {
        let client = Client::builder().workers(2).build();
        let pool = client.queue();
        let tx = pool.sender();
        let mut results = pool.close();
        tx.send(Job::new("only", "not a url", RequestOptions::default()))
            .await
            .unwrap();
        drop(tx);

        let r = results.recv().await.unwrap();
        assert_eq!(r.request_id, "only");
        let response = r.result.unwrap();
        assert!(response.is_error());
        assert!(results.recv().await.is_none());
    }
}
