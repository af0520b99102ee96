//! Bounded-concurrency job runner with guaranteed drain on shutdown.
//!
//! A timed-out job surfaces a `JobTimeout` result, but its compute is not
//! forcibly stopped: the future keeps running detached and its eventual
//! output is discarded. Jobs accepted before shutdown are never abandoned
//! silently.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{GridError, Result};

/// Boxed async job body. Receives a cancellation watch that flips to
/// `true` when the job times out or the pool shuts down.
pub type JobFn<T> = Box<
    dyn FnOnce(watch::Receiver<bool>) -> futures_util::future::BoxFuture<'static, Result<T>>
        + Send,
>;

pub struct Job<T> {
    pub id: String,
    /// Overrides the pool default when set
    pub timeout: Option<Duration>,
    pub run: JobFn<T>,
}

impl<T> Job<T> {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            id: id.into(),
            timeout: None,
            run: Box::new(move |cancel| Box::pin(f(cancel))),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug)]
pub struct JobResult<T> {
    pub job_id: String,
    pub output: Result<T>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub job_queue_size: usize,
    pub result_queue_size: usize,
    pub shutdown_timeout: Duration,
    /// Default per-job timeout for jobs without an explicit one
    pub job_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            job_queue_size: 1000,
            result_queue_size: 1000,
            shutdown_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(10),
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub processing: i64,
    pub queue_depth: usize,
}

pub struct WorkerPool<T: Send + 'static> {
    config: PoolConfig,
    job_tx: Mutex<Option<mpsc::Sender<Job<T>>>>,
    result_rx: Mutex<Option<mpsc::Receiver<JobResult<T>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    timed_out: Arc<AtomicU64>,
    processing: Arc<AtomicI64>,
    queue_depth: Arc<AtomicI64>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (job_tx, job_rx) = mpsc::channel::<Job<T>>(config.job_queue_size);
        let (result_tx, result_rx) = mpsc::channel::<JobResult<T>>(config.result_queue_size);

        let pool = Self {
            config: config.clone(),
            job_tx: Mutex::new(Some(job_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            workers: Mutex::new(Vec::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            timed_out: Arc::new(AtomicU64::new(0)),
            processing: Arc::new(AtomicI64::new(0)),
            queue_depth: Arc::new(AtomicI64::new(0)),
        };

        pool.spawn_workers(job_rx, result_tx);
        pool
    }

    fn spawn_workers(&self, job_rx: mpsc::Receiver<Job<T>>, result_tx: mpsc::Sender<JobResult<T>>) {
        let shared_rx = Arc::new(Mutex::new(job_rx));
        let mut workers = self
            .workers
            .try_lock()
            .expect("no contention during construction");

        for worker_id in 0..self.config.workers {
            let rx = shared_rx.clone();
            let tx = result_tx.clone();
            let default_timeout = self.config.job_timeout;
            let completed = self.completed.clone();
            let failed = self.failed.clone();
            let timed_out = self.timed_out.clone();
            let processing = self.processing.clone();
            let queue_depth = self.queue_depth.clone();

            workers.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else {
                        // Queue closed and drained; worker exits.
                        debug!(worker_id, "worker stopped (queue closed)");
                        return;
                    };
                    queue_depth.fetch_sub(1, Ordering::SeqCst);

                    processing.fetch_add(1, Ordering::SeqCst);
                    let started = std::time::Instant::now();
                    let timeout = job.timeout.unwrap_or(default_timeout);
                    let job_id = job.id.clone();

                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    // Run the body as its own task so a timeout abandons
                    // it without stopping its compute.
                    let body = tokio::spawn((job.run)(cancel_rx));

                    let output = match tokio::time::timeout(timeout, body).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_err)) => {
                            Err(GridError::Internal(format!("job panicked: {join_err}")))
                        }
                        Err(_) => {
                            let _ = cancel_tx.send(true);
                            timed_out.fetch_add(1, Ordering::SeqCst);
                            Err(GridError::JobTimeout {
                                elapsed_ms: timeout.as_millis() as u64,
                            })
                        }
                    };

                    if output.is_ok() {
                        completed.fetch_add(1, Ordering::SeqCst);
                    } else {
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                    processing.fetch_sub(1, Ordering::SeqCst);

                    let result = JobResult {
                        job_id: job_id.clone(),
                        output,
                        duration: started.elapsed(),
                    };

                    // Non-blocking: a full result queue must not deadlock
                    // shutdown.
                    if tx.try_send(result).is_err() {
                        warn!(job_id = %job_id, "result queue full, dropping result");
                    }
                }
            }));
        }
    }

    /// Submit a job; fails immediately when the queue is full or the pool
    /// is closed.
    pub async fn submit(&self, job: Job<T>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GridError::PoolClosed);
        }
        let guard = self.job_tx.lock().await;
        let tx = guard.as_ref().ok_or(GridError::PoolClosed)?;
        match tx.try_send(job) {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::SeqCst);
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(GridError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GridError::PoolClosed),
        }
    }

    /// Submit, waiting up to `timeout` for queue capacity.
    pub async fn submit_timeout(&self, job: Job<T>, timeout: Duration) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GridError::PoolClosed);
        }
        let tx = {
            let guard = self.job_tx.lock().await;
            guard.as_ref().ok_or(GridError::PoolClosed)?.clone()
        };
        match tx.send_timeout(job, timeout).await {
            Ok(()) => {
                self.submitted.fetch_add(1, Ordering::SeqCst);
                self.queue_depth.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(GridError::QueueFull),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(GridError::PoolClosed),
        }
    }

    /// Take the result stream. Yields `None` once the pool has shut down
    /// and all results are drained.
    pub async fn results(&self) -> Option<mpsc::Receiver<JobResult<T>>> {
        self.result_rx.lock().await.take()
    }

    /// Graceful shutdown: refuse new jobs, signal cancellation, close the
    /// queue, and wait for workers to drain it.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("worker pool shutting down");

        let _ = self.shutdown_tx.send(true);
        // Closing the queue lets workers drain what was accepted.
        self.job_tx.lock().await.take();

        let workers = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };

        let drain = async {
            for handle in workers {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, drain).await {
            Ok(()) => {
                info!(
                    completed = self.completed.load(Ordering::SeqCst),
                    failed = self.failed.load(Ordering::SeqCst),
                    "worker pool shutdown complete"
                );
                Ok(())
            }
            Err(_) => {
                warn!("worker pool shutdown timeout exceeded");
                Err(GridError::ShutdownTimeout)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            timed_out: self.timed_out.load(Ordering::SeqCst),
            processing: self.processing.load(Ordering::SeqCst),
            queue_depth: self.queue_depth.load(Ordering::SeqCst).max(0) as usize,
        }
    }
}
