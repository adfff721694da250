//! Download worker pool.
//!
//! This module provides the async download pool that:
//! 1. Runs a fixed number of workers over a bounded task queue
//! 2. Streams files to disk without loading them entirely into memory
//! 3. Finishes each file with an atomic rename into its final folder
//! 4. Retries failed downloads with exponential backoff, re-resolving the
//!    stream URL first since host links go stale
//! 5. Respects rate limits and sleeps on 429 responses

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::StreamExt;
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::diva::io::Config;
use crate::diva::organizer::FileOrganizer;
use crate::diva::progress::DownloadObserver;
use crate::diva::resolver::{AudioResolver, ResolvedTask};
use crate::diva::sender::{calculate_backoff, retry_after_secs, RequestSender};

/// Error types for a single download attempt.
#[derive(Error, Debug)]
pub(crate) enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("connection closed mid-transfer: {got} of {expected} bytes")]
    Incomplete { got: u64, expected: u64 },
}

/// Download pool configuration.
#[derive(Debug, Clone)]
pub(crate) struct DownloadPoolConfig {
    pub(crate) max_concurrent_downloads: usize,
    /// Queue capacity as a multiple of the worker count.
    pub(crate) queue_factor: usize,
    pub(crate) retry_attempts: u32,
    pub(crate) base_retry_delay_ms: u64,
    pub(crate) size_warning: bool,
    pub(crate) size_warning_threshold: u64,
    pub(crate) skip_existing: bool,
}

impl Default for DownloadPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            queue_factor: 2,
            retry_attempts: 3,
            base_retry_delay_ms: 1000,
            size_warning: true,
            size_warning_threshold: 2 * 1024 * 1024 * 1024,
            skip_existing: false,
        }
    }
}

impl DownloadPoolConfig {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_downloads: config.worker_count(),
            queue_factor: config.queue_factor(),
            retry_attempts: config.retry_count(),
            base_retry_delay_ms: config.retry_delay_ms(),
            size_warning: config.size_warning(),
            size_warning_threshold: config.size_warning_threshold(),
            skip_existing: config.skip_existing(),
        }
    }

    /// How many queued tasks the pool accepts before producers block.
    pub(crate) fn queue_bound(&self) -> usize {
        (self.max_concurrent_downloads * self.queue_factor).max(1)
    }
}

/// What happened to one task.
#[derive(Debug, Clone)]
pub(crate) enum DownloadOutcome {
    Success { path: PathBuf },
    Skipped { path: PathBuf },
    Failure { reason: String },
}

/// One finished task with its accounting.
#[derive(Debug, Clone)]
pub(crate) struct DownloadResult {
    task: ResolvedTask,
    outcome: DownloadOutcome,
    bytes_written: u64,
    elapsed: Duration,
    retries: u32,
}

impl DownloadResult {
    pub(crate) fn task(&self) -> &ResolvedTask {
        &self.task
    }

    pub(crate) fn outcome(&self) -> &DownloadOutcome {
        &self.outcome
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Attempts beyond the first, zero for clean downloads.
    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    pub(crate) fn is_success(&self) -> bool {
        matches!(self.outcome, DownloadOutcome::Success { .. })
    }
}

/// Fixed-size pool of download workers fed through a bounded queue.
///
/// A cancelled pool stops pulling new tasks but lets in-flight downloads run
/// to completion, so the results it returns are exactly the tasks that were
/// started.
pub(crate) struct DownloadPool {
    config: DownloadPoolConfig,
    sender: RequestSender,
    resolver: Arc<AudioResolver>,
    organizer: Arc<FileOrganizer>,
    observer: Arc<dyn DownloadObserver>,
    cancel: CancellationToken,
}

impl DownloadPool {
    pub(crate) fn new(
        config: DownloadPoolConfig,
        sender: RequestSender,
        resolver: Arc<AudioResolver>,
        organizer: Arc<FileOrganizer>,
        observer: Arc<dyn DownloadObserver>,
        cancel: CancellationToken,
    ) -> Self {
        DownloadPool {
            config,
            sender,
            resolver,
            organizer,
            observer,
            cancel,
        }
    }

    pub(crate) fn queue_bound(&self) -> usize {
        self.config.queue_bound()
    }

    /// Runs workers until the queue is closed and drained, or the pool is
    /// cancelled. Results come back in completion order.
    pub(crate) async fn run(&self, tasks: flume::Receiver<ResolvedTask>) -> Vec<DownloadResult> {
        let worker_count = self.config.max_concurrent_downloads.max(1);
        debug!("Starting {} download worker(s)", worker_count);

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let worker = Worker {
                config: self.config.clone(),
                sender: self.sender.clone(),
                resolver: Arc::clone(&self.resolver),
                organizer: Arc::clone(&self.organizer),
                observer: Arc::clone(&self.observer),
                cancel: self.cancel.clone(),
            };
            workers.spawn(worker.run(worker_id, tasks.clone()));
        }
        drop(tasks);

        let mut results = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(mut worker_results) => results.append(&mut worker_results),
                Err(err) => error!("Download worker panicked: {}", err),
            }
        }
        results
    }
}

struct Worker {
    config: DownloadPoolConfig,
    sender: RequestSender,
    resolver: Arc<AudioResolver>,
    organizer: Arc<FileOrganizer>,
    observer: Arc<dyn DownloadObserver>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(
        self,
        worker_id: usize,
        tasks: flume::Receiver<ResolvedTask>,
    ) -> Vec<DownloadResult> {
        let mut results = Vec::new();
        loop {
            // The cancel check only guards the dequeue. A task that already
            // started is carried through to a result either way.
            let task = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Worker {} stopping, cancel received", worker_id);
                    break;
                }
                received = tasks.recv_async() => match received {
                    Ok(task) => task,
                    Err(_) => break,
                },
            };

            let result = self.process(task).await;
            self.observer.on_finished(&result);
            results.push(result);
        }
        results
    }

    async fn process(&self, task: ResolvedTask) -> DownloadResult {
        let started = Instant::now();

        if self.config.skip_existing {
            if let Some(path) =
                self.organizer
                    .existing_destination(task.hint(), task.title(), task.ext())
            {
                debug!("\"{}\" is already on disk at {:?}", task.title(), path);
                return DownloadResult {
                    task,
                    outcome: DownloadOutcome::Skipped { path },
                    bytes_written: 0,
                    elapsed: started.elapsed(),
                    retries: 0,
                };
            }
        }

        let max_attempts = self.config.retry_attempts.max(1);
        let mut current = task;
        let mut attempts = 0u32;
        let mut started_notified = false;
        let mut size_warned = false;
        let mut bytes_written = 0u64;

        let outcome = loop {
            attempts += 1;

            if attempts > 1 {
                info!(
                    "Retry attempt {}/{} for \"{}\"",
                    attempts,
                    max_attempts,
                    current.title()
                );
                // Stream URLs are only good for a short window, so a retry
                // has to go back through the page for a fresh one.
                match self.resolver.refresh(&current).await {
                    Ok(fresh) => current = fresh,
                    Err(err) => {
                        break DownloadOutcome::Failure {
                            reason: err.to_string(),
                        };
                    }
                }
            }

            let response = match self.sender.begin_stream(current.stream_url()).await {
                Ok(response) => response,
                Err(err) => {
                    warn!("Request error: {}", err);
                    if attempts >= max_attempts {
                        break DownloadOutcome::Failure {
                            reason: err.to_string(),
                        };
                    }
                    let backoff = calculate_backoff(attempts, self.config.base_retry_delay_ms);
                    debug!("Backing off for {}ms before retry", backoff);
                    sleep(Duration::from_millis(backoff)).await;
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!("Rate limited while fetching \"{}\"", current.title());
                if attempts >= max_attempts {
                    break DownloadOutcome::Failure {
                        reason: format!("HTTP error {status}"),
                    };
                }
                let wait_ms = retry_after_secs(&response)
                    .map(|secs| secs.saturating_mul(1000))
                    .unwrap_or(self.config.base_retry_delay_ms);
                debug!("Backing off for {}ms due to rate limiting", wait_ms);
                sleep(Duration::from_millis(wait_ms)).await;
                continue;
            }
            if status.is_client_error() {
                // The file is gone or off-limits, retrying cannot help.
                break DownloadOutcome::Failure {
                    reason: format!("HTTP error {status}"),
                };
            }
            if !status.is_success() {
                warn!("HTTP error: {}", status);
                if attempts >= max_attempts {
                    break DownloadOutcome::Failure {
                        reason: format!("HTTP error {status}"),
                    };
                }
                let backoff = calculate_backoff(attempts, self.config.base_retry_delay_ms);
                debug!("Backing off for {}ms before retry", backoff);
                sleep(Duration::from_millis(backoff)).await;
                continue;
            }

            let total = response.content_length();
            if !size_warned && self.config.size_warning {
                if let Some(size) = total {
                    if size >= self.config.size_warning_threshold {
                        self.observer.on_large_file(&current, size);
                        size_warned = true;
                    }
                }
            }
            if !started_notified {
                self.observer.on_started(&current, total);
                started_notified = true;
            }

            let temp = self.organizer.temp_path();
            match self.stream_to_temp(response, &temp, &current, total).await {
                Ok(bytes) => {
                    bytes_written = bytes;
                    match self
                        .organizer
                        .place(&temp, current.hint(), current.title(), current.ext())
                    {
                        Ok(path) => {
                            if let Err(err) = self.organizer.tag(
                                &path,
                                current.title(),
                                current.hint(),
                                current.description(),
                            ) {
                                warn!("Could not tag {:?}: {}", path, err);
                            }
                            break DownloadOutcome::Success { path };
                        }
                        Err(err) => {
                            let _ = fs::remove_file(&temp);
                            break DownloadOutcome::Failure {
                                reason: err.to_string(),
                            };
                        }
                    }
                }
                Err(err) => {
                    warn!("Download error: {}", err);
                    if temp.exists() {
                        let _ = fs::remove_file(&temp);
                    }
                    if attempts >= max_attempts {
                        break DownloadOutcome::Failure {
                            reason: err.to_string(),
                        };
                    }
                    let backoff = calculate_backoff(attempts, self.config.base_retry_delay_ms);
                    debug!("Backing off for {}ms before retry", backoff);
                    sleep(Duration::from_millis(backoff)).await;
                }
            }
        };

        DownloadResult {
            task: current,
            outcome,
            bytes_written,
            elapsed: started.elapsed(),
            retries: attempts.saturating_sub(1),
        }
    }

    /// Streams a response body into a temp file, reporting progress per
    /// chunk. The handle is closed before the caller renames the file.
    async fn stream_to_temp(
        &self,
        response: Response,
        temp: &Path,
        task: &ResolvedTask,
        total: Option<u64>,
    ) -> Result<u64, DownloadError> {
        let mut file = File::create(temp).await?;
        let mut stream = response.bytes_stream();
        let mut bytes_written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            bytes_written += chunk.len() as u64;
            self.observer.on_progress(task, bytes_written, total);
        }
        file.flush().await?;

        if let Some(expected) = total {
            if bytes_written != expected {
                return Err(DownloadError::Incomplete {
                    got: bytes_written,
                    expected,
                });
            }
        }
        Ok(bytes_written)
    }
}
