//! Worker runtime: polling, dispatch and completion reporting.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::engine::QueueEngine;
use crate::error::QueueError;
use crate::job::Job;

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Job execution seam.
///
/// Implementations hold the business logic; the worker owns claiming and
/// the completion/failure report. Execution is at-least-once — handlers
/// are expected to be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute a job, returning its result payload.
    async fn run(&self, job: &Job) -> anyhow::Result<serde_json::Value>;
}

/// Maps `job_type` to its handler.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type.
    pub fn register(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Registered job types.
    pub fn job_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }
}

/// A single polling worker bound to one queue.
pub struct Worker {
    engine: QueueEngine,
    queue_name: String,
    worker_id: String,
    registry: Arc<JobRegistry>,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
}

impl Worker {
    /// Create a worker with poll settings from the engine's configuration.
    pub fn new(
        engine: QueueEngine,
        queue_name: impl Into<String>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        let queue_name = queue_name.into();
        let poll_interval = Duration::from_millis(engine.config().poll_interval_ms);
        let jitter = Duration::from_millis(engine.config().jitter_ms);
        Self {
            worker_id: format!("{}-{}", queue_name, Uuid::new_v4()),
            engine,
            queue_name,
            registry,
            poll_interval,
            jitter,
            shutdown_when_queue_empty: false,
        }
    }

    /// Override the generated worker identity.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Shut down once a claim comes back empty instead of polling forever.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// The worker's identity as stamped on claimed jobs.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Calculate the sleep duration with random jitter applied.
    ///
    /// Jitter keeps a fleet of idle workers from polling the store in
    /// lockstep.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run jobs forever, or until the queue drains if
    /// `shutdown_when_queue_empty` is set.
    pub async fn run(&self) {
        loop {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No eligible jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No eligible jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim and run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no eligible job was waiting
    /// - `Err(...)` if claiming or reporting failed
    async fn run_next_job(&self) -> Result<Option<Uuid>, QueueError> {
        let Some(job) = self.engine.claim(&self.queue_name, &self.worker_id).await? else {
            return Ok(None);
        };

        let job_id = job.id;
        let span = info_span!("job", job.id = %job_id, job.job_type = %job.job_type);

        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(job.id = %job_id, job_type = %job.job_type, "No handler registered, failing without retry");
            self.engine
                .fail(
                    job_id,
                    &format!("no handler registered for job type {}", job.job_type),
                    false,
                )
                .await?;
            return Ok(Some(job_id));
        };

        debug!(job.id = %job_id, "Running job…");
        let result = AssertUnwindSafe(handler.run(&job))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let _enter = span.enter();
        match result {
            Ok(Ok(output)) => {
                self.engine.complete(job_id, Some(output)).await?;
            }
            Ok(Err(error)) => {
                let outcome = self.engine.fail(job_id, &error.to_string(), true).await?;
                if outcome.will_retry {
                    debug!("Job failed, will retry");
                }
            }
            Err(panic) => {
                self.engine
                    .fail(job_id, &panic_message(panic.as_ref()), true)
                    .await?;
            }
        }

        Ok(Some(job_id))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<String>() {
        format!("job panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        format!("job panicked: {message}")
    } else {
        "job panicked".to_string()
    }
}

/// A set of workers polling one queue.
pub struct WorkerPool {
    engine: QueueEngine,
    queue_name: String,
    registry: Arc<JobRegistry>,
    num_workers: usize,
    shutdown_when_queue_empty: bool,
}

impl WorkerPool {
    /// Create a pool with a single worker.
    pub fn new(engine: QueueEngine, queue_name: impl Into<String>, registry: JobRegistry) -> Self {
        Self {
            engine,
            queue_name: queue_name.into(),
            registry: Arc::new(registry),
            num_workers: 1,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Have every worker shut down once the queue drains.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the workers.
    ///
    /// Returns a [`RunHandle`] which can be used to wait for them to
    /// shut down.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        for i in 1..=self.num_workers {
            let name = format!("{}-worker-{}", self.queue_name, i);
            info!(worker.id = %name, "Starting worker…");

            let mut worker = Worker::new(
                self.engine.clone(),
                self.queue_name.clone(),
                self.registry.clone(),
            )
            .with_worker_id(name.clone());
            if self.shutdown_when_queue_empty {
                worker = worker.shutdown_when_queue_empty();
            }

            let span = info_span!("worker", worker.id = %name);
            handles.push(tokio::spawn(
                async move { worker.run().await }.instrument(span),
            ));
        }
        RunHandle { handles }
    }
}

/// Handle to a running set of workers.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });
    }
}
