//! Background evaluation worker pool.
//!
//! Evaluations run asynchronously: handlers enqueue a job and return
//! immediately, a distributor fans jobs out to workers round-robin, and
//! each run is held to a wall-clock budget. A job that exceeds its budget
//! or fails transiently is requeued with backoff a bounded number of
//! times; data faults are logged and dropped without retry.

use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::engine::orchestrator::Orchestrator;
use crate::models::AnchorRef;
use crate::services::metrics::{record_job, QUEUE_DEPTH};

#[derive(Debug, Clone, Copy)]
pub struct EvaluationJob {
    pub team_id: Uuid,
    pub anchor: AnchorRef,
    pub attempt: u32,
}

impl EvaluationJob {
    pub fn new(team_id: Uuid, anchor: AnchorRef) -> Self {
        Self {
            team_id,
            anchor,
            attempt: 0,
        }
    }
}

pub struct EvaluationPool {
    config: WorkerConfig,
    engine: Arc<Orchestrator>,
    job_tx: mpsc::Sender<EvaluationJob>,
    job_rx: Option<mpsc::Receiver<EvaluationJob>>,
    shutdown_token: CancellationToken,
}

impl EvaluationPool {
    pub fn new(
        config: WorkerConfig,
        engine: Arc<Orchestrator>,
    ) -> (Self, mpsc::Sender<EvaluationJob>) {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);

        let pool = Self {
            config,
            engine,
            job_tx: job_tx.clone(),
            job_rx: Some(job_rx),
            shutdown_token: CancellationToken::new(),
        };

        (pool, job_tx)
    }

    pub async fn start(mut self) {
        if !self.config.enabled {
            tracing::info!("Evaluation worker pool disabled by configuration");
            return;
        }

        let mut job_rx = self.job_rx.take().expect("start() can only be called once");

        tracing::info!(
            worker_count = self.config.worker_count,
            queue_size = self.config.queue_size,
            evaluation_budget_secs = self.config.evaluation_budget_secs,
            "Starting evaluation worker pool"
        );

        let mut workers = Vec::new();
        for worker_id in 0..self.config.worker_count {
            workers.push(Worker {
                id: worker_id,
                engine: self.engine.clone(),
                job_tx: self.job_tx.clone(),
                budget: Duration::from_secs(self.config.evaluation_budget_secs),
                max_requeues: self.config.max_requeues,
            });
        }

        let shutdown = self.shutdown_token.clone();

        // Single distributor task fanning jobs out round-robin.
        tokio::spawn(async move {
            let mut next_worker = 0;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Job distributor shutting down");
                        break;
                    }
                    job = job_rx.recv() => {
                        match job {
                            Some(job) => {
                                QUEUE_DEPTH.dec();
                                let worker = workers[next_worker].clone();
                                next_worker = (next_worker + 1) % workers.len();

                                tracing::debug!(
                                    worker_id = worker.id,
                                    anchor = %job.anchor,
                                    "Dispatching evaluation job"
                                );

                                tokio::spawn(async move {
                                    worker.process_job(job).await;
                                });
                            }
                            None => {
                                tracing::info!("Channel closed, job distributor exiting");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    pub fn enqueue(&self, job: EvaluationJob) -> Result<(), AppError> {
        enqueue(&self.job_tx, job)
    }

    pub async fn shutdown(&self) {
        tracing::info!("Initiating evaluation pool shutdown");
        self.shutdown_token.cancel();
    }
}

/// Enqueue a job without blocking. A full queue surfaces as service
/// unavailability so the caller can retry later.
pub fn enqueue(tx: &mpsc::Sender<EvaluationJob>, job: EvaluationJob) -> Result<(), AppError> {
    tx.try_send(job)
        .map_err(|_| AppError::ServiceUnavailable("Evaluation queue full".to_string()))?;
    QUEUE_DEPTH.inc();
    Ok(())
}

#[derive(Clone)]
struct Worker {
    id: usize,
    engine: Arc<Orchestrator>,
    job_tx: mpsc::Sender<EvaluationJob>,
    budget: Duration,
    max_requeues: u32,
}

impl Worker {
    async fn process_job(&self, job: EvaluationJob) {
        let start = Instant::now();

        tracing::info!(
            worker_id = self.id,
            team_id = %job.team_id,
            anchor = %job.anchor,
            attempt = job.attempt,
            "Evaluation job started"
        );

        let outcome = tokio::time::timeout(
            self.budget,
            self.engine.evaluate(job.team_id, job.anchor),
        )
        .await;

        match outcome {
            Ok(Ok(report)) => {
                record_job("completed");
                tracing::info!(
                    worker_id = self.id,
                    anchor = %job.anchor,
                    documents_evaluated = report.documents_evaluated,
                    auto_matched = report.auto_matched,
                    suggested = report.suggested,
                    marked_no_match = report.marked_no_match,
                    claim_conflicts = report.claim_conflicts,
                    duration_ms = start.elapsed().as_millis(),
                    "Evaluation job completed"
                );
            }
            Ok(Err(e)) if e.is_retryable() => {
                tracing::warn!(
                    worker_id = self.id,
                    anchor = %job.anchor,
                    error = %e,
                    "Evaluation failed transiently"
                );
                self.requeue(job).await;
            }
            Ok(Err(e)) => {
                record_job("failed");
                tracing::error!(
                    worker_id = self.id,
                    anchor = %job.anchor,
                    error = %e,
                    "Evaluation aborted on a permanent error"
                );
            }
            Err(_) => {
                tracing::warn!(
                    worker_id = self.id,
                    anchor = %job.anchor,
                    budget_secs = self.budget.as_secs(),
                    "Evaluation exceeded its budget"
                );
                self.requeue(job).await;
            }
        }
    }

    /// Put the job back on the queue after a backoff delay, up to the
    /// configured requeue limit.
    async fn requeue(&self, job: EvaluationJob) {
        if job.attempt >= self.max_requeues {
            record_job("dropped");
            tracing::error!(
                anchor = %job.anchor,
                attempts = job.attempt + 1,
                "Evaluation job dropped after exhausting requeues"
            );
            return;
        }

        let delay = RetryConfig::default().backoff_duration(job.attempt);
        let requeued = EvaluationJob {
            attempt: job.attempt + 1,
            ..job
        };
        let tx = self.job_tx.clone();

        record_job("requeued");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.try_send(requeued).is_ok() {
                QUEUE_DEPTH.inc();
            } else {
                record_job("dropped");
                tracing::error!(
                    anchor = %requeued.anchor,
                    "Requeue failed, evaluation job dropped"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;
    use crate::services::events::CapturingEventPublisher;
    use crate::services::fx::FixedFxRates;
    use crate::services::store::InMemoryStore;

    fn test_pool(config: WorkerConfig) -> (EvaluationPool, mpsc::Sender<EvaluationJob>) {
        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(Orchestrator::new(
            store,
            Arc::new(FixedFxRates::new()),
            Arc::new(CapturingEventPublisher::new()),
            ScoringConfig::default(),
        ));
        EvaluationPool::new(config, engine)
    }

    #[tokio::test]
    async fn test_enqueue_rejects_when_queue_is_full() {
        let config = WorkerConfig {
            enabled: false,
            worker_count: 1,
            queue_size: 1,
            evaluation_budget_secs: 1,
            max_requeues: 0,
        };
        // Pool never started, so the single slot stays occupied.
        let (pool, _tx) = test_pool(config);

        let job = EvaluationJob::new(Uuid::new_v4(), AnchorRef::Document(Uuid::new_v4()));
        assert!(pool.enqueue(job).is_ok());

        let second = EvaluationJob::new(Uuid::new_v4(), AnchorRef::Document(Uuid::new_v4()));
        let err = pool.enqueue(second).unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_disabled_pool_does_not_consume_jobs() {
        let config = WorkerConfig {
            enabled: false,
            worker_count: 1,
            queue_size: 4,
            evaluation_budget_secs: 1,
            max_requeues: 0,
        };
        let (pool, tx) = test_pool(config);
        pool.start().await;

        // With the pool disabled the channel has no consumer; the job
        // stays queued rather than erroring.
        let job = EvaluationJob::new(Uuid::new_v4(), AnchorRef::Document(Uuid::new_v4()));
        assert!(tx.try_send(job).is_ok());
    }
}
