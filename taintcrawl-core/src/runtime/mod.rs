//! Worker loop.
//!
//! [`CrawlWorker::run`] registers a worker, keeps dequeuing and executing
//! subjects until the crawl drains or the token is cancelled, and always
//! tries to deregister on the way out so in-flight work is recovered.

pub mod executor;

use std::time::Duration;

use taintcrawl_config::CrawlerConfig;
use taintcrawl_model::{DomainId, SubjectType, Task, WorkerId, WorkerType};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::CompletionPropagator;
use crate::discovery::SubjectFactory;
use crate::discovery::links::{LinkCollector, LinkOrigin};
use crate::error::Result;
use crate::lifecycle::{RecoveryReport, WorkerLifecycle};
use crate::queue::LocalTaskQueue;
use crate::scheduler::{AffinityHints, Scheduler};
use crate::store::EntityStore;
use executor::SubjectExecutor;

pub const NORMAL_TERMINATION: &str = "Normal worker termination";
pub const SIGNAL_TERMINATION: &str = "Worker terminated by signal";

/// Attempts of a dequeue or report whose transaction keeps being rolled
/// back by contention before the worker gives up.
const STORE_ATTEMPTS: u32 = 5;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No work left within the polling budget.
    Drained,
    Cancelled,
}

impl ExitReason {
    pub fn message(&self) -> &'static str {
        match self {
            ExitReason::Drained => NORMAL_TERMINATION,
            ExitReason::Cancelled => SIGNAL_TERMINATION,
        }
    }
}

/// Summary of a finished worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker: WorkerId,
    /// Subjects reported as VISITED or SKIP by this worker.
    pub processed: i32,
    pub reason: ExitReason,
    pub recovery: RecoveryReport,
}

#[derive(Debug)]
pub struct CrawlWorker<E> {
    store: EntityStore,
    config: CrawlerConfig,
    executor: E,
}

struct Components {
    queue: LocalTaskQueue<Scheduler>,
    propagator: CompletionPropagator,
    links: LinkCollector,
}

/// How a visit ends up being reported.
enum Verdict {
    Finished(Option<String>),
    Skipped(String),
}

impl<E: SubjectExecutor> CrawlWorker<E> {
    pub fn new(store: EntityStore, config: CrawlerConfig, executor: E) -> Self {
        Self {
            store,
            config,
            executor,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub async fn run(
        &self,
        worker_type: WorkerType,
        cancel: CancellationToken,
    ) -> Result<WorkerExit> {
        let lifecycle = WorkerLifecycle::new(
            self.store.clone(),
            self.config.scheduler.crash_reset,
        );
        let worker = lifecycle.register(worker_type).await?;
        let mut processed = 0;

        match self.drive(worker, &lifecycle, &cancel, &mut processed).await {
            Ok(reason) => {
                let recovery = lifecycle
                    .deregister(worker, processed, reason.message())
                    .await?;
                info!(worker = %worker, processed, reason = ?reason, "worker exited");
                Ok(WorkerExit {
                    worker,
                    processed,
                    reason,
                    recovery,
                })
            }
            Err(err) => {
                let message = format!("Worker failed: {err}");
                if let Err(dereg) =
                    lifecycle.deregister(worker, processed, &message).await
                {
                    warn!(worker = %worker, error = %dereg, "deregistration after failure failed");
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        worker: WorkerId,
        lifecycle: &WorkerLifecycle,
        cancel: &CancellationToken,
        processed: &mut i32,
    ) -> Result<ExitReason> {
        let mut parts = Components {
            queue: LocalTaskQueue::new(
                worker,
                Scheduler::new(self.store.clone(), self.config.clone()),
            ),
            propagator: CompletionPropagator::new(
                self.store.clone(),
                self.config.sessions.clone(),
            ),
            links: LinkCollector::new(
                SubjectFactory::new(self.store.clone(), self.config.clone()),
                self.config.links.maximum.clone(),
            ),
        };
        let mut hints = AffinityHints::default();
        let mut last_domain: Option<DomainId> = None;
        let mut empty_polls: u32 = 0;
        let mut failed_dequeues: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(ExitReason::Cancelled);
            }

            let next = match next_task(&mut parts.queue, hints).await {
                Ok(next) => {
                    failed_dequeues = 0;
                    next
                }
                Err(err)
                    if err.is_transient() && failed_dequeues + 1 < STORE_ATTEMPTS =>
                {
                    failed_dequeues += 1;
                    warn!(worker = %worker, attempt = failed_dequeues, error = %err, "dequeue rolled back, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(ExitReason::Cancelled),
                        _ = sleep(STORE_RETRY_DELAY * failed_dequeues) => continue,
                    }
                }
                Err(err) => return Err(err),
            };
            let Some(task) = next else {
                lifecycle.heartbeat(worker, None).await?;
                empty_polls += 1;
                let Some(delay) = poll_delay(&self.config, empty_polls) else {
                    return Ok(ExitReason::Drained);
                };
                debug!(worker = %worker, empty_polls, "no work, polling again in {delay:?}");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(ExitReason::Cancelled),
                    _ = sleep(delay) => continue,
                }
            };
            empty_polls = 0;
            hints = AffinityHints::from_task(&task);
            lifecycle.heartbeat(worker, Some(task.subject_id)).await?;

            if task.depth > 0 && last_domain == Some(task.domain_id) {
                let pause =
                    Duration::from_millis(self.config.timeouts.same_site_ms);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(ExitReason::Cancelled),
                    _ = sleep(pause) => {}
                }
            }
            last_domain = Some(task.domain_id);

            lifecycle.mark_visit_started(task.subject_id).await?;
            if !self.visit(worker, &task, &parts, cancel).await? {
                return Ok(ExitReason::Cancelled);
            }
            *processed += 1;
        }
    }

    /// Execute one task and report it. `false` when cancelled mid-visit; the
    /// subject is then left PROCESSING for deregistration to reset.
    async fn visit(
        &self,
        worker: WorkerId,
        task: &Task,
        parts: &Components,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let budget = Duration::from_secs(self.config.max_time.subject_secs);
        info!(worker = %worker, subject = %task.subject_id, subject_type = %task.subject_type, "visiting {}", task.start_url);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            outcome = timeout(budget, self.executor.execute(worker, task)) => outcome,
        };

        let verdict = match outcome {
            Ok(Ok(report)) => {
                if task.subject_type == SubjectType::Reconnaissance
                    && !report.links.is_empty()
                {
                    let origin = LinkOrigin {
                        page_url: report
                            .final_url
                            .as_deref()
                            .unwrap_or(&task.start_url),
                        depth: task.depth + 1,
                        parent: task.url_id,
                        worker: Some(worker),
                        session: task.session_id(),
                    };
                    let scheduled =
                        parts.links.collect(&report.links, &origin).await?;
                    debug!(subject = %task.subject_id, found = report.links.len(), scheduled, "links collected");
                }
                Verdict::Finished(report.final_url)
            }
            Ok(Err(err)) if err.is_store_failure() => return Err(err),
            Ok(Err(err)) => {
                warn!(worker = %worker, subject = %task.subject_id, error = %err, "subject failed");
                Verdict::Skipped(err.to_string())
            }
            Err(_) => {
                let reason = format!(
                    "Subject exceeded its time budget of {}s",
                    budget.as_secs()
                );
                warn!(worker = %worker, subject = %task.subject_id, "{reason}");
                Verdict::Skipped(reason)
            }
        };
        self.report(worker, task, &verdict, &parts.propagator, cancel)
            .await
    }

    /// Report a visit, retrying transactions rolled back by contention.
    /// `false` when cancelled between attempts.
    async fn report(
        &self,
        worker: WorkerId,
        task: &Task,
        verdict: &Verdict,
        propagator: &CompletionPropagator,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut attempt = 1;
        loop {
            let reported = match verdict {
                Verdict::Finished(final_url) => {
                    propagator
                        .finish_subject(task.subject_id, final_url.as_deref())
                        .await
                }
                Verdict::Skipped(reason) => {
                    propagator.skip_subject(task.subject_id, reason).await
                }
            };
            match reported {
                Ok(_) => return Ok(true),
                Err(err) if err.is_transient() && attempt < STORE_ATTEMPTS => {
                    warn!(worker = %worker, subject = %task.subject_id, attempt, error = %err, "report rolled back, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(false),
                        _ = sleep(STORE_RETRY_DELAY * attempt) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Delay before the next poll after `empty_polls` consecutive empty polls,
/// or `None` to stop.
fn poll_delay(config: &CrawlerConfig, empty_polls: u32) -> Option<Duration> {
    let interval = config.scheduler.poll_interval_secs?;
    if config.scheduler.forever || empty_polls < config.scheduler.poll_max {
        Some(Duration::from_secs(interval))
    } else {
        None
    }
}

/// Dequeue with progressively looser hints.
async fn next_task(
    queue: &mut LocalTaskQueue<Scheduler>,
    hints: AffinityHints,
) -> Result<Option<Task>> {
    for relaxed in hints.relaxations() {
        if let Some(task) = queue.dequeue(relaxed).await? {
            return Ok(Some(task));
        }
    }
    Ok(None)
}
