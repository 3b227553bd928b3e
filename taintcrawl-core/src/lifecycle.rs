//! Worker registration, heartbeat and deregistration.
//!
//! Deregistration doubles as crash recovery: subjects a worker left in
//! PROCESSING return to UNVISITED so another worker can pick them up.

use chrono::Utc;
use taintcrawl_config::CrashResetPolicy;
use taintcrawl_model::{SubjectId, WorkerId, WorkerType};
use tracing::info;

use crate::error::{CrawlError, Result};
use crate::store::EntityStore;

/// Subjects touched while deregistering a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// PROCESSING subjects returned to UNVISITED.
    pub reset: u64,
    /// UNVISITED subjects whose affinity to the worker was dropped.
    pub released: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerLifecycle {
    store: EntityStore,
    policy: CrashResetPolicy,
}

impl WorkerLifecycle {
    pub fn new(store: EntityStore, policy: CrashResetPolicy) -> Self {
        Self { store, policy }
    }

    /// Create an ACTIVE worker row. Its id is the affinity key for every
    /// reservation the process makes.
    pub async fn register(&self, worker_type: WorkerType) -> Result<WorkerId> {
        let id = sqlx::query_scalar::<_, WorkerId>(
            r#"
            INSERT INTO workers (worker_type, status, started_at)
            VALUES ($1, 'ACTIVE', $2)
            RETURNING id
            "#,
        )
        .bind(worker_type)
        .bind(Utc::now())
        .fetch_one(self.store.pool())
        .await
        .map_err(|e| CrawlError::database("register worker", e))?;
        info!(worker = %id, worker_type = %worker_type, "worker registered");
        Ok(id)
    }

    /// Record what the worker is busy with; `None` after an empty poll.
    pub async fn heartbeat(
        &self,
        worker: WorkerId,
        current: Option<SubjectId>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE workers
            SET current_subject = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'ACTIVE'
            "#,
        )
        .bind(worker)
        .bind(current)
        .execute(self.store.pool())
        .await
        .map_err(|e| CrawlError::database("worker heartbeat", e))?
        .rows_affected();
        if updated == 0 {
            return Err(CrawlError::NotFound(format!("active worker {worker}")));
        }
        Ok(())
    }

    /// Stamp the start of a subject's visit. Re-visits after a reset keep the
    /// first stamp.
    pub async fn mark_visit_started(&self, subject: SubjectId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subjects
            SET visitation_begin = COALESCE(visitation_begin, $2), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subject)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await
        .map_err(|e| CrawlError::database("stamp subject begin", e))?;
        Ok(())
    }

    /// Reset the worker's in-flight subjects and mark it FINISHED.
    pub async fn deregister(
        &self,
        worker: WorkerId,
        finished_count: i32,
        message: &str,
    ) -> Result<RecoveryReport> {
        let mut tx = self.store.begin("begin deregister tx").await?;
        let mut report = RecoveryReport::default();

        match self.policy {
            CrashResetPolicy::ClearAffinity => {
                report.reset = sqlx::query(
                    r#"
                    UPDATE subjects
                    SET status = 'UNVISITED', worker = NULL, updated_at = NOW()
                    WHERE worker = $1 AND status = 'PROCESSING'
                    "#,
                )
                .bind(worker)
                .execute(&mut *tx)
                .await
                .map_err(|e| CrawlError::database("reset subjects", e))?
                .rows_affected();

                report.released = sqlx::query(
                    r#"
                    UPDATE subjects
                    SET worker = NULL, updated_at = NOW()
                    WHERE worker = $1 AND status = 'UNVISITED'
                    "#,
                )
                .bind(worker)
                .execute(&mut *tx)
                .await
                .map_err(|e| CrawlError::database("release affinity", e))?
                .rows_affected();
            }
            CrashResetPolicy::RetainAffinity => {
                report.reset = sqlx::query(
                    r#"
                    UPDATE subjects
                    SET status = 'UNVISITED', updated_at = NOW()
                    WHERE worker = $1 AND status = 'PROCESSING'
                    "#,
                )
                .bind(worker)
                .execute(&mut *tx)
                .await
                .map_err(|e| CrawlError::database("reset subjects", e))?
                .rows_affected();
            }
        }

        let finished = sqlx::query(
            r#"
            UPDATE workers
            SET status = 'FINISHED',
                finished_at = $2,
                subject_count = $3,
                message = $4,
                current_subject = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker)
        .bind(Utc::now())
        .bind(finished_count)
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(|e| CrawlError::database("finish worker", e))?
        .rows_affected();
        if finished == 0 {
            return Err(CrawlError::NotFound(format!("worker {worker}")));
        }

        tx.commit()
            .await
            .map_err(|e| CrawlError::database("commit deregister tx", e))?;
        info!(
            worker = %worker,
            reset = report.reset,
            released = report.released,
            subjects = finished_count,
            "worker deregistered: {message}"
        );
        Ok(report)
    }
}
