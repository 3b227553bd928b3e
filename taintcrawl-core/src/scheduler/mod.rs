//! Dequeue protocol.
//!
//! [`Scheduler::next`] walks the affinity cascade from [`tiers`], judges each
//! locked candidate against session and domain expiry from [`expiry`], and
//! reserves the survivors for the calling worker, all in one transaction.
//! Urls touched by expiry bulk-skips are handed to the
//! [`CompletionPropagator`] after commit.

pub mod expiry;
pub mod tiers;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use taintcrawl_config::CrawlerConfig;
use taintcrawl_model::{DomainId, SessionId, Subject, Task, UrlId, WorkerId};
use tracing::{debug, info, trace, warn};

use crate::completion::CompletionPropagator;
use crate::error::{CrawlError, Result};
use crate::store::{self, EntityStore};
use expiry::{Budget, ExpiryScope, ExpiryVerdict};

/// Locality the worker would like to stay on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AffinityHints {
    pub url_id: Option<UrlId>,
    pub domain_id: Option<DomainId>,
    pub session_id: Option<SessionId>,
}

impl AffinityHints {
    /// Hints describing where `task` lives.
    pub fn from_task(task: &Task) -> Self {
        Self {
            url_id: Some(task.url_id),
            domain_id: Some(task.domain_id),
            session_id: task.session_id(),
        }
    }

    /// First fetch of a worker: nothing to stay close to yet.
    pub fn is_first_fetch(&self) -> bool {
        self.url_id.is_none() && self.domain_id.is_none()
    }

    /// The hints themselves followed by progressively looser variants:
    /// drop the url, then the domain, then the session. Duplicates are
    /// removed.
    pub fn relaxations(&self) -> Vec<AffinityHints> {
        let steps = [
            *self,
            AffinityHints {
                url_id: None,
                ..*self
            },
            AffinityHints {
                session_id: self.session_id,
                ..AffinityHints::default()
            },
            AffinityHints::default(),
        ];
        let mut out: Vec<AffinityHints> = Vec::with_capacity(steps.len());
        for step in steps {
            if !out.contains(&step) {
                out.push(step);
            }
        }
        out
    }
}

enum Admission {
    Reserved(Box<Task>),
    Rejected,
}

/// Selects, locks and reserves subjects for workers.
#[derive(Debug, Clone)]
pub struct Scheduler {
    store: EntityStore,
    config: CrawlerConfig,
    propagator: CompletionPropagator,
}

impl Scheduler {
    pub fn new(store: EntityStore, config: CrawlerConfig) -> Self {
        let propagator =
            CompletionPropagator::new(store.clone(), config.sessions.clone());
        Self {
            store,
            config,
            propagator,
        }
    }

    /// Reserve up to `scheduler.batch_limit` subjects for `worker`.
    /// An empty batch means no work is available under these hints.
    pub async fn next(
        &self,
        worker: WorkerId,
        hints: AffinityHints,
    ) -> Result<Vec<Task>> {
        let limit = self.config.scheduler.batch_limit.max(1);
        let now = Utc::now();

        let mut tx = self.store.begin("begin dequeue tx").await?;

        let anchor_depth = match (hints.url_id, hints.domain_id) {
            (Some(url_id), Some(_)) => store::fetch_url(&mut tx, url_id)
                .await?
                .map(|url| url.depth),
            _ => None,
        };
        // A worker with capture-before enabled must visit the queued
        // screenshot of a page before its reconnaissance.
        let exclude_reconnaissance =
            self.config.sessions.screenshot_before && hints.is_first_fetch();

        let mut batch = Vec::new();
        let mut rejected = Vec::new();
        let mut finalize: Vec<UrlId> = Vec::new();

        'tiers: for tier in tiers::cascade(worker, &hints, anchor_depth) {
            loop {
                let candidates = tiers::fetch_candidates(
                    &mut tx,
                    &tier.query,
                    exclude_reconnaissance,
                    &rejected,
                    limit - batch.len(),
                )
                .await?;
                if candidates.is_empty() {
                    break;
                }
                trace!(worker = %worker, tier = tier.name, candidates = candidates.len(), "dequeue candidates");

                for row in candidates {
                    let candidate = Subject::from(row);
                    match self
                        .admit(&mut tx, worker, &candidate, now, &mut finalize)
                        .await?
                    {
                        Admission::Reserved(task) => batch.push(*task),
                        Admission::Rejected => rejected.push(candidate.id),
                    }
                }
                if batch.len() >= limit {
                    break 'tiers;
                }
            }
            if !batch.is_empty() {
                break;
            }
        }

        tx.commit()
            .await
            .map_err(|e| CrawlError::database("commit dequeue tx", e))?;

        for url_id in finalize {
            if let Err(err) = self.propagator.on_url_finish(url_id, None).await
            {
                warn!(worker = %worker, url = %url_id, error = %err, "completion propagation after expiry failed");
            }
        }

        if batch.is_empty() {
            debug!(worker = %worker, hints = ?hints, "no subject available");
        }
        Ok(batch)
    }

    async fn admit(
        &self,
        conn: &mut PgConnection,
        worker: WorkerId,
        candidate: &Subject,
        now: DateTime<Utc>,
        finalize: &mut Vec<UrlId>,
    ) -> Result<Admission> {
        let Some(url) = store::try_lock_url(conn, candidate.url_id).await?
        else {
            debug!(worker = %worker, subject = %candidate.id, url = %candidate.url_id, "url locked elsewhere, skipping candidate");
            return Ok(Admission::Rejected);
        };

        let Some(domain) = store::fetch_domain(conn, candidate.domain_id).await?
        else {
            warn!(subject = %candidate.id, domain = %candidate.domain_id, "candidate references missing domain");
            return Ok(Admission::Rejected);
        };

        let session = match candidate.session_id {
            Some(session_id) => store::fetch_session(conn, session_id).await?,
            None => None,
        };
        let grace_secs = self.config.capture_grace_secs();

        if let Some(session) = &session {
            let budget = Budget {
                limit_secs: self.config.max_time.session_secs,
                grace_secs,
            };
            if let Some(verdict) = expiry::evaluate_session(
                session.status,
                session.created_at,
                now,
                budget,
                candidate.subject_type,
            ) {
                self.expire(
                    conn,
                    ExpiryScope::Session(session.id),
                    verdict,
                    worker,
                    candidate,
                    now,
                    finalize,
                )
                .await?;
                return Ok(Admission::Rejected);
            }
        }

        if let Some(begin) = domain.visitation_begin {
            let budget = Budget {
                limit_secs: self.config.max_time.domain_secs,
                grace_secs,
            };
            if let Some(verdict) =
                expiry::evaluate_age(begin, now, budget, candidate.subject_type)
            {
                self.expire(
                    conn,
                    ExpiryScope::Domain(domain.id),
                    verdict,
                    worker,
                    candidate,
                    now,
                    finalize,
                )
                .await?;
                return Ok(Admission::Rejected);
            }
        }

        if !reserve(conn, worker, candidate, now).await? {
            return Ok(Admission::Rejected);
        }
        // Stamp after the claim: rejected candidates leave their domain unlocked.
        if domain.visitation_begin.is_none() {
            sqlx::query(
                r#"
                UPDATE domains
                SET visitation_begin = $2, updated_at = NOW()
                WHERE id = $1 AND visitation_begin IS NULL
                "#,
            )
            .bind(domain.id)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| CrawlError::database("stamp domain begin", e))?;
        }
        debug!(worker = %worker, subject = %candidate.id, url = %url.id, "subject reserved");

        Ok(Admission::Reserved(Box::new(Task {
            subject_id: candidate.id,
            subject_type: candidate.subject_type,
            start_url: candidate.start_url.clone(),
            url_id: url.id,
            domain_id: domain.id,
            domain_name: domain.name,
            depth: url.depth,
            info: candidate.additional_information.clone(),
            session,
            created_at: candidate.created_at,
        })))
    }

    #[allow(clippy::too_many_arguments)]
    async fn expire(
        &self,
        conn: &mut PgConnection,
        scope: ExpiryScope,
        verdict: ExpiryVerdict,
        worker: WorkerId,
        candidate: &Subject,
        now: DateTime<Utc>,
        finalize: &mut Vec<UrlId>,
    ) -> Result<()> {
        let urls =
            expiry::bulk_skip(conn, scope, verdict, worker, candidate.id, now)
                .await?;
        info!(
            worker = %worker,
            scope = ?scope,
            verdict = ?verdict,
            skipped = urls.len(),
            "expired work skipped"
        );
        for url_id in urls.into_iter().chain([candidate.url_id]) {
            if !finalize.contains(&url_id) {
                finalize.push(url_id);
            }
        }
        Ok(())
    }
}

/// Claim `candidate` for `worker` and extend the worker's affinity to the
/// unvisited work of the same url and domain. Returns `false` if the subject
/// was no longer UNVISITED.
async fn reserve(
    conn: &mut PgConnection,
    worker: WorkerId,
    candidate: &Subject,
    now: DateTime<Utc>,
) -> Result<bool> {
    let claimed = sqlx::query(
        r#"
        UPDATE subjects
        SET status = 'PROCESSING', worker = $1, updated_at = NOW()
        WHERE id = $2 AND status = 'UNVISITED'
        "#,
    )
    .bind(worker)
    .bind(candidate.id)
    .execute(&mut *conn)
    .await
    .map_err(|e| CrawlError::database("reserve subject", e))?
    .rows_affected();
    if claimed == 0 {
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE subjects
        SET worker = $1, updated_at = NOW()
        WHERE id IN (
            SELECT id FROM subjects
            WHERE (url_id = $2 OR domain_id = $3)
              AND status = 'UNVISITED'
              AND worker IS DISTINCT FROM $1
            FOR UPDATE SKIP LOCKED
        )
        "#,
    )
    .bind(worker)
    .bind(candidate.url_id)
    .bind(candidate.domain_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| CrawlError::database("propagate affinity", e))?;

    sqlx::query(
        r#"
        UPDATE urls
        SET crawling_status = 'PROCESSING', visitation_begin = $2, updated_at = NOW()
        WHERE id = $1
          AND crawling_status = 'INACTIVE'
          AND visitation_begin IS NULL
        "#,
    )
    .bind(candidate.url_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| CrawlError::database("mark url processing", e))?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taintcrawl_model::SubjectType;

    #[test]
    fn relaxations_loosen_in_order() {
        let hints = AffinityHints {
            url_id: Some(UrlId(1)),
            domain_id: Some(DomainId(2)),
            session_id: Some(SessionId(3)),
        };
        assert_eq!(
            hints.relaxations(),
            vec![
                hints,
                AffinityHints {
                    url_id: None,
                    domain_id: Some(DomainId(2)),
                    session_id: Some(SessionId(3)),
                },
                AffinityHints {
                    url_id: None,
                    domain_id: None,
                    session_id: Some(SessionId(3)),
                },
                AffinityHints::default(),
            ]
        );
    }

    #[test]
    fn relaxations_deduplicate() {
        assert_eq!(
            AffinityHints::default().relaxations(),
            vec![AffinityHints::default()]
        );
        let session_only = AffinityHints {
            session_id: Some(SessionId(3)),
            ..AffinityHints::default()
        };
        assert_eq!(
            session_only.relaxations(),
            vec![session_only, AffinityHints::default()]
        );
    }

    #[test]
    fn first_fetch_ignores_session() {
        let hints = AffinityHints {
            session_id: Some(SessionId(3)),
            ..AffinityHints::default()
        };
        assert!(hints.is_first_fetch());
        assert!(
            !AffinityHints {
                domain_id: Some(DomainId(1)),
                ..hints
            }
            .is_first_fetch()
        );
    }

    #[test]
    fn hints_follow_the_task() {
        let task = Task {
            subject_id: taintcrawl_model::SubjectId(1),
            subject_type: SubjectType::Reconnaissance,
            start_url: "https://a.test/".into(),
            url_id: UrlId(4),
            domain_id: DomainId(5),
            domain_name: "a.test".into(),
            depth: 0,
            info: Default::default(),
            session: None,
            created_at: Utc::now(),
        };
        assert_eq!(
            AffinityHints::from_task(&task),
            AffinityHints {
                url_id: Some(UrlId(4)),
                domain_id: Some(DomainId(5)),
                session_id: None,
            }
        );
    }
}
