//! Completion propagation.
//!
//! Once a subject reaches VISITED or SKIP, its url may be finished, which in
//! turn may finish the url's ancestors and its domain. Finished urls within
//! the capture depth receive their capture-after-visit subjects.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use taintcrawl_config::CaptureSettings;
use taintcrawl_model::{
    CaptureKind, CrawlUrl, CrawlingStatus, DomainId, PageType, Subject,
    SubjectId, SubjectInfo, SubjectStatus, SubjectType, UrlId,
};
use tracing::{debug, info, warn};

use crate::discovery::{NewSubject, find_capture, insert_subject};
use crate::error::{CrawlError, Result};
use crate::store::rows::SubjectRow;
use crate::store::{self, EntityStore};

/// What one propagation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Urls marked COMPLETE, starting with the finished url itself and
    /// continuing up the parent chain.
    pub completed: Vec<UrlId>,
    /// Capture-after-visit subjects created.
    pub captures: usize,
    /// Set when the domain's `visitation_end` was stamped.
    pub domain_finished: Option<DomainId>,
}

#[derive(Debug, Clone)]
pub struct CompletionPropagator {
    store: EntityStore,
    settings: CaptureSettings,
}

impl CompletionPropagator {
    pub fn new(store: EntityStore, settings: CaptureSettings) -> Self {
        Self { store, settings }
    }

    /// Re-evaluate `url_id` after work on it ended, optionally stamping the
    /// end of `subject`.
    pub async fn on_url_finish(
        &self,
        url_id: UrlId,
        subject: Option<SubjectId>,
    ) -> Result<Settlement> {
        let now = Utc::now();
        let mut tx = self.store.begin("begin propagation tx").await?;

        let url = lock_existing_url(&mut tx, url_id).await?;
        if let Some(subject_id) = subject {
            sqlx::query(
                r#"
                UPDATE subjects
                SET visitation_end = COALESCE(visitation_end, $2), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(subject_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| CrawlError::database("stamp subject end", e))?;
        }
        let settlement = self.settle(&mut tx, url, now).await?;

        tx.commit()
            .await
            .map_err(|e| CrawlError::database("commit propagation tx", e))?;
        Ok(settlement)
    }

    /// Mark a subject VISITED and propagate.
    pub async fn finish_subject(
        &self,
        subject_id: SubjectId,
        final_url: Option<&str>,
    ) -> Result<Settlement> {
        self.report(subject_id, SubjectStatus::Visited, final_url, None)
            .await
    }

    /// Mark a subject SKIP, recording `reason` in its payload, and propagate.
    pub async fn skip_subject(
        &self,
        subject_id: SubjectId,
        reason: &str,
    ) -> Result<Settlement> {
        self.report(subject_id, SubjectStatus::Skip, None, Some(reason))
            .await
    }

    async fn report(
        &self,
        subject_id: SubjectId,
        status: SubjectStatus,
        final_url: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Settlement> {
        let now = Utc::now();
        let mut tx = self.store.begin("begin report tx").await?;

        let subject = store::fetch_subject(&mut tx, subject_id)
            .await?
            .ok_or_else(|| CrawlError::NotFound(format!("subject {subject_id}")))?;
        let url = lock_existing_url(&mut tx, subject.url_id).await?;

        let mut info = subject.additional_information.clone();
        if let Some(reason) = reason {
            info.record_message(reason, now);
        }
        let updated = sqlx::query(
            r#"
            UPDATE subjects
            SET status = $2,
                final_url = COALESCE($3, final_url),
                additional_information = additional_information || $4,
                visitation_end = $5,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('UNVISITED', 'PROCESSING')
            "#,
        )
        .bind(subject.id)
        .bind(status)
        .bind(final_url)
        .bind(info.to_value())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| CrawlError::database("report subject", e))?
        .rows_affected();
        if updated == 0 {
            warn!(subject = %subject.id, status = %subject.status, "subject already terminal, report ignored");
        }

        let settlement = self.settle(&mut tx, url, now).await?;
        tx.commit()
            .await
            .map_err(|e| CrawlError::database("commit report tx", e))?;
        debug!(subject = %subject.id, status = %status, completed = settlement.completed.len(), "subject reported");
        Ok(settlement)
    }

    /// Propagation body. `url` must already be locked by the caller.
    async fn settle(
        &self,
        conn: &mut PgConnection,
        url: CrawlUrl,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let mut settlement = Settlement::default();
        let domain_id = url.domain_id;

        if url.crawling_status == CrawlingStatus::Ignore {
            return Ok(settlement);
        }
        if !is_settled(conn, url.id).await? {
            debug!(url = %url.id, "url still has outstanding work");
            return Ok(settlement);
        }

        if url.crawling_status != CrawlingStatus::Complete {
            mark_complete(conn, url.id, now).await?;
            settlement.completed.push(url.id);
            settlement.captures +=
                self.schedule_capture_afterwards(conn, &url).await?;

            let mut current = url;
            while let Some(parent_id) = current.parent_id {
                let Some(parent) = store::lock_url(conn, parent_id).await?
                else {
                    break;
                };
                if parent.crawling_status == CrawlingStatus::Complete
                    || parent.crawling_status == CrawlingStatus::Ignore
                    || !is_settled(conn, parent.id).await?
                {
                    break;
                }
                mark_complete(conn, parent.id, now).await?;
                settlement.completed.push(parent.id);
                settlement.captures +=
                    self.schedule_capture_afterwards(conn, &parent).await?;
                current = parent;
            }
        }

        let outstanding = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM subjects
                WHERE domain_id = $1 AND status IN ('UNVISITED', 'PROCESSING')
            )
            "#,
        )
        .bind(domain_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| CrawlError::database("count domain work", e))?;
        if !outstanding {
            let stamped = sqlx::query(
                r#"
                UPDATE domains
                SET visitation_end = $2, updated_at = NOW()
                WHERE id = $1 AND visitation_end IS NULL
                "#,
            )
            .bind(domain_id)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| CrawlError::database("stamp domain end", e))?
            .rows_affected();
            if stamped > 0 {
                info!(domain = %domain_id, "domain finished");
                settlement.domain_finished = Some(domain_id);
            }
        }

        if !settlement.completed.is_empty() {
            info!(
                urls = ?settlement.completed,
                captures = settlement.captures,
                "urls completed"
            );
        }
        Ok(settlement)
    }

    /// Create the capture-after-visit subjects of a finished url. Existing
    /// captures of the same page type for the same reconnaissance are
    /// reused, so repeated calls create nothing new. Returns how many
    /// subjects were created.
    pub(crate) async fn schedule_capture_afterwards(
        &self,
        conn: &mut PgConnection,
        url: &CrawlUrl,
    ) -> Result<usize> {
        if !self.settings.screenshot_afterwards
            || url.depth > self.settings.screenshot_max_depth
        {
            return Ok(0);
        }

        let Some(recon) = sqlx::query_as::<_, SubjectRow>(
            r#"
            SELECT * FROM subjects
            WHERE url_id = $1 AND subject_type = 'RECONNAISSANCE'
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(url.id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| CrawlError::database("find reconnaissance", e))?
        .map(Subject::from) else {
            return Ok(0);
        };

        let mut targets = vec![(PageType::LandingPage, recon.start_url.as_str())];
        if self.settings.include_loginpages
            && recon.session_id.is_some()
            && let Some(formurl) = recon.additional_information.formurl()
        {
            targets.push((PageType::LoginForm, formurl));
        }

        let mut created = 0;
        for (page_type, start_url) in targets {
            let probe = SubjectInfo::capture_probe(
                CaptureKind::Afterwards,
                page_type,
                Some(recon.id),
            );
            if find_capture(conn, url.id, recon.session_id, &probe, false)
                .await?
                .is_some()
            {
                continue;
            }
            let info =
                SubjectInfo::capture(CaptureKind::Afterwards, page_type, &[recon.id]);
            let capture = insert_subject(
                conn,
                &NewSubject {
                    subject_type: SubjectType::Screenshot,
                    start_url,
                    info: &info,
                    url_id: url.id,
                    domain_id: url.domain_id,
                    session_id: recon.session_id,
                    worker: recon.worker,
                },
            )
            .await?;
            debug!(url = %url.id, subject = %capture.id, page_type = %page_type.as_str(), "capture scheduled");
            created += 1;
        }
        Ok(created)
    }
}

async fn lock_existing_url(
    conn: &mut PgConnection,
    url_id: UrlId,
) -> Result<CrawlUrl> {
    store::lock_url(conn, url_id)
        .await?
        .ok_or_else(|| CrawlError::NotFound(format!("url {url_id}")))
}

/// No outstanding subjects on the url and no outstanding child urls.
async fn is_settled(conn: &mut PgConnection, url_id: UrlId) -> Result<bool> {
    sqlx::query_scalar::<_, bool>(
        r#"
        SELECT NOT EXISTS (
                SELECT 1 FROM subjects
                WHERE url_id = $1 AND status IN ('UNVISITED', 'PROCESSING')
            )
           AND NOT EXISTS (
                SELECT 1 FROM urls
                WHERE parent_id = $1 AND crawling_status IN ('INACTIVE', 'PROCESSING')
            )
        "#,
    )
    .bind(url_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| CrawlError::database("check url settled", e))
}

async fn mark_complete(
    conn: &mut PgConnection,
    url_id: UrlId,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE urls
        SET crawling_status = 'COMPLETE', visitation_end = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(url_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| CrawlError::database("mark url complete", e))?;
    Ok(())
}
