//! Creation path for domains, urls and subjects.
//!
//! Everything the crawl learns about (seeds, links found while visiting a
//! page) enters the store through [`SubjectFactory`]. A url is deduplicated
//! by the hash of its normalised form within its session, counted against
//! the domain cap, and receives a RECONNAISSANCE subject plus any configured
//! capture-before-visit subjects.

pub mod links;
pub mod normalize;

use serde_json::Value;
use sqlx::PgConnection;
use taintcrawl_config::CrawlerConfig;
use taintcrawl_model::{
    CaptureKind, CrawlUrl, CrawlingStatus, Domain, DomainId, PageType,
    SessionId, Subject, SubjectId, SubjectInfo, SubjectType, UrlId, WorkerId,
};
use tracing::{debug, info};

use crate::error::{CrawlError, Result};
use crate::store::rows::{DomainRow, SubjectRow, UrlRow};
use crate::store::{self, EntityStore};
use normalize::{registrable_domain, url_hash};

/// An address to admit into the crawl.
#[derive(Debug, Clone)]
pub struct UrlCandidate {
    pub href: String,
    pub depth: i32,
    /// Url whose visit produced this address; its domain is inherited.
    pub parent: Option<UrlId>,
    /// Worker that discovered it. New subjects start with its affinity.
    pub worker: Option<WorkerId>,
    pub session: Option<SessionId>,
    /// Payload for the RECONNAISSANCE subject.
    pub info: SubjectInfo,
}

impl UrlCandidate {
    /// A depth-0 entry point without parent or worker affinity.
    pub fn seed(href: impl Into<String>, session: Option<SessionId>) -> Self {
        Self {
            href: href.into(),
            depth: 0,
            parent: None,
            worker: None,
            session,
            info: SubjectInfo::new(),
        }
    }
}

/// Result of admitting a [`UrlCandidate`].
#[derive(Debug, Clone)]
pub enum DiscoveryOutcome {
    /// A new url with its RECONNAISSANCE subject and capture-before subjects.
    Created {
        url: CrawlUrl,
        subject: Subject,
        captures: Vec<Subject>,
    },
    /// The address was already known in this session. `subject` is set when
    /// the known url had no RECONNAISSANCE subject yet and one was created.
    Existing {
        url: CrawlUrl,
        subject: Option<Subject>,
    },
    /// The domain cap was exhausted; the url is stored as IGNORE without
    /// any subject.
    Ignored { url: CrawlUrl },
}

impl DiscoveryOutcome {
    pub fn url(&self) -> &CrawlUrl {
        match self {
            DiscoveryOutcome::Created { url, .. }
            | DiscoveryOutcome::Existing { url, .. }
            | DiscoveryOutcome::Ignored { url } => url,
        }
    }

    /// `true` when new work was scheduled.
    pub fn scheduled_work(&self) -> bool {
        matches!(
            self,
            DiscoveryOutcome::Created { .. }
                | DiscoveryOutcome::Existing {
                    subject: Some(_),
                    ..
                }
        )
    }
}

/// Columns of a subject insert.
#[derive(Debug)]
pub(crate) struct NewSubject<'a> {
    pub subject_type: SubjectType,
    pub start_url: &'a str,
    pub info: &'a SubjectInfo,
    pub url_id: UrlId,
    pub domain_id: DomainId,
    pub session_id: Option<SessionId>,
    pub worker: Option<WorkerId>,
}

#[derive(Debug, Clone)]
pub struct SubjectFactory {
    store: EntityStore,
    config: CrawlerConfig,
}

impl SubjectFactory {
    pub fn new(store: EntityStore, config: CrawlerConfig) -> Self {
        Self { store, config }
    }

    /// Admit one address in its own transaction.
    pub async fn create(
        &self,
        candidate: &UrlCandidate,
    ) -> Result<DiscoveryOutcome> {
        let mut tx = self.store.begin("begin discovery tx").await?;
        let outcome = self.create_in(&mut tx, candidate).await?;
        tx.commit()
            .await
            .map_err(|e| CrawlError::database("commit discovery tx", e))?;
        Ok(outcome)
    }

    /// Seed an entry point. With a session and no explicit address, the
    /// session's landing page is used; the session's login form travels
    /// along as `formurl`.
    pub async fn seed(
        &self,
        href: Option<&str>,
        session: Option<SessionId>,
    ) -> Result<DiscoveryOutcome> {
        let session_row = match session {
            Some(id) => Some(self.store.session(id).await?.ok_or_else(
                || CrawlError::NotFound(format!("session {id}")),
            )?),
            None => None,
        };

        let href = match (href, session_row.as_ref()) {
            (Some(href), _) => href.to_string(),
            (None, Some(session)) => session
                .session_information
                .landing_page()
                .map(str::to_string)
                .ok_or_else(|| {
                    CrawlError::NotFound(format!(
                        "landing page for session {}",
                        session.id
                    ))
                })?,
            (None, None) => {
                return Err(CrawlError::Internal(
                    "seeding needs an address or a session".into(),
                ));
            }
        };

        let mut candidate = UrlCandidate::seed(href, session);
        if let Some(formurl) = session_row
            .as_ref()
            .and_then(|s| s.session_information.login_form())
        {
            candidate.info = candidate.info.with_formurl(formurl);
        }

        let outcome = self.create(&candidate).await?;
        info!(
            url = %outcome.url().id,
            session = ?session,
            scheduled = outcome.scheduled_work(),
            "seeded {}",
            candidate.href
        );
        Ok(outcome)
    }

    pub(crate) async fn create_in(
        &self,
        conn: &mut PgConnection,
        candidate: &UrlCandidate,
    ) -> Result<DiscoveryOutcome> {
        let hash = url_hash(&candidate.href)?;

        if let Some(url) =
            find_url_by_hash(conn, &hash, candidate.session).await?
        {
            return self.existing(conn, url, candidate).await;
        }

        let domain_id = match candidate.parent {
            Some(parent_id) => {
                store::fetch_url(conn, parent_id)
                    .await?
                    .ok_or_else(|| {
                        CrawlError::NotFound(format!("parent url {parent_id}"))
                    })?
                    .domain_id
            }
            None => {
                let name = registrable_domain(&candidate.href)?;
                find_or_create_domain(conn, &name, candidate.session)
                    .await?
                    .id
            }
        };

        // The domain row lock serialises cap accounting for its urls.
        let domain = store::lock_domain(conn, domain_id)
            .await?
            .ok_or_else(|| CrawlError::NotFound(format!("domain {domain_id}")))?;
        let status = match self.config.links.maximum.domain {
            Some(cap) if i64::from(domain.url_count) >= i64::from(cap) => {
                CrawlingStatus::Ignore
            }
            _ => CrawlingStatus::Inactive,
        };

        let inserted = sqlx::query_as::<_, UrlRow>(
            r#"
            INSERT INTO urls (url, url_hash, depth, crawling_status,
                              domain_id, session_id, parent_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (url_hash, (COALESCE(session_id, 0))) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(candidate.href.trim())
        .bind(&hash)
        .bind(candidate.depth)
        .bind(status)
        .bind(domain.id)
        .bind(candidate.session)
        .bind(candidate.parent)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| CrawlError::database("insert url", e))?;

        let Some(url) = inserted.map(CrawlUrl::from) else {
            // Lost a race against a concurrent insert of the same address.
            let url = find_url_by_hash(conn, &hash, candidate.session)
                .await?
                .ok_or_else(|| {
                    CrawlError::Internal(format!(
                        "url {} conflicted but is not visible",
                        candidate.href
                    ))
                })?;
            return self.existing(conn, url, candidate).await;
        };

        if status == CrawlingStatus::Ignore {
            debug!(url = %url.id, domain = %domain.name, "domain cap reached, url ignored");
            return Ok(DiscoveryOutcome::Ignored { url });
        }

        sqlx::query(
            "UPDATE domains SET url_count = url_count + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(domain.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| CrawlError::database("count domain url", e))?;

        let (subject, captures) =
            self.schedule_url(conn, &url, &domain, candidate).await?;
        Ok(DiscoveryOutcome::Created {
            url,
            subject,
            captures,
        })
    }

    async fn existing(
        &self,
        conn: &mut PgConnection,
        url: CrawlUrl,
        candidate: &UrlCandidate,
    ) -> Result<DiscoveryOutcome> {
        if url.crawling_status == CrawlingStatus::Ignore {
            return Ok(DiscoveryOutcome::Existing { url, subject: None });
        }

        let has_reconnaissance = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1 FROM subjects
            WHERE url_id = $1 AND subject_type = 'RECONNAISSANCE'
            LIMIT 1
            "#,
        )
        .bind(url.id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| CrawlError::database("probe url subject", e))?
        .is_some();
        if has_reconnaissance {
            return Ok(DiscoveryOutcome::Existing { url, subject: None });
        }

        let domain = store::fetch_domain(conn, url.domain_id)
            .await?
            .ok_or_else(|| {
                CrawlError::NotFound(format!("domain {}", url.domain_id))
            })?;
        let (subject, _) =
            self.schedule_url(conn, &url, &domain, candidate).await?;
        Ok(DiscoveryOutcome::Existing {
            url,
            subject: Some(subject),
        })
    }

    /// Create capture-before subjects and the RECONNAISSANCE subject, then
    /// back-link the captures to it.
    async fn schedule_url(
        &self,
        conn: &mut PgConnection,
        url: &CrawlUrl,
        domain: &Domain,
        candidate: &UrlCandidate,
    ) -> Result<(Subject, Vec<Subject>)> {
        let captures = self.capture_before(conn, url, candidate).await?;

        let subject = insert_subject(
            conn,
            &NewSubject {
                subject_type: SubjectType::Reconnaissance,
                start_url: &url.url,
                info: &candidate.info,
                url_id: url.id,
                domain_id: domain.id,
                session_id: candidate.session,
                worker: candidate.worker,
            },
        )
        .await?;

        let mut linked = Vec::with_capacity(captures.len());
        for mut capture in captures {
            capture.additional_information.push_related(subject.id);
            update_info(conn, capture.id, &capture.additional_information)
                .await?;
            linked.push(capture);
        }
        Ok((subject, linked))
    }

    async fn capture_before(
        &self,
        conn: &mut PgConnection,
        url: &CrawlUrl,
        candidate: &UrlCandidate,
    ) -> Result<Vec<Subject>> {
        let settings = &self.config.sessions;
        if !settings.screenshot_before || url.depth > settings.screenshot_max_depth
        {
            return Ok(Vec::new());
        }

        let mut targets = vec![(PageType::LandingPage, url.url.as_str())];
        if settings.include_loginpages
            && let Some(formurl) = candidate.info.formurl()
        {
            targets.push((PageType::LoginForm, formurl));
        }

        let mut captures = Vec::with_capacity(targets.len());
        for (page_type, start_url) in targets {
            let probe =
                SubjectInfo::capture_probe(CaptureKind::Before, page_type, None);
            let existing = find_capture(
                conn,
                url.id,
                candidate.session,
                &probe,
                true,
            )
            .await?;
            let capture = match existing {
                Some(capture) => capture,
                None => {
                    let info = SubjectInfo::capture(
                        CaptureKind::Before,
                        page_type,
                        &[],
                    );
                    insert_subject(
                        conn,
                        &NewSubject {
                            subject_type: SubjectType::Screenshot,
                            start_url,
                            info: &info,
                            url_id: url.id,
                            domain_id: url.domain_id,
                            session_id: candidate.session,
                            worker: candidate.worker,
                        },
                    )
                    .await?
                }
            };
            captures.push(capture);
        }
        Ok(captures)
    }
}

async fn find_url_by_hash(
    conn: &mut PgConnection,
    hash: &str,
    session: Option<SessionId>,
) -> Result<Option<CrawlUrl>> {
    sqlx::query_as::<_, UrlRow>(
        r#"
        SELECT * FROM urls
        WHERE url_hash = $1 AND session_id IS NOT DISTINCT FROM $2
        "#,
    )
    .bind(hash)
    .bind(session)
    .fetch_optional(&mut *conn)
    .await
    .map(|row| row.map(CrawlUrl::from))
    .map_err(|e| CrawlError::database("find url by hash", e))
}

pub(crate) async fn find_or_create_domain(
    conn: &mut PgConnection,
    name: &str,
    session: Option<SessionId>,
) -> Result<Domain> {
    let inserted = sqlx::query_as::<_, DomainRow>(
        r#"
        INSERT INTO domains (name, session_id)
        VALUES ($1, $2)
        ON CONFLICT (name, (COALESCE(session_id, 0))) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(session)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| CrawlError::database("insert domain", e))?;

    if let Some(row) = inserted {
        return Ok(Domain::from(row));
    }

    sqlx::query_as::<_, DomainRow>(
        r#"
        SELECT * FROM domains
        WHERE name = $1 AND session_id IS NOT DISTINCT FROM $2
        "#,
    )
    .bind(name)
    .bind(session)
    .fetch_one(&mut *conn)
    .await
    .map(Domain::from)
    .map_err(|e| CrawlError::database("fetch existing domain", e))
}

pub(crate) async fn insert_subject(
    conn: &mut PgConnection,
    new: &NewSubject<'_>,
) -> Result<Subject> {
    sqlx::query_as::<_, SubjectRow>(
        r#"
        INSERT INTO subjects (subject_type, start_url, additional_information,
                              url_id, domain_id, session_id, worker)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(new.subject_type)
    .bind(new.start_url)
    .bind(new.info.to_value())
    .bind(new.url_id)
    .bind(new.domain_id)
    .bind(new.session_id)
    .bind(new.worker)
    .fetch_one(&mut *conn)
    .await
    .map(Subject::from)
    .map_err(|e| CrawlError::database("insert subject", e))
}

/// Look up a SCREENSHOT subject of `url_id` whose payload contains `probe`.
pub(crate) async fn find_capture(
    conn: &mut PgConnection,
    url_id: UrlId,
    session: Option<SessionId>,
    probe: &Value,
    unvisited_only: bool,
) -> Result<Option<Subject>> {
    sqlx::query_as::<_, SubjectRow>(
        r#"
        SELECT * FROM subjects
        WHERE subject_type = 'SCREENSHOT'
          AND url_id = $1
          AND session_id IS NOT DISTINCT FROM $2
          AND additional_information @> $3
          AND (NOT $4 OR status = 'UNVISITED')
        ORDER BY id
        LIMIT 1
        "#,
    )
    .bind(url_id)
    .bind(session)
    .bind(probe)
    .bind(unvisited_only)
    .fetch_optional(&mut *conn)
    .await
    .map(|row| row.map(Subject::from))
    .map_err(|e| CrawlError::database("find capture", e))
}

async fn update_info(
    conn: &mut PgConnection,
    id: SubjectId,
    info: &SubjectInfo,
) -> Result<()> {
    sqlx::query(
        "UPDATE subjects SET additional_information = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(info.to_value())
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(|e| CrawlError::database("update subject payload", e))?;
    Ok(())
}
