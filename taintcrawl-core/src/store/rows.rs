//! Row shapes returned by runtime-checked queries and their model conversions.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use taintcrawl_model::{
    CrawlUrl, CrawlingStatus, Domain, DomainId, Session, SessionId,
    SessionInformation, SessionStatus, Subject, SubjectId, SubjectInfo,
    SubjectStatus, SubjectType, UrlId, Worker, WorkerId, WorkerStatus,
    WorkerType,
};

#[derive(Debug, FromRow)]
pub(crate) struct DomainRow {
    pub id: DomainId,
    pub name: String,
    pub rank: i32,
    pub url_count: i32,
    pub visitation_begin: Option<DateTime<Utc>>,
    pub visitation_end: Option<DateTime<Utc>>,
    pub session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

impl From<DomainRow> for Domain {
    fn from(row: DomainRow) -> Self {
        Domain {
            id: row.id,
            name: row.name,
            rank: row.rank,
            url_count: row.url_count,
            visitation_begin: row.visitation_begin,
            visitation_end: row.visitation_end,
            session_id: row.session_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct UrlRow {
    pub id: UrlId,
    pub url: String,
    pub url_hash: String,
    pub depth: i32,
    pub crawling_status: CrawlingStatus,
    pub visitation_begin: Option<DateTime<Utc>>,
    pub visitation_end: Option<DateTime<Utc>>,
    pub domain_id: DomainId,
    pub session_id: Option<SessionId>,
    pub parent_id: Option<UrlId>,
    pub created_at: DateTime<Utc>,
}

impl From<UrlRow> for CrawlUrl {
    fn from(row: UrlRow) -> Self {
        CrawlUrl {
            id: row.id,
            url: row.url,
            url_hash: row.url_hash,
            depth: row.depth,
            crawling_status: row.crawling_status,
            visitation_begin: row.visitation_begin,
            visitation_end: row.visitation_end,
            domain_id: row.domain_id,
            session_id: row.session_id,
            parent_id: row.parent_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SessionRow {
    pub id: SessionId,
    pub session_information: serde_json::Value,
    pub session_data: serde_json::Value,
    pub session_status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            session_information: SessionInformation::new(
                row.session_information,
            ),
            session_data: row.session_data,
            status: row.session_status,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SubjectRow {
    pub id: SubjectId,
    pub subject_type: SubjectType,
    pub start_url: String,
    pub final_url: Option<String>,
    pub status: SubjectStatus,
    pub additional_information: serde_json::Value,
    pub visitation_begin: Option<DateTime<Utc>>,
    pub visitation_end: Option<DateTime<Utc>>,
    pub url_id: UrlId,
    pub domain_id: DomainId,
    pub session_id: Option<SessionId>,
    pub worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
}

impl From<SubjectRow> for Subject {
    fn from(row: SubjectRow) -> Self {
        Subject {
            id: row.id,
            subject_type: row.subject_type,
            start_url: row.start_url,
            final_url: row.final_url,
            status: row.status,
            // Foreign writers may store anything here; never fail a read on it.
            additional_information: SubjectInfo::from_value_lossy(
                row.additional_information,
            ),
            visitation_begin: row.visitation_begin,
            visitation_end: row.visitation_end,
            url_id: row.url_id,
            domain_id: row.domain_id,
            session_id: row.session_id,
            worker: row.worker,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct WorkerRow {
    pub id: WorkerId,
    pub worker_type: WorkerType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub subject_count: i32,
    pub status: WorkerStatus,
    pub message: Option<String>,
    pub current_subject: Option<SubjectId>,
}

impl From<WorkerRow> for Worker {
    fn from(row: WorkerRow) -> Self {
        Worker {
            id: row.id,
            worker_type: row.worker_type,
            started_at: row.started_at,
            finished_at: row.finished_at,
            subject_count: row.subject_count,
            status: row.status,
            message: row.message,
            current_subject: row.current_subject,
        }
    }
}
