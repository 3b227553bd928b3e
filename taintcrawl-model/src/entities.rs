use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ids::{DomainId, SessionId, SubjectId, UrlId, WorkerId};
use crate::payload::{SessionInformation, SubjectInfo};
use crate::status::{
    CrawlingStatus, SessionStatus, SubjectStatus, SubjectType, WorkerStatus,
    WorkerType,
};

/// A registrable domain, partitioned per session when crawling
/// authenticated.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub rank: i32,
    /// Number of non-ignored urls admitted against the domain cap.
    pub url_count: i32,
    pub visitation_begin: Option<DateTime<Utc>>,
    pub visitation_end: Option<DateTime<Utc>>,
    pub session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

/// A crawlable address. Named to keep it apart from `url::Url`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CrawlUrl {
    pub id: UrlId,
    pub url: String,
    /// Hex digest of the normalised address, unique per session.
    pub url_hash: String,
    /// Distance from the seed that led here.
    pub depth: i32,
    pub crawling_status: CrawlingStatus,
    pub visitation_begin: Option<DateTime<Utc>>,
    pub visitation_end: Option<DateTime<Utc>>,
    pub domain_id: DomainId,
    pub session_id: Option<SessionId>,
    /// The url whose visit discovered this one.
    pub parent_id: Option<UrlId>,
    pub created_at: DateTime<Utc>,
}

/// Authenticated context shared by all work scheduled against it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Session {
    pub id: SessionId,
    pub session_information: SessionInformation,
    /// Replay state such as cookies and storage snapshots. Never inspected.
    pub session_data: Value,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Whole seconds the session has existed at `now`.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}

/// A single unit of work.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Subject {
    pub id: SubjectId,
    pub subject_type: SubjectType,
    pub start_url: String,
    pub final_url: Option<String>,
    pub status: SubjectStatus,
    pub additional_information: SubjectInfo,
    pub visitation_begin: Option<DateTime<Utc>>,
    pub visitation_end: Option<DateTime<Utc>>,
    pub url_id: UrlId,
    pub domain_id: DomainId,
    pub session_id: Option<SessionId>,
    pub worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Worker {
    pub id: WorkerId,
    pub worker_type: WorkerType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub subject_count: i32,
    pub status: WorkerStatus,
    pub message: Option<String>,
    /// Heartbeat pointer to the subject currently being executed.
    pub current_subject: Option<SubjectId>,
}

/// A reserved subject repacked with the url, domain and session data the
/// execution layer needs. This is what the local task queue hands out.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Task {
    pub subject_id: SubjectId,
    pub subject_type: SubjectType,
    pub start_url: String,
    pub url_id: UrlId,
    pub domain_id: DomainId,
    pub domain_name: String,
    pub depth: i32,
    pub info: SubjectInfo,
    pub session: Option<Session>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }
}
