//! Session and domain expiry, evaluated lazily per dequeue candidate.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use taintcrawl_model::{
    DomainId, SessionId, SessionStatus, SubjectId, SubjectType, UrlId,
    WorkerId,
};

use crate::error::{CrawlError, Result};

/// Budget against which an age is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub limit_secs: u64,
    /// Tail of the budget reserved for SCREENSHOT subjects.
    pub grace_secs: u64,
}

/// Why a candidate's scope stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryVerdict {
    /// The session was released.
    Unlocked,
    /// Inside the capture grace window: only SCREENSHOT work may proceed.
    GraceWindow { age_secs: i64 },
    /// The whole budget is spent.
    Exhausted { age_secs: i64 },
}

impl ExpiryVerdict {
    /// SCREENSHOT subjects survive the bulk skip of a grace-window verdict.
    pub fn spares_captures(&self) -> bool {
        matches!(self, ExpiryVerdict::GraceWindow { .. })
    }

    pub fn reason(&self, scope: ExpiryScope) -> String {
        let noun = scope.noun();
        match self {
            ExpiryVerdict::Unlocked => {
                "Skipping subject with unlocked session.".to_string()
            }
            ExpiryVerdict::GraceWindow { age_secs } => format!(
                "Skipping subject, {noun} is {age_secs}s old and inside the screenshot window."
            ),
            ExpiryVerdict::Exhausted { age_secs } => format!(
                "Skipping subject, {noun} exceeded its time budget ({age_secs}s)."
            ),
        }
    }
}

/// Row set a verdict applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryScope {
    Session(SessionId),
    Domain(DomainId),
}

impl ExpiryScope {
    fn noun(&self) -> &'static str {
        match self {
            ExpiryScope::Session(_) => "session",
            ExpiryScope::Domain(_) => "domain",
        }
    }
}

/// Age-based verdict for a candidate of `subject_type` whose scope started
/// at `started_at`.
pub fn evaluate_age(
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    budget: Budget,
    subject_type: SubjectType,
) -> Option<ExpiryVerdict> {
    let age_secs = (now - started_at).num_seconds();
    let limit = i64::try_from(budget.limit_secs).unwrap_or(i64::MAX);
    let grace_start = limit
        .saturating_sub(i64::try_from(budget.grace_secs).unwrap_or(i64::MAX));

    if age_secs >= limit {
        return Some(ExpiryVerdict::Exhausted { age_secs });
    }
    if budget.grace_secs > 0
        && age_secs >= grace_start
        && subject_type != SubjectType::Screenshot
    {
        return Some(ExpiryVerdict::GraceWindow { age_secs });
    }
    None
}

/// Session verdict: an unlocked session wins over any age check.
pub fn evaluate_session(
    status: SessionStatus,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    budget: Budget,
    subject_type: SubjectType,
) -> Option<ExpiryVerdict> {
    if status == SessionStatus::Unlocked {
        return Some(ExpiryVerdict::Unlocked);
    }
    evaluate_age(created_at, now, budget, subject_type)
}

/// Mark the unvisited work of `scope` owned by `worker` as SKIP, plus the
/// rejected `candidate` itself. Rows locked by concurrent schedulers are
/// left for their holders to judge. Returns the affected url ids.
pub(crate) async fn bulk_skip(
    conn: &mut PgConnection,
    scope: ExpiryScope,
    verdict: ExpiryVerdict,
    worker: WorkerId,
    candidate: SubjectId,
    now: DateTime<Utc>,
) -> Result<Vec<UrlId>> {
    let (session_id, domain_id) = match scope {
        ExpiryScope::Session(id) => (Some(id), None),
        ExpiryScope::Domain(id) => (None, Some(id)),
    };

    sqlx::query_scalar::<_, UrlId>(
        r#"
        UPDATE subjects
        SET status = 'SKIP',
            additional_information = additional_information
                || jsonb_build_object('message', $1::text, 'time', $2::timestamptz),
            updated_at = NOW()
        WHERE id IN (
            SELECT id FROM subjects
            WHERE status = 'UNVISITED'
              AND (worker = $3 OR id = $4)
              AND ($5::bigint IS NULL OR session_id = $5)
              AND ($6::bigint IS NULL OR domain_id = $6)
              AND (NOT $7 OR subject_type <> 'SCREENSHOT')
            FOR UPDATE SKIP LOCKED
        )
        RETURNING url_id
        "#,
    )
    .bind(verdict.reason(scope))
    .bind(now)
    .bind(worker)
    .bind(candidate)
    .bind(session_id)
    .bind(domain_id)
    .bind(verdict.spares_captures())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| CrawlError::database("expiry bulk skip", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const BUDGET: Budget = Budget {
        limit_secs: 3_600,
        grace_secs: 600,
    };

    fn started(secs_ago: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(secs_ago)
    }

    #[test]
    fn fresh_scope_is_accepted() {
        let now = Utc::now();
        assert_eq!(
            evaluate_age(
                started(10, now),
                now,
                BUDGET,
                SubjectType::Reconnaissance
            ),
            None
        );
    }

    #[test]
    fn grace_window_only_rejects_non_captures() {
        let now = Utc::now();
        let start = started(3_100, now);
        assert_eq!(
            evaluate_age(start, now, BUDGET, SubjectType::Verification),
            Some(ExpiryVerdict::GraceWindow { age_secs: 3_100 })
        );
        assert_eq!(
            evaluate_age(start, now, BUDGET, SubjectType::Screenshot),
            None
        );
    }

    #[test]
    fn exhausted_budget_rejects_everything() {
        let now = Utc::now();
        let start = started(3_601, now);
        for subject_type in [SubjectType::Screenshot, SubjectType::Reconnaissance]
        {
            assert_eq!(
                evaluate_age(start, now, BUDGET, subject_type),
                Some(ExpiryVerdict::Exhausted { age_secs: 3_601 })
            );
        }
    }

    #[test]
    fn no_grace_without_afterwards_capture() {
        let now = Utc::now();
        let budget = Budget {
            limit_secs: 3_600,
            grace_secs: 0,
        };
        assert_eq!(
            evaluate_age(
                started(3_599, now),
                now,
                budget,
                SubjectType::Reconnaissance
            ),
            None
        );
    }

    #[test]
    fn unlocked_session_wins() {
        let now = Utc::now();
        assert_eq!(
            evaluate_session(
                SessionStatus::Unlocked,
                now,
                now,
                BUDGET,
                SubjectType::Screenshot
            ),
            Some(ExpiryVerdict::Unlocked)
        );
    }

    #[test]
    fn reasons_differ_per_verdict() {
        let scope = ExpiryScope::Session(SessionId(1));
        let unlocked = ExpiryVerdict::Unlocked.reason(scope);
        let grace = ExpiryVerdict::GraceWindow { age_secs: 1 }.reason(scope);
        let exhausted = ExpiryVerdict::Exhausted { age_secs: 1 }.reason(scope);
        assert_eq!(unlocked, "Skipping subject with unlocked session.");
        assert_ne!(grace, exhausted);
        assert!(
            ExpiryVerdict::Exhausted { age_secs: 1 }
                .reason(ExpiryScope::Domain(DomainId(1)))
                .contains("domain")
        );
    }
}
