//! Affinity tiers of the dequeue cascade.
//!
//! Each tier is a plain [`CandidateQuery`] built by a named function, so the
//! cascade for a given set of hints can be inspected without a database.
//! Every tier locks the rows it returns and skips rows locked elsewhere.

use sqlx::PgConnection;
use taintcrawl_model::{DomainId, SessionId, SubjectId, UrlId, WorkerId};

use super::AffinityHints;
use crate::error::{CrawlError, Result};
use crate::store::rows::SubjectRow;

/// Which subjects count as "owned" for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Worker(WorkerId),
    /// Unclaimed work (`worker IS NULL`).
    Nobody,
}

/// Session scope of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScope {
    /// Exact match, where `None` only matches subjects without a session.
    Exactly(Option<SessionId>),
    Any,
}

/// Depth restriction relative to the anchor url.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthScope {
    Same(i32),
    Deeper(i32),
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrder {
    CreatedAt,
    StartUrlThenCreatedAt,
}

/// Filters of one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub owner: Owner,
    pub session: SessionScope,
    pub url_id: Option<UrlId>,
    pub domain_id: Option<DomainId>,
    pub depth: DepthScope,
    pub order: CandidateOrder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub name: &'static str,
    pub query: CandidateQuery,
}

/// The worker's own unvisited work on the hinted url (or anywhere, without
/// a url hint) in exactly the hinted session.
pub fn own_work(worker: WorkerId, hints: &AffinityHints) -> Tier {
    Tier {
        name: "own_work",
        query: CandidateQuery {
            owner: Owner::Worker(worker),
            session: SessionScope::Exactly(hints.session_id),
            url_id: hints.url_id,
            domain_id: None,
            depth: DepthScope::Any,
            order: CandidateOrder::CreatedAt,
        },
    }
}

fn domain_tier(
    name: &'static str,
    worker: WorkerId,
    domain_id: DomainId,
    session_id: Option<SessionId>,
    depth: DepthScope,
) -> Tier {
    Tier {
        name,
        query: CandidateQuery {
            owner: Owner::Worker(worker),
            session: SessionScope::Exactly(session_id),
            url_id: None,
            domain_id: Some(domain_id),
            depth,
            order: CandidateOrder::StartUrlThenCreatedAt,
        },
    }
}

pub fn domain_same_depth(
    worker: WorkerId,
    domain_id: DomainId,
    session_id: Option<SessionId>,
    anchor_depth: i32,
) -> Tier {
    domain_tier(
        "domain_same_depth",
        worker,
        domain_id,
        session_id,
        DepthScope::Same(anchor_depth),
    )
}

pub fn domain_deeper(
    worker: WorkerId,
    domain_id: DomainId,
    session_id: Option<SessionId>,
    anchor_depth: i32,
) -> Tier {
    domain_tier(
        "domain_deeper",
        worker,
        domain_id,
        session_id,
        DepthScope::Deeper(anchor_depth),
    )
}

pub fn domain_any_depth(
    worker: WorkerId,
    domain_id: DomainId,
    session_id: Option<SessionId>,
) -> Tier {
    domain_tier(
        "domain_any_depth",
        worker,
        domain_id,
        session_id,
        DepthScope::Any,
    )
}

/// Unclaimed work of any session.
pub fn unclaimed() -> Tier {
    Tier {
        name: "unclaimed",
        query: CandidateQuery {
            owner: Owner::Nobody,
            session: SessionScope::Any,
            url_id: None,
            domain_id: None,
            depth: DepthScope::Any,
            order: CandidateOrder::StartUrlThenCreatedAt,
        },
    }
}

/// Ordered tiers for `hints`. `anchor_depth` is the depth of the hinted url
/// and is only consulted when both a url and a domain are hinted.
pub fn cascade(
    worker: WorkerId,
    hints: &AffinityHints,
    anchor_depth: Option<i32>,
) -> Vec<Tier> {
    let mut tiers = vec![own_work(worker, hints)];
    match (hints.url_id, hints.domain_id, anchor_depth) {
        (Some(_), Some(domain_id), Some(depth)) => {
            tiers.push(domain_same_depth(
                worker,
                domain_id,
                hints.session_id,
                depth,
            ));
            tiers.push(domain_deeper(worker, domain_id, hints.session_id, depth));
            tiers.push(domain_any_depth(worker, domain_id, hints.session_id));
        }
        (_, Some(domain_id), _) => {
            tiers.push(domain_any_depth(worker, domain_id, hints.session_id));
        }
        _ => {}
    }
    tiers.push(unclaimed());
    tiers
}

const CANDIDATE_FILTER: &str = r#"
    SELECT s.*
    FROM subjects s
    JOIN urls u ON u.id = s.url_id
    WHERE s.status = 'UNVISITED'
      AND (($1::bigint IS NULL AND s.worker IS NULL) OR s.worker = $1)
      AND ($2 OR s.session_id IS NOT DISTINCT FROM $3::bigint)
      AND ($4::bigint IS NULL OR s.url_id = $4)
      AND ($5::bigint IS NULL OR s.domain_id = $5)
      AND ($6::integer IS NULL OR u.depth = $6)
      AND ($7::integer IS NULL OR u.depth > $7)
      AND (NOT $8 OR s.subject_type <> 'RECONNAISSANCE')
      AND s.id <> ALL($9::bigint[])
"#;

/// Fetch and lock up to `limit` candidates of `query`, skipping rows locked
/// by concurrent transactions and the ids in `excluded`.
pub(crate) async fn fetch_candidates(
    conn: &mut PgConnection,
    query: &CandidateQuery,
    exclude_reconnaissance: bool,
    excluded: &[SubjectId],
    limit: usize,
) -> Result<Vec<SubjectRow>> {
    let order = match query.order {
        CandidateOrder::CreatedAt => "s.created_at, s.id",
        CandidateOrder::StartUrlThenCreatedAt => {
            "s.start_url, s.created_at, s.id"
        }
    };
    let sql = format!(
        "{CANDIDATE_FILTER} ORDER BY {order} LIMIT $10 FOR UPDATE OF s SKIP LOCKED"
    );

    let owner = match query.owner {
        Owner::Worker(worker) => Some(worker),
        Owner::Nobody => None,
    };
    let (any_session, session_id) = match query.session {
        SessionScope::Exactly(session_id) => (false, session_id),
        SessionScope::Any => (true, None),
    };
    let (same_depth, deeper_than) = match query.depth {
        DepthScope::Same(depth) => (Some(depth), None),
        DepthScope::Deeper(depth) => (None, Some(depth)),
        DepthScope::Any => (None, None),
    };
    let excluded: Vec<i64> = excluded.iter().map(SubjectId::as_i64).collect();

    sqlx::query_as::<_, SubjectRow>(&sql)
        .bind(owner)
        .bind(any_session)
        .bind(session_id)
        .bind(query.url_id)
        .bind(query.domain_id)
        .bind(same_depth)
        .bind(deeper_than)
        .bind(exclude_reconnaissance)
        .bind(excluded)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| CrawlError::database("dequeue candidate select", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: WorkerId = WorkerId(1);

    fn names(tiers: &[Tier]) -> Vec<&'static str> {
        tiers.iter().map(|t| t.name).collect()
    }

    #[test]
    fn url_and_domain_hints_use_all_tiers() {
        let hints = AffinityHints {
            url_id: Some(UrlId(5)),
            domain_id: Some(DomainId(2)),
            session_id: Some(SessionId(9)),
        };
        let tiers = cascade(W, &hints, Some(3));
        assert_eq!(
            names(&tiers),
            vec![
                "own_work",
                "domain_same_depth",
                "domain_deeper",
                "domain_any_depth",
                "unclaimed"
            ]
        );
        assert_eq!(tiers[0].query.url_id, Some(UrlId(5)));
        assert_eq!(tiers[0].query.order, CandidateOrder::CreatedAt);
        assert_eq!(tiers[1].query.depth, DepthScope::Same(3));
        assert_eq!(tiers[2].query.depth, DepthScope::Deeper(3));
        assert_eq!(
            tiers[3].query.session,
            SessionScope::Exactly(Some(SessionId(9)))
        );
        assert_eq!(tiers[4].query.owner, Owner::Nobody);
        assert_eq!(tiers[4].query.session, SessionScope::Any);
    }

    #[test]
    fn domain_only_hint_uses_any_depth() {
        let hints = AffinityHints {
            url_id: None,
            domain_id: Some(DomainId(2)),
            session_id: None,
        };
        let tiers = cascade(W, &hints, None);
        assert_eq!(
            names(&tiers),
            vec!["own_work", "domain_any_depth", "unclaimed"]
        );
        assert_eq!(tiers[0].query.session, SessionScope::Exactly(None));
    }

    #[test]
    fn no_hints_fall_back_to_unclaimed() {
        let tiers = cascade(W, &AffinityHints::default(), None);
        assert_eq!(names(&tiers), vec!["own_work", "unclaimed"]);
        assert_eq!(tiers[0].query.url_id, None);
    }

    #[test]
    fn missing_anchor_depth_skips_depth_tiers() {
        let hints = AffinityHints {
            url_id: Some(UrlId(5)),
            domain_id: Some(DomainId(2)),
            session_id: None,
        };
        let tiers = cascade(W, &hints, None);
        assert_eq!(
            names(&tiers),
            vec!["own_work", "domain_any_depth", "unclaimed"]
        );
    }
}
