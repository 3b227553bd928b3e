#![allow(dead_code)]

use serde_json::{Value, json};
use sqlx::PgPool;
use taintcrawl_config::CrawlerConfig;
use taintcrawl_core::{
    DiscoveryOutcome, EntityStore, SubjectFactory, UrlCandidate,
    WorkerLifecycle,
};
use taintcrawl_model::{
    CrawlUrl, CrawlingStatus, SessionId, Subject, SubjectId, SubjectInfo,
    SubjectStatus, UrlId, WorkerId, WorkerType,
};

/// Defaults with every capture flag off, so tests opt into captures.
pub fn config() -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.sessions.screenshot_before = false;
    config.sessions.screenshot_afterwards = false;
    config.timeouts.same_site_ms = 0;
    config
}

pub async fn store(pool: &PgPool) -> EntityStore {
    EntityStore::new(pool.clone())
        .await
        .expect("store should validate the migrated schema")
}

pub async fn register_worker(store: &EntityStore, config: &CrawlerConfig) -> WorkerId {
    WorkerLifecycle::new(store.clone(), config.scheduler.crash_reset)
        .register(WorkerType::Browser)
        .await
        .expect("register worker")
}

/// Admit `href` and return its url plus RECONNAISSANCE subject.
pub async fn admit(
    factory: &SubjectFactory,
    candidate: UrlCandidate,
) -> (CrawlUrl, Subject) {
    match factory.create(&candidate).await.expect("admit url") {
        DiscoveryOutcome::Created { url, subject, .. } => (url, subject),
        other => panic!("expected a new url, got {other:?}"),
    }
}

pub fn candidate(
    href: &str,
    worker: Option<WorkerId>,
    session: Option<SessionId>,
) -> UrlCandidate {
    UrlCandidate {
        worker,
        ..UrlCandidate::seed(href, session)
    }
}

pub fn child(
    href: &str,
    parent: &CrawlUrl,
    worker: Option<WorkerId>,
) -> UrlCandidate {
    UrlCandidate {
        href: href.to_string(),
        depth: parent.depth + 1,
        parent: Some(parent.id),
        worker,
        session: parent.session_id,
        info: SubjectInfo::new(),
    }
}

/// Session row created `age_secs` ago.
pub async fn aged_session(pool: &PgPool, age_secs: i64, information: Value) -> SessionId {
    sqlx::query_scalar::<_, SessionId>(
        r#"
        INSERT INTO sessions (session_information, created_at)
        VALUES ($1, NOW() - make_interval(secs => $2))
        RETURNING id
        "#,
    )
    .bind(information)
    .bind(age_secs as f64)
    .fetch_one(pool)
    .await
    .expect("insert session")
}

pub async fn fresh_session(pool: &PgPool) -> SessionId {
    aged_session(pool, 0, json!({})).await
}

pub async fn subject(store: &EntityStore, id: SubjectId) -> Subject {
    store
        .subject(id)
        .await
        .expect("fetch subject")
        .expect("subject exists")
}

pub async fn subject_status(store: &EntityStore, id: SubjectId) -> SubjectStatus {
    subject(store, id).await.status
}

pub async fn url(store: &EntityStore, id: UrlId) -> CrawlUrl {
    store.url(id).await.expect("fetch url").expect("url exists")
}

pub async fn url_status(store: &EntityStore, id: UrlId) -> CrawlingStatus {
    url(store, id).await.crawling_status
}

pub async fn count_subjects(pool: &PgPool, url_id: UrlId) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subjects WHERE url_id = $1")
        .bind(url_id)
        .fetch_one(pool)
        .await
        .expect("count subjects")
}
