//! Postgres-backed entity store.
//!
//! Components share one [`EntityStore`] (cloning is cheap, the pool is
//! reference counted) and open their own transactions. The connection-level
//! helpers at the bottom of this module are what those transactions use to
//! read and lock individual rows.

pub(crate) mod rows;

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use taintcrawl_model::{
    CrawlUrl, Domain, DomainId, Session, SessionId, Subject, SubjectId, UrlId,
    Worker, WorkerId,
};
use tracing::info;

use crate::error::{CrawlError, Result};
use rows::{DomainRow, SessionRow, SubjectRow, UrlRow, WorkerRow};

/// Index the dequeue tiers rely on; its absence means migrations never ran.
const DEQUEUE_INDEX: &str = "idx_subjects_dequeue";

/// Durable store for domains, urls, sessions, subjects and workers.
#[derive(Clone)]
pub struct EntityStore {
    pool: PgPool,
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl EntityStore {
    /// Wrap an existing pool after verifying DB health and schema.
    pub async fn new(pool: PgPool) -> Result<Self> {
        // Health check
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| CrawlError::database("health check", e))?;
        info!("Entity store connected to Postgres");

        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind(DEQUEUE_INDEX)
        .fetch_optional(&pool)
        .await
        .map_err(|e| CrawlError::database("schema validation", e))?
        .is_some();

        if !idx_exists {
            return Err(CrawlError::Internal(format!(
                "Required index {DEQUEUE_INDEX} is missing; run migrations"
            )));
        }

        Ok(Self { pool })
    }

    /// Open a pool against `database_url` and validate it.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self> {
        let pool = connect_pool(database_url, max_connections).await?;
        Self::new(pool).await
    }

    /// Apply the embedded migrations to `pool`.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        crate::MIGRATOR.run(pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn begin(
        &self,
        context: &'static str,
    ) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| CrawlError::database(context, e))
    }

    pub async fn subject(&self, id: SubjectId) -> Result<Option<Subject>> {
        let mut conn = self.acquire().await?;
        fetch_subject(&mut conn, id).await
    }

    pub async fn url(&self, id: UrlId) -> Result<Option<CrawlUrl>> {
        let mut conn = self.acquire().await?;
        fetch_url(&mut conn, id).await
    }

    pub async fn domain(&self, id: DomainId) -> Result<Option<Domain>> {
        let mut conn = self.acquire().await?;
        fetch_domain(&mut conn, id).await
    }

    pub async fn session(&self, id: SessionId) -> Result<Option<Session>> {
        let mut conn = self.acquire().await?;
        fetch_session(&mut conn, id).await
    }

    pub async fn worker(&self, id: WorkerId) -> Result<Option<Worker>> {
        sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(Worker::from))
            .map_err(|e| CrawlError::database("fetch worker", e))
    }

    /// Subjects attached to a url, oldest first.
    pub async fn subjects_for_url(&self, url_id: UrlId) -> Result<Vec<Subject>> {
        sqlx::query_as::<_, SubjectRow>(
            "SELECT * FROM subjects WHERE url_id = $1 ORDER BY created_at, id",
        )
        .bind(url_id)
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(Subject::from).collect())
        .map_err(|e| CrawlError::database("list url subjects", e))
    }

    /// Store a freshly acquired session as ACTIVE.
    pub async fn register_session(
        &self,
        information: Value,
        data: Value,
    ) -> Result<Session> {
        sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (session_information, session_data)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(information)
        .bind(data)
        .fetch_one(&self.pool)
        .await
        .map(Session::from)
        .map_err(|e| CrawlError::database("register session", e))
    }

    /// Mark a session UNLOCKED. Its outstanding work is force-skipped the
    /// next time the scheduler considers it. Returns `false` for unknown ids.
    pub async fn unlock_session(&self, id: SessionId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET session_status = 'UNLOCKED', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlError::database("unlock session", e))?;
        if result.rows_affected() > 0 {
            info!(session = %id, "session unlocked");
        }
        Ok(result.rows_affected() > 0)
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| CrawlError::database("acquire connection", e))
    }
}

/// Open a pool without schema validation, e.g. to run migrations first.
pub async fn connect_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(|e| CrawlError::database("connect", e))
}

pub(crate) async fn fetch_subject(
    conn: &mut PgConnection,
    id: SubjectId,
) -> Result<Option<Subject>> {
    sqlx::query_as::<_, SubjectRow>("SELECT * FROM subjects WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map(|row| row.map(Subject::from))
        .map_err(|e| CrawlError::database("fetch subject", e))
}

pub(crate) async fn fetch_url(
    conn: &mut PgConnection,
    id: UrlId,
) -> Result<Option<CrawlUrl>> {
    sqlx::query_as::<_, UrlRow>("SELECT * FROM urls WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map(|row| row.map(CrawlUrl::from))
        .map_err(|e| CrawlError::database("fetch url", e))
}

/// Lock a url row, waiting for concurrent holders.
pub(crate) async fn lock_url(
    conn: &mut PgConnection,
    id: UrlId,
) -> Result<Option<CrawlUrl>> {
    sqlx::query_as::<_, UrlRow>("SELECT * FROM urls WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map(|row| row.map(CrawlUrl::from))
        .map_err(|e| CrawlError::database("lock url", e))
}

/// Lock a url row unless another transaction holds it.
pub(crate) async fn try_lock_url(
    conn: &mut PgConnection,
    id: UrlId,
) -> Result<Option<CrawlUrl>> {
    sqlx::query_as::<_, UrlRow>(
        "SELECT * FROM urls WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map(|row| row.map(CrawlUrl::from))
    .map_err(|e| CrawlError::database("try lock url", e))
}

pub(crate) async fn fetch_domain(
    conn: &mut PgConnection,
    id: DomainId,
) -> Result<Option<Domain>> {
    sqlx::query_as::<_, DomainRow>("SELECT * FROM domains WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map(|row| row.map(Domain::from))
        .map_err(|e| CrawlError::database("fetch domain", e))
}

pub(crate) async fn lock_domain(
    conn: &mut PgConnection,
    id: DomainId,
) -> Result<Option<Domain>> {
    sqlx::query_as::<_, DomainRow>(
        "SELECT * FROM domains WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map(|row| row.map(Domain::from))
    .map_err(|e| CrawlError::database("lock domain", e))
}

pub(crate) async fn fetch_session(
    conn: &mut PgConnection,
    id: SessionId,
) -> Result<Option<Session>> {
    sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map(|row| row.map(Session::from))
        .map_err(|e| CrawlError::database("fetch session", e))
}
