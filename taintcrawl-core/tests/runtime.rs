mod support;

use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use taintcrawl_core::{
    CrawlError, CrawlWorker, ExecutionReport, ExitReason, SubjectExecutor,
    SubjectFactory,
};
use taintcrawl_model::{
    CrawlingStatus, SubjectStatus, SubjectType, Task, WorkerId, WorkerStatus,
    WorkerType,
};
use tokio_util::sync::CancellationToken;

use support::{admit, candidate, config, store, subject, url_status};

/// Reports `/child` on the root page and nothing anywhere else.
#[derive(Debug, Default)]
struct ScriptedExecutor {
    visits: Mutex<Vec<(SubjectType, String)>>,
    fail_with: Option<String>,
}

#[async_trait]
impl SubjectExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _worker: WorkerId,
        task: &Task,
    ) -> taintcrawl_core::Result<ExecutionReport> {
        self.visits
            .lock()
            .unwrap()
            .push((task.subject_type, task.start_url.clone()));
        if let Some(message) = &self.fail_with {
            return Err(CrawlError::Execution(message.clone()));
        }
        let links = if task.depth == 0 && task.subject_type == SubjectType::Reconnaissance
        {
            vec!["/child".to_string(), "https://other.test/".to_string()]
        } else {
            Vec::new()
        };
        Ok(ExecutionReport {
            final_url: Some(task.start_url.clone()),
            links,
        })
    }
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn worker_crawls_until_the_site_drains(pool: PgPool) {
    let store = store(&pool).await;
    let mut config = config();
    config.sessions.screenshot_afterwards = true;
    config.sessions.screenshot_max_depth = 0;
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let (root, _) = admit(&factory, candidate("https://a.test/", None, None)).await;

    let crawler = CrawlWorker::new(store.clone(), config, ScriptedExecutor::default());
    let exit = crawler
        .run(WorkerType::Browser, CancellationToken::new())
        .await
        .expect("worker run");

    assert_eq!(exit.reason, ExitReason::Drained);
    assert_eq!(exit.processed, 3);
    assert_eq!(exit.recovery.reset, 0);

    let visits = crawler.executor().visits.lock().unwrap().clone();
    assert_eq!(
        visits,
        vec![
            (SubjectType::Reconnaissance, "https://a.test/".to_string()),
            (SubjectType::Reconnaissance, "https://a.test/child".to_string()),
            (SubjectType::Screenshot, "https://a.test/".to_string()),
        ]
    );

    assert_eq!(url_status(&store, root.id).await, CrawlingStatus::Complete);
    let subjects = store.subjects_for_url(root.id).await.expect("list");
    assert!(subjects.iter().all(|s| s.status == SubjectStatus::Visited));
    assert!(subjects.iter().all(|s| s.visitation_begin.is_some()));

    let worker = store
        .worker(exit.worker)
        .await
        .expect("fetch worker")
        .expect("worker exists");
    assert_eq!(worker.status, WorkerStatus::Finished);
    assert_eq!(worker.subject_count, 3);
    assert_eq!(worker.message.as_deref(), Some("Normal worker termination"));

    let domain = store
        .domain(root.domain_id)
        .await
        .expect("fetch domain")
        .expect("domain exists");
    assert!(domain.visitation_end.is_some());
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn failed_execution_skips_the_subject(pool: PgPool) {
    let store = store(&pool).await;
    let config = config();
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let (root, recon) = admit(&factory, candidate("https://a.test/", None, None)).await;

    let executor = ScriptedExecutor {
        fail_with: Some("browser crashed".into()),
        ..ScriptedExecutor::default()
    };
    let exit = CrawlWorker::new(store.clone(), config, executor)
        .run(WorkerType::Browser, CancellationToken::new())
        .await
        .expect("worker run");
    assert_eq!(exit.reason, ExitReason::Drained);
    assert_eq!(exit.processed, 1);

    let skipped = subject(&store, recon.id).await;
    assert_eq!(skipped.status, SubjectStatus::Skip);
    assert!(
        skipped
            .additional_information
            .message()
            .is_some_and(|m| m.contains("browser crashed"))
    );
    assert_eq!(url_status(&store, root.id).await, CrawlingStatus::Complete);
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn cancelled_worker_deregisters_with_signal_message(pool: PgPool) {
    let store = store(&pool).await;
    let config = config();
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let (_, recon) = admit(&factory, candidate("https://a.test/", None, None)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let exit = CrawlWorker::new(store.clone(), config, ScriptedExecutor::default())
        .run(WorkerType::Browser, cancel)
        .await
        .expect("worker run");
    assert_eq!(exit.reason, ExitReason::Cancelled);
    assert_eq!(exit.processed, 0);

    let worker = store
        .worker(exit.worker)
        .await
        .expect("fetch worker")
        .expect("worker exists");
    assert_eq!(worker.message.as_deref(), Some("Worker terminated by signal"));
    assert_eq!(subject(&store, recon.id).await.status, SubjectStatus::Unvisited);
}

/// Fails the first transition of any subject to VISITED with a
/// serialization error. The sequence survives the rollback, so only the
/// first attempt fails.
const SERIALIZATION_FAULT: &str = r#"
CREATE SEQUENCE visited_fault_seq;
CREATE FUNCTION fail_first_visited() RETURNS trigger LANGUAGE plpgsql AS $$
BEGIN
    IF NEW.status = 'VISITED' AND OLD.status <> 'VISITED' THEN
        IF nextval('visited_fault_seq') = 1 THEN
            RAISE EXCEPTION 'could not serialize access due to concurrent update'
                USING ERRCODE = '40001';
        END IF;
    END IF;
    RETURN NEW;
END
$$;
CREATE TRIGGER subjects_fail_first_visited
    BEFORE UPDATE ON subjects
    FOR EACH ROW EXECUTE FUNCTION fail_first_visited();
"#;

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn serialization_failure_on_report_is_retried(pool: PgPool) {
    let store = store(&pool).await;
    let config = config();
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let (root, recon) = admit(&factory, candidate("https://a.test/", None, None)).await;
    sqlx::raw_sql(SERIALIZATION_FAULT)
        .execute(&pool)
        .await
        .expect("install fault trigger");

    let exit = CrawlWorker::new(store.clone(), config, ScriptedExecutor::default())
        .run(WorkerType::Browser, CancellationToken::new())
        .await
        .expect("worker survives a rolled back report");

    assert_eq!(exit.reason, ExitReason::Drained);
    assert_eq!(exit.processed, 2);
    assert_eq!(subject(&store, recon.id).await.status, SubjectStatus::Visited);
    assert_eq!(url_status(&store, root.id).await, CrawlingStatus::Complete);

    let worker = store
        .worker(exit.worker)
        .await
        .expect("fetch worker")
        .expect("worker exists");
    assert_eq!(worker.message.as_deref(), Some("Normal worker termination"));
}
