mod support;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;
use sqlx::PgPool;
use taintcrawl_core::{AffinityHints, CompletionPropagator, Scheduler, SubjectFactory};
use taintcrawl_model::{
    CaptureKind, CrawlingStatus, PageType, SubjectId, SubjectStatus, SubjectType,
    UrlId,
};

use support::{
    admit, candidate, child, config, register_worker, store, subject,
    url, url_status,
};

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn finishing_the_last_subject_completes_url_and_schedules_capture(
    pool: PgPool,
) {
    let store = store(&pool).await;
    let mut config = config();
    config.sessions.screenshot_afterwards = true;
    config.sessions.screenshot_max_depth = 0;
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let worker = register_worker(&store, &config).await;
    let (root, recon) = admit(&factory, candidate("https://a.test/", None, None)).await;

    let scheduler = Scheduler::new(store.clone(), config.clone());
    let batch = scheduler
        .next(worker, AffinityHints::default())
        .await
        .expect("dequeue");
    assert_eq!(batch[0].subject_id, recon.id);

    let propagator = CompletionPropagator::new(store.clone(), config.sessions.clone());
    let settlement = propagator
        .finish_subject(recon.id, Some("https://a.test/home"))
        .await
        .expect("finish");
    assert_eq!(settlement.completed, vec![root.id]);
    assert_eq!(settlement.captures, 1);

    let finished = subject(&store, recon.id).await;
    assert_eq!(finished.status, SubjectStatus::Visited);
    assert_eq!(finished.final_url.as_deref(), Some("https://a.test/home"));
    assert!(finished.visitation_end.is_some());

    let root = url(&store, root.id).await;
    assert_eq!(root.crawling_status, CrawlingStatus::Complete);
    assert!(root.visitation_end.is_some());

    let captures: Vec<_> = store
        .subjects_for_url(root.id)
        .await
        .expect("list subjects")
        .into_iter()
        .filter(|s| s.subject_type == SubjectType::Screenshot)
        .collect();
    assert_eq!(captures.len(), 1);
    let capture = &captures[0];
    assert_eq!(capture.status, SubjectStatus::Unvisited);
    assert_eq!(capture.start_url, "https://a.test/");
    assert_eq!(capture.worker, Some(worker));
    assert_eq!(capture.additional_information.related_subjects(), vec![recon.id]);
    assert_eq!(
        capture.additional_information.capture_kind(),
        Some(CaptureKind::Afterwards)
    );
    assert_eq!(
        capture.additional_information.page_type(),
        Some(PageType::LandingPage)
    );
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn repeated_propagation_creates_one_capture_per_page_type(pool: PgPool) {
    let store = store(&pool).await;
    let mut config = config();
    config.sessions.screenshot_afterwards = true;
    config.sessions.include_loginpages = true;
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let worker = register_worker(&store, &config).await;
    let session = store
        .register_session(
            json!({
                "landing_page": "https://a.test/",
                "login_form": "https://a.test/login",
            }),
            json!({"cookies": []}),
        )
        .await
        .expect("register session");

    let seeded = factory
        .seed(None, Some(session.id))
        .await
        .expect("seed landing page");
    let root_id = seeded.url().id;

    let scheduler = Scheduler::new(store.clone(), config.clone());
    let batch = scheduler
        .next(
            worker,
            AffinityHints {
                session_id: Some(session.id),
                ..AffinityHints::default()
            },
        )
        .await
        .expect("dequeue");
    assert_eq!(batch.len(), 1);

    let propagator = CompletionPropagator::new(store.clone(), config.sessions.clone());
    propagator
        .finish_subject(batch[0].subject_id, None)
        .await
        .expect("finish");
    for _ in 0..2 {
        let again = propagator
            .on_url_finish(root_id, None)
            .await
            .expect("propagate again");
        assert_eq!(again.captures, 0);
        assert!(again.completed.is_empty());
    }

    let captures: Vec<_> = store
        .subjects_for_url(root_id)
        .await
        .expect("list subjects")
        .into_iter()
        .filter(|s| s.subject_type == SubjectType::Screenshot)
        .collect();
    assert_eq!(captures.len(), 2);
    let landing = captures
        .iter()
        .find(|s| s.additional_information.page_type() == Some(PageType::LandingPage))
        .expect("landing capture");
    let login = captures
        .iter()
        .find(|s| s.additional_information.page_type() == Some(PageType::LoginForm))
        .expect("login capture");
    assert_eq!(landing.start_url, "https://a.test/");
    assert_eq!(login.start_url, "https://a.test/login");
    assert_eq!(login.session_id, Some(session.id));
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn parent_completes_only_after_children(pool: PgPool) {
    let store = store(&pool).await;
    let config = config();
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let worker = register_worker(&store, &config).await;
    let scheduler = Scheduler::new(store.clone(), config.clone());
    let propagator = CompletionPropagator::new(store.clone(), config.sessions.clone());

    let (root, _) = admit(&factory, candidate("https://a.test/", None, None)).await;
    let root_task = scheduler
        .next(worker, AffinityHints::default())
        .await
        .expect("dequeue root")
        .remove(0);
    let (leaf, _) = admit(&factory, child("https://a.test/leaf", &root, Some(worker))).await;

    let settlement = propagator
        .finish_subject(root_task.subject_id, None)
        .await
        .expect("finish root");
    assert!(settlement.completed.is_empty());
    assert_eq!(settlement.domain_finished, None);
    assert_eq!(url_status(&store, root.id).await, CrawlingStatus::Processing);

    let leaf_task = scheduler
        .next(worker, AffinityHints::from_task(&root_task))
        .await
        .expect("dequeue leaf")
        .remove(0);
    assert_eq!(leaf_task.url_id, leaf.id);
    assert_eq!(leaf_task.depth, 1);
    assert_eq!(url_status(&store, root.id).await, CrawlingStatus::Processing);

    let settlement = propagator
        .skip_subject(leaf_task.subject_id, "navigation failed")
        .await
        .expect("skip leaf");
    assert_eq!(settlement.completed, vec![leaf.id, root.id]);
    assert_eq!(settlement.domain_finished, Some(root.domain_id));
    assert_eq!(url_status(&store, leaf.id).await, CrawlingStatus::Complete);
    assert_eq!(url_status(&store, root.id).await, CrawlingStatus::Complete);

    let domain = store
        .domain(root.domain_id)
        .await
        .expect("fetch domain")
        .expect("domain exists");
    assert!(domain.visitation_end.is_some());
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn skip_reason_merges_into_payload(pool: PgPool) {
    let store = store(&pool).await;
    let config = config();
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let mut seed = candidate("https://a.test/", None, None);
    seed.info = seed.info.with_formurl("https://a.test/login");
    let (_, recon) = admit(&factory, seed).await;

    let propagator = CompletionPropagator::new(store.clone(), config.sessions.clone());
    propagator
        .skip_subject(recon.id, "Subject exceeded its time budget of 1200s")
        .await
        .expect("skip");

    let skipped = subject(&store, recon.id).await;
    assert_eq!(skipped.status, SubjectStatus::Skip);
    let info = &skipped.additional_information;
    assert_eq!(info.message(), Some("Subject exceeded its time budget of 1200s"));
    assert_eq!(info.formurl(), Some("https://a.test/login"));
    assert!(info.as_map().contains_key("time"));
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn terminal_subjects_are_not_reopened(pool: PgPool) {
    let store = store(&pool).await;
    let config = config();
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let (_, recon) = admit(&factory, candidate("https://a.test/", None, None)).await;

    let propagator = CompletionPropagator::new(store.clone(), config.sessions.clone());
    propagator.skip_subject(recon.id, "first").await.expect("skip");
    propagator
        .finish_subject(recon.id, Some("https://a.test/late"))
        .await
        .expect("late finish");

    let recon = subject(&store, recon.id).await;
    assert_eq!(recon.status, SubjectStatus::Skip);
    assert_eq!(recon.additional_information.message(), Some("first"));
    assert_eq!(recon.final_url, None);
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn login_capture_needs_a_session(pool: PgPool) {
    let store = store(&pool).await;
    let mut config = config();
    config.sessions.screenshot_afterwards = true;
    config.sessions.include_loginpages = true;
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let mut seed = candidate("https://a.test/", None, None);
    seed.info = seed.info.with_formurl("https://a.test/login");
    let (root, recon) = admit(&factory, seed).await;

    let settlement = CompletionPropagator::new(store.clone(), config.sessions.clone())
        .finish_subject(recon.id, None)
        .await
        .expect("finish");
    assert_eq!(settlement.captures, 1);

    let captures: Vec<_> = store
        .subjects_for_url(root.id)
        .await
        .expect("list subjects")
        .into_iter()
        .filter(|s| s.subject_type == SubjectType::Screenshot)
        .collect();
    assert_eq!(captures.len(), 1);
    assert_eq!(
        captures[0].additional_information.page_type(),
        Some(PageType::LandingPage)
    );
}

/// Urls marked COMPLETE while own non-capture work or a child is still open.
async fn prematurely_complete(pool: &PgPool) -> Vec<UrlId> {
    sqlx::query_scalar::<_, UrlId>(
        r#"
        SELECT u.id FROM urls u
        WHERE u.crawling_status = 'COMPLETE'
          AND (
            EXISTS (
                SELECT 1 FROM subjects s
                WHERE s.url_id = u.id
                  AND s.status IN ('UNVISITED', 'PROCESSING')
                  AND s.subject_type <> 'SCREENSHOT'
            )
            OR EXISTS (
                SELECT 1 FROM urls c
                WHERE c.parent_id = u.id
                  AND c.crawling_status IN ('INACTIVE', 'PROCESSING')
            )
          )
        "#,
    )
    .fetch_all(pool)
    .await
    .expect("check completion invariant")
}

#[sqlx::test(migrator = "taintcrawl_core::MIGRATOR")]
async fn completion_never_outruns_open_work_in_any_order(pool: PgPool) {
    let store = store(&pool).await;
    let config = config();
    let factory = SubjectFactory::new(store.clone(), config.clone());
    let propagator = CompletionPropagator::new(store.clone(), config.sessions.clone());

    for round in 0..6u64 {
        let host = format!("https://r{round}.test");
        let (root, root_recon) =
            admit(&factory, candidate(&format!("{host}/"), None, None)).await;
        let (left, left_recon) =
            admit(&factory, child(&format!("{host}/left"), &root, None)).await;
        let (right, right_recon) =
            admit(&factory, child(&format!("{host}/right"), &root, None)).await;
        let (_, deep_a) =
            admit(&factory, child(&format!("{host}/left/a"), &left, None)).await;
        let (_, deep_b) =
            admit(&factory, child(&format!("{host}/left/b"), &left, None)).await;
        let (_, deep_c) =
            admit(&factory, child(&format!("{host}/right/c"), &right, None)).await;

        let mut rng = StdRng::seed_from_u64(round);
        let mut events: Vec<(SubjectId, bool)> = [
            root_recon.id,
            left_recon.id,
            right_recon.id,
            deep_a.id,
            deep_b.id,
            deep_c.id,
        ]
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, (i as u64 + round) % 3 == 0))
        .collect();
        events.shuffle(&mut rng);

        for (id, skip) in events {
            if skip {
                propagator
                    .skip_subject(id, "navigation failed")
                    .await
                    .expect("skip");
            } else {
                propagator.finish_subject(id, None).await.expect("finish");
            }
            assert_eq!(
                prematurely_complete(&pool).await,
                Vec::<UrlId>::new(),
                "round {round}: url completed with open work"
            );
        }

        assert_eq!(url_status(&store, root.id).await, CrawlingStatus::Complete);
        assert_eq!(url_status(&store, left.id).await, CrawlingStatus::Complete);
        assert_eq!(url_status(&store, right.id).await, CrawlingStatus::Complete);
        let domain = store
            .domain(root.domain_id)
            .await
            .expect("fetch domain")
            .expect("domain exists");
        assert!(domain.visitation_end.is_some());
    }
}
