//! Priority promotion against a real storage tree and SQLite file.

mod common;

use std::sync::Arc;

use common::TestHarness;
use crashmon_core::application::lifecycle::admission_lock;
use crashmon_core::application::{shutdown_channel, PriorityAllocator, StandardAllocator};

fn priority(h: &TestHarness) -> PriorityAllocator {
    PriorityAllocator::new(
        h.db.clone(),
        h.storage.clone(),
        h.clock(),
        Arc::new(h.config.clone()),
        admission_lock(),
    )
}

#[tokio::test]
async fn test_already_queued_job_is_raised_once() {
    let h = TestHarness::new().await;
    h.add_live_processor(1).await;
    h.add_live_processor(2).await;
    h.add_standard_crash("queued");

    let (_sender, token) = shutdown_channel();
    let standard = StandardAllocator::new(
        h.db.clone(),
        h.storage.clone(),
        h.clock(),
        Arc::new(h.config.clone()),
        admission_lock(),
    );
    let mut standard_session = h.session("standardLoop").await;
    standard
        .run_cycle(standard_session.as_mut(), &token)
        .await
        .unwrap();
    let owner = h.jobs().await[0].1;

    h.flag_priority("queued").await;
    let mut session = h.session("priorityLoop").await;
    let report = priority(&h)
        .run_cycle(session.as_mut(), &token)
        .await
        .unwrap();

    assert_eq!(report.promoted, vec!["queued".to_string()]);
    assert_eq!(h.jobs().await, vec![("queued".to_string(), owner, 1)]);
    assert!(h.priority_flags().await.is_empty());
    assert_eq!(h.handed_off(owner).await, vec!["queued".to_string()]);
}

#[tokio::test]
async fn test_pending_entry_is_admitted_with_priority() {
    let h = TestHarness::new().await;
    h.add_live_processor(5).await;
    let crash = h.add_standard_crash("urgent");
    h.flag_priority("urgent").await;

    let (_sender, token) = shutdown_channel();
    let mut session = h.session("priorityLoop").await;
    let report = priority(&h)
        .run_cycle(session.as_mut(), &token)
        .await
        .unwrap();

    assert_eq!(report.admitted, vec!["urgent".to_string()]);
    assert_eq!(h.jobs().await, vec![("urgent".to_string(), 5, 1)]);
    assert!(h.priority_flags().await.is_empty());
    assert_eq!(h.handed_off(5).await, vec!["urgent".to_string()]);
    assert!(crash.link.symlink_metadata().is_err());
}

#[tokio::test]
async fn test_deferred_tree_is_searched_second() {
    let h = TestHarness::new().await;
    h.add_live_processor(1).await;
    let deferred_root = h.config.deferred_storage_root.clone();
    let crash = h.add_crash(&deferred_root, "20231231", "deferred");
    h.flag_priority("deferred").await;

    let (_sender, token) = shutdown_channel();
    let mut session = h.session("priorityLoop").await;
    let report = priority(&h)
        .run_cycle(session.as_mut(), &token)
        .await
        .unwrap();

    assert_eq!(report.admitted, vec!["deferred".to_string()]);
    assert_eq!(h.jobs().await, vec![("deferred".to_string(), 1, 1)]);
    assert!(crash.json.exists());
}

#[tokio::test]
async fn test_unknown_uuid_is_dropped_after_one_cycle() {
    let h = TestHarness::new().await;
    h.add_live_processor(1).await;
    h.flag_priority("nowhere").await;

    let (_sender, token) = shutdown_channel();
    let mut session = h.session("priorityLoop").await;
    let report = priority(&h)
        .run_cycle(session.as_mut(), &token)
        .await
        .unwrap();

    assert_eq!(report.not_found, vec!["nowhere".to_string()]);
    assert!(h.priority_flags().await.is_empty());
    assert!(h.jobs().await.is_empty());
}

#[tokio::test]
async fn test_owner_without_table_keeps_flag() {
    let h = TestHarness::new().await;
    h.add_live_processor(1).await;
    // Row owned by a processor whose hand-off table was dropped
    sqlx::query(
        "INSERT INTO jobs (pathname, uuid, owner, priority, queuedDateTime) VALUES ('/x/orphan.json', 'orphan', 77, 0, 0)",
    )
    .execute(&h.pool)
    .await
    .unwrap();
    h.flag_priority("orphan").await;

    let (_sender, token) = shutdown_channel();
    let mut session = h.session("priorityLoop").await;
    let report = priority(&h)
        .run_cycle(session.as_mut(), &token)
        .await
        .unwrap();

    assert_eq!(report.deferred, vec!["orphan".to_string()]);
    assert_eq!(h.priority_flags().await, vec!["orphan".to_string()]);
    assert_eq!(h.jobs().await, vec![("orphan".to_string(), 77, 0)]);
}
