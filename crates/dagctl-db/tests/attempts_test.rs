//! Integration tests for the `attempts` query layer's create/re-enqueue
//! semantics against a real database.

use chrono::Utc;

use dagctl_db::models::AttemptStatus;
use dagctl_db::queries::attempts;
use dagctl_test_utils::{create_test_db, drop_test_db};

const YAML: &str = "name: etl\nsteps: []";

#[tokio::test]
async fn duplicate_active_ref_is_rejected_as_none() {
    let (pool, db_name) = create_test_db().await;

    let first = attempts::create_attempt(
        &pool, "default", "etl", "run-1", None, None, None, None,
        serde_json::json!({}), "/tmp/log", YAML,
    )
    .await
    .expect("first insert should succeed")
    .expect("first insert should return a row");
    assert_eq!(first.attempt_number, 1);

    let second = attempts::create_attempt(
        &pool, "default", "etl", "run-1", None, None, None, None,
        serde_json::json!({}), "/tmp/log", YAML,
    )
    .await
    .expect("duplicate insert against a non-terminal ref should not error");
    assert!(second.is_none(), "a non-terminal attempt already on file should block the duplicate");

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// Re-enqueueing `(dag_name, run_id)` after its only attempt already
/// reached a terminal status, without going through the explicit retry
/// path, must not collide with the full `(dag_name, run_id,
/// attempt_number)` unique constraint -- it should transparently pick up
/// the next attempt_number instead.
#[tokio::test]
async fn re_enqueue_after_terminal_attempt_gets_a_fresh_attempt_number() {
    let (pool, db_name) = create_test_db().await;

    let first = attempts::create_attempt(
        &pool, "default", "etl", "run-1", None, None, None, None,
        serde_json::json!({}), "/tmp/log", YAML,
    )
    .await
    .expect("first insert should succeed")
    .expect("first insert should return a row");

    attempts::transition_attempt_status(&pool, first.id, AttemptStatus::Queued, AttemptStatus::Running, Some(Utc::now()), None)
        .await
        .expect("queued -> running should apply");
    attempts::transition_attempt_status(&pool, first.id, AttemptStatus::Running, AttemptStatus::Succeeded, None, Some(Utc::now()))
        .await
        .expect("running -> succeeded should apply");

    let second = attempts::create_attempt(
        &pool, "default", "etl", "run-1", None, None, None, None,
        serde_json::json!({}), "/tmp/log", YAML,
    )
    .await
    .expect("re-enqueue after a terminal attempt should not error")
    .expect("re-enqueue after a terminal attempt should return a fresh row");

    assert_eq!(second.attempt_number, 2);
    assert_eq!(second.status, AttemptStatus::Queued);

    pool.close().await;
    drop_test_db(&db_name).await;
}
