//! The Attempt state machine: 8 states, optimistic-locked transitions.
//!
//! This generalizes `gator-core`'s `TaskStateMachine` (None/Queued/Running/
//! Succeeded/Failed/Aborted/Cancelled/PartiallySucceeded replaces the
//! narrower task-only set) with one extra edge, `Queued -> Cancelled`, and
//! the explicit `<terminal> -> Queued` retry edge which creates a *new*
//! attempt row rather than mutating the old one.

pub mod error;

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

use dagctl_db::models::{Attempt, AttemptStatus};
use dagctl_db::queries::attempts;

pub use error::AttemptError;

/// Total time budget for internally-retried `Busy` contention, per §7.
const BUSY_RETRY_BUDGET: Duration = Duration::from_millis(200);

/// Is `(from, to)` a legal edge in the Attempt state machine?
///
/// The retry edge (`<terminal> -> Queued`) is handled separately by
/// [`StateMachine::retry`], which creates a new attempt row; it is not a
/// transition of an existing row and so is not listed here.
///
/// `Running -> Queued` is the dispatch-rejected requeue edge: a worker
/// that polled a Task but had no free concurrency slot reports back
/// immediately rather than executing it, and the coordinator reverts the
/// attempt to `Queued` so the scheduler retries dispatch.
fn is_valid_transition(from: AttemptStatus, to: AttemptStatus) -> bool {
    use AttemptStatus::*;
    matches!(
        (from, to),
        (None, Queued)
            | (Queued, Running)
            | (Queued, Cancelled)
            | (Running, Queued)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, PartiallySucceeded)
            | (Running, Aborted)
    )
}

/// Thin wrapper around `dagctl_db::queries::attempts` enforcing the state
/// machine and the optimistic-lock-with-bounded-retry protocol described in
/// §4.1/§7: a lost race against another writer surfaces as [`AttemptError::Busy`]
/// only after retrying internally for up to [`BUSY_RETRY_BUDGET`].
pub struct StateMachine<'a> {
    pool: &'a PgPool,
}

impl<'a> StateMachine<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Create the first attempt for a RunRef. `AlreadyExists` if a
    /// non-terminal attempt is already on file (enforced by the partial
    /// unique index `attempts_active_ref_idx`).
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        dag_namespace: &str,
        dag_name: &str,
        run_id: &str,
        parent: Option<(&str, &str)>,
        root: Option<(&str, &str)>,
        params: serde_json::Value,
        log_dir: &str,
        yaml_data: &str,
    ) -> Result<Attempt, AttemptError> {
        let (parent_dag_name, parent_run_id) = parent.map_or((None, None), |(d, r)| (Some(d), Some(r)));
        let (root_dag_name, root_run_id) = root.map_or((None, None), |(d, r)| (Some(d), Some(r)));

        let created = attempts::create_attempt(
            self.pool,
            dag_namespace,
            dag_name,
            run_id,
            parent_dag_name,
            parent_run_id,
            root_dag_name,
            root_run_id,
            params,
            log_dir,
            yaml_data,
        )
        .await
        .map_err(AttemptError::Db)?;

        created.ok_or(AttemptError::AlreadyExists)
    }

    /// Create the next attempt (`attemptID + 1`) for an explicit retry.
    /// Callers must have already verified `previous` is terminal; the DB
    /// layer does not re-check this (the retry edge is not one of the
    /// optimistic-locked transitions above, it always inserts a new row).
    pub async fn retry(&self, previous: &Attempt) -> Result<Attempt, AttemptError> {
        if !previous.status.is_terminal() {
            return Err(AttemptError::InvalidTransition {
                id: previous.id,
                from: previous.status,
                to: AttemptStatus::Queued,
            });
        }
        attempts::create_retry_attempt(self.pool, previous)
            .await
            .map_err(AttemptError::Db)
    }

    pub async fn find(&self, dag_name: &str, run_id: &str) -> Result<Attempt, AttemptError> {
        attempts::find_attempt(self.pool, dag_name, run_id)
            .await
            .map_err(AttemptError::Db)?
            .ok_or(AttemptError::NotFound)
    }

    pub async fn get(&self, id: Uuid) -> Result<Attempt, AttemptError> {
        attempts::get_attempt(self.pool, id)
            .await
            .map_err(AttemptError::Db)?
            .ok_or(AttemptError::NotFound)
    }

    /// Validate and apply `from -> to`, retrying lost optimistic-lock races
    /// internally with jittered backoff up to [`BUSY_RETRY_BUDGET`] before
    /// giving up and returning [`AttemptError::Busy`].
    pub async fn write(
        &self,
        attempt_id: Uuid,
        from: AttemptStatus,
        to: AttemptStatus,
    ) -> Result<(), AttemptError> {
        if !is_valid_transition(from, to) {
            tracing::warn!(
                attempt_id = %attempt_id,
                from = %from,
                to = %to,
                "rejected illegal attempt status transition"
            );
            return Err(AttemptError::InvalidTransition {
                id: attempt_id,
                from,
                to,
            });
        }

        let started_at = matches!(to, AttemptStatus::Running).then(Utc::now);
        let finished_at = to.is_terminal().then(Utc::now);

        let deadline = tokio::time::Instant::now() + BUSY_RETRY_BUDGET;
        loop {
            let rows = attempts::transition_attempt_status(
                self.pool,
                attempt_id,
                from,
                to,
                started_at,
                finished_at,
            )
            .await
            .map_err(AttemptError::Db)?;

            if rows > 0 {
                attempts::append_history(self.pool, attempt_id, to)
                    .await
                    .map_err(AttemptError::Db)?;
                return Ok(());
            }

            // Lost the race. Re-fetch: if the row still shows `from`, it was
            // a transient contention (Busy); if it has moved on already,
            // the edge itself is no longer valid.
            let current = self.get(attempt_id).await?;
            if current.status != from {
                return Err(AttemptError::InvalidTransition {
                    id: attempt_id,
                    from: current.status,
                    to,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(AttemptError::Busy { id: attempt_id });
            }

            let jitter_ms = rand::rng().random_range(5..=25);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }
    }

    pub async fn list_history(
        &self,
        attempt_id: Uuid,
    ) -> Result<Vec<dagctl_db::models::AttemptHistoryEntry>, AttemptError> {
        attempts::list_history(self.pool, attempt_id)
            .await
            .map_err(AttemptError::Db)
    }

    pub async fn update_node_states(
        &self,
        attempt_id: Uuid,
        node_states: serde_json::Value,
    ) -> Result<(), AttemptError> {
        attempts::update_node_states(self.pool, attempt_id, node_states)
            .await
            .map_err(AttemptError::Db)
    }

    /// Idempotent shortcut straight to `Failed`, for failures that occur
    /// before a run ever reaches `Running` (workspace setup, DAG load).
    pub async fn record_early_failure(&self, attempt_id: Uuid) -> Result<(), AttemptError> {
        attempts::record_early_failure(self.pool, attempt_id)
            .await
            .map_err(AttemptError::Db)
    }

    pub async fn list_recent(&self, dag_name: &str, limit: i64) -> Result<Vec<Attempt>, AttemptError> {
        attempts::list_recent(self.pool, dag_name, limit)
            .await
            .map_err(AttemptError::Db)
    }

    pub async fn count_running(&self, dag_name: &str) -> Result<i64, AttemptError> {
        attempts::count_running(self.pool, dag_name)
            .await
            .map_err(AttemptError::Db)
    }

    /// Retention sweep. Never touches non-terminal attempts (enforced by
    /// the underlying query's `status IN (...)` filter, not by this layer).
    pub async fn remove_old_dag_runs(
        &self,
        dag_name: &str,
        older_than: chrono::DateTime<Utc>,
        dry_run: bool,
    ) -> Result<Vec<Attempt>, AttemptError> {
        attempts::remove_old_dag_runs(self.pool, dag_name, older_than, dry_run)
            .await
            .map_err(AttemptError::Db)
    }
}
