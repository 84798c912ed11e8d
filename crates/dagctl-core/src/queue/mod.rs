//! Bounded, two-priority FIFO dispatch queue.
//!
//! Starvation of Low under sustained High load is an accepted design
//! choice (see DESIGN.md Open Question 2): [`QueueStore::next_admissible`]
//! always drains every admissible High entry before considering Low, with
//! no aging policy.

pub mod error;

use dagctl_db::models::{Priority, QueueEntry};
use sqlx::PgPool;

pub use error::QueueError;

/// Thin wrapper around `dagctl_db::queries::queue`, adding the
/// application-level capacity check and the admission predicate that
/// can't be expressed as a single SQL `WHERE` clause (it needs each
/// candidate's DAG's running-attempt count and precondition state, which
/// live outside the `queue_entries` table).
pub struct QueueStore<'a> {
    pool: &'a PgPool,
}

impl<'a> QueueStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a ref. A duplicate `(dag_name, run_id)` is a no-op, per
    /// spec. `capacity = None` means unbounded.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        dag_name: &str,
        run_id: &str,
        priority: Priority,
        capacity: Option<i64>,
    ) -> Result<(), QueueError> {
        if let Some(capacity) = capacity {
            let depth = dagctl_db::queries::queue::queue_depth(self.pool, queue_name)
                .await
                .map_err(QueueError::Db)?;
            if depth >= capacity {
                return Err(QueueError::CapacityExceeded {
                    queue_name: queue_name.to_string(),
                    depth,
                    capacity,
                });
            }
        }

        dagctl_db::queries::queue::enqueue(self.pool, queue_name, dag_name, run_id, priority)
            .await
            .map_err(QueueError::Db)?;

        Ok(())
    }

    pub async fn dequeue_by_run_id(
        &self,
        dag_name: &str,
        run_id: &str,
    ) -> Result<QueueEntry, QueueError> {
        dagctl_db::queries::queue::dequeue_by_run_id(self.pool, dag_name, run_id)
            .await
            .map_err(QueueError::Db)?
            .ok_or(QueueError::NotFound)
    }

    pub async fn peek(&self, dag_name: &str, n: i64) -> Result<Vec<QueueEntry>, QueueError> {
        dagctl_db::queries::queue::peek(self.pool, dag_name, n)
            .await
            .map_err(QueueError::Db)
    }

    pub async fn list(&self, dag_name: &str) -> Result<Vec<QueueEntry>, QueueError> {
        dagctl_db::queries::queue::list(self.pool, dag_name)
            .await
            .map_err(QueueError::Db)
    }

    /// The next entry admissible under `predicate`, in dispatch order
    /// (High strictly before Low, FIFO within a class). Entries the
    /// predicate rejects are skipped, not removed.
    ///
    /// `predicate` is synchronous: by the time the scheduler calls this it
    /// already holds the running-attempt counts and precondition results
    /// for the DAGs it cares about, the same "resolve before spawning"
    /// shape `run_orchestrator`'s ready-task loop uses for harness lookup.
    pub async fn next_admissible<F>(
        &self,
        dag_name: &str,
        predicate: F,
    ) -> Result<Option<QueueEntry>, QueueError>
    where
        F: Fn(&QueueEntry) -> bool,
    {
        let entries = self.list(dag_name).await?;
        Ok(entries.into_iter().find(|e| predicate(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(priority: Priority, secs_ago: i64) -> QueueEntry {
        QueueEntry {
            id: Uuid::new_v4(),
            queue_name: "default".into(),
            dag_name: "etl".into(),
            run_id: "r1".into(),
            priority,
            enqueued_at: Utc::now() - chrono::Duration::seconds(secs_ago),
        }
    }

    #[test]
    fn predicate_skips_rejected_entries() {
        let admissible = [entry(Priority::Low, 10)];
        let found = admissible.iter().find(|_| false);
        assert!(found.is_none());
    }

    #[test]
    fn predicate_accepts_matching_entry() {
        let admissible = [entry(Priority::High, 5)];
        let found = admissible.iter().find(|e| e.priority == Priority::High);
        assert!(found.is_some());
    }
}
