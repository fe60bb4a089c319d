// SQLite QueueSession Implementation

use crate::connection::SharedConnection;
use crate::error::{is_statement_error, map_sqlx_error};
use async_trait::async_trait;
use crashmon_core::domain::{
    Job, JobId, JobOutcome, NewJob, ProcessorId, ProcessorLoad, TerminalJob,
};
use crashmon_core::error::{AppError, Result};
use crashmon_core::port::{PromotionOutcome, QueueSession};
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, warn};

/// Per-processor hand-off table; the id is an integer, so formatting it
/// into the statement is safe
fn priority_table(owner: ProcessorId) -> String {
    format!("priority_jobs_{}", owner)
}

pub struct SqliteQueueSession {
    identity: String,
    conn: SharedConnection,
}

impl SqliteQueueSession {
    pub(crate) fn new(identity: &str, conn: SharedConnection) -> Self {
        Self {
            identity: identity.to_string(),
            conn,
        }
    }
}

/// Append `uuid` to `priority_jobs_<owner>`; `Ok(false)` if the table is
/// missing or unusable
async fn hand_off(conn: &mut SqliteConnection, uuid: &str, owner: ProcessorId) -> Result<bool> {
    let statement = format!("INSERT INTO {} (uuid) VALUES (?)", priority_table(owner));
    match sqlx::query(&statement).bind(uuid).execute(&mut *conn).await {
        Ok(_) => Ok(true),
        Err(e) if is_statement_error(&e) => {
            warn!(uuid = uuid, owner = owner, error = %e, "Cannot write to processor priority table");
            Ok(false)
        }
        Err(e) => Err(map_sqlx_error(e)),
    }
}

#[async_trait]
impl QueueSession for SqliteQueueSession {
    async fn processor_loads(&mut self) -> Result<Vec<ProcessorLoad>> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT p.id, COUNT(j.id)
            FROM processors p LEFT OUTER JOIN jobs j ON j.owner = p.id
            GROUP BY p.id
            ORDER BY p.id
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(id, count)| ProcessorLoad::new(id, count))
            .collect())
    }

    async fn live_processors(&mut self, threshold_ms: i64) -> Result<Vec<ProcessorId>> {
        let mut conn = self.conn.lock().await;
        sqlx::query_scalar("SELECT id FROM processors WHERE lastSeenDateTime >= ? ORDER BY id")
            .bind(threshold_ms)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx_error)
    }

    async fn dead_processors(&mut self, threshold_ms: i64) -> Result<Vec<ProcessorId>> {
        let mut conn = self.conn.lock().await;
        sqlx::query_scalar("SELECT id FROM processors WHERE lastSeenDateTime < ? ORDER BY id")
            .bind(threshold_ms)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx_error)
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        match sqlx::query("ROLLBACK").execute(&mut *conn).await {
            Ok(_) => {
                debug!(identity = %self.identity, "Rolled back open transaction");
                Ok(())
            }
            Err(e) if is_statement_error(&e) => {
                debug!(identity = %self.identity, error = %e, "No transaction to roll back");
                Ok(())
            }
            Err(e) => Err(map_sqlx_error(e)),
        }
    }

    async fn insert_job(&mut self, job: &NewJob) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (pathname, uuid, owner, priority, queuedDateTime)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.pathname)
        .bind(&job.uuid)
        .bind(job.owner)
        .bind(job.priority)
        .bind(job.queued_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match map_sqlx_error(e) {
            AppError::DuplicateJob(_) => AppError::DuplicateJob(job.uuid.clone()),
            other => other,
        })?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn find_queued(&mut self, uuid: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, pathname, uuid, owner, priority, queuedDateTime, startedDateTime, success
            FROM jobs WHERE uuid = ?
            "#,
        )
        .bind(uuid)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(JobRow::into_job))
    }

    async fn priority_uuids(&mut self) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        sqlx::query_scalar("SELECT uuid FROM priorityJobs ORDER BY rowid")
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx_error)
    }

    async fn promote_queued(
        &mut self,
        uuid: &str,
        owner: ProcessorId,
    ) -> Result<PromotionOutcome> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await.map_err(map_sqlx_error)?;

        if !hand_off(&mut tx, uuid, owner).await? {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(PromotionOutcome::OwnerUnavailable);
        }

        sqlx::query("UPDATE jobs SET priority = priority + 1 WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query("DELETE FROM priorityJobs WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(PromotionOutcome::Promoted)
    }

    async fn complete_priority_admission(
        &mut self,
        uuid: &str,
        owner: Option<ProcessorId>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await.map_err(map_sqlx_error)?;

        if let Some(owner) = owner {
            hand_off(&mut tx, uuid, owner).await?;
        }
        sqlx::query("DELETE FROM priorityJobs WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn clear_priority_flag(&mut self, uuid: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("DELETE FROM priorityJobs WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn terminal_jobs(&mut self, outcome: JobOutcome) -> Result<Vec<TerminalJob>> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<(JobId, String, String)> =
            sqlx::query_as("SELECT id, pathname, uuid FROM jobs WHERE success = ? ORDER BY id")
                .bind(outcome == JobOutcome::Succeeded)
                .fetch_all(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(id, pathname, uuid)| TerminalJob { id, pathname, uuid })
            .collect())
    }

    async fn delete_job(&mut self, id: JobId) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// SQLite row representation of `jobs`
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    pathname: String,
    uuid: String,
    owner: i64,
    priority: i32,
    #[sqlx(rename = "queuedDateTime")]
    queued_at: i64,
    #[sqlx(rename = "startedDateTime")]
    started_at: Option<i64>,
    success: Option<bool>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.id,
            pathname: self.pathname,
            uuid: self.uuid,
            owner: self.owner,
            priority: self.priority,
            queued_at: self.queued_at,
            started_at: self.started_at,
            success: self.success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionPool;
    use crate::{connect_options, create_pool, run_migrations};
    use crashmon_core::port::QueueDatabase;
    use sqlx::{ConnectOptions, SqlitePool};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    async fn setup() -> (TempDir, SqlitePool, Box<dyn QueueSession>) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let session = ConnectionPool::new(&url)
            .unwrap()
            .session("standardLoop")
            .await
            .unwrap();
        (dir, pool, session)
    }

    async fn add_processor(pool: &SqlitePool, id: i64, last_seen: i64) {
        sqlx::query("INSERT INTO processors (id, lastSeenDateTime) VALUES (?, ?)")
            .bind(id)
            .bind(last_seen)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(&format!("CREATE TABLE priority_jobs_{} (uuid TEXT NOT NULL)", id))
            .execute(pool)
            .await
            .unwrap();
    }

    fn new_job(uuid: &str, owner: ProcessorId) -> NewJob {
        NewJob {
            pathname: format!("/storage/{}.json", uuid),
            uuid: uuid.to_string(),
            owner,
            priority: 0,
            queued_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_processor_loads_count_jobs_with_outer_join() {
        let (_dir, pool, mut session) = setup().await;
        add_processor(&pool, 1, 0).await;
        add_processor(&pool, 2, 0).await;
        session.insert_job(&new_job("a", 2)).await.unwrap();
        session.insert_job(&new_job("b", 2)).await.unwrap();

        let loads = session.processor_loads().await.unwrap();
        assert_eq!(loads, vec![ProcessorLoad::new(1, 0), ProcessorLoad::new(2, 2)]);
    }

    #[tokio::test]
    async fn test_live_and_dead_split_at_threshold() {
        let (_dir, pool, mut session) = setup().await;
        add_processor(&pool, 1, 500).await;
        add_processor(&pool, 2, 1_000).await;
        add_processor(&pool, 3, 1_500).await;

        assert_eq!(session.live_processors(1_000).await.unwrap(), vec![2, 3]);
        assert_eq!(session.dead_processors(1_000).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_duplicate_uuid_is_reported() {
        let (_dir, pool, mut session) = setup().await;
        add_processor(&pool, 1, 0).await;
        session.insert_job(&new_job("dup", 1)).await.unwrap();

        let err = session.insert_job(&new_job("dup", 1)).await.unwrap_err();
        assert!(matches!(err, AppError::DuplicateJob(ref uuid) if uuid == "dup"));

        session.rollback().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_find_queued_reads_full_row() {
        let (_dir, pool, mut session) = setup().await;
        add_processor(&pool, 4, 0).await;
        session.insert_job(&new_job("row", 4)).await.unwrap();

        let job = session.find_queued("row").await.unwrap().unwrap();
        assert_eq!(job.owner, 4);
        assert_eq!(job.queued_at, 1_000);
        assert_eq!(job.outcome(), None);
        assert!(session.find_queued("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_promote_queued_hands_off_and_clears_flag() {
        let (_dir, pool, mut session) = setup().await;
        add_processor(&pool, 1, 0).await;
        session.insert_job(&new_job("p", 1)).await.unwrap();
        sqlx::query("INSERT INTO priorityJobs (uuid) VALUES ('p')")
            .execute(&pool)
            .await
            .unwrap();

        let outcome = session.promote_queued("p", 1).await.unwrap();
        assert_eq!(outcome, PromotionOutcome::Promoted);

        assert_eq!(session.find_queued("p").await.unwrap().unwrap().priority, 1);
        assert!(session.priority_uuids().await.unwrap().is_empty());
        let handed: Vec<String> = sqlx::query_scalar("SELECT uuid FROM priority_jobs_1")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(handed, vec!["p".to_string()]);
    }

    #[tokio::test]
    async fn test_promote_to_missing_table_changes_nothing() {
        let (_dir, pool, mut session) = setup().await;
        add_processor(&pool, 1, 0).await;
        session.insert_job(&new_job("q", 9)).await.unwrap();
        sqlx::query("INSERT INTO priorityJobs (uuid) VALUES ('q')")
            .execute(&pool)
            .await
            .unwrap();

        let outcome = session.promote_queued("q", 9).await.unwrap();
        assert_eq!(outcome, PromotionOutcome::OwnerUnavailable);
        assert_eq!(session.find_queued("q").await.unwrap().unwrap().priority, 0);
        assert_eq!(session.priority_uuids().await.unwrap(), vec!["q".to_string()]);
    }

    #[tokio::test]
    async fn test_complete_priority_admission_without_table_still_clears_flag() {
        let (_dir, pool, mut session) = setup().await;
        sqlx::query("INSERT INTO priorityJobs (uuid) VALUES ('r')")
            .execute(&pool)
            .await
            .unwrap();

        session
            .complete_priority_admission("r", Some(42))
            .await
            .unwrap();
        assert!(session.priority_uuids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_jobs_by_outcome_and_delete() {
        let (_dir, pool, mut session) = setup().await;
        add_processor(&pool, 1, 0).await;
        for uuid in ["ok", "bad", "running"] {
            session.insert_job(&new_job(uuid, 1)).await.unwrap();
        }
        sqlx::query("UPDATE jobs SET success = 1 WHERE uuid = 'ok'")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET success = 0 WHERE uuid = 'bad'")
            .execute(&pool)
            .await
            .unwrap();

        let failed = session.terminal_jobs(JobOutcome::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].uuid, "bad");
        let succeeded = session.terminal_jobs(JobOutcome::Succeeded).await.unwrap();
        assert_eq!(succeeded[0].uuid, "ok");

        session.delete_job(failed[0].id).await.unwrap();
        assert!(session.find_queued("bad").await.unwrap().is_none());
        assert!(session.find_queued("running").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_without_transaction_is_harmless() {
        let (_dir, _pool, mut session) = setup().await;
        assert!(session.rollback().await.is_ok());
        assert!(session.rollback().await.is_ok());
    }

    #[tokio::test]
    async fn test_busy_database_is_not_a_missing_table() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        add_processor(&pool, 1, 0).await;
        sqlx::query("INSERT INTO priorityJobs (uuid) VALUES ('busy')")
            .execute(&pool)
            .await
            .unwrap();

        // Another writer holds the write lock; this session does not wait
        let mut writer = connect_options(&url).unwrap().connect().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut writer)
            .await
            .unwrap();
        let conn = connect_options(&url)
            .unwrap()
            .busy_timeout(Duration::ZERO)
            .connect()
            .await
            .unwrap();
        let mut session = SqliteQueueSession::new("priorityLoop", Arc::new(Mutex::new(conn)));

        let result = session.promote_queued("busy", 1).await;
        assert!(matches!(result, Err(AppError::Database(_))), "{:?}", result);

        sqlx::query("ROLLBACK").execute(&mut writer).await.unwrap();
        assert_eq!(session.priority_uuids().await.unwrap(), vec!["busy".to_string()]);
    }
}
