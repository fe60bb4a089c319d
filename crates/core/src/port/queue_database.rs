// Queue Database Port (Interface)

use crate::domain::{Job, JobId, JobOutcome, NewJob, ProcessorId, ProcessorLoad, TerminalJob};
use crate::error::Result;
use async_trait::async_trait;

/// Result of raising the priority of a job that is already queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// Hand-off row written, priority incremented, flag row removed
    Promoted,
    /// The owner's `priority_jobs_<id>` table is missing or unusable; nothing changed
    OwnerUnavailable,
}

/// Source of per-identity sessions (the connection pool)
#[async_trait]
pub trait QueueDatabase: Send + Sync {
    /// Session bound to `identity`, backed by a connection that has just
    /// answered a trivial query. Fails with `AppError::Connection` if no
    /// working connection can be produced.
    async fn session(&self, identity: &str) -> Result<Box<dyn QueueSession>>;

    /// Close every pooled connection
    async fn teardown(&self);
}

/// Queue operations over one private connection
///
/// Every mutating operation commits on success and rolls back on failure.
#[async_trait]
pub trait QueueSession: Send {
    /// Outer-join count of jobs per processor, in processor id order
    async fn processor_loads(&mut self) -> Result<Vec<ProcessorLoad>>;

    /// Processors whose heartbeat is at or after `threshold_ms`
    async fn live_processors(&mut self, threshold_ms: i64) -> Result<Vec<ProcessorId>>;

    /// Processors whose heartbeat is before `threshold_ms`
    async fn dead_processors(&mut self, threshold_ms: i64) -> Result<Vec<ProcessorId>>;

    /// Abandon whatever transaction the connection may be left in
    async fn rollback(&mut self) -> Result<()>;

    /// Insert a job row; `AppError::DuplicateJob` if the uuid is already queued
    async fn insert_job(&mut self, job: &NewJob) -> Result<()>;

    /// Job row currently queued under `uuid`
    async fn find_queued(&mut self, uuid: &str) -> Result<Option<Job>>;

    /// Uuids currently flagged in `priorityJobs`
    async fn priority_uuids(&mut self) -> Result<Vec<String>>;

    /// Raise an already-queued job and hand it to its owner's priority table
    async fn promote_queued(&mut self, uuid: &str, owner: ProcessorId)
        -> Result<PromotionOutcome>;

    /// Finish a priority admission found in an index tree: record the
    /// hand-off for `owner` (if any) and remove the flag row
    async fn complete_priority_admission(
        &mut self,
        uuid: &str,
        owner: Option<ProcessorId>,
    ) -> Result<()>;

    /// Remove the flag row for `uuid`
    async fn clear_priority_flag(&mut self, uuid: &str) -> Result<()>;

    /// Finished jobs whose recorded outcome is `outcome`
    async fn terminal_jobs(&mut self, outcome: JobOutcome) -> Result<Vec<TerminalJob>>;

    /// Delete one job row
    async fn delete_job(&mut self, id: JobId) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Shared in-memory tables
    #[derive(Debug, Default)]
    pub struct MockQueueState {
        /// (id, lastSeenDateTime)
        pub processors: Vec<(ProcessorId, i64)>,
        pub jobs: Vec<Job>,
        pub priority_flags: Vec<String>,
        /// Existing `priority_jobs_<id>` tables and their rows
        pub priority_tables: HashMap<ProcessorId, Vec<String>>,
        /// Number of upcoming `processor_loads` calls that fail
        pub failing_load_queries: usize,
        pub rollbacks: usize,
        pub sessions_opened: Vec<String>,
        pub torn_down: bool,
        next_job_id: JobId,
    }

    impl MockQueueState {
        pub fn add_processor(&mut self, id: ProcessorId, last_seen: i64) {
            self.processors.push((id, last_seen));
            self.priority_tables.entry(id).or_default();
        }

        pub fn add_job(&mut self, uuid: &str, owner: ProcessorId, success: Option<bool>) -> JobId {
            self.next_job_id += 1;
            self.jobs.push(Job {
                id: self.next_job_id,
                pathname: format!("/storage/{}.json", uuid),
                uuid: uuid.to_string(),
                owner,
                priority: 0,
                queued_at: 0,
                started_at: None,
                success,
            });
            self.next_job_id
        }

        pub fn job(&self, uuid: &str) -> Option<&Job> {
            self.jobs.iter().find(|j| j.uuid == uuid)
        }
    }

    /// Mock connection pool: every session shares one state
    #[derive(Clone, Default)]
    pub struct MockQueueDatabase {
        pub state: Arc<Mutex<MockQueueState>>,
        /// When set, `session` fails with a connection error
        pub unreachable: Arc<Mutex<bool>>,
    }

    impl MockQueueDatabase {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_state<R>(&self, f: impl FnOnce(&mut MockQueueState) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }

        pub fn mock_session(&self) -> MockQueueSession {
            MockQueueSession {
                state: Arc::clone(&self.state),
            }
        }
    }

    #[async_trait]
    impl QueueDatabase for MockQueueDatabase {
        async fn session(&self, identity: &str) -> Result<Box<dyn QueueSession>> {
            if *self.unreachable.lock().unwrap() {
                return Err(AppError::Connection(format!(
                    "{}: database unreachable",
                    identity
                )));
            }
            self.state
                .lock()
                .unwrap()
                .sessions_opened
                .push(identity.to_string());
            Ok(Box::new(self.mock_session()))
        }

        async fn teardown(&self) {
            self.state.lock().unwrap().torn_down = true;
        }
    }

    pub struct MockQueueSession {
        state: Arc<Mutex<MockQueueState>>,
    }

    #[async_trait]
    impl QueueSession for MockQueueSession {
        async fn processor_loads(&mut self) -> Result<Vec<ProcessorLoad>> {
            let mut state = self.state.lock().unwrap();
            if state.failing_load_queries > 0 {
                state.failing_load_queries -= 1;
                return Err(AppError::Database(
                    "current transaction is aborted".to_string(),
                ));
            }
            let mut ids: Vec<ProcessorId> = state.processors.iter().map(|(id, _)| *id).collect();
            ids.sort_unstable();
            Ok(ids
                .into_iter()
                .map(|id| {
                    let count = state.jobs.iter().filter(|j| j.owner == id).count() as i64;
                    ProcessorLoad::new(id, count)
                })
                .collect())
        }

        async fn live_processors(&mut self, threshold_ms: i64) -> Result<Vec<ProcessorId>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .processors
                .iter()
                .filter(|(_, seen)| *seen >= threshold_ms)
                .map(|(id, _)| *id)
                .collect())
        }

        async fn dead_processors(&mut self, threshold_ms: i64) -> Result<Vec<ProcessorId>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .processors
                .iter()
                .filter(|(_, seen)| *seen < threshold_ms)
                .map(|(id, _)| *id)
                .collect())
        }

        async fn rollback(&mut self) -> Result<()> {
            self.state.lock().unwrap().rollbacks += 1;
            Ok(())
        }

        async fn insert_job(&mut self, job: &NewJob) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.job(&job.uuid).is_some() {
                return Err(AppError::DuplicateJob(job.uuid.clone()));
            }
            state.next_job_id += 1;
            let id = state.next_job_id;
            state.jobs.push(Job {
                id,
                pathname: job.pathname.clone(),
                uuid: job.uuid.clone(),
                owner: job.owner,
                priority: job.priority,
                queued_at: job.queued_at,
                started_at: None,
                success: None,
            });
            Ok(())
        }

        async fn find_queued(&mut self, uuid: &str) -> Result<Option<Job>> {
            Ok(self.state.lock().unwrap().job(uuid).cloned())
        }

        async fn priority_uuids(&mut self) -> Result<Vec<String>> {
            Ok(self.state.lock().unwrap().priority_flags.clone())
        }

        async fn promote_queued(
            &mut self,
            uuid: &str,
            owner: ProcessorId,
        ) -> Result<PromotionOutcome> {
            let mut state = self.state.lock().unwrap();
            match state.priority_tables.get_mut(&owner) {
                Some(rows) => rows.push(uuid.to_string()),
                None => return Ok(PromotionOutcome::OwnerUnavailable),
            }
            if let Some(job) = state.jobs.iter_mut().find(|j| j.uuid == uuid) {
                job.priority += 1;
            }
            state.priority_flags.retain(|u| u != uuid);
            Ok(PromotionOutcome::Promoted)
        }

        async fn complete_priority_admission(
            &mut self,
            uuid: &str,
            owner: Option<ProcessorId>,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(rows) = owner.and_then(|o| state.priority_tables.get_mut(&o)) {
                rows.push(uuid.to_string());
            }
            state.priority_flags.retain(|u| u != uuid);
            Ok(())
        }

        async fn clear_priority_flag(&mut self, uuid: &str) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .priority_flags
                .retain(|u| u != uuid);
            Ok(())
        }

        async fn terminal_jobs(&mut self, outcome: JobOutcome) -> Result<Vec<TerminalJob>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .jobs
                .iter()
                .filter(|j| j.outcome() == Some(outcome))
                .map(|j| TerminalJob {
                    id: j.id,
                    pathname: j.pathname.clone(),
                    uuid: j.uuid.clone(),
                })
                .collect())
        }

        async fn delete_job(&mut self, id: JobId) -> Result<()> {
            self.state.lock().unwrap().jobs.retain(|j| j.id != id);
            Ok(())
        }
    }
}
