//! Admission: turning an index entry into a job row
//!
//! `Admitter::admit` is shared by the standard and priority loops.
//! `StandardAllocator` walks the primary index tree once per cycle.

use crate::application::config::{duration_ms, MonitorConfig};
use crate::application::constants::{STANDARD_LOOP, STANDARD_PRIORITY};
use crate::application::lifecycle::{ends_loop, finish_loop, open_session, AdmissionLock};
use crate::application::reclaimer::reclaim_dead_processors;
use crate::application::scheduler::JobScheduler;
use crate::application::shutdown::ShutdownToken;
use crate::domain::{derive_uuid, NewJob, Priority, ProcessorId};
use crate::error::{AppError, Result};
use crate::port::{CrashStorage, QueueDatabase, QueueSession, TimeProvider};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Admits one artifact at a time
#[derive(Clone)]
pub struct Admitter {
    storage: Arc<dyn CrashStorage>,
    time_provider: Arc<dyn TimeProvider>,
    config: Arc<MonitorConfig>,
}

impl Admitter {
    pub fn new(
        storage: Arc<dyn CrashStorage>,
        time_provider: Arc<dyn TimeProvider>,
        config: Arc<MonitorConfig>,
    ) -> Self {
        Self {
            storage,
            time_provider,
            config,
        }
    }

    /// Queue `artifact` (found through `link`) for the next scheduled processor
    ///
    /// Returns the assigned processor, or `None` when nothing was admitted:
    /// the target is gone (link deleted), the uuid is already queued (link
    /// deleted), or the insert failed for another logged reason. Only
    /// cancellation and fatal errors are returned as `Err`.
    pub async fn admit(
        &self,
        session: &mut dyn QueueSession,
        scheduler: &mut JobScheduler,
        link: &Path,
        artifact: &Path,
        priority: Priority,
        token: &ShutdownToken,
    ) -> Result<Option<ProcessorId>> {
        debug!(priority = priority, artifact = %artifact.display(), "Queuing");

        if !self.storage.artifact_exists(artifact).await {
            debug!(link = %link.display(), "Index entry is bad, target missing");
            self.remove_link(link).await;
            return Ok(None);
        }

        match self
            .insert(session, scheduler, artifact, priority, token)
            .await
        {
            Ok((uuid, owner)) => {
                info!(uuid = %uuid, owner = owner, priority = priority, "Job queued");
                self.remove_link(link).await;
                Ok(Some(owner))
            }
            Err(AppError::DuplicateJob(uuid)) => {
                rollback_quietly(session).await;
                self.remove_link(link).await;
                debug!(uuid = %uuid, "Already in queue, ignoring");
                Ok(None)
            }
            Err(AppError::Cancelled) => {
                debug!("Admission detected quit");
                rollback_quietly(session).await;
                Err(AppError::Cancelled)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                rollback_quietly(session).await;
                error!(artifact = %artifact.display(), error = %e, "Admission failed");
                Ok(None)
            }
        }
    }

    async fn insert(
        &self,
        session: &mut dyn QueueSession,
        scheduler: &mut JobScheduler,
        artifact: &Path,
        priority: Priority,
        token: &ShutdownToken,
    ) -> Result<(String, ProcessorId)> {
        let uuid = derive_uuid(artifact, &self.config.json_file_suffix)?;
        token.check()?;

        let owner = scheduler
            .next()
            .ok_or_else(|| AppError::NoProcessors("scheduler is exhausted".to_string()))?;
        debug!(uuid = %uuid, owner = owner, "Trying to insert");

        let job = NewJob {
            pathname: artifact.display().to_string(),
            uuid: uuid.clone(),
            owner,
            priority,
            queued_at: self.time_provider.now_millis(),
        };
        session.insert_job(&job).await?;
        Ok((uuid, owner))
    }

    async fn remove_link(&self, link: &Path) {
        if let Err(e) = self.storage.remove_entry(link).await {
            warn!(link = %link.display(), error = %e, "Cannot remove index entry");
        }
    }
}

async fn rollback_quietly(session: &mut dyn QueueSession) {
    if let Err(e) = session.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

/// What happened to one index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Admitted(ProcessorId),
    NotAdmitted,
    TooYoung,
    Stale,
}

/// Counters for one standard admission cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub seen: usize,
    pub admitted: usize,
    pub too_young: usize,
    pub stale: usize,
    pub failed: usize,
}

/// The main loop: reclaim, snapshot, walk the index, admit, sleep
pub struct StandardAllocator {
    db: Arc<dyn QueueDatabase>,
    storage: Arc<dyn CrashStorage>,
    time_provider: Arc<dyn TimeProvider>,
    config: Arc<MonitorConfig>,
    admitter: Admitter,
    admission_lock: AdmissionLock,
}

impl StandardAllocator {
    pub fn new(
        db: Arc<dyn QueueDatabase>,
        storage: Arc<dyn CrashStorage>,
        time_provider: Arc<dyn TimeProvider>,
        config: Arc<MonitorConfig>,
        admission_lock: AdmissionLock,
    ) -> Self {
        let admitter = Admitter::new(
            Arc::clone(&storage),
            Arc::clone(&time_provider),
            Arc::clone(&config),
        );
        Self {
            db,
            storage,
            time_provider,
            config,
            admitter,
            admission_lock,
        }
    }

    /// Run until cancelled (`Ok`) or a fatal condition (`Err`, quit flag raised)
    pub async fn run(&self, token: ShutdownToken) -> Result<()> {
        info!("Standard job allocation loop starting");
        let mut session = open_session(self.db.as_ref(), STANDARD_LOOP, &token).await?;

        let reason = loop {
            match self.run_cycle(session.as_mut(), &token).await {
                Ok(stats) => debug!(?stats, "End of standard cycle, about to sleep"),
                Err(e) if ends_loop(&e) => break e,
                Err(e) => error!(error = %e, "Standard cycle aborted"),
            }
            if let Err(e) = token.sleep(self.config.standard_loop_delay()).await {
                break e;
            }
        };

        rollback_quietly(session.as_mut()).await;
        finish_loop(STANDARD_LOOP, reason, &token)
    }

    /// One pass over the primary index tree
    pub async fn run_cycle(
        &self,
        session: &mut dyn QueueSession,
        token: &ShutdownToken,
    ) -> Result<CycleStats> {
        token.check()?;
        if let Err(e) =
            reclaim_dead_processors(session, &self.config, self.time_provider.as_ref()).await
        {
            if ends_loop(&e) {
                return Err(e);
            }
            error!(error = %e, "Dead processor check failed");
        }
        token.check()?;

        let index_root = self.config.index_root();
        debug!(index = %index_root.display(), "Beginning index scan");
        let entries = self
            .storage
            .index_entries(&index_root, &self.config.symlink_suffix, token)
            .await?;

        // Built on the first admission, under the admission lock
        let mut scheduler = None;

        let mut stats = CycleStats::default();
        for link in entries {
            token.check()?;
            stats.seen += 1;
            match self
                .process_entry(session, &mut scheduler, &link, token)
                .await
            {
                Ok(EntryOutcome::Admitted(_)) => stats.admitted += 1,
                Ok(EntryOutcome::NotAdmitted) => {}
                Ok(EntryOutcome::TooYoung) => stats.too_young += 1,
                Ok(EntryOutcome::Stale) => stats.stale += 1,
                Err(e) if ends_loop(&e) => return Err(e),
                Err(e) => {
                    stats.failed += 1;
                    error!(link = %link.display(), error = %e, "Index entry failed");
                }
            }
        }
        Ok(stats)
    }

    async fn process_entry(
        &self,
        session: &mut dyn QueueSession,
        scheduler: &mut Option<JobScheduler>,
        link: &Path,
        token: &ShutdownToken,
    ) -> Result<EntryOutcome> {
        debug!(link = %link.display(), "Found index entry");

        let modified_ms = match self.storage.entry_modified_ms(link).await? {
            Some(ms) => ms,
            None => {
                debug!(link = %link.display(), "Index entry is bad, target missing");
                self.storage.remove_entry(link).await?;
                return Ok(EntryOutcome::Stale);
            }
        };
        let age_ms = self.time_provider.now_millis().saturating_sub(modified_ms);
        if age_ms <= duration_ms(self.config.minimum_symlink_age()) {
            return Ok(EntryOutcome::TooYoung);
        }

        let artifact = self.storage.resolve_entry(link).await?;
        debug!(link = %link.display(), artifact = %artifact.display(), "Index entry resolved");
        token.check()?;

        let _guard = self.admission_lock.lock().await;
        let scheduler = match scheduler {
            Some(scheduler) => scheduler,
            slot @ None => {
                debug!("Building job scheduler");
                slot.insert(
                    JobScheduler::for_config(session, &self.config, self.time_provider.as_ref())
                        .await?,
                )
            }
        };
        let outcome = self
            .admitter
            .admit(session, scheduler, link, &artifact, STANDARD_PRIORITY, token)
            .await?;
        Ok(match outcome {
            Some(owner) => EntryOutcome::Admitted(owner),
            None => EntryOutcome::NotAdmitted,
        })
    }
}
