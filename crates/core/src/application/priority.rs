//! Priority promotion loop
//!
//! Consumes `priorityJobs` flags. A flagged uuid is either already queued
//! (raise it in place), still waiting in one of the index trees (admit it
//! with elevated priority), or nowhere (log and drop the flag).

use crate::application::admission::Admitter;
use crate::application::config::MonitorConfig;
use crate::application::constants::{ELEVATED_PRIORITY, PRIORITY_LOOP};
use crate::application::lifecycle::{ends_loop, finish_loop, open_session, AdmissionLock};
use crate::application::scheduler::JobScheduler;
use crate::application::shutdown::ShutdownToken;
use crate::error::Result;
use crate::port::{CrashStorage, PromotionOutcome, QueueDatabase, QueueSession, TimeProvider};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How each flagged uuid was dealt with in one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityReport {
    /// Already queued, priority raised
    pub promoted: Vec<String>,
    /// Owner's priority table unusable; flag kept for a later cycle
    pub deferred: Vec<String>,
    /// Found in an index tree and handed to the admission path
    pub admitted: Vec<String>,
    /// Not queued and in neither tree; flag removed
    pub not_found: Vec<String>,
}

pub struct PriorityAllocator {
    db: Arc<dyn QueueDatabase>,
    storage: Arc<dyn CrashStorage>,
    config: Arc<MonitorConfig>,
    admitter: Admitter,
    admission_lock: AdmissionLock,
}

impl PriorityAllocator {
    pub fn new(
        db: Arc<dyn QueueDatabase>,
        storage: Arc<dyn CrashStorage>,
        time_provider: Arc<dyn TimeProvider>,
        config: Arc<MonitorConfig>,
        admission_lock: AdmissionLock,
    ) -> Self {
        let admitter = Admitter::new(Arc::clone(&storage), time_provider, Arc::clone(&config));
        Self {
            db,
            storage,
            config,
            admitter,
            admission_lock,
        }
    }

    /// Run until cancelled (`Ok`) or a fatal condition (`Err`, quit flag raised)
    pub async fn run(&self, token: ShutdownToken) -> Result<()> {
        info!("Priority job allocation loop starting");
        let mut session = open_session(self.db.as_ref(), PRIORITY_LOOP, &token).await?;

        let reason = loop {
            match self.run_cycle(session.as_mut(), &token).await {
                Ok(report) if report == PriorityReport::default() => {}
                Ok(report) => debug!(?report, "End of priority cycle"),
                Err(e) if ends_loop(&e) => break e,
                Err(e) => {
                    error!(error = %e, "Priority cycle aborted");
                    if let Err(rollback_err) = session.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                    }
                }
            }
            if let Err(e) = token.sleep(self.config.priority_loop_delay()).await {
                break e;
            }
        };

        if let Err(e) = session.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
        finish_loop(PRIORITY_LOOP, reason, &token)
    }

    pub async fn run_cycle(
        &self,
        session: &mut dyn QueueSession,
        token: &ShutdownToken,
    ) -> Result<PriorityReport> {
        token.check()?;
        let mut pending = session.priority_uuids().await?;
        let mut report = PriorityReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let _guard = self.admission_lock.lock().await;
        debug!(count = pending.len(), "Beginning search for priority jobs");

        self.promote_already_queued(session, &mut pending, &mut report, token)
            .await?;
        if pending.is_empty() {
            return Ok(report);
        }

        let mut scheduler = JobScheduler::balanced(session).await?;
        for index_root in [self.config.index_root(), self.config.deferred_index_root()] {
            if pending.is_empty() {
                break;
            }
            self.admit_from_index(
                session,
                &mut scheduler,
                &index_root,
                &mut pending,
                &mut report,
                token,
            )
            .await?;
        }

        for uuid in pending {
            error!(uuid = %uuid, "Priority uuid was never found");
            session.clear_priority_flag(&uuid).await?;
            report.not_found.push(uuid);
        }
        Ok(report)
    }

    /// Step (a): raise jobs that are already in the queue
    async fn promote_already_queued(
        &self,
        session: &mut dyn QueueSession,
        pending: &mut Vec<String>,
        report: &mut PriorityReport,
        token: &ShutdownToken,
    ) -> Result<()> {
        let mut unresolved = Vec::with_capacity(pending.len());
        for uuid in pending.drain(..) {
            token.check()?;
            let Some(job) = session.find_queued(&uuid).await? else {
                unresolved.push(uuid);
                continue;
            };
            info!(uuid = %uuid, owner = job.owner, "Priority job already queued, raising its priority");
            match session.promote_queued(&uuid, job.owner).await? {
                PromotionOutcome::Promoted => report.promoted.push(uuid),
                PromotionOutcome::OwnerUnavailable => {
                    warn!(
                        uuid = %uuid,
                        owner = job.owner,
                        "Owner has no usable priority table, leaving flag for a later cycle"
                    );
                    report.deferred.push(uuid);
                }
            }
        }
        *pending = unresolved;
        Ok(())
    }

    /// Steps (b) and (c): look for each pending uuid's entry under `index_root`
    async fn admit_from_index(
        &self,
        session: &mut dyn QueueSession,
        scheduler: &mut JobScheduler,
        index_root: &Path,
        pending: &mut Vec<String>,
        report: &mut PriorityReport,
        token: &ShutdownToken,
    ) -> Result<()> {
        let mut unresolved = Vec::with_capacity(pending.len());
        for uuid in pending.drain(..) {
            token.check()?;
            debug!(uuid = %uuid, index = %index_root.display(), "Looking for priority entry");
            let entry_name = format!("{}{}", uuid, self.config.symlink_suffix);
            let link = match self.storage.find_index_entry(index_root, &entry_name, token).await {
                Ok(Some(link)) => link,
                Ok(None) => {
                    unresolved.push(uuid);
                    continue;
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(index = %index_root.display(), error = %e, "Cannot search index");
                    unresolved.push(uuid);
                    continue;
                }
            };

            let artifact = match self.storage.resolve_entry(&link).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    debug!(link = %link.display(), error = %e, "Not it");
                    unresolved.push(uuid);
                    continue;
                }
            };
            info!(uuid = %uuid, artifact = %artifact.display(), "Priority queuing");
            let owner = self
                .admitter
                .admit(session, scheduler, &link, &artifact, ELEVATED_PRIORITY, token)
                .await?;
            session.complete_priority_admission(&uuid, owner).await?;
            report.admitted.push(uuid);
        }
        *pending = unresolved;
        Ok(())
    }
}
