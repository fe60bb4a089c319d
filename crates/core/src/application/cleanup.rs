// Cleanup loops: finished job rows and old empty directories

use crate::application::config::{duration_ms, MonitorConfig};
use crate::application::constants::{DIRECTORY_CLEANUP_LOOP, JOB_CLEANUP_LOOP};
use crate::application::lifecycle::{ends_loop, finish_loop, open_session};
use crate::application::shutdown::ShutdownToken;
use crate::domain::{JobOutcome, TerminalJob};
use crate::error::Result;
use crate::port::{CrashStorage, DirectoryInfo, QueueDatabase, QueueSession, TimeProvider};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happens to the artifact pair of a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposal {
    Delete,
    /// Move into this directory, tagging the file names with the outcome
    Archive(PathBuf),
}

impl Disposal {
    fn for_outcome(config: &MonitorConfig, outcome: JobOutcome) -> Self {
        let save = match outcome {
            JobOutcome::Failed => config.save_failed_minidumps,
            JobOutcome::Succeeded => config.save_processed_minidumps,
        };
        if save {
            Disposal::Archive(config.save_minidumps_to.clone())
        } else {
            Disposal::Delete
        }
    }
}

/// Dump path paired with a json artifact path
pub fn dump_path_for(json_path: &str, json_suffix: &str, dump_suffix: &str) -> PathBuf {
    let stem = json_path.strip_suffix(json_suffix).unwrap_or(json_path);
    PathBuf::from(format!("{}{}", stem, dump_suffix))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCleanupReport {
    pub failed_removed: usize,
    pub processed_removed: usize,
    /// Artifact files that could not be deleted or moved
    pub disposal_failures: usize,
}

/// Removes failed and succeeded job rows, disposing of their artifacts first
pub struct JobCleaner {
    db: Arc<dyn QueueDatabase>,
    storage: Arc<dyn CrashStorage>,
    config: Arc<MonitorConfig>,
}

impl JobCleaner {
    pub fn new(
        db: Arc<dyn QueueDatabase>,
        storage: Arc<dyn CrashStorage>,
        config: Arc<MonitorConfig>,
    ) -> Self {
        Self {
            db,
            storage,
            config,
        }
    }

    pub async fn run(&self, token: ShutdownToken) -> Result<()> {
        info!("Job cleanup loop starting");
        let mut session = open_session(self.db.as_ref(), JOB_CLEANUP_LOOP, &token).await?;

        let reason = loop {
            debug!("Beginning job cleanup cycle");
            match self.run_cycle(session.as_mut(), &token).await {
                Ok(report) => debug!(?report, "End of job cleanup cycle"),
                Err(e) if ends_loop(&e) => break e,
                Err(e) => {
                    error!(error = %e, "Job cleanup cycle aborted");
                    if let Err(rollback_err) = session.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                    }
                }
            }
            if let Err(e) = token.sleep(self.config.cleanup_jobs_loop_delay()).await {
                break e;
            }
        };

        if let Err(e) = session.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
        finish_loop(JOB_CLEANUP_LOOP, reason, &token)
    }

    /// Failed rows first, then succeeded rows; each row is its own commit
    pub async fn run_cycle(
        &self,
        session: &mut dyn QueueSession,
        token: &ShutdownToken,
    ) -> Result<JobCleanupReport> {
        let mut report = JobCleanupReport::default();
        for outcome in [JobOutcome::Failed, JobOutcome::Succeeded] {
            let disposal = Disposal::for_outcome(&self.config, outcome);
            let jobs = session.terminal_jobs(outcome).await?;
            for job in jobs {
                token.check()?;
                report.disposal_failures += self.dispose(&job, outcome, &disposal).await;
                session.delete_job(job.id).await?;
                debug!(uuid = %job.uuid, outcome = %outcome, "Job row removed");
                match outcome {
                    JobOutcome::Failed => report.failed_removed += 1,
                    JobOutcome::Succeeded => report.processed_removed += 1,
                }
            }
        }
        Ok(report)
    }

    /// Delete or archive the json and dump files; returns the number of failures
    async fn dispose(&self, job: &TerminalJob, outcome: JobOutcome, disposal: &Disposal) -> usize {
        let json = PathBuf::from(&job.pathname);
        let dump = dump_path_for(
            &job.pathname,
            &self.config.json_file_suffix,
            &self.config.dump_file_suffix,
        );

        let mut failures = 0;
        for (path, suffix) in [
            (json, &self.config.json_file_suffix),
            (dump, &self.config.dump_file_suffix),
        ] {
            let result = match disposal {
                Disposal::Delete => {
                    debug!(path = %path.display(), "Deleting");
                    self.storage.delete_file(&path).await
                }
                Disposal::Archive(dir) => {
                    let target = dir.join(format!(
                        "{}{}.{}",
                        job.uuid,
                        suffix,
                        outcome.archive_tag()
                    ));
                    debug!(path = %path.display(), target = %target.display(), "Archiving");
                    self.storage.move_file(&path, &target).await
                }
            };
            if let Err(e) = result {
                warn!(uuid = %job.uuid, path = %path.display(), error = %e, "Artifact disposal failed");
                failures += 1;
            }
        }
        failures
    }
}

/// Whether an empty-directory candidate should be removed
///
/// Never the root, never a directory with entries, never one younger than
/// its threshold (dump threshold for names starting with the dump prefix,
/// date threshold otherwise).
pub fn directory_judged_deletable(
    dir: &DirectoryInfo,
    root: &Path,
    config: &MonitorConfig,
    now_ms: i64,
) -> bool {
    if !dir.is_empty || dir.path == root {
        return false;
    }
    let is_dump_dir = dir
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(&config.dump_dir_prefix));
    let age_limit: Duration = if is_dump_dir {
        config.dump_dir_delta()
    } else {
        config.date_dir_delta()
    };
    let age_ms = now_ms.saturating_sub(dir.modified_ms);
    let limit_ms = duration_ms(age_limit);
    debug!(path = %dir.path.display(), age_ms = age_ms, limit_ms = limit_ms, "Judging directory");
    age_ms > limit_ms
}

/// Prunes old empty directories from the storage tree
pub struct DirectoryCleaner {
    storage: Arc<dyn CrashStorage>,
    time_provider: Arc<dyn TimeProvider>,
    config: Arc<MonitorConfig>,
}

impl DirectoryCleaner {
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

    pub async fn run(&self, token: ShutdownToken) -> Result<()> {
        info!("Directory cleanup loop starting");
        let reason = loop {
            debug!("Beginning directory cleanup cycle");
            match self.run_cycle(&token).await {
                Ok(removed) => debug!(removed = removed.len(), "End of directory cleanup cycle"),
                Err(e) if ends_loop(&e) => break e,
                Err(e) => error!(error = %e, "Directory cleanup cycle aborted"),
            }
            if let Err(e) = token
                .sleep(self.config.cleanup_directory_loop_delay())
                .await
            {
                break e;
            }
        };
        finish_loop(DIRECTORY_CLEANUP_LOOP, reason, &token)
    }

    /// One bottom-up pass; returns the directories removed
    pub async fn run_cycle(&self, token: &ShutdownToken) -> Result<Vec<PathBuf>> {
        let root = &self.config.storage_root;
        let now_ms = self.time_provider.now_millis();
        let mut removed = Vec::new();
        for dir in self.storage.directories_bottom_up(root, token).await? {
            token.check()?;
            if !directory_judged_deletable(&dir, root, &self.config, now_ms) {
                continue;
            }
            debug!(path = %dir.path.display(), "Removing");
            match self.storage.remove_directory(&dir.path).await {
                Ok(()) => removed.push(dir.path),
                Err(e) => warn!(path = %dir.path.display(), error = %e, "Cannot remove directory"),
            }
        }
        Ok(removed)
    }
}
