//! Monitor orchestration
//!
//! Starts the priority and cleanup loops as tasks, runs the standard
//! admission loop on the calling task, then joins everything and closes
//! the pool. The exit status says whether the stop was requested or
//! forced by a fatal condition.

use crate::application::admission::StandardAllocator;
use crate::application::cleanup::{DirectoryCleaner, JobCleaner};
use crate::application::config::MonitorConfig;
use crate::application::constants::{DIRECTORY_CLEANUP_LOOP, JOB_CLEANUP_LOOP, PRIORITY_LOOP};
use crate::application::lifecycle::admission_lock;
use crate::application::priority::PriorityAllocator;
use crate::application::shutdown::ShutdownToken;
use crate::error::Result;
use crate::port::{CrashStorage, QueueDatabase, TimeProvider};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How the monitor stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Shutdown was requested from outside
    Clean,
    /// A loop hit a fatal condition
    Fatal(String),
}

impl MonitorExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, MonitorExit::Clean)
    }
}

pub struct Monitor {
    db: Arc<dyn QueueDatabase>,
    storage: Arc<dyn CrashStorage>,
    time_provider: Arc<dyn TimeProvider>,
    config: Arc<MonitorConfig>,
}

impl Monitor {
    pub fn new(
        db: Arc<dyn QueueDatabase>,
        storage: Arc<dyn CrashStorage>,
        time_provider: Arc<dyn TimeProvider>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            db,
            storage,
            time_provider,
            config: Arc::new(config),
        }
    }

    /// Run all four loops until shutdown
    pub async fn run(&self, token: ShutdownToken) -> MonitorExit {
        info!(
            storage_root = %self.config.storage_root.display(),
            deferred_storage_root = %self.config.deferred_storage_root.display(),
            scheduling = ?self.config.scheduling,
            "Monitor starting"
        );
        let lock = admission_lock();

        let priority = PriorityAllocator::new(
            Arc::clone(&self.db),
            Arc::clone(&self.storage),
            Arc::clone(&self.time_provider),
            Arc::clone(&self.config),
            Arc::clone(&lock),
        );
        let job_cleaner = JobCleaner::new(
            Arc::clone(&self.db),
            Arc::clone(&self.storage),
            Arc::clone(&self.config),
        );
        let directory_cleaner = DirectoryCleaner::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.time_provider),
            Arc::clone(&self.config),
        );
        let standard = StandardAllocator::new(
            Arc::clone(&self.db),
            Arc::clone(&self.storage),
            Arc::clone(&self.time_provider),
            Arc::clone(&self.config),
            lock,
        );

        let handles: Vec<(&str, JoinHandle<Result<()>>)> = vec![
            (PRIORITY_LOOP, {
                let token = token.clone();
                tokio::spawn(async move { priority.run(token).await })
            }),
            (JOB_CLEANUP_LOOP, {
                let token = token.clone();
                tokio::spawn(async move { job_cleaner.run(token).await })
            }),
            (DIRECTORY_CLEANUP_LOOP, {
                let token = token.clone();
                tokio::spawn(async move { directory_cleaner.run(token).await })
            }),
        ];

        // Loops report their own errors; the fatal reason lives on the token
        let _ = standard.run(token.clone()).await;

        for (identity, handle) in handles {
            if let Err(e) = handle.await {
                error!(identity = identity, error = %e, "Loop task failed");
                token.abort(format!("{}: task failed: {}", identity, e));
            }
        }

        self.db.teardown().await;

        match token.fatal_reason() {
            Some(reason) => {
                error!(reason = %reason, "Monitor stopped by fatal condition");
                MonitorExit::Fatal(reason)
            }
            None => {
                info!("Monitor stopped");
                MonitorExit::Clean
            }
        }
    }
}
