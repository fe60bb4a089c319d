//! Job scheduler iterators
//!
//! Both variants are built from a one-time database snapshot and then
//! produce processor ids forever. A new admission pass must build a new
//! iterator to see fresh counts.

use crate::application::config::{MonitorConfig, SchedulingMode};
use crate::domain::{ProcessorId, ProcessorLoad};
use crate::error::{AppError, Result};
use crate::port::{QueueSession, TimeProvider};
use tracing::{debug, warn};

/// Least-loaded-first processor ids
#[derive(Debug, Clone)]
pub struct BalancedScheduler {
    loads: Vec<ProcessorLoad>,
}

impl BalancedScheduler {
    /// Fails with `NoProcessors` for an empty snapshot
    pub fn from_snapshot(loads: Vec<ProcessorLoad>) -> Result<Self> {
        if loads.is_empty() {
            return Err(AppError::NoProcessors(
                "there are no processors registered".to_string(),
            ));
        }
        Ok(Self { loads })
    }

    /// Processor with the minimum in-memory count; ties go to the earliest
    /// snapshot entry. The chosen processor's count is incremented.
    pub fn next_processor(&mut self) -> ProcessorId {
        let mut chosen = 0;
        for (idx, load) in self.loads.iter().enumerate().skip(1) {
            if load.job_count < self.loads[chosen].job_count {
                chosen = idx;
            }
        }
        self.loads[chosen].job_count += 1;
        debug!(
            processor = self.loads[chosen].id,
            assigned = self.loads[chosen].job_count,
            "Balanced scheduler picked processor"
        );
        self.loads[chosen].id
    }

    pub fn loads(&self) -> &[ProcessorLoad] {
        &self.loads
    }
}

impl Iterator for BalancedScheduler {
    type Item = ProcessorId;

    fn next(&mut self) -> Option<ProcessorId> {
        Some(self.next_processor())
    }
}

/// Round-robin over live processor ids, ignoring load
#[derive(Debug, Clone)]
pub struct UnbalancedScheduler {
    ids: Vec<ProcessorId>,
    cursor: usize,
}

impl UnbalancedScheduler {
    /// Fails with `NoProcessors` for an empty snapshot
    pub fn from_snapshot(ids: Vec<ProcessorId>) -> Result<Self> {
        if ids.is_empty() {
            return Err(AppError::NoProcessors(
                "there are no active processors registered".to_string(),
            ));
        }
        Ok(Self { ids, cursor: 0 })
    }

    pub fn next_processor(&mut self) -> ProcessorId {
        let id = self.ids[self.cursor];
        self.cursor = (self.cursor + 1) % self.ids.len();
        id
    }
}

impl Iterator for UnbalancedScheduler {
    type Item = ProcessorId;

    fn next(&mut self) -> Option<ProcessorId> {
        Some(self.next_processor())
    }
}

/// Scheduler chosen by configuration for one admission pass
#[derive(Debug, Clone)]
pub enum JobScheduler {
    Balanced(BalancedScheduler),
    Unbalanced(UnbalancedScheduler),
}

impl JobScheduler {
    /// Snapshot `(processor, job count)` pairs and build a balanced iterator
    pub async fn balanced(session: &mut dyn QueueSession) -> Result<Self> {
        let loads = match session.processor_loads().await {
            Ok(loads) => loads,
            Err(e) => {
                warn!(error = %e, "Processor load query failed, rolling back and retrying once");
                session.rollback().await?;
                session.processor_loads().await.map_err(|e| {
                    AppError::Connection(format!("processor load query failed twice: {}", e))
                })?
            }
        };
        Ok(JobScheduler::Balanced(BalancedScheduler::from_snapshot(
            loads,
        )?))
    }

    /// Snapshot live processor ids and build a round-robin iterator
    pub async fn unbalanced(session: &mut dyn QueueSession, threshold_ms: i64) -> Result<Self> {
        let ids = match session.live_processors(threshold_ms).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Live processor query failed, rolling back and retrying once");
                session.rollback().await?;
                session.live_processors(threshold_ms).await.map_err(|e| {
                    AppError::Connection(format!("live processor query failed twice: {}", e))
                })?
            }
        };
        Ok(JobScheduler::Unbalanced(UnbalancedScheduler::from_snapshot(
            ids,
        )?))
    }

    /// Build whichever variant `config.scheduling` selects
    pub async fn for_config(
        session: &mut dyn QueueSession,
        config: &MonitorConfig,
        time_provider: &dyn TimeProvider,
    ) -> Result<Self> {
        match config.scheduling {
            SchedulingMode::Balanced => Self::balanced(session).await,
            SchedulingMode::Unbalanced => {
                let threshold = config.check_in_threshold_ms(time_provider.now_millis());
                Self::unbalanced(session, threshold).await
            }
        }
    }
}

impl Iterator for JobScheduler {
    type Item = ProcessorId;

    fn next(&mut self) -> Option<ProcessorId> {
        match self {
            JobScheduler::Balanced(s) => s.next(),
            JobScheduler::Unbalanced(s) => s.next(),
        }
    }
}
