// Dead-processor detection, run once per standard admission cycle

use crate::application::config::MonitorConfig;
use crate::domain::ProcessorId;
use crate::error::{AppError, Result};
use crate::port::{QueueSession, TimeProvider};
use tracing::{info, warn};

/// What one reclaimer pass saw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub dead: Vec<ProcessorId>,
    pub live: Vec<ProcessorId>,
}

/// Partition processors by heartbeat and refuse to continue with zero live ones
///
/// Jobs owned by dead processors are left in place; moving them to live
/// processors is not done here.
///
/// Returns `Err(NoProcessors)` when dead processors exist and none are live.
/// Query failures are returned as ordinary (non-fatal) errors.
pub async fn reclaim_dead_processors(
    session: &mut dyn QueueSession,
    config: &MonitorConfig,
    time_provider: &dyn TimeProvider,
) -> Result<ReclaimReport> {
    info!("Looking for dead processors");
    let threshold = config.check_in_threshold_ms(time_provider.now_millis());

    let dead = session.dead_processors(threshold).await?;
    if dead.is_empty() {
        return Ok(ReclaimReport::default());
    }

    for id in &dead {
        warn!(processor = id, threshold_ms = threshold, "Processor is dead");
    }

    let live = session.live_processors(threshold).await?;
    if live.is_empty() {
        return Err(AppError::NoProcessors(format!(
            "all {} registered processors are dead",
            dead.len()
        )));
    }

    info!(
        dead = dead.len(),
        live = live.len(),
        "Dead processors found; their jobs stay assigned"
    );
    Ok(ReclaimReport { dead, live })
}
