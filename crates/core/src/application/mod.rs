// Application Layer - the monitor's loops and the pieces they share

pub mod admission;
pub mod cleanup;
pub mod config;
pub mod constants;
pub mod lifecycle;
pub mod monitor;
pub mod priority;
pub mod reclaimer;
pub mod scheduler;
pub mod shutdown;

// Re-exports
pub use admission::{Admitter, CycleStats, StandardAllocator};
pub use cleanup::{directory_judged_deletable, DirectoryCleaner, JobCleaner};
pub use config::{MonitorConfig, SchedulingMode};
pub use monitor::{Monitor, MonitorExit};
pub use priority::{PriorityAllocator, PriorityReport};
pub use scheduler::{BalancedScheduler, JobScheduler, UnbalancedScheduler};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
