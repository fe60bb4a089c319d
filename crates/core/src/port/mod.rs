// Port Layer - Interfaces for external dependencies

pub mod crash_storage;
pub mod queue_database;
pub mod time_provider;

// Re-exports
pub use crash_storage::{CrashStorage, DirectoryInfo};
pub use queue_database::{PromotionOutcome, QueueDatabase, QueueSession};
pub use time_provider::TimeProvider;
