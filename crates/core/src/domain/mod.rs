// Domain Layer - Pure business logic and entities

pub mod error;
pub mod job;
pub mod processor;

// Re-exports
pub use error::DomainError;
pub use job::{derive_uuid, Job, JobId, JobOutcome, NewJob, Priority, TerminalJob};
pub use processor::{ProcessorId, ProcessorLoad};
