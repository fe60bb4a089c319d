// Processor Domain Model

/// Registered processor id (`processors.id`)
pub type ProcessorId = i64;

/// One row of the processor/job-count snapshot used by balanced scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorLoad {
    pub id: ProcessorId,
    pub job_count: i64,
}

impl ProcessorLoad {
    pub fn new(id: ProcessorId, job_count: i64) -> Self {
        Self { id, job_count }
    }
}
