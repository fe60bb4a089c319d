// Monitor constants (no magic values)

/// Connection identity of the standard admission loop
pub const STANDARD_LOOP: &str = "standardLoop";

/// Connection identity of the priority loop
pub const PRIORITY_LOOP: &str = "priorityLoop";

/// Connection identity of the job cleanup loop
pub const JOB_CLEANUP_LOOP: &str = "jobCleanupLoop";

/// Name of the directory cleanup loop (it never touches the database)
pub const DIRECTORY_CLEANUP_LOOP: &str = "directoryCleanupLoop";

/// Priority given to jobs admitted by the standard loop
pub const STANDARD_PRIORITY: i32 = 0;

/// Priority given to jobs admitted by the priority loop
pub const ELEVATED_PRIORITY: i32 = 1;
