// Crashmon Infrastructure - System Adapters
// Implements: CrashStorage (local filesystem)

pub mod local_storage;
pub mod path_utils;

pub use local_storage::LocalCrashStorage;
pub use path_utils::normalize_lexically;
