// Monitor configuration

use crate::error::{AppError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which processor iterator an admission pass uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    /// Least-loaded processor first
    #[default]
    Balanced,
    /// Round-robin over live processors
    Unbalanced,
}

/// Everything the four loops need to know about storage and timing
///
/// Durations are whole seconds so the struct maps directly onto the
/// daemon's TOML/env configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub storage_root: PathBuf,
    pub deferred_storage_root: PathBuf,
    /// Name of the index tree under each storage root
    pub index_dir_name: String,

    pub json_file_suffix: String,
    pub dump_file_suffix: String,
    pub symlink_suffix: String,

    pub minimum_symlink_age_secs: u64,
    pub processor_check_in_secs: u64,

    pub standard_loop_delay_secs: u64,
    pub priority_loop_delay_secs: u64,
    pub cleanup_jobs_loop_delay_secs: u64,
    pub cleanup_directory_loop_delay_secs: u64,

    /// Archive (true) or delete (false) artifacts of failed jobs
    pub save_failed_minidumps: bool,
    /// Archive (true) or delete (false) artifacts of successful jobs
    pub save_processed_minidumps: bool,
    pub save_minidumps_to: PathBuf,

    /// Age limit for empty directories in general
    pub date_dir_delta_secs: u64,
    /// Age limit for empty directories named with `dump_dir_prefix`
    pub dump_dir_delta_secs: u64,
    pub dump_dir_prefix: String,

    pub scheduling: SchedulingMode,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/var/crashmon/standard"),
            deferred_storage_root: PathBuf::from("/var/crashmon/deferred"),
            index_dir_name: "index".to_string(),
            json_file_suffix: ".json".to_string(),
            dump_file_suffix: ".dump".to_string(),
            symlink_suffix: ".symlink".to_string(),
            minimum_symlink_age_secs: 60,
            processor_check_in_secs: 5 * 60,
            standard_loop_delay_secs: 30,
            priority_loop_delay_secs: 30,
            cleanup_jobs_loop_delay_secs: 5 * 60,
            cleanup_directory_loop_delay_secs: 60 * 60,
            save_failed_minidumps: false,
            save_processed_minidumps: false,
            save_minidumps_to: PathBuf::from("/var/crashmon/archive"),
            date_dir_delta_secs: 24 * 60 * 60,
            dump_dir_delta_secs: 3 * 24 * 60 * 60,
            dump_dir_prefix: "bp_".to_string(),
            scheduling: SchedulingMode::Balanced,
        }
    }
}

impl MonitorConfig {
    /// Reject settings no loop can work with
    pub fn validate(&self) -> Result<()> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(AppError::Config("storage_root is empty".to_string()));
        }
        for (name, value) in [
            ("json_file_suffix", &self.json_file_suffix),
            ("dump_file_suffix", &self.dump_file_suffix),
            ("symlink_suffix", &self.symlink_suffix),
        ] {
            if value.is_empty() {
                return Err(AppError::Config(format!("{} is empty", name)));
            }
        }
        Ok(())
    }

    pub fn index_root(&self) -> PathBuf {
        self.storage_root.join(&self.index_dir_name)
    }

    pub fn deferred_index_root(&self) -> PathBuf {
        self.deferred_storage_root.join(&self.index_dir_name)
    }

    pub fn minimum_symlink_age(&self) -> Duration {
        Duration::from_secs(self.minimum_symlink_age_secs)
    }

    pub fn processor_check_in(&self) -> Duration {
        Duration::from_secs(self.processor_check_in_secs)
    }

    pub fn standard_loop_delay(&self) -> Duration {
        Duration::from_secs(self.standard_loop_delay_secs)
    }

    pub fn priority_loop_delay(&self) -> Duration {
        Duration::from_secs(self.priority_loop_delay_secs)
    }

    pub fn cleanup_jobs_loop_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_jobs_loop_delay_secs)
    }

    pub fn cleanup_directory_loop_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_directory_loop_delay_secs)
    }

    pub fn date_dir_delta(&self) -> Duration {
        Duration::from_secs(self.date_dir_delta_secs)
    }

    pub fn dump_dir_delta(&self) -> Duration {
        Duration::from_secs(self.dump_dir_delta_secs)
    }

    /// Heartbeat cutoff: processors last seen before this are dead
    pub fn check_in_threshold_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(duration_ms(self.processor_check_in()))
    }
}

/// Whole milliseconds of `duration`, saturating at `i64::MAX`
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
