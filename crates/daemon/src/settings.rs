// Daemon settings: defaults <- TOML file <- CRASHMON__* environment

use config::{Config, ConfigError, Environment, File, FileFormat};
use crashmon_core::application::MonitorConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// sqlx SQLite url, e.g. `sqlite:///var/crashmon/queue.db`
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://crashmon.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Development: pretty formatting with colors
    #[default]
    Pretty,
    /// Production: JSON structured logging
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub format: LogFormat,
    /// Used when RUST_LOG is not set
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "crashmon=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub monitor: MonitorConfig,
    pub log: LogSettings,
}

impl Settings {
    /// Load settings; the file is optional unless `required`
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix("CRASHMON")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashmon_core::application::SchedulingMode;
    use std::path::PathBuf;

    #[test]
    fn test_missing_optional_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml"), false).unwrap();
        assert_eq!(settings.database.url, "sqlite://crashmon.db");
        assert_eq!(settings.monitor.json_file_suffix, ".json");
        assert_eq!(settings.log.format, LogFormat::Pretty);
    }

    #[test]
    fn test_missing_required_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Settings::load(&dir.path().join("absent.toml"), true).is_err());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("crashmon.toml");
        std::fs::write(
            &path,
            r#"
[database]
url = "sqlite:///tmp/queue.db"

[monitor]
storage_root = "/data/crashes"
minimum_symlink_age_secs = 5
save_failed_minidumps = true
scheduling = "unbalanced"

[log]
format = "json"
"#,
        )
        .unwrap();

        let settings = Settings::load(&path, true).unwrap();
        assert_eq!(settings.database.url, "sqlite:///tmp/queue.db");
        assert_eq!(settings.monitor.storage_root, PathBuf::from("/data/crashes"));
        assert_eq!(settings.monitor.minimum_symlink_age_secs, 5);
        assert!(settings.monitor.save_failed_minidumps);
        assert_eq!(settings.monitor.scheduling, SchedulingMode::Unbalanced);
        // untouched keys keep their defaults
        assert_eq!(settings.monitor.dump_file_suffix, ".dump");
        assert_eq!(settings.log.format, LogFormat::Json);
    }
}
