//! Test harness for end-to-end monitor scenarios.
//!
//! `TestHarness` provides a temporary storage tree (primary, deferred and
//! archive roots), a migrated SQLite database file, and the real adapters
//! wired the way the daemon wires them.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crashmon_core::application::MonitorConfig;
use crashmon_core::port::time_provider::SystemTimeProvider;
use crashmon_core::port::{QueueSession, TimeProvider};
use crashmon_infra_sqlite::{create_pool, run_migrations, ConnectionPool};
use crashmon_infra_system::LocalCrashStorage;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Paths of one crash written by the harness
pub struct Crash {
    pub link: PathBuf,
    pub json: PathBuf,
    pub dump: PathBuf,
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub database_url: String,
    /// Direct access for seeding and inspecting rows
    pub pool: SqlitePool,
    pub db: Arc<ConnectionPool>,
    pub storage: Arc<LocalCrashStorage>,
    pub config: MonitorConfig,
}

impl TestHarness {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();
        let database_url = format!("sqlite://{}", base.join("queue.db").display());

        let config = MonitorConfig {
            storage_root: base.join("standard"),
            deferred_storage_root: base.join("deferred"),
            save_minidumps_to: base.join("archive"),
            minimum_symlink_age_secs: 0,
            ..Default::default()
        };
        fs::create_dir_all(config.index_root()).unwrap();
        fs::create_dir_all(config.deferred_index_root()).unwrap();

        let pool = create_pool(&database_url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let db = Arc::new(ConnectionPool::new(&database_url).unwrap());

        Self {
            temp_dir,
            database_url,
            pool,
            db,
            storage: Arc::new(LocalCrashStorage::new()),
            config,
        }
    }

    pub fn clock(&self) -> Arc<dyn TimeProvider> {
        Arc::new(SystemTimeProvider)
    }

    pub fn now_ms(&self) -> i64 {
        SystemTimeProvider.now_millis()
    }

    pub async fn session(&self, identity: &str) -> Box<dyn QueueSession> {
        use crashmon_core::port::QueueDatabase;
        self.db.session(identity).await.unwrap()
    }

    /// Register a processor heartbeat and create its hand-off table
    pub async fn add_processor(&self, id: i64, last_seen_ms: i64) {
        sqlx::query("INSERT INTO processors (id, lastSeenDateTime) VALUES (?, ?)")
            .bind(id)
            .bind(last_seen_ms)
            .execute(&self.pool)
            .await
            .unwrap();
        sqlx::query(&format!(
            "CREATE TABLE priority_jobs_{} (uuid TEXT NOT NULL)",
            id
        ))
        .execute(&self.pool)
        .await
        .unwrap();
    }

    pub async fn add_live_processor(&self, id: i64) {
        self.add_processor(id, self.now_ms()).await;
    }

    /// Write `<uuid>.json`/`<uuid>.dump` under `<root>/name/<date>` and a
    /// relative `<uuid>.symlink` under `<root>/index/<date>/<hour>`
    pub fn add_crash(&self, root: &Path, date: &str, uuid: &str) -> Crash {
        let artifacts = root.join("name").join(date);
        let index = root.join("index").join(date).join("12");
        fs::create_dir_all(&artifacts).unwrap();
        fs::create_dir_all(&index).unwrap();

        let json = artifacts.join(format!("{}.json", uuid));
        let dump = artifacts.join(format!("{}.dump", uuid));
        fs::write(&json, br#"{"ProductName": "Firefox"}"#).unwrap();
        fs::write(&dump, b"MDMP").unwrap();

        let link = index.join(format!("{}.symlink", uuid));
        symlink(format!("../../../name/{}/{}.json", date, uuid), &link).unwrap();
        Crash { link, json, dump }
    }

    pub fn add_standard_crash(&self, uuid: &str) -> Crash {
        let root = self.config.storage_root.clone();
        self.add_crash(&root, "20240101", uuid)
    }

    pub async fn flag_priority(&self, uuid: &str) {
        sqlx::query("INSERT INTO priorityJobs (uuid) VALUES (?)")
            .bind(uuid)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    pub async fn priority_flags(&self) -> Vec<String> {
        sqlx::query_scalar("SELECT uuid FROM priorityJobs")
            .fetch_all(&self.pool)
            .await
            .unwrap()
    }

    pub async fn handed_off(&self, processor: i64) -> Vec<String> {
        sqlx::query_scalar(&format!("SELECT uuid FROM priority_jobs_{}", processor))
            .fetch_all(&self.pool)
            .await
            .unwrap()
    }

    /// (uuid, owner, priority) for every job row
    pub async fn jobs(&self) -> Vec<(String, i64, i32)> {
        sqlx::query_as("SELECT uuid, owner, priority FROM jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .unwrap()
    }

    /// Insert a row directly, as if a processor had finished it
    pub async fn add_finished_job(&self, crash: &Crash, uuid: &str, owner: i64, success: bool) {
        sqlx::query(
            "INSERT INTO jobs (pathname, uuid, owner, priority, queuedDateTime, success) VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(crash.json.display().to_string())
        .bind(uuid)
        .bind(owner)
        .bind(self.now_ms())
        .bind(success)
        .execute(&self.pool)
        .await
        .unwrap();
    }
}
