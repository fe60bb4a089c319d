// Local filesystem CrashStorage
// Tree walks run on the blocking pool; single-file operations use tokio::fs.

use crate::path_utils::resolve_link_target;
use async_trait::async_trait;
use crashmon_core::application::ShutdownToken;
use crashmon_core::error::{AppError, Result};
use crashmon_core::port::{CrashStorage, DirectoryInfo};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Crash storage on a locally mounted filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalCrashStorage;

impl LocalCrashStorage {
    pub fn new() -> Self {
        Self
    }
}

fn millis(time: SystemTime) -> i64 {
    chrono::DateTime::<chrono::Utc>::from(time).timestamp_millis()
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("blocking task failed: {}", e)))?
}

/// Errors below the root are logged and skipped; an unreadable root fails
fn walk_error(root: &Path, err: walkdir::Error) -> Result<()> {
    if err.depth() == 0 {
        return Err(AppError::Io(err.into_io_error().unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::Other, format!("cannot walk {}", root.display()))
        })));
    }
    warn!(root = %root.display(), error = %err, "Skipping unreadable entry");
    Ok(())
}

fn list_index_entries(root: &Path, suffix: &str, token: &ShutdownToken) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        token.check()?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                walk_error(root, e)?;
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(suffix));
        if matches {
            entries.push(entry.into_path());
        }
    }
    Ok(entries)
}

fn search_index(root: &Path, file_name: &str, token: &ShutdownToken) -> Result<Option<PathBuf>> {
    for entry in WalkDir::new(root).follow_links(false) {
        token.check()?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                walk_error(root, e)?;
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let candidate = entry.path().join(file_name);
        if candidate.symlink_metadata().is_ok() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn list_directories(root: &Path, token: &ShutdownToken) -> Result<Vec<DirectoryInfo>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).contents_first(true) {
        token.check()?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                walk_error(root, e)?;
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let info = fs::read_dir(entry.path()).and_then(|mut children| {
            let modified = entry.metadata().map_err(io::Error::from)?.modified()?;
            Ok(DirectoryInfo {
                path: entry.path().to_path_buf(),
                is_empty: children.next().is_none(),
                modified_ms: millis(modified),
            })
        });
        match info {
            Ok(info) => dirs.push(info),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Cannot inspect directory"),
        }
    }
    Ok(dirs)
}

#[async_trait]
impl CrashStorage for LocalCrashStorage {
    async fn index_entries(
        &self,
        index_root: &Path,
        suffix: &str,
        token: &ShutdownToken,
    ) -> Result<Vec<PathBuf>> {
        let root = index_root.to_path_buf();
        let suffix = suffix.to_string();
        let token = token.clone();
        blocking(move || list_index_entries(&root, &suffix, &token)).await
    }

    async fn entry_modified_ms(&self, link: &Path) -> Result<Option<i64>> {
        // Follows the link: a dangling link has no metadata
        match tokio::fs::metadata(link).await {
            Ok(meta) => Ok(Some(millis(meta.modified()?))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_entry(&self, link: &Path) -> Result<PathBuf> {
        let target = tokio::fs::read_link(link).await?;
        Ok(resolve_link_target(link, &target))
    }

    async fn find_index_entry(
        &self,
        index_root: &Path,
        file_name: &str,
        token: &ShutdownToken,
    ) -> Result<Option<PathBuf>> {
        let root = index_root.to_path_buf();
        let file_name = file_name.to_string();
        let token = token.clone();
        blocking(move || search_index(&root, &file_name, &token)).await
    }

    async fn artifact_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn remove_entry(&self, link: &Path) -> Result<()> {
        debug!(link = %link.display(), "Removing index entry");
        tokio::fs::remove_file(link).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(rename_err) = tokio::fs::rename(from, to).await {
            if !tokio::fs::try_exists(from).await.unwrap_or(false) {
                return Err(rename_err.into());
            }
            // Different filesystem: copy, then remove the original
            debug!(from = %from.display(), to = %to.display(), error = %rename_err, "Rename failed, copying");
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await?;
        }
        Ok(())
    }

    async fn directories_bottom_up(
        &self,
        root: &Path,
        token: &ShutdownToken,
    ) -> Result<Vec<DirectoryInfo>> {
        let root = root.to_path_buf();
        let token = token.clone();
        blocking(move || list_directories(&root, &token)).await
    }

    async fn remove_directory(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_dir(path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crashmon_core::application::shutdown_channel;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// `<root>/name/ab/<uuid>.json|.dump` plus a relative link in `<root>/index/day`
    fn add_crash(root: &Path, uuid: &str) -> (PathBuf, PathBuf) {
        let artifacts = root.join("name").join("ab");
        let index = root.join("index").join("day");
        fs::create_dir_all(&artifacts).unwrap();
        fs::create_dir_all(&index).unwrap();
        let json = artifacts.join(format!("{}.json", uuid));
        fs::write(&json, b"{}").unwrap();
        fs::write(artifacts.join(format!("{}.dump", uuid)), b"MDMP").unwrap();
        let link = index.join(format!("{}.symlink", uuid));
        symlink(format!("../../name/ab/{}.json", uuid), &link).unwrap();
        (link, json)
    }

    #[tokio::test]
    async fn test_index_walk_and_resolution() {
        let dir = TempDir::new().unwrap();
        let (_sender, token) = shutdown_channel();
        let (link, json) = add_crash(dir.path(), "abc123");
        fs::write(dir.path().join("index").join("day").join("notes.txt"), b"").unwrap();
        let storage = LocalCrashStorage::new();

        let entries = storage
            .index_entries(&dir.path().join("index"), ".symlink", &token)
            .await
            .unwrap();
        assert_eq!(entries, vec![link.clone()]);

        assert_eq!(storage.resolve_entry(&link).await.unwrap(), json);
        assert!(storage.entry_modified_ms(&link).await.unwrap().is_some());
        assert!(storage.artifact_exists(&json).await);
    }

    #[tokio::test]
    async fn test_dangling_link_has_no_age_and_can_be_removed() {
        let dir = TempDir::new().unwrap();
        let (link, json) = add_crash(dir.path(), "gone");
        fs::remove_file(&json).unwrap();
        let storage = LocalCrashStorage::new();

        assert_eq!(storage.entry_modified_ms(&link).await.unwrap(), None);
        storage.remove_entry(&link).await.unwrap();
        assert!(link.symlink_metadata().is_err());
    }

    #[tokio::test]
    async fn test_missing_index_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (_sender, token) = shutdown_channel();
        let storage = LocalCrashStorage::new();
        assert!(storage
            .index_entries(&dir.path().join("nope"), ".symlink", &token)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_find_index_entry_searches_every_directory() {
        let dir = TempDir::new().unwrap();
        let (_sender, token) = shutdown_channel();
        let (link, _) = add_crash(dir.path(), "wanted");
        let storage = LocalCrashStorage::new();
        let index = dir.path().join("index");

        let found = storage
            .find_index_entry(&index, "wanted.symlink", &token)
            .await
            .unwrap();
        assert_eq!(found, Some(link));
        assert_eq!(
            storage
                .find_index_entry(&index, "other.symlink", &token)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_move_file_into_archive() {
        let dir = TempDir::new().unwrap();
        let (_, json) = add_crash(dir.path(), "old");
        let target = dir.path().join("archive").join("old.json.failed");
        let storage = LocalCrashStorage::new();

        storage.move_file(&json, &target).await.unwrap();
        assert!(!json.exists());
        assert!(target.exists());
        assert!(storage.move_file(&json, &target).await.is_err());
    }

    #[tokio::test]
    async fn test_directories_listed_children_first() {
        let dir = TempDir::new().unwrap();
        let (_sender, token) = shutdown_channel();
        fs::create_dir_all(dir.path().join("a").join("b")).unwrap();
        fs::write(dir.path().join("a").join("file"), b"").unwrap();
        let storage = LocalCrashStorage::new();

        let dirs = storage
            .directories_bottom_up(dir.path(), &token)
            .await
            .unwrap();
        let paths: Vec<_> = dirs.iter().map(|d| d.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                dir.path().join("a").join("b"),
                dir.path().join("a"),
                dir.path().to_path_buf()
            ]
        );
        assert!(dirs[0].is_empty);
        assert!(!dirs[1].is_empty);

        assert!(storage.remove_directory(&dir.path().join("a")).await.is_err());
        storage
            .remove_directory(&dir.path().join("a").join("b"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_walks_stop_once_shutdown_requested() {
        let dir = TempDir::new().unwrap();
        add_crash(dir.path(), "pending");
        let index = dir.path().join("index");
        let storage = LocalCrashStorage::new();
        let (sender, token) = shutdown_channel();
        sender.shutdown();

        let entries = storage.index_entries(&index, ".symlink", &token).await;
        assert!(entries.unwrap_err().is_cancelled());

        let found = storage
            .find_index_entry(&index, "pending.symlink", &token)
            .await;
        assert!(found.unwrap_err().is_cancelled());

        let dirs = storage.directories_bottom_up(dir.path(), &token).await;
        assert!(dirs.unwrap_err().is_cancelled());
    }
}
