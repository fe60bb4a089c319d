// Crash Storage Port (filesystem holding the index trees and artifacts)

use crate::application::shutdown::ShutdownToken;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Snapshot of one directory seen by the directory cleanup walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryInfo {
    pub path: PathBuf,
    pub is_empty: bool,
    pub modified_ms: i64,
}

/// Filesystem operations needed by the monitor
#[async_trait]
pub trait CrashStorage: Send + Sync {
    /// Depth-first list of index entries under `index_root` whose file name
    /// ends with `suffix`. Fails if the tree cannot be enumerated, or with
    /// `Cancelled` as soon as `token` is shut down mid-walk.
    async fn index_entries(
        &self,
        index_root: &Path,
        suffix: &str,
        token: &ShutdownToken,
    ) -> Result<Vec<PathBuf>>;

    /// Modification time of the entry's target in epoch ms, `None` when
    /// the link target is missing
    async fn entry_modified_ms(&self, link: &Path) -> Result<Option<i64>>;

    /// Absolute, normalized path the link points to
    async fn resolve_entry(&self, link: &Path) -> Result<PathBuf>;

    /// Search every directory of `index_root` for an entry named `file_name`
    async fn find_index_entry(
        &self,
        index_root: &Path,
        file_name: &str,
        token: &ShutdownToken,
    ) -> Result<Option<PathBuf>>;

    /// Whether the artifact exists
    async fn artifact_exists(&self, path: &Path) -> bool;

    /// Delete an index entry (the link itself, never its target)
    async fn remove_entry(&self, link: &Path) -> Result<()>;

    async fn delete_file(&self, path: &Path) -> Result<()>;

    async fn move_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Every directory under `root` (root included), children before parents
    async fn directories_bottom_up(
        &self,
        root: &Path,
        token: &ShutdownToken,
    ) -> Result<Vec<DirectoryInfo>>;

    /// Remove an empty directory
    async fn remove_directory(&self, path: &Path) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct MockStorageState {
        /// link -> (target, modified_ms); target may be absent from `files`
        pub links: BTreeMap<PathBuf, (PathBuf, i64)>,
        pub files: HashSet<PathBuf>,
        pub directories: Vec<DirectoryInfo>,
        pub removed_directories: Vec<PathBuf>,
        /// from -> to
        pub moves: HashMap<PathBuf, PathBuf>,
        /// Paths whose deletion or move fails
        pub failing_paths: HashSet<PathBuf>,
        pub index_unreadable: bool,
    }

    /// In-memory storage tree
    #[derive(Clone, Default)]
    pub struct MockCrashStorage {
        pub state: Arc<Mutex<MockStorageState>>,
    }

    impl MockCrashStorage {
        pub fn new() -> Self {
            Self::default()
        }

        /// Add `<dir>/<uuid>.symlink` pointing at `<artifact_dir>/<uuid>.json`
        /// and create the json and dump files
        pub fn add_crash(&self, index_dir: &str, artifact_dir: &str, uuid: &str, modified_ms: i64) {
            let mut state = self.state.lock().unwrap();
            let link = PathBuf::from(index_dir).join(format!("{}.symlink", uuid));
            let json = PathBuf::from(artifact_dir).join(format!("{}.json", uuid));
            let dump = PathBuf::from(artifact_dir).join(format!("{}.dump", uuid));
            state.files.insert(json.clone());
            state.files.insert(dump);
            state.links.insert(link, (json, modified_ms));
        }

        pub fn has_link(&self, link: &Path) -> bool {
            self.state.lock().unwrap().links.contains_key(link)
        }

        pub fn has_file(&self, path: &Path) -> bool {
            self.state.lock().unwrap().files.contains(path)
        }

        pub fn with_state<R>(&self, f: impl FnOnce(&mut MockStorageState) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }
    }

    #[async_trait]
    impl CrashStorage for MockCrashStorage {
        async fn index_entries(
            &self,
            index_root: &Path,
            suffix: &str,
            token: &ShutdownToken,
        ) -> Result<Vec<PathBuf>> {
            token.check()?;
            let state = self.state.lock().unwrap();
            if state.index_unreadable {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "index unreadable",
                )));
            }
            Ok(state
                .links
                .keys()
                .filter(|l| l.starts_with(index_root))
                .filter(|l| l.to_string_lossy().ends_with(suffix))
                .cloned()
                .collect())
        }

        async fn entry_modified_ms(&self, link: &Path) -> Result<Option<i64>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .links
                .get(link)
                .filter(|(target, _)| state.files.contains(target))
                .map(|(_, modified)| *modified))
        }

        async fn resolve_entry(&self, link: &Path) -> Result<PathBuf> {
            self.state
                .lock()
                .unwrap()
                .links
                .get(link)
                .map(|(target, _)| target.clone())
                .ok_or_else(|| {
                    AppError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no such link: {}", link.display()),
                    ))
                })
        }

        async fn find_index_entry(
            &self,
            index_root: &Path,
            file_name: &str,
            token: &ShutdownToken,
        ) -> Result<Option<PathBuf>> {
            token.check()?;
            let state = self.state.lock().unwrap();
            Ok(state
                .links
                .keys()
                .find(|l| {
                    l.starts_with(index_root)
                        && l.file_name().and_then(|n| n.to_str()) == Some(file_name)
                })
                .cloned())
        }

        async fn artifact_exists(&self, path: &Path) -> bool {
            self.state.lock().unwrap().files.contains(path)
        }

        async fn remove_entry(&self, link: &Path) -> Result<()> {
            self.state.lock().unwrap().links.remove(link);
            Ok(())
        }

        async fn delete_file(&self, path: &Path) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.failing_paths.contains(path) || !state.files.remove(path) {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot delete {}", path.display()),
                )));
            }
            Ok(())
        }

        async fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.failing_paths.contains(from) || !state.files.remove(from) {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot move {}", from.display()),
                )));
            }
            state.files.insert(to.to_path_buf());
            state.moves.insert(from.to_path_buf(), to.to_path_buf());
            Ok(())
        }

        async fn directories_bottom_up(
            &self,
            root: &Path,
            token: &ShutdownToken,
        ) -> Result<Vec<DirectoryInfo>> {
            token.check()?;
            Ok(self
                .state
                .lock()
                .unwrap()
                .directories
                .iter()
                .filter(|d| d.path.starts_with(root))
                .cloned()
                .collect())
        }

        async fn remove_directory(&self, path: &Path) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.failing_paths.contains(path) {
                return Err(AppError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    format!("cannot remove {}", path.display()),
                )));
            }
            state.directories.retain(|d| d.path != path);
            state.removed_directories.push(path.to_path_buf());
            Ok(())
        }
    }
}
