//! Working-database directories under the harness's temp root.
//!
//! The sync binary creates one timestamped directory per run under the
//! root passed as `--db-tmp`, each holding an `archive/` and a `live/`
//! store. The harness only locates and removes them.

use crate::errors::{HarnessError, HarnessResult};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A directory holding an `archive` and a `live` store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDatabase {
    path: PathBuf,
}

impl WorkingDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn archive(&self) -> PathBuf {
        self.path.join("archive")
    }

    pub fn live(&self) -> PathBuf {
        self.path.join("live")
    }
}

/// Owns the temp root for one harness run.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a file kept directly in the root (logs, snapshots).
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Remove anything left by an earlier run and create an empty root.
    pub fn prepare(&self) -> HarnessResult<()> {
        if self.root.exists() {
            tracing::info!(root = %self.root.display(), "removing stale work directory");
            std::fs::remove_dir_all(&self.root).map_err(|source| self.error(source))?;
        }
        std::fs::create_dir_all(&self.root).map_err(|source| self.error(source))
    }

    /// The most recently modified directory directly under the root.
    pub fn locate_current(&self) -> HarnessResult<WorkingDatabase> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| self.error(source))?;

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|source| self.error(source))?;
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_dir() => meta,
                _ => continue,
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let candidate = (modified, entry.path());
            if newest.as_ref().is_none_or(|best| candidate > *best) {
                newest = Some(candidate);
            }
        }

        newest
            .map(|(_, path)| WorkingDatabase::new(path))
            .ok_or_else(|| HarnessError::NoWorkingDatabase {
                root: self.root.clone(),
            })
    }

    /// Best-effort removal of a superseded working database.
    pub fn discard(&self, db: &WorkingDatabase) -> bool {
        match std::fs::remove_dir_all(db.path()) {
            Ok(()) => {
                tracing::debug!(path = %db.path().display(), "removed superseded working database");
                true
            }
            Err(e) => {
                tracing::warn!(path = %db.path().display(), error = %e, "failed to remove superseded working database");
                false
            }
        }
    }

    /// Best-effort removal of every working database except `keep`.
    pub fn remove_stale(&self, keep: &WorkingDatabase) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .map(|e| WorkingDatabase::new(e.path()))
            .filter(|db| db != keep)
            .filter(|db| self.discard(db))
            .count()
    }

    /// Remove the whole root. Errors are logged, not returned.
    pub fn cleanup(&self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "failed to remove work directory")
            }
        }
    }

    fn error(&self, source: std::io::Error) -> HarnessError {
        HarnessError::Workspace {
            path: self.root.clone(),
            source,
        }
    }
}

/// Removes the temp root when dropped, whatever path led there.
pub struct WorkspaceGuard<'a> {
    manager: &'a WorkspaceManager,
}

impl<'a> WorkspaceGuard<'a> {
    pub fn new(manager: &'a WorkspaceManager) -> Self {
        Self { manager }
    }
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        self.manager.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_db(root: &Path, name: &str) -> WorkingDatabase {
        let path = root.join(name);
        fs::create_dir_all(path.join("archive")).unwrap();
        fs::create_dir_all(path.join("live")).unwrap();
        WorkingDatabase::new(path)
    }

    #[test]
    fn test_prepare_clears_previous_contents() {
        let dir = tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path().join("db-heal-test"));
        ws.prepare().unwrap();
        make_db(ws.root(), "state_db_old");
        fs::write(ws.file("sync.log"), "old").unwrap();

        ws.prepare().unwrap();
        assert!(ws.root().exists());
        assert_eq!(fs::read_dir(ws.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_locate_current_picks_newest_dir_and_ignores_files() {
        let dir = tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        make_db(dir.path(), "state_db_a");
        std::thread::sleep(Duration::from_millis(20));
        let newest = make_db(dir.path(), "state_db_b");
        std::thread::sleep(Duration::from_millis(20));
        fs::write(ws.file("sync.log"), "newer file").unwrap();

        assert_eq!(ws.locate_current().unwrap(), newest);
    }

    #[test]
    fn test_locate_current_without_dirs_is_error() {
        let dir = tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        fs::write(ws.file("sync.log"), "").unwrap();
        assert!(matches!(
            ws.locate_current(),
            Err(HarnessError::NoWorkingDatabase { .. })
        ));
    }

    #[test]
    fn test_working_database_layout() {
        let db = WorkingDatabase::new("/tmp/root/state_db_1");
        assert_eq!(db.archive(), PathBuf::from("/tmp/root/state_db_1/archive"));
        assert_eq!(db.live(), PathBuf::from("/tmp/root/state_db_1/live"));
    }

    #[test]
    fn test_discard_is_best_effort() {
        let dir = tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        let db = make_db(dir.path(), "state_db_a");
        assert!(ws.discard(&db));
        assert!(!db.path().exists());
        assert!(!ws.discard(&db));
    }

    #[test]
    fn test_remove_stale_keeps_current() {
        let dir = tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        make_db(dir.path(), "a");
        make_db(dir.path(), "b");
        let keep = make_db(dir.path(), "c");
        fs::write(ws.file("snapshot.dat"), "x").unwrap();

        assert_eq!(ws.remove_stale(&keep), 2);
        assert!(keep.path().exists());
        assert!(ws.file("snapshot.dat").exists());
    }

    #[test]
    fn test_guard_removes_root_on_drop() {
        let dir = tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path().join("db-heal-test"));
        ws.prepare().unwrap();
        make_db(ws.root(), "state_db");
        {
            let _guard = WorkspaceGuard::new(&ws);
        }
        assert!(!ws.root().exists());
        // Cleaning an already removed root is harmless.
        ws.cleanup();
    }
}
