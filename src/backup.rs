//! Backup guard around a single file mutation
//!
//! Before a fix touches a file, its bytes are snapshotted in memory and copied
//! to a sibling `<file>.backup`. If the mutation fails (or unwinds), the
//! snapshot is written back. On success the `.backup` file is left on disk as
//! an audit trail.

use crate::error::{FixError, FixResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const BACKUP_SUFFIX: &str = "backup";

/// Path of the sibling backup file: `calc.py` -> `calc.py.backup`.
pub fn backup_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Scoped snapshot of one file.
///
/// Dropping an armed guard restores the original bytes, so every exit path
/// out of a mutation either commits or rolls back.
#[derive(Debug)]
pub struct BackupGuard {
    target: PathBuf,
    backup_path: PathBuf,
    original: Vec<u8>,
    armed: bool,
}

impl BackupGuard {
    /// Snapshot `target` and write `<target>.backup`.
    pub fn acquire(target: &Path) -> FixResult<Self> {
        if !target.is_file() {
            return Err(FixError::FileNotFound(target.to_path_buf()));
        }

        let original = fs::read(target).map_err(|e| FixError::io(target, e))?;
        let backup_path = backup_path_for(target);
        fs::write(&backup_path, &original).map_err(|e| FixError::io(&backup_path, e))?;
        debug!(file = %target.display(), "backup created");

        Ok(Self {
            target: target.to_path_buf(),
            backup_path,
            original,
            armed: true,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Original file contents as text (lossy for non-UTF-8 bytes).
    pub fn original_text(&self) -> String {
        String::from_utf8_lossy(&self.original).into_owned()
    }

    /// Keep the mutation. The `.backup` file stays for auditing.
    pub fn commit(mut self) {
        self.armed = false;
    }

    /// Write the snapshot back over the target.
    pub fn restore(mut self) -> FixResult<()> {
        self.armed = false;
        self.write_back()
    }

    fn write_back(&self) -> FixResult<()> {
        fs::write(&self.target, &self.original).map_err(|source| FixError::Restore {
            path: self.target.clone(),
            source,
        })?;
        debug!(file = %self.target.display(), "restored from backup");
        Ok(())
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.write_back() {
                warn!(file = %self.target.display(), error = %err, "restore on drop failed");
            }
        }
    }
}

/// Run `mutate` against `target` under a backup guard.
///
/// A mutation error restores the file and is returned as-is; a failed restore
/// is returned instead, since the file is then in an unknown state.
pub fn guarded<T>(target: &Path, mutate: impl FnOnce(&Path) -> FixResult<T>) -> FixResult<T> {
    let guard = BackupGuard::acquire(target)?;
    match mutate(guard.target()) {
        Ok(value) => {
            guard.commit();
            Ok(value)
        }
        Err(err) => {
            warn!(
                file = %target.display(),
                backup = %guard.backup_path().display(),
                error = %err,
                "mutation failed, restoring backup"
            );
            guard.restore()?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_backup_path_appends_suffix() {
        assert_eq!(
            backup_path_for(Path::new("tests/math.py")),
            PathBuf::from("tests/math.py.backup")
        );
    }

    #[test]
    fn test_failed_mutation_restores_exact_bytes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("calc.py");
        fs::write(&file, "class Calc:\n\tpass\n").unwrap();

        let result: FixResult<()> = guarded(&file, |path| {
            fs::write(path, "garbage").unwrap();
            Err(FixError::apply(path, "boom"))
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&file).unwrap(), "class Calc:\n\tpass\n");
    }

    #[test]
    fn test_success_keeps_backup_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("calc.py");
        fs::write(&file, "old\n").unwrap();

        guarded(&file, |path| fs::write(path, "new\n").map_err(|e| FixError::io(path, e))).unwrap();

        assert_eq!(fs::read_to_string(&file).unwrap(), "new\n");
        assert_eq!(fs::read_to_string(backup_path_for(&file)).unwrap(), "old\n");
    }

    #[test]
    fn test_drop_without_commit_restores() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("calc.py");
        fs::write(&file, "old\n").unwrap();

        {
            let _guard = BackupGuard::acquire(&file).unwrap();
            fs::write(&file, "half-written").unwrap();
        }

        assert_eq!(fs::read_to_string(&file).unwrap(), "old\n");
    }

    #[test]
    fn test_missing_file_is_file_not_found() {
        let dir = tempdir().unwrap();
        let err = BackupGuard::acquire(&dir.path().join("nope.py")).unwrap_err();
        assert!(matches!(err, FixError::FileNotFound(_)));
    }
}
