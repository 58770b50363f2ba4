//! Ensure only one calcard-server instance serves a given database file.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// A lock guard that releases the lock when dropped
pub struct LockGuard {
    _file: File,
}

fn lock_path(database: &Path) -> PathBuf {
    let mut name = database.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    database.with_file_name(name)
}

/// Acquire an exclusive lock beside `database`, failing if another instance holds it
pub fn acquire_lock(database: &Path) -> Result<LockGuard> {
    let path = lock_path(database);
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let file = File::create(&path).context("Failed to create lock file")?;

    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "Another calcard-server instance is already serving {}.\n\
            If you believe this is an error, remove: {}",
            database.display(),
            path.display()
        )
    })?;

    Ok(LockGuard { _file: file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_on_same_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("calcard.sqlite3");

        let first = acquire_lock(&database).unwrap();
        assert!(acquire_lock(&database).is_err());
        drop(first);
        assert!(acquire_lock(&database).is_ok());
    }

    #[test]
    fn test_lock_sits_beside_database() {
        assert_eq!(
            lock_path(Path::new("/var/lib/calcard/calcard.sqlite3")),
            PathBuf::from("/var/lib/calcard/calcard.sqlite3.lock")
        );
    }
}
