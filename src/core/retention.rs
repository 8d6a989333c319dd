/// Retention of database backup artifacts
///
/// Only entries named exactly like an artifact of the given database are
/// considered: `<database>_<YYYYMMDD_HHMMSS>.sql|.dump` files and
/// `<database>_<YYYYMMDD_HHMMSS>` directories. The newest `keep` by modification
/// time survive.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::core::error::BackupResult;
use crate::utils::is_backup_timestamp;

/// Whether `file_name` is an artifact of `database`
pub fn is_artifact_of(file_name: &str, database: &str, is_dir: bool) -> bool {
    let Some(rest) = file_name
        .strip_prefix(database)
        .and_then(|r| r.strip_prefix('_'))
    else {
        return false;
    };

    if is_dir {
        return is_backup_timestamp(rest);
    }

    match rest.rsplit_once('.') {
        Some((stamp, "sql" | "dump")) => is_backup_timestamp(stamp),
        _ => false,
    }
}

/// Artifacts of `database` under `backup_path`, newest first
pub fn list_artifacts(backup_path: &Path, database: &str) -> BackupResult<Vec<PathBuf>> {
    if !backup_path.exists() {
        return Ok(Vec::new());
    }

    let mut artifacts: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(backup_path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let name = entry.file_name().to_string_lossy().to_string();

        if is_artifact_of(&name, database, meta.is_dir()) {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            artifacts.push((entry.path(), modified));
        }
    }

    artifacts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    Ok(artifacts.into_iter().map(|(path, _)| path).collect())
}

/// Delete all but the `keep` newest artifacts of `database`; returns what was removed
pub fn prune(backup_path: &Path, database: &str, keep: usize) -> BackupResult<Vec<PathBuf>> {
    let artifacts = list_artifacts(backup_path, database)?;
    let mut removed = Vec::new();

    for path in artifacts.into_iter().skip(keep) {
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };

        match result {
            Ok(()) => {
                tracing::info!("Removed old backup: {}", path.display());
                removed.push(path);
            }
            Err(e) => tracing::error!("Failed to remove {}: {}", path.display(), e),
        }
    }

    if !removed.is_empty() {
        tracing::info!("Removed {} old backups of database {}", removed.len(), database);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    #[test]
    fn test_artifact_name_matching() {
        assert!(is_artifact_of("shop_20240102_030405.sql", "shop", false));
        assert!(is_artifact_of("shop_20240102_030405.dump", "shop", false));
        assert!(is_artifact_of("shop_20240102_030405", "shop", true));

        assert!(!is_artifact_of("shop_20240102_030405", "shop", false));
        assert!(!is_artifact_of("shop_20240102_030405.tar", "shop", false));
        assert!(!is_artifact_of("shop_archive_20240102_030405.sql", "shop", false));
        assert!(!is_artifact_of("shopping_20240102_030405.sql", "shop", false));
        assert!(!is_artifact_of("shop_20240102_030405.sql", "shop_archive", false));
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let names = [
            "shop_20240101_000000.sql",
            "shop_20240102_000000.sql",
            "shop_20240103_000000.sql",
            "shop_20240104_000000.sql",
            "shop_20240105_000000.sql",
        ];
        // oldest first: the first name is 500s old, the last 100s
        let paths: Vec<PathBuf> = names
            .iter()
            .enumerate()
            .map(|(i, n)| touch(dir.path(), n, 500 - i as u64 * 100))
            .collect();

        let removed = prune(dir.path(), "shop", 3).unwrap();

        assert_eq!(removed.len(), 2);
        assert!(!paths[0].exists());
        assert!(!paths[1].exists());
        for kept in &paths[2..] {
            assert!(kept.exists());
        }
    }

    #[test]
    fn test_prune_ignores_other_databases_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "shop_20240101_000000.sql", 300);
        touch(dir.path(), "shop_20240102_000000.sql", 200);
        let other = touch(dir.path(), "shop_archive_20230101_000000.sql", 900);
        let notes = touch(dir.path(), "shop_notes.txt", 900);

        let removed = prune(dir.path(), "shop", 1).unwrap();

        assert_eq!(removed.len(), 1);
        assert!(other.exists());
        assert!(notes.exists());
    }

    #[test]
    fn test_prune_handles_mongodb_directories() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("events_20240101_000000");
        fs::create_dir_all(old.join("events")).unwrap();
        fs::write(old.join("events").join("log.bson"), b"x").unwrap();
        File::open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(1000))
            .unwrap();

        let new = dir.path().join("events_20240102_000000");
        fs::create_dir_all(new.join("events")).unwrap();

        let removed = prune(dir.path(), "events", 1).unwrap();

        assert_eq!(removed, vec![old.clone()]);
        assert!(!old.exists());
        assert!(new.exists());
    }

    #[test]
    fn test_prune_below_retention_removes_nothing() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "shop_20240101_000000.dump", 10);

        assert!(prune(dir.path(), "shop", 3).unwrap().is_empty());
        assert!(prune(&dir.path().join("missing"), "shop", 3)
            .unwrap()
            .is_empty());
    }
}
