//! Directory-level atomic replace.
//!
//! A new version is staged in a hidden sibling (`.tmp-{name}-{pid}-{seq}`) and
//! swapped in with renames. The previous version is parked as
//! `.old-{name}-{pid}-{seq}` for the duration of the swap. Only names that do
//! not start with `.` are ever treated as committed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const STAGING_PREFIX: &str = ".tmp-";
const BACKUP_PREFIX: &str = ".old-";

static SEQ: AtomicU64 = AtomicU64::new(0);

fn unique_suffix() -> String {
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{seq}", std::process::id())
}

fn file_name(path: &Path) -> io::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))
}

/// Create an empty staging directory next to `target`.
pub fn staging_dir(target: &Path) -> io::Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
    fs::create_dir_all(parent)?;
    let staged = parent.join(format!("{STAGING_PREFIX}{}-{}", file_name(target)?, unique_suffix()));
    fs::create_dir(&staged)?;
    Ok(staged)
}

/// Replace `target` with `staged`.
///
/// Either the old or the new directory is at `target` afterwards, except for
/// a crash between the two renames, which [`recover`] repairs.
pub fn replace_dir(staged: &Path, target: &Path) -> io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;

    let backup = if target.exists() {
        let name = file_name(target)?;
        let backup = parent.join(format!("{BACKUP_PREFIX}{name}-{}", unique_suffix()));
        fs::rename(target, &backup)?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = fs::rename(staged, target) {
        if let Some(backup) = &backup {
            if let Err(restore) = fs::rename(backup, target) {
                tracing::error!(
                    target = %target.display(),
                    error = %restore,
                    "failed to restore previous version after swap failure"
                );
            }
        }
        return Err(e);
    }

    if let Some(backup) = backup {
        if let Err(e) = fs::remove_dir_all(&backup) {
            tracing::warn!(
                path = %backup.display(),
                error = %e,
                "failed to remove replaced version"
            );
        }
    }

    Ok(())
}

/// Remove a staging directory after a failed write.
pub fn discard(staged: &Path) {
    if let Err(e) = fs::remove_dir_all(staged) {
        tracing::warn!(path = %staged.display(), error = %e, "failed to remove staging directory");
    }
}

/// What [`recover`] did in one directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub staging_removed: usize,
    pub backups_restored: usize,
    pub backups_removed: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge(&mut self, other: RecoveryReport) {
        self.staging_removed += other.staging_removed;
        self.backups_restored += other.backups_restored;
        self.backups_removed += other.backups_removed;
    }
}

/// Strip `{prefix}` and the trailing `-{pid}-{seq}` from a hidden entry name.
fn original_name<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = name.strip_prefix(prefix)?;
    let mut parts = rest.rsplitn(3, '-');
    let _seq = parts.next()?;
    let _pid = parts.next()?;
    parts.next().filter(|n| !n.is_empty())
}

/// Clean up what interrupted swaps left behind in `dir`.
///
/// Staging directories are deleted. A backup whose original name is missing
/// was parked by a swap that never completed, so it is renamed back.
pub fn recover(dir: &Path) -> io::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    if !dir.is_dir() {
        return Ok(report);
    }

    let mut backups = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(STAGING_PREFIX) {
            fs::remove_dir_all(entry.path())?;
            report.staging_removed += 1;
        } else if name.starts_with(BACKUP_PREFIX) {
            backups.push((name, entry.path()));
        }
    }

    // Single writer: at most one backup per name is expected.
    backups.sort();
    for (name, path) in backups {
        let target = original_name(&name, BACKUP_PREFIX).map(|n| dir.join(n));
        match target {
            Some(target) if !target.exists() => {
                fs::rename(&path, &target)?;
                report.backups_restored += 1;
            }
            _ => {
                fs::remove_dir_all(&path)?;
                report.backups_removed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_swaps_in_new_version() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("SPY_2024");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("old.txt"), "old").unwrap();

        let staged = staging_dir(&target).unwrap();
        fs::write(staged.join("new.txt"), "new").unwrap();
        replace_dir(&staged, &target).unwrap();

        assert!(target.join("new.txt").exists());
        assert!(!target.join("old.txt").exists());
        assert!(!staged.exists());
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn original_name_strips_suffix() {
        assert_eq!(original_name(".old-SPY_2024-123-7", BACKUP_PREFIX), Some("SPY_2024"));
        assert_eq!(
            original_name(".old-BRK-B_2023-01-99-0", BACKUP_PREFIX),
            Some("BRK-B_2023-01")
        );
        assert_eq!(original_name(".old-1-2", BACKUP_PREFIX), None);
    }

    #[test]
    fn recover_removes_staging_and_restores_orphaned_backup() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join(".tmp-SPY_2024-1-1")).unwrap();
        let backup = tmp.path().join(".old-SPY_2023-1-2");
        fs::create_dir(&backup).unwrap();
        fs::write(backup.join("part-00000.parquet"), "x").unwrap();
        // A committed partition with a stale backup next to it.
        fs::create_dir(tmp.path().join("SPY_2022")).unwrap();
        fs::create_dir(tmp.path().join(".old-SPY_2022-1-3")).unwrap();

        let report = recover(tmp.path()).unwrap();

        assert_eq!(
            report,
            RecoveryReport {
                staging_removed: 1,
                backups_restored: 1,
                backups_removed: 1,
            }
        );
        assert!(tmp.path().join("SPY_2023/part-00000.parquet").exists());
        assert!(recover(tmp.path()).unwrap().is_clean());
    }
}
