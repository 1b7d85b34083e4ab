use std::fs;
use std::path::{Path, PathBuf};

use super::{write_atomically, PatchError, Result};

const CONTAINER_BACKUP_NAME: &str = "app.asar";
const MANIFEST_BACKUP_NAME: &str = "Info.plist";

/// Keeps a copy of the original archive and manifest, taken before the first
/// patch.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    fn container_backup_path(&self) -> PathBuf {
        self.backup_dir.join(CONTAINER_BACKUP_NAME)
    }

    fn manifest_backup_path(&self) -> PathBuf {
        self.backup_dir.join(MANIFEST_BACKUP_NAME)
    }

    /// A backup set is complete once its container copy exists, as it is
    /// written last.
    pub fn has_backup(&self) -> bool {
        self.container_backup_path().is_file()
    }

    /// Copies the live files into the backup directory, unless a backup
    /// already exists. Returns whether a backup was made.
    pub fn ensure_backup(&self, container_path: &Path, manifest_path: &Path) -> Result<bool> {
        if self.has_backup() {
            log::debug!(
                "Backup already present in '{}'",
                self.backup_dir.to_string_lossy()
            );
            return Ok(false);
        }
        fs::create_dir_all(&self.backup_dir)?;
        if manifest_path.is_file() {
            write_atomically(&self.manifest_backup_path(), &fs::read(manifest_path)?)?;
        } else {
            log::warn!(
                "'{}' does not exist, only the archive will be backed up",
                manifest_path.to_string_lossy()
            );
        }
        write_atomically(&self.container_backup_path(), &fs::read(container_path)?)?;
        log::info!("Backup saved to '{}'", self.backup_dir.to_string_lossy());
        Ok(true)
    }

    /// Puts the backed up files back in place. The backup itself is kept.
    pub fn restore(&self, container_path: &Path, manifest_path: &Path) -> Result<()> {
        if !self.has_backup() {
            return Err(PatchError::NotFound(format!(
                "no backup in '{}'",
                self.backup_dir.to_string_lossy()
            )));
        }
        write_atomically(container_path, &fs::read(self.container_backup_path())?)?;
        let manifest_backup_path = self.manifest_backup_path();
        if manifest_backup_path.is_file() {
            write_atomically(manifest_path, &fs::read(manifest_backup_path)?)?;
        } else {
            log::warn!("No manifest backup found, leaving the live manifest untouched");
        }
        Ok(())
    }
}
