mod backup;
mod codesign;
mod core;
mod engine;
mod manifest;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub use self::backup::BackupManager;
pub use self::codesign::{AdHocCodesign, CodeSigner};
pub use self::core::{PatchReport, Patcher};
pub use self::engine::{AnchorStrategy, LiteralAnchors, PatchEngine, PatchOutcome};
pub use self::manifest::{ManifestStore, PlistUtility};
use asarkit::AsarError;
use tempfile::NamedTempFile;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    Asar(#[from] AsarError),
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("anchor not found: {0}")]
    AnchorNotFound(String),
    #[error("patch verification failed: {0}")]
    PatchVerification(String),
    #[error("manifest error: {0}")]
    ManifestError(String),
    #[error("code signing failed: {0}")]
    SigningError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("entry '{0}' is not valid UTF-8")]
    InvalidEncoding(String),
}

/// Location of the files `reskin` touches inside a macOS application bundle.
#[derive(Debug, Clone)]
pub struct AppBundle {
    root: PathBuf,
}

impl AppBundle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bundle name without its `.app` extension.
    pub fn name(&self) -> String {
        self.root
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string())
    }

    pub fn container_path(&self) -> PathBuf {
        self.root.join("Contents/Resources/app.asar")
    }

    pub fn info_plist_path(&self) -> PathBuf {
        self.root.join("Contents/Info.plist")
    }
}

/// Replaces the content of `path` through a temporary file renamed over it,
/// so readers never observe a partially written file. Permissions of an
/// existing file are kept.
pub fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp_file = NamedTempFile::new_in(parent_dir)?;
    temp_file.write_all(content)?;
    temp_file.as_file().sync_all()?;
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(temp_file.path(), metadata.permissions())?;
    }
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
