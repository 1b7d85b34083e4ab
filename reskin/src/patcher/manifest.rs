use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{write_atomically, PatchError, Result};
use tempfile::NamedTempFile;

const PLUTIL_PROGRAM: &str = "plutil";

/// Storage of the archive header digest the OS checks before running the
/// application.
pub trait ManifestStore {
    fn read_hash(&self) -> Result<String>;
    fn write_hash(&self, digest: &str) -> Result<()>;
}

/// Reads and writes `ElectronAsarIntegrity` in an `Info.plist` through
/// `plutil`.
#[derive(Debug, Clone)]
pub struct PlistUtility {
    program: OsString,
    plist_path: PathBuf,
    key_path: String,
}

impl PlistUtility {
    pub fn new(plist_path: impl Into<PathBuf>) -> Self {
        Self::with_program(PLUTIL_PROGRAM, plist_path)
    }

    pub fn with_program(program: impl Into<OsString>, plist_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            plist_path: plist_path.into(),
            key_path: integrity_key_path("Resources/app.asar"),
        }
    }

    fn run(&self, command: &mut Command) -> Result<String> {
        log::trace!("Running {:?}", command);
        let output = command.output().map_err(|e| {
            PatchError::ManifestError(format!(
                "failed to run '{}': {}",
                self.program.to_string_lossy(),
                e
            ))
        })?;
        if !output.status.success() {
            return Err(PatchError::ManifestError(format!(
                "'{}' exited with {}: {}",
                self.program.to_string_lossy(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ManifestStore for PlistUtility {
    fn read_hash(&self) -> Result<String> {
        self.run(
            Command::new(&self.program)
                .arg("-extract")
                .arg(&self.key_path)
                .args(&["raw", "-o", "-"])
                .arg(&self.plist_path),
        )
    }

    /// Edits a copy of the plist, then moves it over the original.
    fn write_hash(&self, digest: &str) -> Result<()> {
        let parent_dir = self
            .plist_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let staging_file = NamedTempFile::new_in(parent_dir)?;
        fs::copy(&self.plist_path, staging_file.path())?;
        self.run(
            Command::new(&self.program)
                .arg("-replace")
                .arg(&self.key_path)
                .args(&["-string", digest])
                .arg(staging_file.path()),
        )?;
        let content = fs::read(staging_file.path())?;
        write_atomically(&self.plist_path, &content)
    }
}

/// Builds the `plutil` key path of an archive's integrity hash. Dots inside
/// the archive path are escaped so they are not read as separators.
fn integrity_key_path(archive_relative_path: &str) -> String {
    format!(
        "ElectronAsarIntegrity.{}.hash",
        archive_relative_path.replace('.', "\\.")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_key_path() {
        let utility = PlistUtility::new("/tmp/Info.plist");
        assert_eq!(
            utility.key_path,
            "ElectronAsarIntegrity.Resources/app\\.asar.hash"
        );
        assert_eq!(
            integrity_key_path("Resources/other.app.asar"),
            "ElectronAsarIntegrity.Resources/other\\.app\\.asar.hash"
        );
    }

    #[test]
    fn test_missing_program() {
        let temp_dir = tempdir().unwrap();
        let plist_path = temp_dir.path().join("Info.plist");
        fs::write(&plist_path, b"<plist/>").unwrap();
        let utility = PlistUtility::with_program("reskin-no-such-utility", &plist_path);
        assert!(matches!(
            utility.read_hash().unwrap_err(),
            PatchError::ManifestError(_)
        ));
        assert!(matches!(
            utility.write_hash("abcd").unwrap_err(),
            PatchError::ManifestError(_)
        ));
        // The live manifest is left as is
        assert_eq!(fs::read(&plist_path).unwrap(), b"<plist/>".to_vec());
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_program() {
        let temp_dir = tempdir().unwrap();
        let plist_path = temp_dir.path().join("Info.plist");
        fs::write(&plist_path, b"<plist/>").unwrap();
        let utility = PlistUtility::with_program("false", &plist_path);
        match utility.read_hash().unwrap_err() {
            PatchError::ManifestError(msg) => assert!(msg.contains("'false' exited")),
            e => panic!("unexpected error: {}", e),
        }
    }
}
