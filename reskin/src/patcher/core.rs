use std::fmt;
use std::path::PathBuf;

use super::{
    write_atomically, AppBundle, BackupManager, CodeSigner, ManifestStore, PatchEngine,
    PatchError, PatchOutcome, Result,
};
use asarkit::{header_digest, AsarArchive, AsarError};
use serde_json::Value;

const PACKAGE_MANIFEST_PATH: &str = "package.json";
/// Entry point Electron falls back to when `package.json` has no `main`.
const DEFAULT_MAIN_SCRIPT: &str = "index.js";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStatus {
    Match,
    Mismatch,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchStatus {
    pub container_path: PathBuf,
    pub entry_path: String,
    pub patched: bool,
    pub integrity: IntegrityStatus,
    pub has_backup: bool,
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let integrity = match self.integrity {
            IntegrityStatus::Match => "yes",
            IntegrityStatus::Mismatch => "no",
            IntegrityStatus::Unknown => "unknown",
        };
        writeln!(f, "archive: {}", self.container_path.to_string_lossy())?;
        writeln!(f, "entry: {}", self.entry_path)?;
        writeln!(f, "patched: {}", yes_no(self.patched))?;
        writeln!(f, "integrity-match: {}", integrity)?;
        write!(f, "backup: {}", yes_no(self.has_backup))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchReport {
    /// The archive has been patched.
    Applied { backup_created: bool },
    /// The archive was already patched, only the manifest had to be updated.
    ManifestResynced,
    /// Nothing had to be done.
    AlreadyApplied,
}

/// Runs `status`, `patch` and `restore` against an application bundle.
pub struct Patcher {
    bundle: AppBundle,
    engine: PatchEngine,
    entry_path: Option<String>,
    manifest: Box<dyn ManifestStore>,
    backups: BackupManager,
    signer: Option<Box<dyn CodeSigner>>,
}

impl Patcher {
    pub fn new(
        bundle: AppBundle,
        engine: PatchEngine,
        manifest: Box<dyn ManifestStore>,
        backups: BackupManager,
    ) -> Self {
        Self {
            bundle,
            engine,
            entry_path: None,
            manifest,
            backups,
            signer: None,
        }
    }

    /// Patches `entry_path` instead of the script `package.json` points to.
    pub fn with_entry_path(mut self, entry_path: Option<String>) -> Self {
        self.entry_path = entry_path;
        self
    }

    pub fn with_signer(mut self, signer: Option<Box<dyn CodeSigner>>) -> Self {
        self.signer = signer;
        self
    }

    pub fn status(&self) -> Result<PatchStatus> {
        let container_path = self.bundle.container_path();
        let archive = AsarArchive::open(&container_path)?;
        let entry_path = self.resolve_entry_path(&archive)?;
        let content = read_entry(&archive, &entry_path)?;
        let text = entry_text(&entry_path, &content)?;
        let digest = archive.header_digest()?;
        let integrity = match self.manifest.read_hash() {
            Ok(hash) if hash.eq_ignore_ascii_case(&digest) => IntegrityStatus::Match,
            Ok(_) => IntegrityStatus::Mismatch,
            Err(e) => {
                log::debug!("Failed to read the manifest hash: {}", e);
                IntegrityStatus::Unknown
            }
        };
        Ok(PatchStatus {
            container_path,
            entry_path,
            patched: PatchEngine::is_already_patched(text),
            integrity,
            has_backup: self.backups.has_backup(),
        })
    }

    /// Applies the patch. Nothing is written if the script cannot be patched.
    pub fn patch(&self) -> Result<PatchReport> {
        let container_path = self.bundle.container_path();
        let archive = AsarArchive::open(&container_path)?;
        let entry_path = self.resolve_entry_path(&archive)?;
        log::info!("Patching '{}'", entry_path);
        let content = read_entry(&archive, &entry_path)?;
        let text = entry_text(&entry_path, &content)?;

        let patched_text = match self.engine.apply_patch(text)? {
            PatchOutcome::Patched(v) => v,
            PatchOutcome::AlreadyPatched => {
                let digest = archive.header_digest()?;
                if self.manifest_matches(&digest) {
                    log::info!("Patch already applied");
                    return Ok(PatchReport::AlreadyApplied);
                }
                log::info!("Patch already applied, updating the manifest hash");
                self.manifest.write_hash(&digest)?;
                self.sign_bundle();
                return Ok(PatchReport::ManifestResynced);
            }
        };

        let backup_created = self
            .backups
            .ensure_backup(&container_path, &self.bundle.info_plist_path())?;
        let mut entries = archive.extract_entries()?;
        entries.insert(entry_path, patched_text.into_bytes());
        let rebuilt = asarkit::rebuild(archive.header(), &entries)?;
        write_atomically(&container_path, &rebuilt)?;
        log::info!("Archive rebuilt ({} bytes)", rebuilt.len());

        let digest = header_digest(&rebuilt)?;
        self.manifest.write_hash(&digest).map_err(|e| {
            PatchError::ManifestError(format!(
                "archive was patched but its hash could not be stored, run 'patch' again to update the manifest ({})",
                e
            ))
        })?;
        log::info!("Manifest hash set to {}", digest);
        self.sign_bundle();
        Ok(PatchReport::Applied { backup_created })
    }

    /// Puts the original archive and manifest back.
    pub fn restore(&self) -> Result<()> {
        self.backups
            .restore(&self.bundle.container_path(), &self.bundle.info_plist_path())?;
        log::info!("Original files restored");
        self.sign_bundle();
        Ok(())
    }

    fn manifest_matches(&self, digest: &str) -> bool {
        match self.manifest.read_hash() {
            Ok(hash) => hash.eq_ignore_ascii_case(digest),
            Err(e) => {
                log::debug!("Failed to read the manifest hash: {}", e);
                false
            }
        }
    }

    /// Signing problems only affect whether the OS accepts to launch the
    /// application, they are reported as warnings.
    fn sign_bundle(&self) {
        if let Some(signer) = &self.signer {
            log::info!("Signing '{}'", self.bundle.root().to_string_lossy());
            if let Err(e) = signer.sign(self.bundle.root()) {
                log::warn!("{}", e);
            }
        }
    }

    fn resolve_entry_path(&self, archive: &AsarArchive) -> Result<String> {
        if let Some(entry_path) = &self.entry_path {
            return Ok(entry_path.clone());
        }
        let package_manifest = read_entry(archive, PACKAGE_MANIFEST_PATH)?;
        let package_manifest: Value = serde_json::from_slice(&package_manifest).map_err(|e| {
            AsarError::format_error(format!("Invalid {}: {}", PACKAGE_MANIFEST_PATH, e))
        })?;
        let main_script = package_manifest
            .get("main")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MAIN_SCRIPT);
        Ok(main_script.trim_start_matches("./").to_string())
    }
}

fn read_entry(archive: &AsarArchive, entry_path: &str) -> Result<Vec<u8>> {
    archive.read_file(entry_path).map_err(|e| match e {
        AsarError::EntryNotFound(path) => PatchError::NotFound(format!("'{}' in archive", path)),
        e => e.into(),
    })
}

fn entry_text<'a>(entry_path: &str, content: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(content).map_err(|_| PatchError::InvalidEncoding(entry_path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patcher::LiteralAnchors;
    use asarkit::EntryMap;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;
    use tempfile::{tempdir, TempDir};

    #[derive(Clone, Default)]
    struct MemoryManifest(Rc<RefCell<Option<String>>>);

    impl MemoryManifest {
        fn get(&self) -> Option<String> {
            self.0.borrow().clone()
        }

        fn set(&self, hash: &str) {
            *self.0.borrow_mut() = Some(hash.to_string());
        }
    }

    impl ManifestStore for MemoryManifest {
        fn read_hash(&self) -> Result<String> {
            self.get()
                .ok_or_else(|| PatchError::ManifestError("no hash".to_string()))
        }

        fn write_hash(&self, digest: &str) -> Result<()> {
            self.set(digest);
            Ok(())
        }
    }

    struct ReadOnlyManifest(MemoryManifest);

    impl ManifestStore for ReadOnlyManifest {
        fn read_hash(&self) -> Result<String> {
            self.0.read_hash()
        }

        fn write_hash(&self, _digest: &str) -> Result<()> {
            Err(PatchError::ManifestError("permission denied".to_string()))
        }
    }

    #[derive(Clone, Default)]
    struct CountingSigner {
        calls: Rc<Cell<usize>>,
        fail: bool,
    }

    impl CodeSigner for CountingSigner {
        fn sign(&self, _bundle_path: &Path) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                return Err(PatchError::SigningError("not allowed".to_string()));
            }
            Ok(())
        }
    }

    struct TestBundle {
        _temp_dir: TempDir,
        bundle: AppBundle,
        backup_dir: PathBuf,
        manifest: MemoryManifest,
        signer: CountingSigner,
    }

    impl TestBundle {
        fn patcher(&self) -> Patcher {
            let engine = PatchEngine::new("body{color:red}", Box::new(LiteralAnchors::default()));
            Patcher::new(
                self.bundle.clone(),
                engine,
                Box::new(self.manifest.clone()),
                BackupManager::new(&self.backup_dir),
            )
            .with_signer(Some(Box::new(self.signer.clone())))
        }

        fn container(&self) -> Vec<u8> {
            fs::read(self.bundle.container_path()).unwrap()
        }
    }

    fn demo_archive_bytes() -> Vec<u8> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../asarkit/resources/tests/asar/demo.asar");
        fs::read(path).unwrap()
    }

    fn test_bundle(container: &[u8]) -> TestBundle {
        let temp_dir = tempdir().unwrap();
        let bundle = AppBundle::new(temp_dir.path().join("Demo.app"));
        fs::create_dir_all(bundle.container_path().parent().unwrap()).unwrap();
        fs::write(bundle.container_path(), container).unwrap();
        fs::write(bundle.info_plist_path(), b"<plist>original</plist>").unwrap();
        let manifest = MemoryManifest::default();
        manifest.set(&header_digest(container).unwrap());
        TestBundle {
            backup_dir: temp_dir.path().join("backups"),
            _temp_dir: temp_dir,
            bundle,
            manifest,
            signer: CountingSigner::default(),
        }
    }

    fn main_script(container: &[u8]) -> String {
        let archive = AsarArchive::from_bytes(container.to_vec()).unwrap();
        String::from_utf8(archive.read_file("dist/main.js").unwrap()).unwrap()
    }

    #[test]
    fn test_fresh_patch() {
        let original = demo_archive_bytes();
        let t = test_bundle(&original);
        let patcher = t.patcher();

        let status = patcher.status().unwrap();
        assert_eq!(status.entry_path, "dist/main.js");
        assert!(!status.patched);
        assert_eq!(status.integrity, IntegrityStatus::Match);
        assert!(!status.has_backup);

        assert_eq!(
            patcher.patch().unwrap(),
            PatchReport::Applied {
                backup_created: true
            }
        );

        let patched = t.container();
        let script = main_script(&patched);
        assert_eq!(script.matches("/*reskin:patched*/").count(), 1);
        assert!(script.contains("M=new B(W);__reskinApply(M);"));
        assert_eq!(t.manifest.get(), Some(header_digest(&patched).unwrap()));
        assert_eq!(t.signer.calls.get(), 1);
        assert_eq!(fs::read(t.backup_dir.join("app.asar")).unwrap(), original);

        let status = patcher.status().unwrap();
        assert!(status.patched);
        assert_eq!(status.integrity, IntegrityStatus::Match);
        assert!(status.has_backup);
        let report = status.to_string();
        assert!(report.contains("patched: yes"));
        assert!(report.contains("integrity-match: yes"));
    }

    #[test]
    fn test_patched_archive_is_consistent() {
        let original = demo_archive_bytes();
        let t = test_bundle(&original);
        t.patcher().patch().unwrap();

        let original = AsarArchive::from_bytes(original).unwrap();
        let patched = AsarArchive::from_bytes(t.container()).unwrap();
        patched.verify_integrity().unwrap();
        let original_entries = original.extract_entries().unwrap();
        let patched_entries = patched.extract_entries().unwrap();
        assert_eq!(original_entries.len(), patched_entries.len());
        for (path, content) in &original_entries {
            if path != "dist/main.js" {
                assert_eq!(&patched_entries[path], content, "{}", path);
            }
        }
        assert_eq!(
            patched.get_file_entry("native.node"),
            original.get_file_entry("native.node")
        );
    }

    #[test]
    fn test_already_patched() {
        let t = test_bundle(&demo_archive_bytes());
        let patcher = t.patcher();
        patcher.patch().unwrap();
        let patched = t.container();
        let backup = fs::read(t.backup_dir.join("app.asar")).unwrap();

        assert_eq!(patcher.patch().unwrap(), PatchReport::AlreadyApplied);
        assert_eq!(t.container(), patched);
        assert_eq!(fs::read(t.backup_dir.join("app.asar")).unwrap(), backup);
        assert_eq!(t.signer.calls.get(), 1);
    }

    #[test]
    fn test_already_patched_with_stale_manifest() {
        let t = test_bundle(&demo_archive_bytes());
        let patcher = t.patcher();
        patcher.patch().unwrap();
        let patched = t.container();
        t.manifest.set("0000");
        assert_eq!(
            patcher.status().unwrap().integrity,
            IntegrityStatus::Mismatch
        );

        assert_eq!(patcher.patch().unwrap(), PatchReport::ManifestResynced);
        assert_eq!(t.container(), patched);
        assert_eq!(t.manifest.get(), Some(header_digest(&patched).unwrap()));
        assert_eq!(patcher.status().unwrap().integrity, IntegrityStatus::Match);
    }

    #[test]
    fn test_missing_anchor_leaves_archive_untouched() {
        let archive = AsarArchive::from_bytes(demo_archive_bytes()).unwrap();
        let mut entries: EntryMap = archive.extract_entries().unwrap();
        let script = main_script(archive.as_bytes()).replace("BrowserWindow:B", "BrowserWindow:X");
        entries.insert("dist/main.js".to_string(), script.into_bytes());
        let container = asarkit::rebuild(archive.header(), &entries).unwrap();
        let t = test_bundle(&container);
        let manifest_before = t.manifest.get();

        match t.patcher().patch().unwrap_err() {
            PatchError::AnchorNotFound(_) => {}
            e => panic!("unexpected error: {}", e),
        }
        assert_eq!(t.container(), container);
        assert_eq!(t.manifest.get(), manifest_before);
        assert!(!t.backup_dir.exists());
        assert_eq!(t.signer.calls.get(), 0);
    }

    #[test]
    fn test_manifest_write_failure_can_be_resynced() {
        let original = demo_archive_bytes();
        let t = test_bundle(&original);
        let engine = PatchEngine::new("body{color:red}", Box::new(LiteralAnchors::default()));
        let patcher = Patcher::new(
            t.bundle.clone(),
            engine,
            Box::new(ReadOnlyManifest(t.manifest.clone())),
            BackupManager::new(&t.backup_dir),
        );
        match patcher.patch().unwrap_err() {
            PatchError::ManifestError(msg) => {
                assert!(msg.contains("run 'patch' again"));
                assert!(msg.contains("permission denied"));
            }
            e => panic!("unexpected error: {}", e),
        }
        let patched = t.container();
        assert_ne!(patched, original);
        assert_eq!(
            t.patcher().status().unwrap().integrity,
            IntegrityStatus::Mismatch
        );

        assert_eq!(t.patcher().patch().unwrap(), PatchReport::ManifestResynced);
        assert_eq!(t.container(), patched);
        assert_eq!(t.manifest.get(), Some(header_digest(&patched).unwrap()));
    }

    #[test]
    fn test_restore_without_backup() {
        let original = demo_archive_bytes();
        let t = test_bundle(&original);
        assert!(matches!(
            t.patcher().restore().unwrap_err(),
            PatchError::NotFound(_)
        ));
        assert_eq!(t.container(), original);
    }

    #[test]
    fn test_restore_after_patch() {
        let original = demo_archive_bytes();
        let t = test_bundle(&original);
        let patcher = t.patcher();
        patcher.patch().unwrap();
        fs::write(t.bundle.info_plist_path(), b"<plist>patched</plist>").unwrap();

        patcher.restore().unwrap();
        assert_eq!(t.container(), original);
        assert_eq!(
            fs::read(t.bundle.info_plist_path()).unwrap(),
            b"<plist>original</plist>".to_vec()
        );
        assert_eq!(t.signer.calls.get(), 2);
        assert!(!patcher.status().unwrap().patched);

        // Restoring twice is harmless
        patcher.restore().unwrap();
        assert_eq!(t.container(), original);
    }

    #[test]
    fn test_signing_failure_is_not_fatal() {
        let mut t = test_bundle(&demo_archive_bytes());
        t.signer.fail = true;
        assert!(matches!(
            t.patcher().patch().unwrap(),
            PatchReport::Applied { .. }
        ));
        assert_eq!(t.signer.calls.get(), 1);
    }

    #[test]
    fn test_unknown_entry_path() {
        let t = test_bundle(&demo_archive_bytes());
        let patcher = t
            .patcher()
            .with_entry_path(Some("dist/missing.js".to_string()));
        assert!(matches!(
            patcher.patch().unwrap_err(),
            PatchError::NotFound(_)
        ));
    }

    #[test]
    fn test_unreadable_manifest_is_unknown() {
        let t = test_bundle(&demo_archive_bytes());
        *t.manifest.0.borrow_mut() = None;
        assert_eq!(
            t.patcher().status().unwrap().integrity,
            IntegrityStatus::Unknown
        );
    }
}
