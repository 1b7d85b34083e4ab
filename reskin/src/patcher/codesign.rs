use std::path::Path;
use std::process::Command;

use super::{PatchError, Result};

pub trait CodeSigner {
    fn sign(&self, bundle_path: &Path) -> Result<()>;
}

/// Re-signs a bundle with an ad-hoc signature through `codesign`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdHocCodesign;

impl CodeSigner for AdHocCodesign {
    fn sign(&self, bundle_path: &Path) -> Result<()> {
        let output = Command::new("codesign")
            .args(&["--force", "--deep", "--sign", "-"])
            .arg(bundle_path)
            .output()
            .map_err(|e| PatchError::SigningError(format!("failed to run 'codesign': {}", e)))?;
        if !output.status.success() {
            return Err(PatchError::SigningError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}
