use crate::reader::parse_prelude;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const INTEGRITY_ALGORITHM: &str = "SHA256";
pub const INTEGRITY_BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// Per-entry integrity metadata, checked by Electron when it loads a file
/// from the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrity {
    pub algorithm: String,
    pub hash: String,
    pub block_size: u32,
    pub blocks: Vec<String>,
}

impl Integrity {
    /// Computes the integrity record of `content`.
    ///
    /// Blocks cover the content in `INTEGRITY_BLOCK_SIZE` chunks. The trailing
    /// remainder is always recorded, even when empty, which is what the
    /// reference packer produces.
    pub fn compute(content: &[u8]) -> Self {
        let block_size = INTEGRITY_BLOCK_SIZE as usize;
        let chunks = content.chunks_exact(block_size);
        let remainder = chunks.remainder();
        let mut blocks: Vec<String> = chunks.map(sha256_hex).collect();
        blocks.push(sha256_hex(remainder));
        Self {
            algorithm: INTEGRITY_ALGORITHM.to_string(),
            hash: sha256_hex(content),
            block_size: INTEGRITY_BLOCK_SIZE,
            blocks,
        }
    }

    /// Checks whether this record describes `content`.
    pub fn matches(&self, content: &[u8]) -> bool {
        self.algorithm == INTEGRITY_ALGORITHM
            && self.block_size == INTEGRITY_BLOCK_SIZE
            && *self == Self::compute(content)
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Computes the digest Electron stores in `ElectronAsarIntegrity`: the SHA-256
/// of the header JSON exactly as declared by the prelude.
pub fn header_digest(archive: &[u8]) -> Result<String> {
    let prelude = parse_prelude(archive)?;
    Ok(sha256_hex(prelude.header_json(archive)))
}
