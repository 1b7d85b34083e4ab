//! Reading and rebuilding of Electron ASAR archives.
//!
//! An archive starts with a 16-byte prelude, followed by a JSON header that
//! describes a directory tree, followed by the concatenated content of every
//! packed file.

mod builder;
mod error;
pub mod header;
pub mod integrity;
mod reader;

pub use builder::rebuild;
pub use error::{AsarError, Result};
pub use header::{Directory, FileEntry, Header, LinkEntry, Node};
pub use integrity::{header_digest, sha256_hex, Integrity};
pub use reader::{extract_entries, parse_archive, parse_prelude, AsarArchive, EntryMap, Prelude};
