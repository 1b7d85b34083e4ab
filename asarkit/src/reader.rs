use std::convert::TryFrom;
use std::fs;
use std::path::Path;

use crate::header::{parse_header, FileEntry, Header};
use crate::integrity::header_digest;
use crate::{AsarError, Result};
use indexmap::IndexMap;
use nom::number::complete::le_u32;
use nom::sequence::tuple;
use nom::IResult;

/// Size of the prelude (four little-endian u32 fields).
pub const PRELUDE_SIZE: usize = 16;
/// Value of the first prelude field: size of the outer pickle's payload.
pub const PRELUDE_MAGIC: u32 = 4;

/// Logical paths mapped to their content, in header order.
pub type EntryMap = IndexMap<String, Vec<u8>>;

/// The prelude is a pair of nested Chromium pickles: the outer one stores
/// `header_size`, the inner one stores the header JSON as a length-prefixed,
/// 4-byte aligned string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prelude {
    pub magic: u32,
    pub header_size: u32,
    pub header_payload_size: u32,
    pub json_size: u32,
}

impl Prelude {
    /// Offset of the data region from the start of the archive.
    pub fn data_offset(&self) -> u64 {
        8 + u64::from(self.header_size)
    }

    /// Returns the header JSON bytes. The prelude must come from `archive`.
    pub fn header_json<'a>(&self, archive: &'a [u8]) -> &'a [u8] {
        &archive[PRELUDE_SIZE..PRELUDE_SIZE + self.json_size as usize]
    }
}

fn parse_prelude_fields(input: &[u8]) -> IResult<&[u8], Prelude> {
    let (output, (magic, header_size, header_payload_size, json_size)) =
        tuple((le_u32, le_u32, le_u32, le_u32))(input)?;
    Ok((
        output,
        Prelude {
            magic,
            header_size,
            header_payload_size,
            json_size,
        },
    ))
}

/// Parses and validates the prelude against the archive's actual length.
pub fn parse_prelude(archive: &[u8]) -> Result<Prelude> {
    if archive.len() < PRELUDE_SIZE {
        return Err(AsarError::format_error(format!(
            "Archive is {} bytes long, smaller than its {}-byte prelude",
            archive.len(),
            PRELUDE_SIZE
        )));
    }
    let (_, prelude) = parse_prelude_fields(archive)
        .map_err(|_| AsarError::format_error("Failed to parse archive prelude"))?;
    if prelude.magic != PRELUDE_MAGIC {
        return Err(AsarError::format_error(format!(
            "Unexpected prelude magic {}",
            prelude.magic
        )));
    }
    if u64::from(prelude.header_payload_size) + 4 != u64::from(prelude.header_size) {
        return Err(AsarError::format_error(
            "Inconsistent header size fields in prelude",
        ));
    }
    if u64::from(prelude.json_size) + 4 > u64::from(prelude.header_payload_size) {
        return Err(AsarError::format_error(
            "Header JSON length exceeds declared header size",
        ));
    }
    let json_end = PRELUDE_SIZE as u64 + u64::from(prelude.json_size);
    if json_end > archive.len() as u64 || prelude.data_offset() > archive.len() as u64 {
        return Err(AsarError::format_error(
            "Declared header length extends past the end of the archive",
        ));
    }
    Ok(prelude)
}

/// Parses an archive, returning its header and the offset of its data
/// region.
pub fn parse_archive(archive: &[u8]) -> Result<(Header, u64)> {
    let prelude = parse_prelude(archive)?;
    let header = parse_header(prelude.header_json(archive))?;
    Ok((header, prelude.data_offset()))
}

/// Returns the byte range a packed entry occupies in `archive`.
fn entry_range(
    path: &str,
    entry: &FileEntry,
    data_offset: u64,
    archive_len: usize,
) -> Result<(usize, usize)> {
    let offset = entry
        .offset
        .ok_or_else(|| AsarError::format_error(format!("Entry '{}' has no offset", path)))?;
    let out_of_bounds =
        || AsarError::format_error(format!("Entry '{}' lies outside of the data region", path));
    let start = data_offset.checked_add(offset).ok_or_else(out_of_bounds)?;
    let end = start.checked_add(entry.size).ok_or_else(out_of_bounds)?;
    if end > archive_len as u64 {
        return Err(out_of_bounds());
    }
    Ok((usize::try_from(start)?, usize::try_from(end)?))
}

/// Copies every packed entry out of `archive`, in header order. Unpacked
/// entries live outside of the archive and are skipped.
pub fn extract_entries(archive: &[u8], header: &Header, data_offset: u64) -> Result<EntryMap> {
    let mut entries = EntryMap::new();
    for (path, entry) in header.files() {
        if !entry.is_packed() {
            continue;
        }
        let (start, end) = entry_range(&path, entry, data_offset, archive.len())?;
        entries.insert(path, archive[start..end].to_vec());
    }
    Ok(entries)
}

/// An archive loaded in memory.
#[derive(Debug)]
pub struct AsarArchive {
    data: Vec<u8>,
    header: Header,
    data_offset: u64,
}

impl AsarArchive {
    pub fn open(asar_archive_path: &Path) -> Result<AsarArchive> {
        let data = fs::read(asar_archive_path)?;
        AsarArchive::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<AsarArchive> {
        let (header, data_offset) = parse_archive(&data)?;
        Ok(AsarArchive {
            data,
            header,
            data_offset,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn file_count(&self) -> usize {
        self.header.files().len()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.header.files().into_iter().map(|(p, _)| p).collect()
    }

    pub fn get_file_entry(&self, file_path: &str) -> Option<&FileEntry> {
        self.header.find_file(file_path)
    }

    /// Reads a packed entry's content.
    pub fn read_file(&self, file_path: &str) -> Result<Vec<u8>> {
        let entry = self
            .get_file_entry(file_path)
            .filter(|e| e.is_packed())
            .ok_or_else(|| AsarError::EntryNotFound(file_path.to_string()))?;
        let (start, end) = entry_range(file_path, entry, self.data_offset, self.data.len())?;
        Ok(self.data[start..end].to_vec())
    }

    pub fn extract_entries(&self) -> Result<EntryMap> {
        extract_entries(&self.data, &self.header, self.data_offset)
    }

    pub fn header_digest(&self) -> Result<String> {
        header_digest(&self.data)
    }

    /// Checks every packed entry that carries an integrity record against its
    /// stored bytes.
    pub fn verify_integrity(&self) -> Result<()> {
        for (path, entry) in self.header.files() {
            if !entry.is_packed() {
                continue;
            }
            if let Some(integrity) = &entry.integrity {
                let (start, end) = entry_range(&path, entry, self.data_offset, self.data.len())?;
                if !integrity.matches(&self.data[start..end]) {
                    return Err(AsarError::IntegrityMismatch(path));
                }
            }
        }
        Ok(())
    }
}
