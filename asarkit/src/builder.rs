use std::convert::TryFrom;
use std::io::Write;

use crate::header::{FileEntry, Header};
use crate::integrity::Integrity;
use crate::reader::{EntryMap, PRELUDE_MAGIC, PRELUDE_SIZE};
use crate::{AsarError, Result};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct SerializablePrelude {
    pub magic: u32,
    pub header_size: u32,
    pub header_payload_size: u32,
    pub json_size: u32,
}

/// Rebuilds an archive from a header and the content of its packed entries.
///
/// Entries are laid out contiguously in header order, whatever their original
/// offsets were. Sizes and integrity records are recomputed from the given
/// content. Unpacked entries and links are written back untouched and take no
/// room in the data region.
pub fn rebuild(header: &Header, entries: &EntryMap) -> Result<Vec<u8>> {
    let mut header = header.clone();
    let mut data: Vec<u8> = Vec::new();
    header.visit_files_mut(&mut |path: &str, file: &mut FileEntry| {
        if !file.is_packed() {
            return Ok(());
        }
        let content = entries
            .get(path)
            .ok_or_else(|| AsarError::MissingEntry(path.to_string()))?;
        file.offset = Some(data.len() as u64);
        file.size = content.len() as u64;
        file.integrity = Some(Integrity::compute(content));
        data.extend_from_slice(content);
        Ok(())
    })?;

    let json = serde_json::to_vec(&header)?;
    let aligned_json_size = align_to_u32(json.len());
    let mut archive = Vec::with_capacity(PRELUDE_SIZE + aligned_json_size + data.len());
    write_prelude(&mut archive, json.len())?;
    archive.write_all(&json)?;
    // Pickle strings are padded to a 4-byte boundary
    archive.resize(PRELUDE_SIZE + aligned_json_size, 0);
    archive.write_all(&data)?;
    Ok(archive)
}

fn align_to_u32(size: usize) -> usize {
    (size + 3) & !3
}

fn write_prelude<W: Write>(writer: &mut W, json_size: usize) -> Result<()> {
    let aligned_json_size = u32::try_from(align_to_u32(json_size))?;
    let header_payload_size = aligned_json_size
        .checked_add(4)
        .ok_or_else(|| AsarError::format_error("Header is too large"))?;
    let header_size = header_payload_size
        .checked_add(4)
        .ok_or_else(|| AsarError::format_error("Header is too large"))?;
    let prelude = SerializablePrelude {
        magic: PRELUDE_MAGIC,
        header_size,
        header_payload_size,
        json_size: u32::try_from(json_size)?,
    };
    bincode::serialize_into(writer, &prelude)?;
    Ok(())
}
