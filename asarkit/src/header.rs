//! Typed model of the JSON header embedded at the start of an archive.
//!
//! The header is a tree: directories hold an ordered map of children, leaves
//! are either files (packed in the data region or stored unpacked next to the
//! archive) or symbolic links. Keys this module does not know about
//! (`executable`, ...) are kept in `extra` and written back untouched.

use std::convert::TryFrom;
use std::fmt;

use crate::integrity::Integrity;
use crate::{AsarError, Result};
use indexmap::IndexMap;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root of an archive header. The root has the same shape as any other
/// directory: `{"files": {...}}`.
pub type Header = Directory;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Directory {
    pub files: IndexMap<String, Node>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Directory(Directory),
    File(FileEntry),
    Link(LinkEntry),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Offset relative to the start of the data region. Unpacked entries
    /// have none.
    pub offset: Option<u64>,
    pub size: u64,
    pub integrity: Option<Integrity>,
    /// `None` when the header does not spell the flag out.
    pub unpacked: Option<bool>,
    pub extra: Map<String, Value>,
}

impl FileEntry {
    pub fn is_packed(&self) -> bool {
        self.unpacked != Some(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEntry {
    pub link: String,
    pub extra: Map<String, Value>,
}

impl Directory {
    /// Looks up a file by its slash-separated path.
    pub fn find_file(&self, path: &str) -> Option<&FileEntry> {
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        let mut current = self;
        while let Some(name) = components.next() {
            match current.files.get(name)? {
                Node::Directory(dir) => current = dir,
                Node::File(file) if components.peek().is_none() => return Some(file),
                _ => return None,
            }
        }
        None
    }

    /// Lists every file in depth-first header order, with its full path.
    pub fn files(&self) -> Vec<(String, &FileEntry)> {
        let mut out = Vec::new();
        collect_files(self, "", &mut out);
        out
    }

    /// Calls `f` on every file in depth-first header order, with its full
    /// path. Stops at the first error.
    pub fn visit_files_mut<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &mut FileEntry) -> Result<()>,
    {
        visit_files_mut(self, "", f)
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn collect_files<'a>(dir: &'a Directory, prefix: &str, out: &mut Vec<(String, &'a FileEntry)>) {
    for (name, node) in &dir.files {
        let path = join_path(prefix, name);
        match node {
            Node::Directory(sub_dir) => collect_files(sub_dir, &path, out),
            Node::File(file) => out.push((path, file)),
            Node::Link(_) => {}
        }
    }
}

fn visit_files_mut<F>(dir: &mut Directory, prefix: &str, f: &mut F) -> Result<()>
where
    F: FnMut(&str, &mut FileEntry) -> Result<()>,
{
    for (name, node) in dir.files.iter_mut() {
        let path = join_path(prefix, name);
        match node {
            Node::Directory(sub_dir) => visit_files_mut(sub_dir, &path, f)?,
            Node::File(file) => f(&path, file)?,
            Node::Link(_) => {}
        }
    }
    Ok(())
}

/// Parses a header from its JSON text.
pub fn parse_header(json: &[u8]) -> Result<Header> {
    serde_json::from_slice(json)
        .map_err(|e| AsarError::format_error(format!("Invalid header JSON: {}", e)))
}

// Wire representation of a node. Every shape shares the same JSON object, the
// variant is decided by which keys are present.
#[derive(Deserialize)]
struct RawNode {
    #[serde(default)]
    files: Option<IndexMap<String, Node>>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    size: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_lenient_u64")]
    offset: Option<u64>,
    #[serde(default)]
    integrity: Option<Integrity>,
    #[serde(default)]
    unpacked: Option<bool>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Serialize)]
struct RawNodeRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<&'a IndexMap<String, Node>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(
        serialize_with = "serialize_offset",
        skip_serializing_if = "Option::is_none"
    )]
    offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    integrity: Option<&'a Integrity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unpacked: Option<bool>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> std::result::Result<Self, Self::Error> {
        let mut extra = raw.extra;
        if let Some(files) = raw.files {
            // Whole directories can be flagged as unpacked
            if let Some(unpacked) = raw.unpacked {
                extra.insert("unpacked".to_string(), Value::Bool(unpacked));
            }
            return Ok(Node::Directory(Directory { files, extra }));
        }
        if let Some(link) = raw.link {
            if let Some(unpacked) = raw.unpacked {
                extra.insert("unpacked".to_string(), Value::Bool(unpacked));
            }
            return Ok(Node::Link(LinkEntry { link, extra }));
        }
        let size = raw.size.ok_or("file entry has no size")?;
        if raw.offset.is_none() && raw.unpacked != Some(true) {
            return Err("packed file entry has no offset".to_string());
        }
        Ok(Node::File(FileEntry {
            offset: raw.offset,
            size,
            integrity: raw.integrity,
            unpacked: raw.unpacked,
            extra,
        }))
    }
}

impl<'a> From<&'a Node> for RawNodeRef<'a> {
    fn from(node: &'a Node) -> Self {
        match node {
            Node::Directory(dir) => RawNodeRef {
                files: Some(&dir.files),
                link: None,
                size: None,
                offset: None,
                integrity: None,
                unpacked: None,
                extra: &dir.extra,
            },
            Node::Link(link) => RawNodeRef {
                files: None,
                link: Some(&link.link),
                size: None,
                offset: None,
                integrity: None,
                unpacked: None,
                extra: &link.extra,
            },
            Node::File(file) => RawNodeRef {
                files: None,
                link: None,
                size: Some(file.size),
                offset: file.offset,
                integrity: file.integrity.as_ref(),
                unpacked: file.unpacked,
                extra: &file.extra,
            },
        }
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        RawNodeRef::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawNode::deserialize(deserializer)?;
        Node::try_from(raw).map_err(de::Error::custom)
    }
}

/// Offsets can exceed 2^53 in theory, so the format stores them as decimal
/// strings.
fn serialize_offset<S: Serializer>(
    offset: &Option<u64>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match offset {
        Some(v) => serializer.serialize_str(&v.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Accepts either a JSON number or a decimal string.
fn deserialize_lenient_u64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error> {
    struct LenientU64;

    impl<'de> Visitor<'de> for LenientU64 {
        type Value = Option<u64>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an unsigned integer or a decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
            u64::try_from(v)
                .map(Some)
                .map_err(|_| E::custom(format!("negative value {}", v)))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            v.trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| E::custom(format!("invalid number '{}'", v)))
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }
    }

    deserializer.deserialize_any(LenientU64)
}
