//! PARC directory-tree archives.
//!
//! An archive is held as a flat arena of [`ParNode`]s indexed by [`NodeId`].
//! Node 0 is the root folder, which is folder 0 on disk. Children are kept in
//! insertion order, the order in which [`writer`] assigns record indices.

pub mod reader;
pub mod writer;

pub use reader::{ParReadOptions, read_par};
pub use writer::{ParWriteOptions, write_par};

use crate::compression::sllz;
use crate::error::{ArchiveError, Result};
use crate::path::entry_path;
use log::{debug, info};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

pub const PARC_MAGIC: &[u8; 4] = b"PARC";

/// Size of every folder and file name slot.
pub const NAME_SLOT_SIZE: usize = 0x40;
pub const BLOCK_SIZE: u64 = 2048;

pub const DEFAULT_FOLDER_ATTRIBUTES: i32 = 0x10;
pub const DEFAULT_FILE_ATTRIBUTES: i32 = 0x20;

pub(crate) const COMPRESSED_FLAG: u32 = 0x8000_0000;
pub(crate) const OFFSET_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParHeader {
    pub platform_id: u8,
    /// 0 switches every field after this byte to little endian.
    pub endianness: u8,
    pub size_extended: u8,
    pub relocated: u8,
    pub version: i32,
    pub data_size: i32,
}

impl Default for ParHeader {
    fn default() -> Self {
        Self {
            platform_id: 2,
            endianness: 1,
            size_extended: 0,
            relocated: 0,
            version: 0x0002_0001,
            data_size: 0,
        }
    }
}

impl ParHeader {
    pub fn is_little_endian(&self) -> bool {
        self.endianness == 0
    }
}

#[derive(Debug, Clone)]
pub struct ParFile {
    /// Bytes as stored in the archive; an SLLZ stream when `is_compressed`.
    pub data: Vec<u8>,
    pub is_compressed: bool,
    pub decompressed_size: u32,
    pub attributes: i32,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    /// Cleared for payloads read from an archive so they are written back
    /// as they were.
    pub can_be_compressed: bool,
}

impl ParFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            decompressed_size: data.len() as u32,
            data,
            is_compressed: false,
            attributes: DEFAULT_FILE_ATTRIBUTES,
            timestamp: now_timestamp(),
            can_be_compressed: true,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The decompressed payload.
    pub fn contents(&self) -> Result<Cow<'_, [u8]>> {
        if self.is_compressed {
            Ok(Cow::Owned(sllz::decompress(&self.data)?))
        } else {
            Ok(Cow::Borrowed(&self.data))
        }
    }
}

/// A `.par` file expanded into the tree. Its children are the children of
/// the nested root folder.
#[derive(Debug, Clone)]
pub struct NestedArchive {
    pub header: ParHeader,
    pub root_name: String,
    pub root_attributes: i32,
    /// File record attributes of the `.par` file itself.
    pub attributes: i32,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Folder { attributes: i32 },
    File(ParFile),
    Nested(NestedArchive),
}

#[derive(Debug, Clone)]
pub struct ParNode {
    pub name: String,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl ParNode {
    pub fn is_container(&self) -> bool {
        !matches!(self.kind, NodeKind::File(_))
    }

    pub fn as_file(&self) -> Option<&ParFile> {
        match &self.kind {
            NodeKind::File(file) => Some(file),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParArchive {
    pub header: ParHeader,
    nodes: Vec<ParNode>,
}

impl Default for ParArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl ParArchive {
    pub fn new() -> Self {
        Self::with_root(ParHeader::default(), "", DEFAULT_FOLDER_ATTRIBUTES)
    }

    pub fn with_root(header: ParHeader, root_name: &str, root_attributes: i32) -> Self {
        Self {
            header,
            nodes: vec![ParNode {
                name: root_name.to_string(),
                kind: NodeKind::Folder {
                    attributes: root_attributes,
                },
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &ParNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ParNode {
        &mut self.nodes[id]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn add_folder(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.push_node(
            parent,
            name,
            NodeKind::Folder {
                attributes: DEFAULT_FOLDER_ATTRIBUTES,
            },
        )
    }

    pub fn add_file(&mut self, parent: NodeId, name: &str, file: ParFile) -> Result<NodeId> {
        self.push_node(parent, name, NodeKind::File(file))
    }

    pub fn add_node(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        self.push_node(parent, name, kind)
    }

    fn push_node(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        match self.nodes.get(parent) {
            Some(node) if node.is_container() => {}
            Some(node) => {
                return Err(ArchiveError::InvalidFormat(format!(
                    "Cannot add '{}' below file '{}'",
                    name, node.name
                )));
            }
            None => {
                return Err(ArchiveError::FileNotFound(format!("node #{}", parent)));
            }
        }

        let id = self.nodes.len();
        self.nodes.push(ParNode {
            name: name.to_string(),
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Copies the children of `source_parent` in `source` below `parent`.
    pub(crate) fn graft(
        &mut self,
        parent: NodeId,
        source: &ParArchive,
        source_parent: NodeId,
    ) -> Result<()> {
        for &child in source.children(source_parent) {
            let node = source.node(child);
            let id = self.push_node(parent, &node.name, node.kind.clone())?;
            self.graft(id, source, child)?;
        }
        Ok(())
    }

    /// Copies the subtree below `node` into a standalone archive.
    pub(crate) fn subtree(
        &self,
        node: NodeId,
        header: ParHeader,
        root_name: &str,
        root_attributes: i32,
    ) -> Result<Self> {
        let mut archive = Self::with_root(header, root_name, root_attributes);
        archive.graft(0, self, node)?;
        Ok(archive)
    }

    /// Resolves a `/`- or `\`-separated path below the root, ignoring case.
    /// Empty and `.` components are skipped.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root();
        for part in path.split(['/', '\\']).filter(|p| !p.is_empty()) {
            let child = self.nodes[current]
                .children
                .iter()
                .find(|&&child| display_name(&self.nodes[child].name).eq_ignore_ascii_case(part));
            match child {
                Some(&child) => current = child,
                None if part == "." => {}
                None => return None,
            }
        }
        Some(current)
    }

    /// Path of a node below the root, `/`-separated. Unnamed folders show
    /// as `.`.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            parts.push(display_name(&self.nodes[current].name));
            current = parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Every file node with its path, depth first in child order.
    pub fn files(&self) -> Vec<(String, NodeId)> {
        let mut out = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if let NodeKind::File(_) = node.kind {
                out.push((self.path_of(id), id));
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Orders every child list by name, ignoring case.
    pub fn sort_children(&mut self) {
        for id in 0..self.nodes.len() {
            let mut children = std::mem::take(&mut self.nodes[id].children);
            children.sort_by_cached_key(|&child| self.nodes[child].name.to_lowercase());
            self.nodes[id].children = children;
        }
    }

    /// Builds a tree from a directory on disk. Directories named `*.par`
    /// are written back as nested archives.
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        let root = path.as_ref();
        let mut archive = ParArchive::new();
        let mut ids: HashMap<PathBuf, NodeId> = HashMap::new();
        ids.insert(root.to_path_buf(), archive.root());

        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let msg = e.to_string();
                ArchiveError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other(msg)),
                )
            })?;

            let parent_path = entry.path().parent().unwrap_or(root);
            let parent = *ids.get(parent_path).ok_or_else(|| {
                ArchiveError::FileNotFound(parent_path.display().to_string())
            })?;
            let name = entry.file_name().to_string_lossy();

            if entry.file_type().is_dir() {
                let id = archive.add_folder(parent, &name)?;
                ids.insert(entry.path().to_path_buf(), id);
            } else if entry.file_type().is_file() {
                let data = fs::read(entry.path())?;
                let mut file = ParFile::new(data);
                if let Some(since_epoch) = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                {
                    file.timestamp = since_epoch.as_secs();
                }
                debug!("Adding {} ({} bytes)", entry.path().display(), file.data.len());
                archive.add_file(parent, &name, file)?;
            }
        }

        Ok(archive)
    }

    pub fn open<P: AsRef<Path>>(path: P, options: &ParReadOptions) -> Result<Self> {
        let data = fs::read(path)?;
        read_par(&data, options)
    }

    pub fn from_bytes(data: &[u8], options: &ParReadOptions) -> Result<Self> {
        read_par(data, options)
    }

    pub fn to_bytes(&self, options: &ParWriteOptions) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        write_par(self, &mut out, options)?;
        Ok(out.into_inner())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, options: &ParWriteOptions) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        write_par(self, &mut out, options)?;
        out.flush()?;
        Ok(())
    }

    /// Writes every file below `output_dir`, decompressing SLLZ payloads.
    /// Nested archives become directories.
    pub fn extract_to<P: AsRef<Path>>(&self, output_dir: P) -> Result<()> {
        let output_dir = output_dir.as_ref();
        for (path, id) in self.files() {
            let Some(file) = self.nodes[id].as_file() else {
                continue;
            };
            let output_path = output_dir.join(entry_path(&path)?);
            if let Some(parent) = output_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let contents = file.contents()?;
            info!("Extracting: {} ({} bytes)", output_path.display(), contents.len());
            fs::write(&output_path, &contents)?;
        }
        Ok(())
    }
}

pub(crate) fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "."
    } else {
        name
    }
}

pub(crate) fn is_par_name(name: &str) -> bool {
    let name = name.as_bytes();
    name.len() >= 4 && name[name.len() - 4..].eq_ignore_ascii_case(b".par")
}
