use super::reader::RECORD_SIZE;
use super::{
    BLOCK_SIZE, COMPRESSED_FLAG, DEFAULT_FILE_ATTRIBUTES, DEFAULT_FOLDER_ATTRIBUTES,
    NAME_SLOT_SIZE, NodeId, NodeKind, PARC_MAGIC, ParArchive, ParFile, ParHeader, is_par_name,
    now_timestamp,
};
use crate::compression::sllz::{self, SllzOptions, SllzVersion, V2_MIN_INPUT_SIZE};
use crate::endian::{EndianWriter, align_up};
use crate::error::{ArchiveError, Result};
use encoding_rs::WINDOWS_1252;
use log::{debug, info};
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::{Seek, Write};

/// Fixed header fields ahead of the name tables.
const HEADER_FIELDS_SIZE: usize = 0x20;

#[derive(Debug, Clone, Copy)]
pub struct ParWriteOptions {
    /// SLLZ version used for file payloads; 0 stores everything as-is.
    pub compressor_version: u8,
    /// Write the root folder name as `.`.
    pub include_dots: bool,
    /// Write a zero timestamp for every file.
    pub reset_file_dates: bool,
    /// Compression worker threads; 0 picks the rayon default.
    pub threads: usize,
}

impl Default for ParWriteOptions {
    fn default() -> Self {
        Self {
            compressor_version: 1,
            include_dots: false,
            reset_file_dates: false,
            threads: 0,
        }
    }
}

struct FolderEntry {
    node: NodeId,
    name: String,
    attributes: i32,
    folder_count: i32,
    first_folder: i32,
    file_count: i32,
    first_file: i32,
}

impl FolderEntry {
    fn new(node: NodeId, name: String, attributes: i32) -> Self {
        Self {
            node,
            name,
            attributes,
            folder_count: 0,
            first_folder: 0,
            file_count: 0,
            first_file: 0,
        }
    }
}

struct Payload<'a> {
    data: Cow<'a, [u8]>,
    is_compressed: bool,
    decompressed_size: u32,
    attributes: i32,
    timestamp: u64,
}

/// Serialises `archive`. The writer must be positioned at the start of the
/// output, since data offsets are absolute.
pub fn write_par<W: Write + Seek>(
    archive: &ParArchive,
    writer: W,
    options: &ParWriteOptions,
) -> Result<()> {
    let compressor = match options.compressor_version {
        0 => None,
        version => Some(SllzVersion::try_from(version)?),
    };

    let (folders, files) = layout(archive, options);
    let payloads = prepare_payloads(archive, &files, compressor, options)?;

    let header_size = HEADER_FIELDS_SIZE + NAME_SLOT_SIZE * (folders.len() + files.len());
    let file_table = header_size + RECORD_SIZE * folders.len();
    let data_start = align_up((file_table + RECORD_SIZE * files.len()) as u64, BLOCK_SIZE);
    let offsets = data_offsets(payloads.iter().map(|p| p.data.len() as u64), data_start);

    debug!(
        "PAR: writing {} folders and {} files, data from 0x{:X}",
        folders.len(),
        files.len(),
        data_start
    );

    let header = &archive.header;
    let mut writer = EndianWriter::new(writer, false);
    writer.write_bytes(PARC_MAGIC)?;
    writer.write_u8(header.platform_id)?;
    writer.write_u8(header.endianness)?;
    writer.write_u8(header.size_extended)?;
    writer.write_u8(header.relocated)?;
    writer.set_endian(header.is_little_endian());
    writer.write_i32(header.version)?;
    writer.write_i32(header.data_size)?;
    writer.write_i32(folders.len() as i32)?;
    writer.write_i32(header_size as i32)?;
    writer.write_i32(files.len() as i32)?;
    writer.write_i32(file_table as i32)?;

    for folder in &folders {
        writer.write_fixed_string(&folder.name, NAME_SLOT_SIZE, WINDOWS_1252)?;
    }
    for &node in &files {
        writer.write_fixed_string(&archive.node(node).name, NAME_SLOT_SIZE, WINDOWS_1252)?;
    }

    for folder in &folders {
        writer.write_i32(folder.folder_count)?;
        writer.write_i32(folder.first_folder)?;
        writer.write_i32(folder.file_count)?;
        writer.write_i32(folder.first_file)?;
        writer.write_i32(folder.attributes)?;
        writer.write_zeros(12)?;
    }

    for (payload, &offset) in payloads.iter().zip(&offsets) {
        writer.write_u32(if payload.is_compressed {
            COMPRESSED_FLAG
        } else {
            0
        })?;
        writer.write_u32(payload.decompressed_size)?;
        writer.write_u32(payload.data.len() as u32)?;
        writer.write_u32(offset as u32)?;
        writer.write_i32(payload.attributes)?;
        writer.write_u32((offset >> 32) as u32)?;
        writer.write_u64(payload.timestamp)?;
    }

    for (payload, &offset) in payloads.iter().zip(&offsets) {
        writer.write_until(offset)?;
        writer.write_bytes(&payload.data)?;
    }
    writer.write_padding(BLOCK_SIZE)?;

    info!(
        "PAR: wrote {} files ({} compressed)",
        payloads.len(),
        payloads.iter().filter(|p| p.is_compressed).count()
    );
    Ok(())
}

/// Assigns folder and file indices breadth first. Folders named `*.par`
/// take a file slot and are written as nested archives.
fn layout(archive: &ParArchive, options: &ParWriteOptions) -> (Vec<FolderEntry>, Vec<NodeId>) {
    let root = archive.root();
    let root_name = if options.include_dots {
        ".".to_string()
    } else {
        archive.node(root).name.clone()
    };

    let mut folders = vec![FolderEntry::new(root, root_name, folder_attributes(archive, root))];
    let mut files = Vec::new();
    let mut queue = VecDeque::from([0usize]);

    while let Some(index) = queue.pop_front() {
        folders[index].first_folder = folders.len() as i32;
        folders[index].first_file = files.len() as i32;

        for &child in archive.children(folders[index].node) {
            let node = archive.node(child);
            match node.kind {
                NodeKind::Folder { attributes } if !is_par_name(&node.name) => {
                    folders.push(FolderEntry::new(child, node.name.clone(), attributes));
                    folders[index].folder_count += 1;
                    queue.push_back(folders.len() - 1);
                }
                _ => {
                    files.push(child);
                    folders[index].file_count += 1;
                }
            }
        }
    }

    (folders, files)
}

fn folder_attributes(archive: &ParArchive, node: NodeId) -> i32 {
    match archive.node(node).kind {
        NodeKind::Folder { attributes } => attributes,
        _ => DEFAULT_FOLDER_ATTRIBUTES,
    }
}

/// Nested archives are built on the calling thread first; file compression
/// then runs on a pool bounded by `options.threads`.
fn prepare_payloads<'a>(
    archive: &'a ParArchive,
    files: &[NodeId],
    compressor: Option<SllzVersion>,
    options: &ParWriteOptions,
) -> Result<Vec<Payload<'a>>> {
    let nested: Vec<Option<Payload<'a>>> = files
        .iter()
        .map(|&node| match archive.node(node).kind {
            NodeKind::File(_) => Ok(None),
            _ => nested_payload(archive, node, options).map(Some),
        })
        .collect::<Result<Vec<_>>>()?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.threads)
        .build()
        .map_err(|e| ArchiveError::Unsupported(format!("Compression worker pool: {}", e)))?;

    let compressed = pool.install(|| {
        files
            .par_iter()
            .map(|&node| match &archive.node(node).kind {
                NodeKind::File(file) => {
                    file_payload(&archive.node(node).name, file, compressor, options).map(Some)
                }
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>>>()
    })?;

    nested
        .into_iter()
        .zip(compressed)
        .map(|(nested, file)| {
            nested.or(file).ok_or_else(|| {
                ArchiveError::InvalidFormat("PAR file slot without a payload".to_string())
            })
        })
        .collect()
}

fn nested_payload(
    archive: &ParArchive,
    node: NodeId,
    options: &ParWriteOptions,
) -> Result<Payload<'static>> {
    let parc = archive.node(node);
    debug!("PAR: building nested archive '{}'", parc.name);

    let (bytes, attributes, timestamp) = match &parc.kind {
        NodeKind::Nested(info) => (
            archive
                .subtree(node, info.header, &info.root_name, info.root_attributes)?
                .to_bytes(options)?,
            info.attributes,
            info.timestamp,
        ),
        _ => (
            archive
                .subtree(node, ParHeader::default(), "", DEFAULT_FOLDER_ATTRIBUTES)?
                .to_bytes(options)?,
            DEFAULT_FILE_ATTRIBUTES,
            now_timestamp(),
        ),
    };

    Ok(Payload {
        decompressed_size: bytes.len() as u32,
        data: Cow::Owned(bytes),
        is_compressed: false,
        attributes,
        timestamp: if options.reset_file_dates { 0 } else { timestamp },
    })
}

fn file_payload<'a>(
    name: &str,
    file: &'a ParFile,
    compressor: Option<SllzVersion>,
    options: &ParWriteOptions,
) -> Result<Payload<'a>> {
    let stored = Payload {
        data: Cow::Borrowed(&file.data),
        is_compressed: file.is_compressed,
        decompressed_size: if file.is_compressed {
            file.decompressed_size
        } else {
            file.data.len() as u32
        },
        attributes: file.attributes,
        timestamp: if options.reset_file_dates {
            0
        } else {
            file.timestamp
        },
    };

    let Some(version) = compressor else {
        return Ok(stored);
    };
    if !file.can_be_compressed || file.is_compressed || file.data.is_empty() {
        return Ok(stored);
    }
    if version == SllzVersion::V2 && file.data.len() < V2_MIN_INPUT_SIZE {
        debug!("PAR: '{}' is too small for SLLZv2, storing", name);
        return Ok(stored);
    }

    let compressed = sllz::compress(
        &file.data,
        SllzOptions {
            version,
            endianness: 0,
        },
    )?;

    if !keep_compressed(file.data.len(), compressed.len()) {
        debug!(
            "PAR: '{}' does not shrink enough ({} -> {}), storing",
            name,
            file.data.len(),
            compressed.len()
        );
        return Ok(stored);
    }

    Ok(Payload {
        data: Cow::Owned(compressed),
        is_compressed: true,
        decompressed_size: file.data.len() as u32,
        ..stored
    })
}

/// The compressed form must be strictly smaller, and for inputs of a block
/// or more it must save at least a whole block.
fn keep_compressed(original: usize, compressed: usize) -> bool {
    let block = BLOCK_SIZE as usize;
    compressed < original && (original < block || original - compressed >= block)
}

/// Absolute data offsets for payloads of the given sizes. Files larger than
/// a block start on a block boundary; smaller files share the remainder of
/// the current block until it runs out.
fn data_offsets(sizes: impl IntoIterator<Item = u64>, start: u64) -> Vec<u64> {
    let mut position = start;
    let mut block_left = 0u64;
    let mut offsets = Vec::new();

    for size in sizes {
        if size > BLOCK_SIZE || size >= block_left {
            block_left = BLOCK_SIZE - size % BLOCK_SIZE;
            position = align_up(position, BLOCK_SIZE);
        } else {
            block_left -= size;
        }
        offsets.push(position);
        position += size;
    }

    offsets
}
