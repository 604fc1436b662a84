use super::{
    COMPRESSED_FLAG, DEFAULT_FOLDER_ATTRIBUTES, NAME_SLOT_SIZE, NestedArchive, NodeKind,
    OFFSET_MASK, PARC_MAGIC, ParArchive, ParFile, ParHeader, is_par_name,
};
use crate::compression::sllz;
use crate::endian::EndianReader;
use crate::error::{ArchiveError, Result};
use encoding_rs::WINDOWS_1252;
use log::debug;
use std::collections::VecDeque;
use std::io::{Cursor, SeekFrom};
use std::ops::Range;

/// Both folder and file records are eight 32-bit words.
pub(crate) const RECORD_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct ParReadOptions {
    /// Expand `.par` files into nested trees.
    pub recursive: bool,
}

struct FolderRecord {
    folder_count: i32,
    first_folder: i32,
    file_count: i32,
    first_file: i32,
    attributes: i32,
}

struct FileRecord {
    flag: u32,
    decompressed_size: u32,
    compressed_size: u32,
    offset: u64,
    attributes: i32,
    timestamp: u64,
}

/// Parses a PARC archive, unwrapping an outer SLLZ stream if present.
pub fn read_par(data: &[u8], options: &ParReadOptions) -> Result<ParArchive> {
    if sllz::is_sllz(data) {
        debug!("PAR: archive is SLLZ compressed, decompressing first");
        let decompressed = sllz::decompress(data)?;
        return read_parc(&decompressed, options);
    }
    read_parc(data, options)
}

fn read_parc(data: &[u8], options: &ParReadOptions) -> Result<ParArchive> {
    // Big endian until the endianness byte says otherwise.
    let mut reader = EndianReader::new(Cursor::new(data), false);

    if &reader.read_magic()? != PARC_MAGIC {
        return Err(ArchiveError::InvalidSignature("PARC"));
    }

    let platform_id = reader.read_u8()?;
    let endianness = reader.read_u8()?;
    let size_extended = reader.read_u8()?;
    let relocated = reader.read_u8()?;
    if endianness == 0 {
        reader.set_endian(true);
    }

    let header = ParHeader {
        platform_id,
        endianness,
        size_extended,
        relocated,
        version: reader.read_i32()?,
        data_size: reader.read_i32()?,
    };

    let folder_count = read_count(&mut reader, "folder", data.len())?;
    let folder_table = read_count(&mut reader, "folder table offset", data.len())?;
    let file_count = read_count(&mut reader, "file", data.len())?;
    let file_table = read_count(&mut reader, "file table offset", data.len())?;

    debug!(
        "PAR: {} folders at 0x{:X}, {} files at 0x{:X}, version 0x{:08X}",
        folder_count, folder_table, file_count, file_table, header.version
    );

    if folder_count == 0 {
        return Err(ArchiveError::InvalidFormat(
            "PAR archive has no root folder".to_string(),
        ));
    }

    let folder_names = (0..folder_count)
        .map(|_| reader.read_fixed_string(NAME_SLOT_SIZE, WINDOWS_1252))
        .collect::<Result<Vec<_>>>()?;
    let file_names = (0..file_count)
        .map(|_| reader.read_fixed_string(NAME_SLOT_SIZE, WINDOWS_1252))
        .collect::<Result<Vec<_>>>()?;

    reader.seek(SeekFrom::Start(folder_table as u64))?;
    let mut folders = Vec::with_capacity(folder_count);
    for _ in 0..folder_count {
        let record = FolderRecord {
            folder_count: reader.read_i32()?,
            first_folder: reader.read_i32()?,
            file_count: reader.read_i32()?,
            first_file: reader.read_i32()?,
            attributes: reader.read_i32()?,
        };
        reader.read_bytes(12)?;
        folders.push(record);
    }

    reader.seek(SeekFrom::Start(file_table as u64))?;
    let mut files = Vec::with_capacity(file_count);
    for _ in 0..file_count {
        let flag = reader.read_u32()?;
        let decompressed_size = reader.read_u32()?;
        let compressed_size = reader.read_u32()?;
        let offset_low = reader.read_u32()?;
        let attributes = reader.read_i32()?;
        let offset_high = reader.read_u32()?;
        let timestamp = reader.read_u64()?;

        files.push(FileRecord {
            flag,
            decompressed_size,
            compressed_size,
            offset: (((offset_high as u64) << 32) | offset_low as u64) & OFFSET_MASK,
            attributes,
            timestamp,
        });
    }

    let mut archive = ParArchive::with_root(header, &folder_names[0], folders[0].attributes);
    let mut visited = vec![false; folder_count];
    visited[0] = true;

    let mut queue = VecDeque::from([(0usize, archive.root())]);
    while let Some((index, node)) = queue.pop_front() {
        let record = &folders[index];

        for child in index_range(record.first_folder, record.folder_count, folder_count, "folder")? {
            if std::mem::replace(&mut visited[child], true) {
                return Err(ArchiveError::InvalidFormat(format!(
                    "Folder {} is referenced more than once",
                    child
                )));
            }
            let id = archive.add_node(
                node,
                &folder_names[child],
                NodeKind::Folder {
                    attributes: folders[child].attributes,
                },
            )?;
            queue.push_back((child, id));
        }

        for child in index_range(record.first_file, record.file_count, file_count, "file")? {
            let record = &files[child];
            let name = &file_names[child];
            let stored = stored_bytes(data, record, name)?;

            if options.recursive && is_par_name(name) {
                debug!("PAR: expanding nested archive '{}'", name);
                let nested = read_par(stored, options)?;
                let nested_root = nested.node(nested.root());
                let root_attributes = match nested_root.kind {
                    NodeKind::Folder { attributes } => attributes,
                    _ => DEFAULT_FOLDER_ATTRIBUTES,
                };
                let id = archive.add_node(
                    node,
                    name,
                    NodeKind::Nested(NestedArchive {
                        header: nested.header,
                        root_name: nested_root.name.clone(),
                        root_attributes,
                        attributes: record.attributes,
                        timestamp: record.timestamp,
                    }),
                )?;
                archive.graft(id, &nested, nested.root())?;
                continue;
            }

            archive.add_file(
                node,
                name,
                ParFile {
                    data: stored.to_vec(),
                    is_compressed: record.flag & COMPRESSED_FLAG != 0,
                    decompressed_size: record.decompressed_size,
                    attributes: record.attributes,
                    timestamp: record.timestamp,
                    can_be_compressed: false,
                },
            )?;
        }
    }

    Ok(archive)
}

fn read_count(
    reader: &mut EndianReader<Cursor<&[u8]>>,
    what: &str,
    limit: usize,
) -> Result<usize> {
    let value = reader.read_i32()?;
    if value < 0 || value as usize > limit {
        return Err(ArchiveError::InvalidFormat(format!(
            "PAR {} value {} is out of range",
            what, value
        )));
    }
    Ok(value as usize)
}

fn index_range(first: i32, count: i32, total: usize, what: &str) -> Result<Range<usize>> {
    if first < 0 || count < 0 || first as usize + count as usize > total {
        return Err(ArchiveError::InvalidFormat(format!(
            "PAR {} range {}+{} exceeds {} records",
            what, first, count, total
        )));
    }
    Ok(first as usize..first as usize + count as usize)
}

fn stored_bytes<'a>(data: &'a [u8], record: &FileRecord, name: &str) -> Result<&'a [u8]> {
    let start = record.offset as usize;
    let end = start.checked_add(record.compressed_size as usize);
    match end {
        Some(end) if end <= data.len() => Ok(&data[start..end]),
        _ => Err(ArchiveError::Truncated(format!(
            "'{}' at 0x{:X} (+{}) lies past the end of the archive ({} bytes)",
            name,
            record.offset,
            record.compressed_size,
            data.len()
        ))),
    }
}
