use crate::compression::{decompress_crilayla, is_crilayla};
use crate::endian::{EndianReader, EndianWriter, align_up};
use crate::error::{ArchiveError, Result};
use crate::path::entry_path;
use crate::utf::{Cell, CellValue, FieldWidth, Utf};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, create_dir_all};
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub const CPK_MAGIC: &[u8; 4] = b"CPK ";

/// Sentinel used by the CPK header for absent sections.
pub const UNSET_OFFSET: u64 = 0xFFFFFFFFFFFFFFFF;

const COPYRIGHT_MARKER: &[u8; 6] = b"(c)CRI";
const COPYRIGHT_END: u64 = 0x800;

/// Magic, unknown field and packet size preceding every section packet.
const SECTION_HEADER_SIZE: u64 = 0x10;
const DEFAULT_ALIGN: u64 = 0x800;
const MAX_PACKET_SIZE: u64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TocKind {
    Cpk = 0,
    Toc = 1,
    Itoc = 2,
    Etoc = 3,
    Gtoc = 4,
}

impl TocKind {
    /// Order in which sections are emitted on write.
    pub const WRITE_ORDER: [TocKind; 5] = [
        TocKind::Cpk,
        TocKind::Itoc,
        TocKind::Toc,
        TocKind::Etoc,
        TocKind::Gtoc,
    ];

    pub fn magic(self) -> &'static [u8; 4] {
        match self {
            TocKind::Cpk => CPK_MAGIC,
            TocKind::Toc => b"TOC ",
            TocKind::Itoc => b"ITOC",
            TocKind::Etoc => b"ETOC",
            TocKind::Gtoc => b"GTOC",
        }
    }

    fn label(self) -> &'static str {
        match self {
            TocKind::Cpk => "CPK",
            TocKind::Toc => "TOC",
            TocKind::Itoc => "ITOC",
            TocKind::Etoc => "ETOC",
            TocKind::Gtoc => "GTOC",
        }
    }

    fn header_entry_name(self) -> &'static str {
        match self {
            TocKind::Cpk => "CPK_HDR",
            TocKind::Toc => "TOC_HDR",
            TocKind::Itoc => "ITOC_HDR",
            TocKind::Etoc => "ETOC_HDR",
            TocKind::Gtoc => "GTOC_HDR",
        }
    }

    fn offset_column(self) -> &'static str {
        match self {
            TocKind::Cpk => "",
            TocKind::Toc => "TocOffset",
            TocKind::Itoc => "ItocOffset",
            TocKind::Etoc => "EtocOffset",
            TocKind::Gtoc => "GtocOffset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Cpk,
    Hdr,
    File,
    Content,
}

/// Location of a scalar inside the raw packet of the owning section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchField {
    pub position: u64,
    pub width: FieldWidth,
}

impl PatchField {
    /// `bias` is added to the cell position, for cells of tables nested in a
    /// blob of the section packet.
    fn from_cell(cell: &Cell, bias: u64) -> Option<Self> {
        Some(Self {
            position: cell.position? + bias,
            width: cell.value.field_width()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub dir_name: Option<String>,
    pub file_name: String,
    pub file_size: u64,
    pub file_size_field: Option<PatchField>,
    pub extract_size: Option<u64>,
    pub extract_size_field: Option<PatchField>,
    pub file_offset: u64,
    pub file_offset_field: Option<PatchField>,
    pub id: Option<u32>,
    pub user_string: Option<String>,
    pub local_dir: Option<String>,
    pub update_date_time: Option<u64>,
    pub toc: TocKind,
    pub kind: EntryKind,
    pub encrypted: bool,
    /// Base added to the stored offset to obtain `file_offset`.
    pub offset: u64,
}

impl FileEntry {
    pub fn new(toc: TocKind, kind: EntryKind) -> Self {
        Self {
            dir_name: None,
            file_name: String::new(),
            file_size: 0,
            file_size_field: None,
            extract_size: None,
            extract_size_field: None,
            file_offset: 0,
            file_offset_field: None,
            id: None,
            user_string: None,
            local_dir: None,
            update_date_time: None,
            toc,
            kind,
            encrypted: false,
            offset: 0,
        }
    }

    pub fn full_path(&self) -> String {
        match &self.dir_name {
            Some(dir) if !dir.is_empty() => format!("{}/{}", dir, self.file_name),
            _ => self.file_name.clone(),
        }
    }
}

/// New values for an entry; `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryPatch {
    pub offset: Option<u64>,
    pub size: Option<u64>,
    pub extract_size: Option<u64>,
}

#[derive(Debug, Clone)]
struct Section {
    offset: u64,
    unknown: u32,
    encrypted: bool,
    /// Decrypted packet bytes.
    packet: Vec<u8>,
}

/// Where a file payload lands in a repacked archive.
struct Placement<'a> {
    offset: u64,
    source_offset: u64,
    size: u64,
    replacement: Option<&'a [u8]>,
}

#[derive(Debug, Clone, Default)]
pub struct Cpk {
    pub file_table: Vec<FileEntry>,
    pub cpk_data: HashMap<String, CellValue>,
    pub content_offset: u64,
    pub align: u64,
    sections: [Option<Section>; 5],
}

impl Cpk {
    pub fn new() -> Self {
        Self {
            content_offset: UNSET_OFFSET,
            align: DEFAULT_ALIGN,
            ..Default::default()
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut cpk = Cpk::new();
        cpk.read_cpk(path)?;
        Ok(cpk)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cpk = Cpk::new();
        cpk.read_from(Cursor::new(data), data.len() as u64)?;
        Ok(cpk)
    }

    pub fn read_cpk<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        info!("File size: {} bytes", file_size);
        self.read_from(BufReader::new(file), file_size)
    }

    pub fn read_from<R: Read + Seek>(&mut self, reader: R, file_size: u64) -> Result<()> {
        *self = Cpk::new();
        let mut reader = EndianReader::new(reader, false);

        let cpk_section = read_section(&mut reader, TocKind::Cpk, 0, file_size)?;
        let utf = Utf::parse(&cpk_section.packet)?;

        self.file_table.push(FileEntry {
            file_name: TocKind::Cpk.header_entry_name().to_string(),
            file_offset: SECTION_HEADER_SIZE,
            file_size: cpk_section.packet.len() as u64,
            encrypted: cpk_section.encrypted,
            ..FileEntry::new(TocKind::Cpk, EntryKind::Cpk)
        });
        self.sections[TocKind::Cpk as usize] = Some(cpk_section);

        if let Some(row) = utf.rows.first() {
            for (column, cell) in utf.columns.iter().zip(row) {
                self.cpk_data.insert(column.name.clone(), cell.value.clone());
            }
        }

        if let Some((content_offset, field)) = header_offset(&utf, "ContentOffset") {
            self.content_offset = content_offset;
            self.file_table.push(FileEntry {
                file_name: "CONTENT_OFFSET".to_string(),
                file_offset: content_offset,
                file_offset_field: field,
                ..FileEntry::new(TocKind::Cpk, EntryKind::Content)
            });
        }

        self.align = utf
            .get_column_data(0, "Align")
            .and_then(CellValue::to_u64)
            .filter(|&align| align > 0)
            .unwrap_or(DEFAULT_ALIGN);

        debug!("Content offset: 0x{:X}", self.content_offset);
        debug!("Align: 0x{:X}", self.align);

        for kind in [TocKind::Toc, TocKind::Etoc, TocKind::Itoc, TocKind::Gtoc] {
            let Some((offset, field)) = header_offset(&utf, kind.offset_column()) else {
                continue;
            };
            debug!("{} offset: 0x{:X}", kind.label(), offset);

            self.file_table.push(FileEntry {
                file_name: kind.header_entry_name().to_string(),
                file_offset: offset,
                file_offset_field: field,
                ..FileEntry::new(TocKind::Cpk, EntryKind::Hdr)
            });

            let section = read_section(&mut reader, kind, offset, file_size)?;
            if let Some(entry) = self
                .file_table
                .iter_mut()
                .find(|e| e.file_name == kind.header_entry_name())
            {
                entry.encrypted = section.encrypted;
                entry.file_size = section.packet.len() as u64;
            }

            match kind {
                TocKind::Toc => self.read_toc(&section)?,
                TocKind::Etoc => self.read_etoc(&section)?,
                TocKind::Itoc => self.read_itoc(&section)?,
                // The group index is kept verbatim and never interpreted.
                TocKind::Gtoc | TocKind::Cpk => {}
            }

            self.sections[kind as usize] = Some(section);
        }

        Ok(())
    }

    fn read_toc(&mut self, section: &Section) -> Result<()> {
        let add_offset = section.offset.min(self.content_offset);
        let utf = Utf::parse(&section.packet)?;

        for row in 0..utf.num_rows as usize {
            let string_at = |name: &str| {
                utf.get_column_data(row, name)
                    .and_then(CellValue::as_string)
                    .map(str::to_string)
            };
            let number_at =
                |name: &str| utf.get_column_data(row, name).and_then(CellValue::to_u64);
            let field_at = |name: &str| {
                utf.get_cell(row, name)
                    .and_then(|cell| PatchField::from_cell(cell, 0))
            };

            let entry = FileEntry {
                dir_name: string_at("DirName"),
                file_name: string_at("FileName").unwrap_or_default(),
                file_size: number_at("FileSize").unwrap_or(0),
                file_size_field: field_at("FileSize"),
                extract_size: number_at("ExtractSize"),
                extract_size_field: field_at("ExtractSize"),
                file_offset: number_at("FileOffset").unwrap_or(0) + add_offset,
                file_offset_field: field_at("FileOffset"),
                id: number_at("ID").map(|id| id as u32),
                user_string: string_at("UserString"),
                offset: add_offset,
                ..FileEntry::new(TocKind::Toc, EntryKind::File)
            };

            debug!(
                "Adding file entry: '{}' (size: {}, offset: 0x{:X})",
                entry.full_path(),
                entry.file_size,
                entry.file_offset
            );
            self.file_table.push(entry);
        }

        Ok(())
    }

    /// Attaches `LocalDir` to file entries by row order.
    fn read_etoc(&mut self, section: &Section) -> Result<()> {
        let utf = Utf::parse(&section.packet)?;

        let file_indices: Vec<_> = self
            .file_table
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == EntryKind::File)
            .map(|(idx, _)| idx)
            .collect();

        if (utf.num_rows as usize) < file_indices.len() {
            return Err(ArchiveError::InvalidFormat(format!(
                "ETOC has {} rows for {} files",
                utf.num_rows,
                file_indices.len()
            )));
        }

        for (row, idx) in file_indices.into_iter().enumerate() {
            let entry = &mut self.file_table[idx];
            entry.local_dir = utf
                .get_column_data(row, "LocalDir")
                .and_then(CellValue::as_string)
                .map(str::to_string);
            entry.update_date_time = utf
                .get_column_data(row, "UpdateDateTime")
                .and_then(CellValue::to_u64);
        }

        Ok(())
    }

    fn read_itoc(&mut self, section: &Section) -> Result<()> {
        if self.content_offset == UNSET_OFFSET {
            return Err(ArchiveError::InvalidFormat(
                "ITOC present without a content offset".to_string(),
            ));
        }

        let utf = Utf::parse(&section.packet)?;
        let mut records: BTreeMap<u32, FileEntry> = BTreeMap::new();

        for column in ["DataL", "DataH"] {
            let Some(cell) = utf.get_cell(0, column) else {
                continue;
            };
            let (Some(blob), Some(blob_position)) = (cell.value.as_data(), cell.position) else {
                continue;
            };

            let nested = Utf::parse(blob)?;
            for row in 0..nested.num_rows as usize {
                let Some(id) = nested
                    .get_column_data(row, "ID")
                    .and_then(CellValue::to_u64)
                    .map(|id| id as u32)
                else {
                    continue;
                };

                let mut entry = FileEntry {
                    file_name: format!("{:04}", id),
                    id: Some(id),
                    ..FileEntry::new(TocKind::Itoc, EntryKind::File)
                };

                if let Some(cell) = nested.get_cell(row, "FileSize") {
                    entry.file_size = cell.value.to_u64().unwrap_or(0);
                    entry.file_size_field = PatchField::from_cell(cell, blob_position);
                }
                if let Some(cell) = nested.get_cell(row, "ExtractSize") {
                    let extract_size = cell.value.to_u64().unwrap_or(0);
                    if extract_size != 0 {
                        entry.extract_size = Some(extract_size);
                        entry.extract_size_field = PatchField::from_cell(cell, blob_position);
                    }
                }

                if records.insert(id, entry).is_some() {
                    warn!("ITOC: ID {} appears in more than one table", id);
                }
            }
        }

        let mut file_offset = self.content_offset;
        for (_, mut entry) in records {
            entry.file_offset = file_offset;
            entry.offset = self.content_offset;
            file_offset += align_up(entry.file_size, self.align);
            self.file_table.push(entry);
        }

        Ok(())
    }

    pub fn files(&self) -> impl Iterator<Item = (usize, &FileEntry)> {
        self.file_table
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == EntryKind::File)
    }

    /// Finds a file entry by full path or bare file name, ignoring case.
    pub fn find_file(&self, target: &str) -> Option<usize> {
        let target = target.to_lowercase();
        self.files()
            .find(|(_, e)| e.full_path().to_lowercase() == target)
            .or_else(|| {
                self.files()
                    .find(|(_, e)| e.file_name.to_lowercase() == target)
            })
            .map(|(idx, _)| idx)
    }

    /// Decrypted packet of a section, if the archive has one.
    pub fn section_packet(&self, kind: TocKind) -> Option<&[u8]> {
        self.sections[kind as usize]
            .as_ref()
            .map(|s| s.packet.as_slice())
    }

    pub fn section_offset(&self, kind: TocKind) -> Option<u64> {
        self.sections[kind as usize].as_ref().map(|s| s.offset)
    }

    /// Updates an entry and overwrites the matching fields of its owning
    /// packet in place. Fields without backing storage are left alone.
    pub fn patch_entry(&mut self, index: usize, patch: EntryPatch) -> Result<()> {
        let entry = self
            .file_table
            .get_mut(index)
            .ok_or_else(|| ArchiveError::FileNotFound(format!("entry #{}", index)))?;

        let mut writes = Vec::new();

        if let Some(extract_size) = patch.extract_size {
            entry.extract_size = Some(extract_size);
            if let Some(field) = entry.extract_size_field {
                writes.push((field, extract_size));
            }
        }
        if let Some(size) = patch.size {
            entry.file_size = size;
            if let Some(field) = entry.file_size_field {
                writes.push((field, size));
            }
        }
        if let Some(offset) = patch.offset {
            entry.file_offset = offset;
            if let Some(field) = entry.file_offset_field {
                let stored = offset.checked_sub(entry.offset).ok_or_else(|| {
                    ArchiveError::InvalidFormat(format!(
                        "Offset 0x{:X} lies before base 0x{:X} of '{}'",
                        offset, entry.offset, entry.file_name
                    ))
                })?;
                writes.push((field, stored));
            }
        }

        if writes.is_empty() {
            return Ok(());
        }

        let toc = entry.toc;
        let section = self.sections[toc as usize].as_mut().ok_or_else(|| {
            ArchiveError::InvalidFormat(format!("No {} section to patch", toc.label()))
        })?;

        for (field, value) in writes {
            write_field(&mut section.packet, field, value)?;
        }

        Ok(())
    }

    /// Emits every section envelope at its recorded offset, re-encrypting
    /// packets that were encrypted on read. File data is not touched.
    pub fn write_headers<W: Write + Seek>(&self, writer: W) -> Result<()> {
        let mut writer = EndianWriter::new(writer, true);

        for kind in TocKind::WRITE_ORDER {
            let Some(section) = &self.sections[kind as usize] else {
                continue;
            };
            write_section(&mut writer, kind, section)?;

            if kind == TocKind::Cpk {
                let marker_at = COPYRIGHT_END - COPYRIGHT_MARKER.len() as u64;
                if SECTION_HEADER_SIZE + section.packet.len() as u64 <= marker_at {
                    writer.seek(SeekFrom::Start(marker_at))?;
                    writer.write_bytes(COPYRIGHT_MARKER)?;
                } else {
                    warn!("CPK header packet overlaps the copyright marker, not stamping it");
                }
            }
        }

        Ok(())
    }

    /// Reads the stored bytes of an entry, decompressing CRILAYLA payloads.
    pub fn read_file<R: Read + Seek>(&self, reader: &mut R, index: usize) -> Result<Vec<u8>> {
        let entry = self
            .file_table
            .get(index)
            .ok_or_else(|| ArchiveError::FileNotFound(format!("entry #{}", index)))?;

        let stream_len = reader.seek(SeekFrom::End(0))?;
        check_stored_range(entry, stream_len)?;

        reader.seek(SeekFrom::Start(entry.file_offset))?;
        let mut data = vec![0u8; entry.file_size as usize];
        reader.read_exact(&mut data)?;

        if is_crilayla(&data) {
            info!(
                "Decompressing CRILAYLA file: {} (compressed size: {})",
                entry.full_path(),
                data.len()
            );
            data = decompress_crilayla(&data)?;
        }

        Ok(data)
    }

    pub fn extract_file<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        cpk_path: P,
        target: &str,
        output_dir: Q,
    ) -> Result<()> {
        let index = self
            .find_file(target)
            .ok_or_else(|| ArchiveError::FileNotFound(target.to_string()))?;
        let mut reader = BufReader::new(File::open(cpk_path)?);
        self.extract_single_file(&mut reader, index, output_dir.as_ref())
    }

    pub fn extract_all<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        cpk_path: P,
        output_dir: Q,
    ) -> Result<()> {
        let mut reader = BufReader::new(File::open(cpk_path)?);
        let indices: Vec<_> = self.files().map(|(idx, _)| idx).collect();
        for index in indices {
            self.extract_single_file(&mut reader, index, output_dir.as_ref())?;
        }
        Ok(())
    }

    fn extract_single_file<R: Read + Seek>(
        &self,
        reader: &mut R,
        index: usize,
        output_dir: &Path,
    ) -> Result<()> {
        let entry = &self.file_table[index];
        let output_path = output_dir.join(entry_path(&entry.full_path())?);

        if entry.file_size == 0 {
            warn!("File {} has zero size, skipping", output_path.display());
            return Ok(());
        }

        let data = self.read_file(reader, index)?;
        if let Some(parent) = output_path.parent() {
            create_dir_all(parent)?;
        }

        info!("Extracting: {} ({} bytes)", output_path.display(), data.len());
        std::fs::write(&output_path, &data)?;
        Ok(())
    }

    /// Rebuilds the archive into `dest`: file payloads are laid out from the
    /// content offset in their original order, each padded to the archive
    /// alignment, with entries named in `replacements` swapped for the given
    /// bytes. Sections stored behind the content region are moved after the
    /// new content.
    ///
    /// Every table field is patched on a staged copy before the first byte
    /// reaches `dest`, so a replacement that does not fit its size field
    /// fails without writing anything. On error `self` is left unchanged.
    pub fn repack<R: Read + Seek, W: Write + Seek>(
        &mut self,
        source: &mut R,
        dest: W,
        replacements: &HashMap<String, Vec<u8>>,
    ) -> Result<()> {
        if self.content_offset == UNSET_OFFSET {
            return Err(ArchiveError::Unsupported(
                "Repacking an archive without a content offset".to_string(),
            ));
        }

        let source_len = source.seek(SeekFrom::End(0))?;
        let mut staged = self.clone();

        let mut order: Vec<usize> = self.files().map(|(idx, _)| idx).collect();
        order.sort_by_key(|&idx| self.file_table[idx].file_offset);

        let mut placements = Vec::with_capacity(order.len());
        let mut position = self.content_offset;
        let mut replaced = 0;
        for idx in order {
            let entry = &self.file_table[idx];
            let replacement = replacements
                .get(&entry.full_path())
                .or_else(|| replacements.get(&entry.file_name))
                .map(Vec::as_slice);

            let patch = match replacement {
                Some(data) => {
                    debug!(
                        "Replacing '{}' ({} -> {} bytes) at 0x{:X}",
                        entry.full_path(),
                        entry.file_size,
                        data.len(),
                        position
                    );
                    replaced += 1;
                    let size = data.len() as u64;
                    EntryPatch {
                        offset: Some(position),
                        size: Some(size),
                        extract_size: Some(size),
                    }
                }
                None => {
                    check_stored_range(entry, source_len)?;
                    EntryPatch {
                        offset: Some(position),
                        ..EntryPatch::default()
                    }
                }
            };
            staged.patch_entry(idx, patch)?;

            let size = replacement.map_or(entry.file_size, |data| data.len() as u64);
            placements.push(Placement {
                offset: position,
                source_offset: entry.file_offset,
                size,
                replacement,
            });
            position = align_up(position + size, self.align);
        }

        let content_end = position;
        staged.patch_header_cell("ContentSize", content_end - self.content_offset)?;
        staged.relocate_trailing_sections(content_end)?;

        let mut writer = EndianWriter::new(dest, true);
        writer.write_until(self.content_offset)?;
        for placement in &placements {
            writer.write_until(placement.offset)?;
            match placement.replacement {
                Some(data) => writer.write_bytes(data)?,
                None => {
                    source.seek(SeekFrom::Start(placement.source_offset))?;
                    let mut data = vec![0u8; placement.size as usize];
                    source.read_exact(&mut data)?;
                    writer.write_bytes(&data)?;
                }
            }
        }
        writer.write_until(content_end)?;

        let mut dest = writer.into_inner();
        staged.write_headers(&mut dest)?;
        dest.flush()?;

        *self = staged;
        info!("Repacked archive, {} file(s) replaced", replaced);
        Ok(())
    }

    /// Repacks `source_path` into `dest_path`, which may be the same file.
    /// The archive is built in a temporary file beside the destination and
    /// only moved over it once complete.
    pub fn repack_file<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        source_path: P,
        dest_path: Q,
        replacements: &HashMap<String, Vec<u8>>,
    ) -> Result<()> {
        let dest_path = dest_path.as_ref();
        let source = std::fs::read(source_path)?;

        let dest_dir = match dest_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut staging = NamedTempFile::new_in(dest_dir)?;
        self.repack(
            &mut Cursor::new(&source),
            BufWriter::new(staging.as_file_mut()),
            replacements,
        )?;

        staging
            .persist(dest_path)
            .map_err(|e| ArchiveError::Io(e.error))?;
        Ok(())
    }

    /// Moves sections that sat behind the content region to follow
    /// `content_end`, keeping their relative order.
    fn relocate_trailing_sections(&mut self, content_end: u64) -> Result<()> {
        let mut trailing: Vec<TocKind> = [TocKind::Toc, TocKind::Itoc, TocKind::Etoc, TocKind::Gtoc]
            .into_iter()
            .filter(|&kind| {
                self.section_offset(kind)
                    .is_some_and(|offset| offset >= self.content_offset)
            })
            .collect();
        trailing.sort_by_key(|&kind| self.section_offset(kind));

        let mut next_offset = content_end;
        for kind in trailing {
            next_offset = align_up(next_offset, self.align);
            if let Some(section) = self.sections[kind as usize].as_mut() {
                section.offset = next_offset;
                next_offset += SECTION_HEADER_SIZE + section.packet.len() as u64;
            }
            let new_offset = self.section_offset(kind);
            if let Some(idx) = self
                .file_table
                .iter()
                .position(|e| e.file_name == kind.header_entry_name())
            {
                self.patch_entry(
                    idx,
                    EntryPatch {
                        offset: new_offset,
                        ..EntryPatch::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Overwrites a numeric cell of the CPK header row when it has storage.
    fn patch_header_cell(&mut self, column: &str, value: u64) -> Result<()> {
        let Some(section) = self.sections[TocKind::Cpk as usize].as_mut() else {
            return Ok(());
        };
        let utf = Utf::parse(&section.packet)?;
        if let Some(field) = utf
            .get_cell(0, column)
            .and_then(|cell| PatchField::from_cell(cell, 0))
        {
            write_field(&mut section.packet, field, value)?;
            self.cpk_data
                .insert(column.to_string(), widen_to(field.width, value));
        }
        Ok(())
    }
}

/// Fails when an entry's stored bytes run past the end of the archive.
fn check_stored_range(entry: &FileEntry, stream_len: u64) -> Result<()> {
    match entry.file_offset.checked_add(entry.file_size) {
        Some(end) if end <= stream_len => Ok(()),
        _ => Err(ArchiveError::Truncated(format!(
            "'{}' claims 0x{:X} bytes at 0x{:X}, past the archive end 0x{:X}",
            entry.full_path(),
            entry.file_size,
            entry.file_offset,
            stream_len
        ))),
    }
}

/// Reads the column as a section offset; absent when the cell has no storage
/// or holds the unset sentinel.
fn header_offset(utf: &Utf, column: &str) -> Option<(u64, Option<PatchField>)> {
    let cell = utf.get_cell(0, column)?;
    cell.position?;
    let value = cell.value.to_u64()?;
    if value == UNSET_OFFSET {
        return None;
    }
    Some((value, PatchField::from_cell(cell, 0)))
}

fn read_section<R: Read + Seek>(
    reader: &mut EndianReader<R>,
    kind: TocKind,
    offset: u64,
    file_size: u64,
) -> Result<Section> {
    reader.seek(SeekFrom::Start(offset))?;
    if &reader.read_magic()? != kind.magic() {
        return Err(ArchiveError::InvalidSignature(kind.label()));
    }

    reader.set_endian(true);
    let unknown = reader.read_u32()?;
    let size = reader.read_i64()?;
    reader.set_endian(false);

    let position = reader.position()?;
    if size < 0 || size as u64 > MAX_PACKET_SIZE || position + size as u64 > file_size {
        return Err(ArchiveError::InvalidFormat(format!(
            "{} packet size {} does not fit in the archive ({} bytes left)",
            kind.label(),
            size,
            file_size.saturating_sub(position)
        )));
    }

    let mut packet = reader.read_bytes(size as usize)?;
    let encrypted = !packet.starts_with(crate::utf::UTF_MAGIC);
    if encrypted {
        debug!("{} packet is encrypted, decrypting...", kind.label());
        packet = decrypt_utf(&packet);
    }

    if kind != TocKind::Gtoc && !packet.starts_with(crate::utf::UTF_MAGIC) {
        return Err(ArchiveError::InvalidUtfSignature);
    }

    Ok(Section {
        offset,
        unknown,
        encrypted,
        packet,
    })
}

fn write_section<W: Write + Seek>(
    writer: &mut EndianWriter<W>,
    kind: TocKind,
    section: &Section,
) -> Result<()> {
    writer.seek(SeekFrom::Start(section.offset))?;
    writer.write_bytes(kind.magic())?;
    writer.write_u32(section.unknown)?;
    writer.write_u64(section.packet.len() as u64)?;
    if section.encrypted {
        writer.write_bytes(&decrypt_utf(&section.packet))
    } else {
        writer.write_bytes(&section.packet)
    }
}

/// XORs `input` with the UTF obfuscation keystream. Applying it twice
/// yields the original bytes.
pub fn decrypt_utf(input: &[u8]) -> Vec<u8> {
    let mut m = 0x0000655f_u32;
    let t = 0x00004115_u32;

    input
        .iter()
        .map(|&byte| {
            let out = byte ^ (m & 0xff) as u8;
            m = m.wrapping_mul(t);
            out
        })
        .collect()
}

/// Writes `value` big endian at the field, which must lie inside `packet`.
fn write_field(packet: &mut [u8], field: PatchField, value: u64) -> Result<()> {
    let start = field.position as usize;
    let end = start + field.width.size();
    let target = packet.get_mut(start..end).ok_or_else(|| {
        ArchiveError::InvalidFormat(format!(
            "Patch at 0x{:X} ({:?}) lies outside the packet",
            field.position, field.width
        ))
    })?;

    let overflow = || {
        ArchiveError::InvalidFormat(format!(
            "Value {} does not fit a {:?} field",
            value, field.width
        ))
    };

    match field.width {
        FieldWidth::U8 => target.copy_from_slice(&[u8::try_from(value).map_err(|_| overflow())?]),
        FieldWidth::U16 => target
            .copy_from_slice(&u16::try_from(value).map_err(|_| overflow())?.to_be_bytes()),
        FieldWidth::U32 => target
            .copy_from_slice(&u32::try_from(value).map_err(|_| overflow())?.to_be_bytes()),
        FieldWidth::U64 => target.copy_from_slice(&value.to_be_bytes()),
        FieldWidth::F32 => target.copy_from_slice(&(value as f32).to_be_bytes()),
    }

    Ok(())
}

fn widen_to(width: FieldWidth, value: u64) -> CellValue {
    match width {
        FieldWidth::U8 => CellValue::UInt8(value as u8),
        FieldWidth::U16 => CellValue::UInt16(value as u16),
        FieldWidth::U32 => CellValue::UInt32(value as u32),
        FieldWidth::U64 => CellValue::UInt64(value),
        FieldWidth::F32 => CellValue::Float(value as f32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utf::{Column, ColumnType, StorageMode};

    const CONTENT: u64 = 0x1000;

    fn per_row(name: &str, column_type: ColumnType) -> Column {
        Column::new(name, StorageMode::PerRow, column_type)
    }

    fn header_packet(sections: &[(TocKind, u64)], content: u64, align: u16) -> Vec<u8> {
        let offset_of = |kind| {
            sections
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, o)| *o)
                .unwrap_or(UNSET_OFFSET)
        };
        let mut utf = Utf::with_columns(
            "CpkHeader",
            vec![
                per_row("UpdateDateTime", ColumnType::UInt64),
                per_row("ContentOffset", ColumnType::UInt64),
                per_row("ContentSize", ColumnType::UInt64),
                per_row("TocOffset", ColumnType::UInt64),
                per_row("ItocOffset", ColumnType::UInt64),
                per_row("EtocOffset", ColumnType::UInt64),
                per_row("GtocOffset", ColumnType::UInt64),
                Column::new("EnabledPackedSize", StorageMode::Zero, ColumnType::UInt64),
                per_row("Files", ColumnType::UInt32),
                per_row("Align", ColumnType::UInt16),
            ],
        );
        utf.push_row(vec![
            CellValue::UInt64(1),
            CellValue::UInt64(content),
            CellValue::UInt64(0x1000),
            CellValue::UInt64(offset_of(TocKind::Toc)),
            CellValue::UInt64(offset_of(TocKind::Itoc)),
            CellValue::UInt64(offset_of(TocKind::Etoc)),
            CellValue::UInt64(offset_of(TocKind::Gtoc)),
            CellValue::None,
            CellValue::UInt32(2),
            CellValue::UInt16(align),
        ])
        .unwrap();
        utf.to_bytes().unwrap()
    }

    fn toc_packet(files: &[(&str, &str, u32, u64)]) -> Vec<u8> {
        let mut utf = Utf::with_columns(
            "CpkTocInfo",
            vec![
                per_row("DirName", ColumnType::String),
                per_row("FileName", ColumnType::String),
                per_row("FileSize", ColumnType::UInt32),
                per_row("ExtractSize", ColumnType::UInt32),
                per_row("FileOffset", ColumnType::UInt64),
                per_row("ID", ColumnType::UInt32),
                per_row("UserString", ColumnType::String),
            ],
        );
        for (id, (dir, name, size, offset)) in files.iter().enumerate() {
            utf.push_row(vec![
                CellValue::String(dir.to_string()),
                CellValue::String(name.to_string()),
                CellValue::UInt32(*size),
                CellValue::UInt32(*size),
                CellValue::UInt64(*offset),
                CellValue::UInt32(id as u32),
                CellValue::String("<NULL>".to_string()),
            ])
            .unwrap();
        }
        utf.to_bytes().unwrap()
    }

    fn etoc_packet(local_dirs: &[&str]) -> Vec<u8> {
        let mut utf = Utf::with_columns(
            "CpkEtocInfo",
            vec![
                per_row("UpdateDateTime", ColumnType::UInt64),
                per_row("LocalDir", ColumnType::String),
            ],
        );
        for dir in local_dirs {
            utf.push_row(vec![
                CellValue::UInt64(0x07E4_0101),
                CellValue::String(dir.to_string()),
            ])
            .unwrap();
        }
        utf.to_bytes().unwrap()
    }

    fn place(buffer: &mut Vec<u8>, at: u64, bytes: &[u8]) {
        let at = at as usize;
        if buffer.len() < at + bytes.len() {
            buffer.resize(at + bytes.len(), 0);
        }
        buffer[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn envelope(kind: TocKind, packet: &[u8], encrypt: bool) -> Vec<u8> {
        let mut out = kind.magic().to_vec();
        out.extend_from_slice(&0xFFu32.to_le_bytes());
        out.extend_from_slice(&(packet.len() as u64).to_le_bytes());
        if encrypt {
            out.extend_from_slice(&decrypt_utf(packet));
        } else {
            out.extend_from_slice(packet);
        }
        out
    }

    const ETOC_AT: u64 = 0x2800;

    /// Header at 0, TOC at 0x800, two files from 0x1000, ETOC behind them.
    fn toc_archive() -> Vec<u8> {
        let mut bytes = Vec::new();
        let header = header_packet(
            &[(TocKind::Toc, 0x800), (TocKind::Etoc, ETOC_AT)],
            CONTENT,
            0x800,
        );
        place(&mut bytes, 0, &envelope(TocKind::Cpk, &header, true));
        place(&mut bytes, 0x7FA, COPYRIGHT_MARKER);
        let toc = toc_packet(&[
            ("bgm", "title.hca", 100, 0x800),
            ("se", "click.hca", 3000, 0x1000),
        ]);
        place(&mut bytes, 0x800, &envelope(TocKind::Toc, &toc, true));
        place(&mut bytes, 0x1000, &[b'a'; 100]);
        place(&mut bytes, 0x1800, &[b'b'; 3000]);
        let etoc = etoc_packet(&["bgm", "se", ""]);
        place(&mut bytes, ETOC_AT, &envelope(TocKind::Etoc, &etoc, false));
        bytes
    }

    fn nested_sizes(wide: bool, rows: &[(u16, u32, u32)]) -> Vec<u8> {
        let size_type = if wide {
            ColumnType::UInt32
        } else {
            ColumnType::UInt16
        };
        let mut utf = Utf::with_columns(
            "CpkItocL",
            vec![
                per_row("ID", ColumnType::UInt16),
                per_row("FileSize", size_type),
                per_row("ExtractSize", size_type),
            ],
        );
        for &(id, size, extract) in rows {
            let (size, extract) = if wide {
                (CellValue::UInt32(size), CellValue::UInt32(extract))
            } else {
                (
                    CellValue::UInt16(size as u16),
                    CellValue::UInt16(extract as u16),
                )
            };
            utf.push_row(vec![CellValue::UInt16(id), size, extract])
                .unwrap();
        }
        utf.to_bytes().unwrap()
    }

    fn itoc_archive() -> Vec<u8> {
        let mut bytes = Vec::new();
        let header = header_packet(&[(TocKind::Itoc, 0x800)], CONTENT, 32);
        place(&mut bytes, 0, &envelope(TocKind::Cpk, &header, false));
        place(&mut bytes, 0x7FA, COPYRIGHT_MARKER);

        let mut itoc = Utf::with_columns(
            "CpkItocInfo",
            vec![
                per_row("FilesL", ColumnType::UInt32),
                per_row("FilesH", ColumnType::UInt32),
                per_row("DataL", ColumnType::Data),
                per_row("DataH", ColumnType::Data),
            ],
        );
        itoc.push_row(vec![
            CellValue::UInt32(2),
            CellValue::UInt32(1),
            CellValue::Data(nested_sizes(false, &[(0, 100, 0), (2, 50, 60)])),
            CellValue::Data(nested_sizes(true, &[(1, 75, 0)])),
        ])
        .unwrap();
        let itoc = itoc.to_bytes().unwrap();
        place(&mut bytes, 0x800, &envelope(TocKind::Itoc, &itoc, true));
        place(&mut bytes, CONTENT, &[0u8; 0x200]);
        bytes
    }

    fn entry<'a>(cpk: &'a Cpk, name: &str) -> &'a FileEntry {
        cpk.file_table
            .iter()
            .find(|e| e.file_name == name)
            .unwrap()
    }

    #[test]
    fn test_decrypt_is_self_inverse() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
        let once = decrypt_utf(&data);
        assert_ne!(once, data);
        assert_eq!(decrypt_utf(&once), data);
        assert!(decrypt_utf(&[]).is_empty());
    }

    #[test]
    fn test_reads_toc_archive() {
        let cpk = Cpk::from_bytes(&toc_archive()).unwrap();

        let names: Vec<_> = cpk.file_table.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(
            names,
            [
                "CPK_HDR",
                "CONTENT_OFFSET",
                "TOC_HDR",
                "title.hca",
                "click.hca",
                "ETOC_HDR"
            ]
        );
        assert_eq!(cpk.content_offset, CONTENT);
        assert_eq!(cpk.align, 0x800);
        assert!(entry(&cpk, "CPK_HDR").encrypted);
        assert!(entry(&cpk, "TOC_HDR").encrypted);
        assert!(!entry(&cpk, "ETOC_HDR").encrypted);

        let title = entry(&cpk, "title.hca");
        assert_eq!(title.full_path(), "bgm/title.hca");
        assert_eq!(title.file_offset, 0x1000);
        assert_eq!(title.file_size, 100);
        assert_eq!(title.extract_size, Some(100));
        assert_eq!(title.offset, 0x800);
        assert_eq!(title.local_dir.as_deref(), Some("bgm"));
        assert_eq!(title.update_date_time, Some(0x07E4_0101));

        let click = entry(&cpk, "click.hca");
        assert_eq!(click.file_offset, 0x1800);
        assert_eq!(click.local_dir.as_deref(), Some("se"));
        assert_eq!(click.id, Some(1));

        assert_eq!(
            cpk.cpk_data.get("Files").and_then(CellValue::as_u32),
            Some(2)
        );
    }

    #[test]
    fn test_unmodified_write_is_identical() {
        for original in [toc_archive(), itoc_archive()] {
            let cpk = Cpk::from_bytes(&original).unwrap();
            let mut rewritten = Cursor::new(original.clone());
            cpk.write_headers(&mut rewritten).unwrap();
            assert_eq!(rewritten.into_inner(), original);
        }
    }

    #[test]
    fn test_headers_onto_blank_output() {
        let original = toc_archive();
        let cpk = Cpk::from_bytes(&original).unwrap();
        let mut blank = Cursor::new(Vec::new());
        cpk.write_headers(&mut blank).unwrap();
        let blank = blank.into_inner();

        assert_eq!(&blank[..0x10], &original[..0x10]);
        assert_eq!(&blank[0x7FA..0x800], COPYRIGHT_MARKER);
        assert_eq!(&blank[ETOC_AT as usize..], &original[ETOC_AT as usize..]);
    }

    #[test]
    fn test_patch_touches_only_the_field() {
        let mut cpk = Cpk::from_bytes(&toc_archive()).unwrap();
        let idx = cpk.find_file("se/click.hca").unwrap();
        let field = cpk.file_table[idx].file_size_field.unwrap();
        let before = cpk.section_packet(TocKind::Toc).unwrap().to_vec();

        cpk.patch_entry(
            idx,
            EntryPatch {
                size: Some(0x0102_0304),
                ..EntryPatch::default()
            },
        )
        .unwrap();

        let after = cpk.section_packet(TocKind::Toc).unwrap();
        let range = field.position as usize..field.position as usize + field.width.size();
        for (i, (a, b)) in before.iter().zip(after).enumerate() {
            if !range.contains(&i) {
                assert_eq!(a, b, "byte {} changed", i);
            }
        }
        assert_eq!(&after[range], &[1, 2, 3, 4]);
        assert_eq!(cpk.file_table[idx].file_size, 0x0102_0304);
    }

    #[test]
    fn test_patch_offset_is_stored_relative() {
        let mut cpk = Cpk::from_bytes(&toc_archive()).unwrap();
        let idx = cpk.find_file("click.hca").unwrap();
        cpk.patch_entry(
            idx,
            EntryPatch {
                offset: Some(0x2000),
                ..EntryPatch::default()
            },
        )
        .unwrap();

        let field = cpk.file_table[idx].file_offset_field.unwrap();
        assert_eq!(field.width, FieldWidth::U64);
        let packet = cpk.section_packet(TocKind::Toc).unwrap();
        let at = field.position as usize;
        assert_eq!(
            u64::from_be_bytes(packet[at..at + 8].try_into().unwrap()),
            0x1800
        );

        let mut out = Cursor::new(toc_archive());
        cpk.write_headers(&mut out).unwrap();
        let reread = Cpk::from_bytes(&out.into_inner()).unwrap();
        assert_eq!(entry(&reread, "click.hca").file_offset, 0x2000);
    }

    #[test]
    fn test_patch_without_storage_is_noop() {
        let mut cpk = Cpk::from_bytes(&itoc_archive()).unwrap();
        let idx = cpk.find_file("0001").unwrap();
        let before = cpk.section_packet(TocKind::Itoc).unwrap().to_vec();
        cpk.patch_entry(
            idx,
            EntryPatch {
                offset: Some(0x4000),
                extract_size: Some(9),
                ..EntryPatch::default()
            },
        )
        .unwrap();
        assert_eq!(cpk.section_packet(TocKind::Itoc).unwrap(), &before[..]);
        assert_eq!(cpk.file_table[idx].file_offset, 0x4000);
    }

    #[test]
    fn test_patch_rejects_overflow() {
        let mut cpk = Cpk::from_bytes(&itoc_archive()).unwrap();
        let idx = cpk.find_file("0000").unwrap();
        let result = cpk.patch_entry(
            idx,
            EntryPatch {
                size: Some(0x1_0000),
                ..EntryPatch::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_itoc_offsets_follow_id_order() {
        let cpk = Cpk::from_bytes(&itoc_archive()).unwrap();
        let files: Vec<_> = cpk
            .files()
            .map(|(_, e)| (e.id.unwrap(), e.file_size, e.file_offset))
            .collect();

        assert_eq!(
            files,
            [
                (0, 100, CONTENT),
                (1, 75, CONTENT + 128),
                (2, 50, CONTENT + 128 + 96),
            ]
        );
        assert_eq!(entry(&cpk, "0002").extract_size, Some(60));
        assert_eq!(entry(&cpk, "0000").extract_size, None);
        assert_eq!(
            entry(&cpk, "0000").file_size_field.unwrap().width,
            FieldWidth::U16
        );
        assert_eq!(
            entry(&cpk, "0001").file_size_field.unwrap().width,
            FieldWidth::U32
        );
    }

    #[test]
    fn test_itoc_patch_lands_in_nested_table() {
        let original = itoc_archive();
        let mut cpk = Cpk::from_bytes(&original).unwrap();
        let idx = cpk.find_file("0001").unwrap();
        cpk.patch_entry(
            idx,
            EntryPatch {
                size: Some(200),
                ..EntryPatch::default()
            },
        )
        .unwrap();

        let mut out = Cursor::new(original);
        cpk.write_headers(&mut out).unwrap();
        let reread = Cpk::from_bytes(&out.into_inner()).unwrap();
        assert_eq!(entry(&reread, "0001").file_size, 200);
        assert_eq!(entry(&reread, "0002").file_offset, CONTENT + 128 + 224);
    }

    #[test]
    fn test_repack_replaces_and_relocates() {
        let original = toc_archive();
        let mut cpk = Cpk::from_bytes(&original).unwrap();
        let replacement = vec![b'z'; 5000];
        let replacements = HashMap::from([("bgm/title.hca".to_string(), replacement.clone())]);

        let mut out = Cursor::new(Vec::new());
        cpk.repack(&mut Cursor::new(&original), &mut out, &replacements)
            .unwrap();
        let repacked = out.into_inner();

        let reread = Cpk::from_bytes(&repacked).unwrap();
        let title = reread.find_file("bgm/title.hca").unwrap();
        let click = reread.find_file("se/click.hca").unwrap();
        assert_eq!(reread.file_table[title].file_size, 5000);
        assert_eq!(reread.file_table[title].extract_size, Some(5000));
        assert_eq!(reread.file_table[title].file_offset, CONTENT);
        assert_eq!(reread.file_table[click].file_offset, 0x2800);
        assert_eq!(reread.file_table[click].local_dir.as_deref(), Some("se"));

        let etoc_at = reread.section_offset(TocKind::Etoc).unwrap();
        assert_eq!(etoc_at, align_up(0x2800 + 3000, 0x800));
        assert_eq!(
            reread.cpk_data.get("ContentSize").and_then(CellValue::as_u64),
            Some(etoc_at - CONTENT)
        );

        let mut reader = Cursor::new(&repacked);
        assert_eq!(reread.read_file(&mut reader, title).unwrap(), replacement);
        assert_eq!(
            reread.read_file(&mut reader, click).unwrap(),
            vec![b'b'; 3000]
        );
        assert_eq!(&repacked[0x7FA..0x800], COPYRIGHT_MARKER);
    }

    #[test]
    fn test_repack_without_changes_keeps_layout() {
        let original = toc_archive();
        let mut cpk = Cpk::from_bytes(&original).unwrap();
        let mut out = Cursor::new(Vec::new());
        cpk.repack(&mut Cursor::new(&original), &mut out, &HashMap::new())
            .unwrap();
        let repacked = out.into_inner();

        // Only the content-size cell of the header may differ.
        let reread = Cpk::from_bytes(&repacked).unwrap();
        assert_eq!(reread.section_offset(TocKind::Etoc), Some(ETOC_AT));
        assert_eq!(
            reread.section_packet(TocKind::Toc),
            Cpk::from_bytes(&original)
                .unwrap()
                .section_packet(TocKind::Toc)
        );
        assert_eq!(&repacked[0x800..], &original[0x800..]);
    }

    #[test]
    fn test_oversized_replacement_writes_nothing() {
        let original = itoc_archive();
        let mut cpk = Cpk::from_bytes(&original).unwrap();
        let replacements = HashMap::from([("0000".to_string(), vec![1u8; 70_000])]);

        let mut out = Cursor::new(Vec::new());
        let result = cpk.repack(&mut Cursor::new(&original), &mut out, &replacements);
        assert!(matches!(result, Err(ArchiveError::InvalidFormat(_))));
        assert!(out.into_inner().is_empty());
        assert_eq!(entry(&cpk, "0000").file_size, 100);
        assert_eq!(
            cpk.section_packet(TocKind::Itoc),
            Cpk::from_bytes(&original)
                .unwrap()
                .section_packet(TocKind::Itoc)
        );
    }

    #[test]
    fn test_failed_in_place_repack_keeps_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.cpk");
        let original = itoc_archive();
        std::fs::write(&path, &original).unwrap();

        let mut cpk = Cpk::open(&path).unwrap();
        let replacements = HashMap::from([("0000".to_string(), vec![1u8; 70_000])]);
        assert!(cpk.repack_file(&path, &path, &replacements).is_err());

        assert_eq!(std::fs::read(&path).unwrap(), original);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_in_place_repack_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.cpk");
        std::fs::write(&path, toc_archive()).unwrap();

        let mut cpk = Cpk::open(&path).unwrap();
        let replacements = HashMap::from([("click.hca".to_string(), vec![b'c'; 10])]);
        cpk.repack_file(&path, &path, &replacements).unwrap();

        let reread = Cpk::open(&path).unwrap();
        let click = reread.find_file("se/click.hca").unwrap();
        let mut reader = BufReader::new(File::open(&path).unwrap());
        assert_eq!(reread.read_file(&mut reader, click).unwrap(), vec![b'c'; 10]);
    }

    #[test]
    fn test_read_past_end_is_truncation() {
        let bytes = toc_archive();
        let mut cpk = Cpk::from_bytes(&bytes).unwrap();
        let click = cpk.find_file("click.hca").unwrap();
        cpk.patch_entry(
            click,
            EntryPatch {
                size: Some(0xFFFF_FFFF),
                ..EntryPatch::default()
            },
        )
        .unwrap();
        assert!(matches!(
            cpk.read_file(&mut Cursor::new(&bytes), click),
            Err(ArchiveError::Truncated(_))
        ));
    }

    #[test]
    fn test_extract_rejects_parent_directory() {
        let mut bytes = toc_archive();
        let toc = toc_packet(&[
            ("../bgm", "title.hca", 100, 0x800),
            ("se", "click.hca", 3000, 0x1000),
        ]);
        bytes.truncate(0x800);
        place(&mut bytes, 0x800, &envelope(TocKind::Toc, &toc, true));
        place(&mut bytes, 0x1000, &[b'a'; 100]);
        place(&mut bytes, 0x1800, &[b'b'; 3000]);
        let etoc = etoc_packet(&["bgm", "se", ""]);
        place(&mut bytes, ETOC_AT, &envelope(TocKind::Etoc, &etoc, false));

        let base = tempfile::tempdir().unwrap();
        let archive_path = base.path().join("game.cpk");
        std::fs::write(&archive_path, &bytes).unwrap();
        let output = base.path().join("out").join("nested");

        let cpk = Cpk::open(&archive_path).unwrap();
        assert!(matches!(
            cpk.extract_all(&archive_path, &output),
            Err(ArchiveError::InvalidFormat(_))
        ));
        assert!(!base.path().join("out").join("bgm").exists());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = toc_archive();
        bytes[0..4].copy_from_slice(b"CPX ");
        assert!(matches!(
            Cpk::from_bytes(&bytes),
            Err(ArchiveError::InvalidSignature("CPK"))
        ));

        let mut bytes = toc_archive();
        bytes[0x800..0x804].copy_from_slice(b"TOX ");
        assert!(matches!(
            Cpk::from_bytes(&bytes),
            Err(ArchiveError::InvalidSignature("TOC"))
        ));
    }

    #[test]
    fn test_short_etoc_is_rejected() {
        let mut bytes = toc_archive();
        let etoc = etoc_packet(&["only-one"]);
        bytes.truncate(ETOC_AT as usize);
        place(&mut bytes, ETOC_AT, &envelope(TocKind::Etoc, &etoc, false));
        assert!(matches!(
            Cpk::from_bytes(&bytes),
            Err(ArchiveError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_truncated_section() {
        let mut bytes = toc_archive();
        bytes.truncate(ETOC_AT as usize + 0x14);
        assert!(Cpk::from_bytes(&bytes).is_err());
    }
}
