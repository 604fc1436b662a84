use crate::endian::{EndianReader, EndianWriter};
use crate::error::{ArchiveError, Result};
use encoding_rs::SHIFT_JIS;
use log::{debug, warn};
use std::collections::HashMap;
use std::io::{Cursor, SeekFrom};

pub const UTF_MAGIC: &[u8; 4] = b"@UTF";

/// Magic, table size, the three region offsets, name, column count, row
/// length and row count.
const UTF_HEADER_SIZE: usize = 0x20;

/// Offsets stored in the header are relative to the end of the magic and
/// table-size fields.
const OFFSET_BIAS: u64 = 8;

const STORAGE_MASK: u8 = 0xF0;
const TYPE_MASK: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    None,
    Zero,
    Constant,
    PerRow,
}

impl StorageMode {
    pub fn from_flags(flags: u8) -> Result<Self> {
        match flags & STORAGE_MASK {
            0x00 => Ok(StorageMode::None),
            0x10 => Ok(StorageMode::Zero),
            0x30 => Ok(StorageMode::Constant),
            0x50 => Ok(StorageMode::PerRow),
            other => Err(ArchiveError::Parse(format!(
                "Unknown storage flag: 0x{:02X}",
                other
            ))),
        }
    }

    fn bits(self) -> u8 {
        match self {
            StorageMode::None => 0x00,
            StorageMode::Zero => 0x10,
            StorageMode::Constant => 0x30,
            StorageMode::PerRow => 0x50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    UInt8 = 0x00,
    Int8 = 0x01,
    UInt16 = 0x02,
    Int16 = 0x03,
    UInt32 = 0x04,
    Int32 = 0x05,
    UInt64 = 0x06,
    Int64 = 0x07,
    Float = 0x08,
    String = 0x0A,
    Data = 0x0B,
}

impl ColumnType {
    pub fn from_flags(flags: u8) -> Result<Self> {
        match flags & TYPE_MASK {
            0x00 => Ok(ColumnType::UInt8),
            0x01 => Ok(ColumnType::Int8),
            0x02 => Ok(ColumnType::UInt16),
            0x03 => Ok(ColumnType::Int16),
            0x04 => Ok(ColumnType::UInt32),
            0x05 => Ok(ColumnType::Int32),
            0x06 => Ok(ColumnType::UInt64),
            0x07 => Ok(ColumnType::Int64),
            0x08 => Ok(ColumnType::Float),
            0x0A => Ok(ColumnType::String),
            0x0B => Ok(ColumnType::Data),
            other => Err(ArchiveError::Parse(format!(
                "Unsupported column type: 0x{:X}",
                other
            ))),
        }
    }

    /// Inline size of one value of this type inside a row or column block.
    fn inline_size(self) -> u16 {
        match self {
            ColumnType::UInt8 | ColumnType::Int8 => 1,
            ColumnType::UInt16 | ColumnType::Int16 => 2,
            ColumnType::UInt32 | ColumnType::Int32 | ColumnType::Float | ColumnType::String => 4,
            ColumnType::UInt64 | ColumnType::Int64 | ColumnType::Data => 8,
        }
    }
}

/// Width of a scalar field that can be overwritten in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    U8,
    U16,
    U32,
    U64,
    F32,
}

impl FieldWidth {
    pub fn size(self) -> usize {
        match self {
            FieldWidth::U8 => 1,
            FieldWidth::U16 => 2,
            FieldWidth::U32 | FieldWidth::F32 => 4,
            FieldWidth::U64 => 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub flags: u8,
    pub name: String,
    /// Value shared by every row of a constant-storage column.
    pub constant: Option<CellValue>,
}

impl Column {
    pub fn new(name: &str, storage: StorageMode, column_type: ColumnType) -> Self {
        Self {
            flags: storage.bits() | column_type as u8,
            name: name.to_string(),
            constant: None,
        }
    }

    pub fn constant(name: &str, column_type: ColumnType, value: CellValue) -> Self {
        Self {
            constant: Some(value),
            ..Column::new(name, StorageMode::Constant, column_type)
        }
    }

    pub fn storage(&self) -> Result<StorageMode> {
        StorageMode::from_flags(self.flags)
    }

    pub fn column_type(&self) -> Result<ColumnType> {
        ColumnType::from_flags(self.flags)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    String(String),
    Data(Vec<u8>),
    None,
}

impl CellValue {
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            CellValue::UInt8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            CellValue::UInt16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            CellValue::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            CellValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    /// Widens any unsigned integer cell to `u64`.
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            CellValue::UInt8(v) => Some(*v as u64),
            CellValue::UInt16(v) => Some(*v as u64),
            CellValue::UInt32(v) => Some(*v as u64),
            CellValue::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            CellValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            CellValue::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Width of the value when written back in place; `None` for strings,
    /// blobs and missing values.
    pub fn field_width(&self) -> Option<FieldWidth> {
        match self {
            CellValue::UInt8(_) => Some(FieldWidth::U8),
            CellValue::UInt16(_) => Some(FieldWidth::U16),
            CellValue::UInt32(_) => Some(FieldWidth::U32),
            CellValue::UInt64(_) => Some(FieldWidth::U64),
            CellValue::Float(_) => Some(FieldWidth::F32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub value: CellValue,
    /// Byte offset of the value in the buffer the table was read from. For
    /// blobs this is the resolved offset of the blob payload. `None` when the
    /// column has no per-row storage.
    pub position: Option<u64>,
}

pub type Row = Vec<Cell>;

#[derive(Debug)]
pub struct Utf {
    pub table_size: u32,
    pub rows_offset: u64,
    pub strings_offset: u64,
    pub data_offset: u64,
    pub table_name: String,
    pub num_columns: u16,
    pub row_length: u16,
    pub num_rows: u32,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

impl Default for Utf {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf {
    pub fn new() -> Self {
        Self {
            table_size: 0,
            rows_offset: 0,
            strings_offset: 0,
            data_offset: 0,
            table_name: String::new(),
            num_columns: 0,
            row_length: 0,
            num_rows: 0,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Parses a complete table from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut utf = Utf::new();
        utf.read_utf(data)?;
        Ok(utf)
    }

    pub fn read_utf(&mut self, data: &[u8]) -> Result<()> {
        self.read_utf_at(data, 0)
    }

    /// Parses a table that starts `base` bytes into `data`. Cell positions
    /// are reported relative to the start of `data`.
    pub fn read_utf_at(&mut self, data: &[u8], base: u64) -> Result<()> {
        debug!(
            "UTF: Starting to read UTF data at {}, buffer size: {}",
            base,
            data.len()
        );
        // The table body is big endian regardless of the enclosing packet.
        let mut reader = EndianReader::new(Cursor::new(data), false);
        reader.seek(SeekFrom::Start(base))?;

        if &reader.read_magic()? != UTF_MAGIC {
            return Err(ArchiveError::InvalidUtfSignature);
        }

        self.table_size = reader.read_u32()?;
        self.rows_offset = reader.read_u32()? as u64 + base + OFFSET_BIAS;
        self.strings_offset = reader.read_u32()? as u64 + base + OFFSET_BIAS;
        self.data_offset = reader.read_u32()? as u64 + base + OFFSET_BIAS;

        let table_name_offset = reader.read_u32()?;
        self.num_columns = reader.read_u16()?;
        self.row_length = reader.read_u16()?;
        self.num_rows = reader.read_u32()?;

        debug!(
            "UTF: Table info - columns: {}, row_length: {}, rows: {}, offsets: rows {} strings {} data {}",
            self.num_columns,
            self.row_length,
            self.num_rows,
            self.rows_offset,
            self.strings_offset,
            self.data_offset
        );

        for (label, offset) in [
            ("Rows", self.rows_offset),
            ("Strings", self.strings_offset),
            ("Data", self.data_offset),
        ] {
            if offset > data.len() as u64 {
                return Err(ArchiveError::InvalidFormat(format!(
                    "{} offset ({}) exceeds buffer size ({})",
                    label,
                    offset,
                    data.len()
                )));
            }
        }

        self.table_name = self
            .read_string_at(&mut reader, table_name_offset as u64)
            .unwrap_or_default();

        self.columns.clear();
        for i in 0..self.num_columns {
            let flags = reader.read_u8()?;
            let flags = if flags == 0 {
                reader.seek(SeekFrom::Current(3))?;
                reader.read_u8()?
            } else {
                flags
            };

            let name_offset = reader.read_u32()?;
            let name = if self.strings_offset + name_offset as u64 >= data.len() as u64 {
                warn!(
                    "UTF: Column {} name offset {} is beyond buffer, using default name",
                    i, name_offset
                );
                format!("Column{}", i)
            } else {
                match self.read_string_at(&mut reader, name_offset as u64) {
                    Ok(s) if !s.is_empty() => s,
                    _ => {
                        warn!("UTF: Failed to read column {} name, using default", i);
                        format!("Column{}", i)
                    }
                }
            };

            let column_type = ColumnType::from_flags(flags)?;
            let constant = match StorageMode::from_flags(flags)? {
                StorageMode::Constant => {
                    let (value, _) = self.read_value(&mut reader, column_type)?;
                    Some(value)
                }
                _ => None,
            };

            debug!("UTF: Column {} '{}' flags 0x{:02X}", i, name, flags);
            self.columns.push(Column {
                flags,
                name,
                constant,
            });
        }

        self.rows.clear();
        for row_idx in 0..self.num_rows {
            reader.seek(SeekFrom::Start(
                self.rows_offset + (row_idx as u64 * self.row_length as u64),
            ))?;

            let mut row = Vec::with_capacity(self.columns.len());

            for col_idx in 0..self.columns.len() {
                let column = &self.columns[col_idx];
                let cell = match column.storage()? {
                    StorageMode::None | StorageMode::Zero => Cell {
                        value: CellValue::None,
                        position: None,
                    },
                    StorageMode::Constant => Cell {
                        value: column.constant.clone().unwrap_or(CellValue::None),
                        position: None,
                    },
                    StorageMode::PerRow => {
                        let column_type = column.column_type()?;
                        let (value, position) = self.read_value(&mut reader, column_type)?;
                        Cell {
                            value,
                            position: Some(position),
                        }
                    }
                };

                row.push(cell);
            }

            self.rows.push(row);
        }

        debug!("UTF: Successfully parsed table '{}'", self.table_name);
        Ok(())
    }

    /// Reads one value of `column_type` at the reader's position. Returns the
    /// value and the position a later in-place patch must target.
    fn read_value(
        &self,
        reader: &mut EndianReader<Cursor<&[u8]>>,
        column_type: ColumnType,
    ) -> Result<(CellValue, u64)> {
        let position = reader.position()?;
        let value = match column_type {
            ColumnType::UInt8 | ColumnType::Int8 => CellValue::UInt8(reader.read_u8()?),
            ColumnType::UInt16 | ColumnType::Int16 => CellValue::UInt16(reader.read_u16()?),
            ColumnType::UInt32 | ColumnType::Int32 => CellValue::UInt32(reader.read_u32()?),
            ColumnType::UInt64 | ColumnType::Int64 => CellValue::UInt64(reader.read_u64()?),
            ColumnType::Float => CellValue::Float(reader.read_f32()?),
            ColumnType::String => {
                let str_offset = reader.read_u32()?;
                CellValue::String(self.read_string_at(reader, str_offset as u64)?)
            }
            ColumnType::Data => {
                let data_offset = reader.read_u32()?;
                let data_size = reader.read_u32()?;
                let data_value =
                    self.read_data_at(reader, data_offset as u64, data_size as usize)?;
                return Ok((
                    CellValue::Data(data_value),
                    self.data_offset + data_offset as u64,
                ));
            }
        };
        Ok((value, position))
    }

    fn read_string_at(
        &self,
        reader: &mut EndianReader<Cursor<&[u8]>>,
        offset: u64,
    ) -> Result<String> {
        let current_pos = reader.position()?;
        reader.seek(SeekFrom::Start(self.strings_offset + offset))?;
        let result = reader.read_cstring(SHIFT_JIS)?;
        reader.seek(SeekFrom::Start(current_pos))?;
        Ok(result)
    }

    fn read_data_at(
        &self,
        reader: &mut EndianReader<Cursor<&[u8]>>,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        let current_pos = reader.position()?;
        reader.seek(SeekFrom::Start(self.data_offset + offset))?;
        let result = reader.read_bytes(size)?;
        reader.seek(SeekFrom::Start(current_pos))?;
        Ok(result)
    }

    pub fn column_index(&self, column_name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column_name)
    }

    pub fn get_cell(&self, row: usize, column_name: &str) -> Option<&Cell> {
        let col_index = self.column_index(column_name)?;
        self.rows.get(row)?.get(col_index)
    }

    pub fn get_column_data(&self, row: usize, column_name: &str) -> Option<&CellValue> {
        self.get_cell(row, column_name).map(|cell| &cell.value)
    }

    pub fn get_column_position(&self, row: usize, column_name: &str) -> Option<u64> {
        self.get_cell(row, column_name)?.position
    }

    pub fn get_column_data_or_default(
        &self,
        row: usize,
        column_name: &str,
        default_type: u8,
    ) -> CellValue {
        match self.get_column_data(row, column_name) {
            Some(CellValue::None) | None => match default_type {
                0 => CellValue::UInt8(0xFF),
                1 => CellValue::UInt16(0xFFFF),
                2 => CellValue::UInt32(0xFFFFFFFF),
                3 => CellValue::UInt64(0xFFFFFFFFFFFFFFFF),
                _ => CellValue::None,
            },
            Some(value) => value.clone(),
        }
    }

    /// Starts an empty table for encoding.
    pub fn with_columns(table_name: &str, columns: Vec<Column>) -> Self {
        Self {
            table_name: table_name.to_string(),
            num_columns: columns.len() as u16,
            columns,
            ..Utf::new()
        }
    }

    pub fn push_row(&mut self, values: Vec<CellValue>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(ArchiveError::InvalidFormat(format!(
                "Row has {} values but table '{}' has {} columns",
                values.len(),
                self.table_name,
                self.columns.len()
            )));
        }
        self.rows.push(
            values
                .into_iter()
                .map(|value| Cell {
                    value,
                    position: None,
                })
                .collect(),
        );
        self.num_rows = self.rows.len() as u32;
        Ok(())
    }

    /// Serialises the table. Per-row cells must match their column type;
    /// zero- and none-storage cells are not written.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut strings = StringPool::new();
        let mut data = Vec::new();
        strings.intern("<NULL>");
        let table_name_offset = strings.intern(&self.table_name);

        let mut column_block = EndianWriter::new(Vec::new(), false);
        let mut row_length: u16 = 0;
        for column in &self.columns {
            let storage = column.storage()?;
            let column_type = column.column_type()?;
            column_block.write_u8(column.flags)?;
            column_block.write_u32(strings.intern(&column.name))?;
            match storage {
                StorageMode::Constant => {
                    let value = column.constant.as_ref().ok_or_else(|| {
                        ArchiveError::InvalidFormat(format!(
                            "Constant column '{}' has no value",
                            column.name
                        ))
                    })?;
                    encode_value(
                        &mut column_block,
                        column_type,
                        value,
                        &mut strings,
                        &mut data,
                    )?;
                }
                StorageMode::PerRow => row_length += column_type.inline_size(),
                StorageMode::None | StorageMode::Zero => {}
            }
        }
        let column_block = column_block.into_inner();

        let mut row_block = EndianWriter::new(Vec::new(), false);
        for row in &self.rows {
            for (column, cell) in self.columns.iter().zip(row) {
                if column.storage()? == StorageMode::PerRow {
                    encode_value(
                        &mut row_block,
                        column.column_type()?,
                        &cell.value,
                        &mut strings,
                        &mut data,
                    )?;
                }
            }
        }
        let row_block = row_block.into_inner();

        let rows_offset = (UTF_HEADER_SIZE + column_block.len()) as u64;
        let strings_offset = rows_offset + row_block.len() as u64;
        let data_offset = strings_offset + strings.bytes.len() as u64;
        let total = data_offset + data.len() as u64;

        let mut writer = EndianWriter::new(Vec::with_capacity(total as usize), false);
        writer.write_bytes(UTF_MAGIC)?;
        writer.write_u32((total - OFFSET_BIAS) as u32)?;
        writer.write_u32((rows_offset - OFFSET_BIAS) as u32)?;
        writer.write_u32((strings_offset - OFFSET_BIAS) as u32)?;
        writer.write_u32((data_offset - OFFSET_BIAS) as u32)?;
        writer.write_u32(table_name_offset)?;
        writer.write_u16(self.columns.len() as u16)?;
        writer.write_u16(row_length)?;
        writer.write_u32(self.rows.len() as u32)?;
        writer.write_bytes(&column_block)?;
        writer.write_bytes(&row_block)?;
        writer.write_bytes(&strings.bytes)?;
        writer.write_bytes(&data)?;

        Ok(writer.into_inner())
    }
}

struct StringPool {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StringPool {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            offsets: HashMap::new(),
        }
    }

    fn intern(&mut self, value: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(value) {
            return offset;
        }
        let offset = self.bytes.len() as u32;
        let (encoded, _, _) = SHIFT_JIS.encode(value);
        self.bytes.extend_from_slice(&encoded);
        self.bytes.push(0);
        self.offsets.insert(value.to_string(), offset);
        offset
    }
}

fn encode_value(
    writer: &mut EndianWriter<Vec<u8>>,
    column_type: ColumnType,
    value: &CellValue,
    strings: &mut StringPool,
    data: &mut Vec<u8>,
) -> Result<()> {
    match (column_type, value) {
        (ColumnType::UInt8 | ColumnType::Int8, CellValue::UInt8(v)) => writer.write_u8(*v),
        (ColumnType::UInt16 | ColumnType::Int16, CellValue::UInt16(v)) => writer.write_u16(*v),
        (ColumnType::UInt32 | ColumnType::Int32, CellValue::UInt32(v)) => writer.write_u32(*v),
        (ColumnType::UInt64 | ColumnType::Int64, CellValue::UInt64(v)) => writer.write_u64(*v),
        (ColumnType::Float, CellValue::Float(v)) => writer.write_f32(*v),
        (ColumnType::String, CellValue::String(s)) => writer.write_u32(strings.intern(s)),
        (ColumnType::Data, CellValue::Data(bytes)) => {
            writer.write_u32(data.len() as u32)?;
            writer.write_u32(bytes.len() as u32)?;
            data.extend_from_slice(bytes);
            Ok(())
        }
        (column_type, value) => Err(ArchiveError::InvalidFormat(format!(
            "Value {:?} does not match column type {:?}",
            value, column_type
        ))),
    }
}
