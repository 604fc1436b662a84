use crate::error::{ArchiveError, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use encoding_rs::Encoding;
use log::debug;
use std::io::{Read, Seek, SeekFrom, Write};

macro_rules! byte_order_reads {
    ($($name:ident -> $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self) -> Result<$ty> {
                let value = if self.is_little_endian {
                    self.reader.$name::<LittleEndian>()?
                } else {
                    self.reader.$name::<BigEndian>()?
                };
                Ok(value)
            }
        )*
    };
}

macro_rules! byte_order_writes {
    ($($name:ident($ty:ty)),* $(,)?) => {
        $(
            pub fn $name(&mut self, value: $ty) -> Result<()> {
                if self.is_little_endian {
                    self.writer.$name::<LittleEndian>(value)?;
                } else {
                    self.writer.$name::<BigEndian>(value)?;
                }
                Ok(())
            }
        )*
    };
}

pub struct EndianReader<R> {
    reader: R,
    is_little_endian: bool,
}

impl<R: Read> EndianReader<R> {
    pub fn new(reader: R, is_little_endian: bool) -> Self {
        Self {
            reader,
            is_little_endian,
        }
    }

    pub fn set_endian(&mut self, is_little_endian: bool) {
        self.is_little_endian = is_little_endian;
    }

    pub fn is_little_endian(&self) -> bool {
        self.is_little_endian
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = self.reader.read_u8()?;
        Ok(byte)
    }

    byte_order_reads! {
        read_u16 -> u16,
        read_u32 -> u32,
        read_u64 -> u64,
        read_i32 -> i32,
        read_i64 -> i64,
        read_f32 -> f32,
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; count];
        self.reader.read_exact(&mut bytes).map_err(|e| {
            debug!("Short read of {} bytes: {}", count, e);
            ArchiveError::from(e)
        })?;
        Ok(bytes)
    }

    pub fn read_magic(&mut self) -> Result<[u8; 4]> {
        let mut magic = [0u8; 4];
        self.reader.read_exact(&mut magic)?;
        Ok(magic)
    }

    /// Reads a NUL-terminated string of any length. Running out of data
    /// before the terminator is a truncation.
    pub fn read_cstring(&mut self, encoding: &'static Encoding) -> Result<String> {
        let mut bytes = Vec::new();

        loop {
            match self.read_u8() {
                Ok(0) => break,
                Ok(byte) => bytes.push(byte),
                Err(ArchiveError::Truncated(_)) => {
                    return Err(ArchiveError::Truncated(format!(
                        "String ends without a terminator after {} bytes",
                        bytes.len()
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        let (decoded, _, _) = encoding.decode(&bytes);
        Ok(decoded.into_owned())
    }

    /// Reads a fixed-size, NUL-padded string slot.
    pub fn read_fixed_string(&mut self, length: usize, encoding: &'static Encoding) -> Result<String> {
        let bytes = self.read_bytes(length)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let (decoded, _, _) = encoding.decode(&bytes[..end]);
        Ok(decoded.into_owned())
    }
}

impl<R: Seek> EndianReader<R> {
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.reader.seek(pos)?)
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.reader.stream_position()?)
    }
}

pub struct EndianWriter<W> {
    writer: W,
    is_little_endian: bool,
}

impl<W: Write> EndianWriter<W> {
    pub fn new(writer: W, is_little_endian: bool) -> Self {
        Self {
            writer,
            is_little_endian,
        }
    }

    pub fn set_endian(&mut self, is_little_endian: bool) {
        self.is_little_endian = is_little_endian;
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        Ok(())
    }

    byte_order_writes! {
        write_u16(u16),
        write_u32(u32),
        write_u64(u64),
        write_i32(i32),
        write_f32(f32),
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn write_zeros(&mut self, count: u64) -> Result<()> {
        std::io::copy(&mut std::io::repeat(0).take(count), &mut self.writer)?;
        Ok(())
    }

    /// Writes `value` into a zero-padded slot of exactly `length` bytes.
    pub fn write_fixed_string(
        &mut self,
        value: &str,
        length: usize,
        encoding: &'static Encoding,
    ) -> Result<()> {
        let (encoded, _, _) = encoding.encode(value);
        if encoded.len() > length {
            return Err(ArchiveError::InvalidFormat(format!(
                "Name '{}' does not fit in {} bytes",
                value, length
            )));
        }
        self.write_bytes(&encoded)?;
        self.write_zeros((length - encoded.len()) as u64)
    }
}

impl<W: Write + Seek> EndianWriter<W> {
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.writer.seek(pos)?)
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.writer.stream_position()?)
    }

    /// Zero-fills from the current position up to `target`. Does nothing if
    /// the writer is already past it.
    pub fn write_until(&mut self, target: u64) -> Result<()> {
        let position = self.position()?;
        if position < target {
            self.write_zeros(target - position)?;
        }
        Ok(())
    }

    pub fn write_padding(&mut self, alignment: u64) -> Result<()> {
        let position = self.position()?;
        self.write_until(align_up(position, alignment))
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    match value % alignment {
        0 => value,
        rem => value + (alignment - rem),
    }
}
