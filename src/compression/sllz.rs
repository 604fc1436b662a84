use crate::endian::{EndianReader, EndianWriter};
use crate::error::{ArchiveError, Result};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::{debug, warn};
use std::io::{Cursor, Read, Write};

pub const SLLZ_MAGIC: &[u8; 4] = b"SLLZ";
pub const SLLZ_HEADER_SIZE: u16 = 0x10;

const V1_MAX_WINDOW_SIZE: usize = 4096;
const V1_MAX_ENCODED_LENGTH: usize = 18;
const V1_MIN_MATCH: usize = 3;
/// Slack granted to the V1 output buffer beyond the input size before the
/// compressor gives up and stores the data as-is.
const V1_OUTPUT_SLACK: usize = 2048;

const V2_CHUNK_SIZE: usize = 0x10000;
const V2_CHUNK_HEADER_SIZE: usize = 5;
const V2_STORED_FLAG: u32 = 0x0080_0000;
/// Smallest input the V2 compressor accepts.
pub const V2_MIN_INPUT_SIZE: usize = 0x1B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SllzVersion {
    V1 = 1,
    V2 = 2,
}

impl TryFrom<u8> for SllzVersion {
    type Error = ArchiveError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SllzVersion::V1),
            2 => Ok(SllzVersion::V2),
            other => Err(ArchiveError::Unsupported(format!(
                "SLLZ compression version {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SllzOptions {
    pub version: SllzVersion,
    /// Header endianness byte; 0 selects little endian.
    pub endianness: u8,
}

impl Default for SllzOptions {
    fn default() -> Self {
        Self {
            version: SllzVersion::V1,
            endianness: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SllzHeader {
    pub endianness: u8,
    pub version: u8,
    pub header_size: u16,
    pub decompressed_size: u32,
    /// Includes the header itself.
    pub compressed_size: u32,
}

impl SllzHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = EndianReader::new(Cursor::new(data), true);
        if &reader.read_magic()? != SLLZ_MAGIC {
            return Err(ArchiveError::InvalidSignature("SLLZ"));
        }
        let endianness = reader.read_u8()?;
        reader.set_endian(endianness == 0);
        let version = reader.read_u8()?;
        let header_size = reader.read_u16()?;
        let decompressed_size = reader.read_u32()?;
        let compressed_size = reader.read_u32()?;

        Ok(Self {
            endianness,
            version,
            header_size,
            decompressed_size,
            compressed_size,
        })
    }

    fn write<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = EndianWriter::new(writer, self.endianness == 0);
        writer.write_bytes(SLLZ_MAGIC)?;
        writer.write_u8(self.endianness)?;
        writer.write_u8(self.version)?;
        writer.write_u16(self.header_size)?;
        writer.write_u32(self.decompressed_size)?;
        writer.write_u32(self.compressed_size)
    }
}

pub fn is_sllz(data: &[u8]) -> bool {
    data.len() >= SLLZ_MAGIC.len() && &data[..SLLZ_MAGIC.len()] == SLLZ_MAGIC
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let header = SllzHeader::parse(data)?;
    let version = SllzVersion::try_from(header.version)?;

    let start = header.header_size as usize;
    let end = (header.compressed_size as usize).max(start);
    if end > data.len() {
        return Err(ArchiveError::Truncated(format!(
            "SLLZ stream declares {} bytes but only {} are present",
            end,
            data.len()
        )));
    }
    let payload = &data[start..end];

    debug!(
        "SLLZ: version {:?}, {} -> {} bytes",
        version, header.compressed_size, header.decompressed_size
    );

    match version {
        SllzVersion::V1 => decompress_v1(payload, header.decompressed_size as usize),
        SllzVersion::V2 => decompress_v2(payload, header.decompressed_size as usize),
    }
}

/// Compresses `data` into an SLLZ stream. When V1 output would outgrow its
/// budget the input is returned unchanged, without an SLLZ envelope.
pub fn compress(data: &[u8], options: SllzOptions) -> Result<Vec<u8>> {
    let payload = match options.version {
        SllzVersion::V1 => match compress_v1(data) {
            Ok(payload) => payload,
            Err(ArchiveError::Capacity(reason)) => {
                warn!("SLLZ: {}, storing {} bytes uncompressed", reason, data.len());
                return Ok(data.to_vec());
            }
            Err(e) => return Err(e),
        },
        SllzVersion::V2 => {
            if data.len() < V2_MIN_INPUT_SIZE {
                return Err(ArchiveError::InvalidFormat(format!(
                    "SLLZv2 input must be at least 0x{:X} bytes, got 0x{:X}",
                    V2_MIN_INPUT_SIZE,
                    data.len()
                )));
            }
            compress_v2(data)?
        }
    };

    let header = SllzHeader {
        endianness: options.endianness,
        version: options.version as u8,
        header_size: SLLZ_HEADER_SIZE,
        decompressed_size: data.len() as u32,
        compressed_size: (payload.len() + SLLZ_HEADER_SIZE as usize) as u32,
    };

    let mut out = Vec::with_capacity(header.compressed_size as usize);
    header.write(&mut out)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

fn truncated_v1() -> ArchiveError {
    ArchiveError::Compression("SLLZv1 stream ended unexpectedly".to_string())
}

fn decompress_v1(input: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
    // A two-byte match yields at most 18 bytes.
    if decompressed_size > input.len().saturating_mul(V1_MAX_ENCODED_LENGTH / 2) {
        return Err(ArchiveError::Compression(format!(
            "SLLZv1 declares {} bytes from a {} byte stream",
            decompressed_size,
            input.len()
        )));
    }
    let mut output = Vec::with_capacity(decompressed_size);
    if decompressed_size == 0 {
        return Ok(output);
    }

    let mut input_position = 0usize;
    let mut next_byte = || -> Result<u8> {
        let byte = *input.get(input_position).ok_or_else(truncated_v1)?;
        input_position += 1;
        Ok(byte)
    };

    let mut flag = next_byte()?;
    let mut flag_count = 8;

    while output.len() < decompressed_size {
        let is_match = flag & 0x80 != 0;
        flag <<= 1;
        flag_count -= 1;
        if flag_count == 0 {
            flag = next_byte()?;
            flag_count = 8;
        }

        if is_match {
            let tuple = u16::from_le_bytes([next_byte()?, next_byte()?]);
            let distance = 1 + (tuple >> 4) as usize;
            let count = 3 + (tuple & 0xF) as usize;

            if distance > output.len() {
                return Err(ArchiveError::Compression(format!(
                    "SLLZv1 match distance {} before start of output ({})",
                    distance,
                    output.len()
                )));
            }
            if output.len() + count > decompressed_size {
                return Err(ArchiveError::Compression(
                    "SLLZv1 match overruns the declared size".to_string(),
                ));
            }

            // Byte by byte so overlapping matches repeat freshly copied data.
            for _ in 0..count {
                let byte = output[output.len() - distance];
                output.push(byte);
            }
        } else {
            output.push(next_byte()?);
        }
    }

    Ok(output)
}

fn compress_v1(input: &[u8]) -> Result<Vec<u8>> {
    let output_budget = input.len() + V1_OUTPUT_SLACK;
    let mut output = Vec::with_capacity(output_budget);
    let check_budget = |output: &Vec<u8>| -> Result<()> {
        if output.len() >= output_budget {
            return Err(ArchiveError::Capacity(
                "compressed size is bigger than original size".to_string(),
            ));
        }
        Ok(())
    };

    let mut flag_position = 0usize;
    let mut current_flag = 0u8;
    let mut bit_count = 0;
    output.push(0);
    check_budget(&output)?;

    let mut input_position = 0usize;
    while input_position < input.len() {
        let found = find_match(input, input_position);

        if found.is_some() {
            current_flag |= 1 << (7 - bit_count);
        }
        bit_count += 1;

        if bit_count == 8 {
            output[flag_position] = current_flag;
            current_flag = 0;
            bit_count = 0;
            flag_position = output.len();
            output.push(0);
            check_budget(&output)?;
        }

        match found {
            Some((distance, length)) => {
                if !(1..=V1_MAX_WINDOW_SIZE).contains(&distance)
                    || !(V1_MIN_MATCH..=V1_MAX_ENCODED_LENGTH).contains(&length)
                {
                    return Err(ArchiveError::Capacity(format!(
                        "match (distance {}, length {}) is not representable",
                        distance, length
                    )));
                }
                let tuple = (((distance - 1) << 4) | ((length - 3) & 0xF)) as u16;
                for byte in tuple.to_le_bytes() {
                    output.push(byte);
                    check_budget(&output)?;
                }
                input_position += length;
            }
            None => {
                output.push(input[input_position]);
                check_budget(&output)?;
                input_position += 1;
            }
        }
    }

    output[flag_position] = current_flag;
    Ok(output)
}

/// Finds the longest earlier occurrence (at least three bytes) of the data at
/// `position`, lying entirely within the preceding window. Among equally long
/// candidates the closest one wins. Returns `(distance, length)`.
fn find_match(input: &[u8], position: usize) -> Option<(usize, usize)> {
    let window_size = position.min(V1_MAX_WINDOW_SIZE);
    let max_length = (input.len() - position).min(V1_MAX_ENCODED_LENGTH);
    if max_length < V1_MIN_MATCH {
        return None;
    }

    let window_start = position - window_size;
    let mut best: Option<(usize, usize)> = None;

    for start in (window_start..position).rev() {
        let limit = max_length.min(position - start);
        let length = input[start..start + limit]
            .iter()
            .zip(&input[position..position + limit])
            .take_while(|(a, b)| a == b)
            .count();

        if length >= V1_MIN_MATCH && best.is_none_or(|(_, best_length)| length > best_length) {
            best = Some((position - start, length));
            if length == max_length {
                break;
            }
        }
    }

    best
}

fn decompress_v2(input: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
    let max_chunks = input.len() / V2_CHUNK_HEADER_SIZE;
    if decompressed_size > max_chunks.saturating_mul(V2_CHUNK_SIZE) {
        return Err(ArchiveError::Compression(format!(
            "SLLZv2 declares {} bytes from a {} byte stream",
            decompressed_size,
            input.len()
        )));
    }
    let mut output = Vec::with_capacity(decompressed_size);
    let mut input_position = 0usize;

    while output.len() < decompressed_size {
        let chunk_header = input
            .get(input_position..input_position + V2_CHUNK_HEADER_SIZE)
            .ok_or_else(|| {
                ArchiveError::Compression("SLLZv2 chunk header truncated".to_string())
            })?;
        let raw_size = u32::from_be_bytes([0, chunk_header[0], chunk_header[1], chunk_header[2]]);
        let chunk_decompressed_size =
            u16::from_be_bytes([chunk_header[3], chunk_header[4]]) as usize + 1;
        let is_compressed = raw_size & V2_STORED_FLAG == 0;
        let chunk_size = (raw_size & !V2_STORED_FLAG) as usize;

        if chunk_size < V2_CHUNK_HEADER_SIZE || input_position + chunk_size > input.len() {
            return Err(ArchiveError::Compression(format!(
                "SLLZv2 chunk at {} has invalid size {}",
                input_position, chunk_size
            )));
        }
        let body = &input[input_position + V2_CHUNK_HEADER_SIZE..input_position + chunk_size];

        if is_compressed {
            let mut chunk = Vec::with_capacity(chunk_decompressed_size);
            ZlibDecoder::new(body).read_to_end(&mut chunk)?;
            if chunk.len() != chunk_decompressed_size {
                return Err(ArchiveError::InvalidFormat(format!(
                    "SLLZv2 chunk inflated to {} bytes, expected {}",
                    chunk.len(),
                    chunk_decompressed_size
                )));
            }
            output.extend_from_slice(&chunk);
        } else {
            let stored = body.get(..chunk_decompressed_size).ok_or_else(|| {
                ArchiveError::Compression("SLLZv2 stored chunk truncated".to_string())
            })?;
            output.extend_from_slice(stored);
        }

        input_position += chunk_size;
    }

    if output.len() != decompressed_size {
        return Err(ArchiveError::InvalidFormat(format!(
            "SLLZv2 produced {} bytes, expected {}",
            output.len(),
            decompressed_size
        )));
    }

    Ok(output)
}

fn compress_v2(input: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();

    for chunk in input.chunks(V2_CHUNK_SIZE) {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(chunk)?;
        let compressed = encoder.finish()?;

        let chunk_size = compressed.len() + V2_CHUNK_HEADER_SIZE;
        output.extend_from_slice(&(chunk_size as u32).to_be_bytes()[1..]);
        output.extend_from_slice(&((chunk.len() - 1) as u16).to_be_bytes());
        output.extend_from_slice(&compressed);
    }

    Ok(output)
}
