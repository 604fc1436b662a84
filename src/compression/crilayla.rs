use crate::endian::EndianReader;
use crate::error::{ArchiveError, Result};
use log::debug;
use std::io::Cursor;

pub const CRILAYLA_MAGIC: &[u8; 8] = b"CRILAYLA";

/// Magic plus the uncompressed size and header offset fields.
const PREFIX_SIZE: usize = 0x10;
/// Uncompressed block stored verbatim after the compressed stream.
const HEADER_BLOCK_SIZE: usize = 0x100;

const VLE_LENS: [u32; 4] = [2, 3, 5, 8];

/// Largest output a header may declare.
const MAX_UNCOMPRESSED_SIZE: usize = 100_000_000;

pub fn is_crilayla(data: &[u8]) -> bool {
    data.len() >= CRILAYLA_MAGIC.len() && &data[..CRILAYLA_MAGIC.len()] == CRILAYLA_MAGIC
}

/// Decompresses a CRILAYLA blob. The returned buffer holds the 0x100-byte
/// uncompressed header followed by the decoded payload.
pub fn decompress_crilayla(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < PREFIX_SIZE + HEADER_BLOCK_SIZE {
        return Err(ArchiveError::Compression(
            "Input too short for CRILAYLA".to_string(),
        ));
    }
    if !is_crilayla(input) {
        return Err(ArchiveError::InvalidSignature("CRILAYLA"));
    }

    let mut reader = EndianReader::new(Cursor::new(input), true);
    reader.read_bytes(CRILAYLA_MAGIC.len())?;
    let uncompressed_size = reader.read_i32()?;
    let header_offset = reader.read_i32()?;

    debug!(
        "CRILAYLA: uncompressed_size={}, header_offset={}",
        uncompressed_size, header_offset
    );

    if uncompressed_size < 0 || header_offset < 0 {
        return Err(ArchiveError::Compression(
            "Invalid CRILAYLA header values".to_string(),
        ));
    }
    let uncompressed_size = uncompressed_size as usize;
    if uncompressed_size > MAX_UNCOMPRESSED_SIZE {
        return Err(ArchiveError::Compression(format!(
            "CRILAYLA declares {} bytes, more than the {} byte limit",
            uncompressed_size, MAX_UNCOMPRESSED_SIZE
        )));
    }
    let header_start = header_offset as usize + PREFIX_SIZE;

    if header_start + HEADER_BLOCK_SIZE > input.len() {
        return Err(ArchiveError::Compression(format!(
            "Invalid header offset: {} + 0x110 > {}",
            header_offset,
            input.len()
        )));
    }

    let mut result = vec![0u8; uncompressed_size + HEADER_BLOCK_SIZE];
    result[..HEADER_BLOCK_SIZE]
        .copy_from_slice(&input[header_start..header_start + HEADER_BLOCK_SIZE]);

    if uncompressed_size == 0 {
        return Ok(result);
    }

    // The stream is consumed from its last byte towards the front and fills
    // the output from its end towards the header block.
    let mut bits = BackwardBitReader::new(&input[..input.len() - HEADER_BLOCK_SIZE]);
    let output_end = HEADER_BLOCK_SIZE + uncompressed_size - 1;
    let mut bytes_output = 0usize;

    while bytes_output < uncompressed_size {
        if bits.next_bits(1)? > 0 {
            let distance = bits.next_bits(13)? as usize + 3;
            let mut length = 3usize;
            let mut all_levels_maxed = true;

            for width in VLE_LENS {
                let this_level = bits.next_bits(width)? as usize;
                length += this_level;
                if this_level != (1 << width) - 1 {
                    all_levels_maxed = false;
                    break;
                }
            }

            if all_levels_maxed {
                loop {
                    let this_level = bits.next_bits(8)? as usize;
                    length += this_level;
                    if this_level != 255 {
                        break;
                    }
                }
            }

            if length > uncompressed_size - bytes_output {
                return Err(ArchiveError::Compression(format!(
                    "Backreference of {} bytes overruns output ({} bytes left)",
                    length,
                    uncompressed_size - bytes_output
                )));
            }

            let mut source = output_end - bytes_output + distance;
            if source >= result.len() {
                return Err(ArchiveError::Compression(format!(
                    "Backreference distance {} points past the output end",
                    distance
                )));
            }

            for _ in 0..length {
                result[output_end - bytes_output] = result[source];
                source -= 1;
                bytes_output += 1;
            }
        } else {
            let byte = bits.next_bits(8)? as u8;
            result[output_end - bytes_output] = byte;
            bytes_output += 1;
        }
    }

    debug!("CRILAYLA: Decompressed {} bytes", bytes_output);
    Ok(result)
}

/// Pulls bits MSB-first from bytes taken in reverse order.
struct BackwardBitReader<'a> {
    input: &'a [u8],
    remaining: usize,
    bit_pool: u8,
    bits_left: u32,
}

impl<'a> BackwardBitReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            remaining: input.len(),
            bit_pool: 0,
            bits_left: 0,
        }
    }

    fn next_bits(&mut self, bit_count: u32) -> Result<u16> {
        let mut out_bits = 0u16;
        let mut produced = 0;

        while produced < bit_count {
            if self.bits_left == 0 {
                if self.remaining == 0 {
                    return Err(ArchiveError::Compression(
                        "CRILAYLA stream ended before the output was filled".to_string(),
                    ));
                }
                self.remaining -= 1;
                self.bit_pool = self.input[self.remaining];
                self.bits_left = 8;
            }

            let bits_this_round = self.bits_left.min(bit_count - produced);
            let mask = ((1u32 << bits_this_round) - 1) as u16;
            let extracted = (self.bit_pool >> (self.bits_left - bits_this_round)) as u16 & mask;

            out_bits = (out_bits << bits_this_round) | extracted;
            self.bits_left -= bits_this_round;
            produced += bits_this_round;
        }

        Ok(out_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Packs bits MSB-first in the order the decoder consumes them.
    struct BitWriter {
        bytes: Vec<u8>,
        bits: usize,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bits: 0,
            }
        }

        fn push(&mut self, value: u32, count: u32) {
            for i in (0..count).rev() {
                if self.bits % 8 == 0 {
                    self.bytes.push(0);
                }
                let bit = ((value >> i) & 1) as u8;
                let last = self.bytes.last_mut().unwrap();
                *last |= bit << (7 - self.bits % 8);
                self.bits += 1;
            }
        }

        fn literal(&mut self, byte: u8) {
            self.push(0, 1);
            self.push(byte as u32, 8);
        }
    }

    fn build(stream: BitWriter, size: usize, header: &[u8; HEADER_BLOCK_SIZE]) -> Vec<u8> {
        let mut compressed = stream.bytes;
        compressed.reverse();

        let mut out = CRILAYLA_MAGIC.to_vec();
        out.extend_from_slice(&(size as i32).to_le_bytes());
        out.extend_from_slice(&(compressed.len() as i32).to_le_bytes());
        out.extend_from_slice(&compressed);
        out.extend_from_slice(header);
        out
    }

    fn header() -> [u8; HEADER_BLOCK_SIZE] {
        let mut header = [0u8; HEADER_BLOCK_SIZE];
        for (i, b) in header.iter_mut().enumerate() {
            *b = i as u8;
        }
        header
    }

    #[test]
    fn test_literals_and_backreference() {
        let mut bits = BitWriter::new();
        // Output is produced back to front.
        bits.literal(b'Z');
        bits.literal(b'Y');
        bits.literal(b'X');
        bits.push(1, 1);
        bits.push(0, 13); // distance 3
        bits.push(3, 2); // length 3 + 3 ...
        bits.push(0, 3); // ... + 0 = 6

        let input = build(bits, 9, &header());
        let output = decompress_crilayla(&input).unwrap();

        assert_eq!(&output[..HEADER_BLOCK_SIZE], &header()[..]);
        assert_eq!(&output[HEADER_BLOCK_SIZE..], b"XYZXYZXYZ");
    }

    #[test]
    fn test_long_run_uses_extension_fields() {
        let mut bits = BitWriter::new();
        for _ in 0..3 {
            bits.literal(b'A');
        }
        bits.push(1, 1);
        bits.push(0, 13);
        bits.push(3, 2);
        bits.push(7, 3);
        bits.push(31, 5);
        bits.push(255, 8);
        bits.push(10, 8);
        let length = 3 + 3 + 7 + 31 + 255 + 10;

        let input = build(bits, 3 + length, &header());
        let output = decompress_crilayla(&input).unwrap();

        assert_eq!(output.len(), HEADER_BLOCK_SIZE + 3 + length);
        assert!(output[HEADER_BLOCK_SIZE..].iter().all(|&b| b == b'A'));
    }

    #[test]
    fn test_exhausted_stream_is_an_error() {
        let mut bits = BitWriter::new();
        bits.literal(b'Q');
        // Claims far more output than the stream encodes.
        let input = build(bits, 64, &header());
        assert!(matches!(
            decompress_crilayla(&input),
            Err(ArchiveError::Compression(_))
        ));
    }

    #[test]
    fn test_overrunning_backreference_is_an_error() {
        let mut bits = BitWriter::new();
        for _ in 0..3 {
            bits.literal(b'A');
        }
        bits.push(1, 1);
        bits.push(0, 13);
        bits.push(2, 2); // length 5, only 1 byte left
        let input = build(bits, 4, &header());
        assert!(matches!(
            decompress_crilayla(&input),
            Err(ArchiveError::Compression(_))
        ));
    }

    #[test]
    fn test_rejects_short_or_foreign_input() {
        assert!(decompress_crilayla(b"CRILAYLA").is_err());
        let mut not_crilayla = vec![0u8; 0x200];
        not_crilayla[..8].copy_from_slice(b"CRILAYLB");
        assert!(matches!(
            decompress_crilayla(&not_crilayla),
            Err(ArchiveError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_oversized_declared_length_is_rejected() {
        let mut stream = BitWriter::new();
        stream.literal(b'a');
        let mut data = build(stream, 1, &header());
        data[8..12].copy_from_slice(&i32::MAX.to_le_bytes());

        assert!(matches!(
            decompress_crilayla(&data),
            Err(ArchiveError::Compression(_))
        ));
    }
}
