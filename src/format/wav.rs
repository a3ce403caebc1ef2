//! WAV (RIFF/WAVE) header handling.
//!
//! Recordings start with a zeroed 44-byte placeholder; once the final byte count is known
//! the RIFF and data length fields are patched in place, which requires a seekable file.
//! See: <http://soundfile.sapp.org/doc/WaveFormat/>

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Byte offset of the file size field in WAV header (RIFF chunk size).
const WAV_FILE_SIZE_OFFSET: u64 = 4;

/// Byte offset of the data chunk size field in WAV header.
const WAV_DATA_SIZE_OFFSET: u64 = 40;

/// Size of the WAV header in bytes (RIFF + fmt + data chunk headers).
pub const WAV_HEADER_SIZE: usize = 44;

/// Size of the fmt chunk data (16 bytes for PCM).
const WAV_FMT_CHUNK_SIZE: u32 = 16;

/// Audio format code for PCM (uncompressed).
pub const WAV_FORMAT_PCM: u16 = 1;

/// Upper bound on a fmt chunk body we are willing to buffer.
const WAV_FMT_CHUNK_MAX: u32 = 64;

/// Format fields of a parsed playback file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavInfo {
    /// Channel quantity (1 or 2).
    pub channel_qty: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bits per sample (always 16).
    pub bits_per_sample: u16,
    /// Byte offset of the first PCM sample.
    pub data_offset: u64,
    /// Length of the data chunk in bytes.
    pub data_len: u32,
}

/// Builds a complete 44-byte PCM header.
///
/// Samples wider than 3 bytes are described as 24-bit, matching what capture tools expect
/// for 32-bit microphone dumps.
pub fn header(channels: u16, sample_rate: u32, sample_size: u8, data_size: u32) -> [u8; WAV_HEADER_SIZE] {
    let bits_per_sample: u16 = if sample_size > 3 { 24 } else { u16::from(sample_size) * 8 };
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut out = [0u8; WAV_HEADER_SIZE];
    out[0..4].copy_from_slice(b"RIFF");
    out[4..8].copy_from_slice(&(WAV_HEADER_SIZE as u32 - 8 + data_size).to_le_bytes());
    out[8..12].copy_from_slice(b"WAVE");
    out[12..16].copy_from_slice(b"fmt ");
    out[16..20].copy_from_slice(&WAV_FMT_CHUNK_SIZE.to_le_bytes());
    out[20..22].copy_from_slice(&WAV_FORMAT_PCM.to_le_bytes());
    out[22..24].copy_from_slice(&channels.to_le_bytes());
    out[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    out[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    out[32..34].copy_from_slice(&block_align.to_le_bytes());
    out[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
    out[36..40].copy_from_slice(b"data");
    out[40..44].copy_from_slice(&data_size.to_le_bytes());
    out
}

/// Writes a zero placeholder header; the real one is written by [`finalize`].
pub fn write_placeholder<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&[0u8; WAV_HEADER_SIZE])
}

/// Writes the full header at the start of the file, then returns to the end.
pub fn finalize<W: Write + Seek>(
    writer: &mut W,
    channels: u16,
    sample_rate: u32,
    sample_size: u8,
    data_size: u32,
) -> io::Result<()> {
    writer.seek(SeekFrom::Start(0))?;
    writer.write_all(&header(channels, sample_rate, sample_size, data_size))?;
    writer.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Updates only the RIFF and data size fields of an existing header.
pub fn update_sizes<W: Write + Seek>(writer: &mut W, data_size: u32) -> io::Result<()> {
    let file_size = WAV_HEADER_SIZE as u32 - 8 + data_size;
    writer.seek(SeekFrom::Start(WAV_FILE_SIZE_OFFSET))?;
    writer.write_all(&file_size.to_le_bytes())?;

    writer.seek(SeekFrom::Start(WAV_DATA_SIZE_OFFSET))?;
    writer.write_all(&data_size.to_le_bytes())?;

    writer.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Why a header could not be used for playback.
#[derive(Debug, thiserror::Error)]
pub enum WavParseError {
    /// Reading or seeking failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The header is not RIFF/WAVE or misses a required chunk.
    #[error("{0}")]
    Malformed(&'static str),
    /// The fmt chunk describes something other than 16-bit PCM with 1-2 channels.
    #[error("unsupported wave params: format {format} bits {bits} channels {channels}")]
    Unsupported {
        /// Audio format code.
        format: u16,
        /// Bits per sample.
        bits: u16,
        /// Channel quantity.
        channels: u16,
    },
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Walks the RIFF subchunks of a playback file.
///
/// `fmt ` and `data` are required; `INFO` and unknown chunks are skipped. On success the
/// reader is left positioned at the first PCM sample.
pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<WavInfo, WavParseError> {
    let mut riff = [0u8; 12];
    reader.read_exact(&mut riff)?;
    if &riff[0..4] != b"RIFF" {
        return Err(WavParseError::Malformed("missing RIFF tag"));
    }
    if &riff[8..12] != b"WAVE" {
        return Err(WavParseError::Malformed("missing WAVE tag"));
    }
    let riff_len = u64::from(le_u32(&riff[4..8])).saturating_sub(4);

    let mut walked: u64 = 0;
    let mut fmt: Option<(u16, u32, u16)> = None;
    let mut data: Option<(u64, u32)> = None;

    while walked + 1 < riff_len {
        let mut chunk = [0u8; 8];
        reader.read_exact(&mut chunk)?;
        let chunk_len = le_u32(&chunk[4..8]);

        match &chunk[0..4] {
            b"fmt " => {
                if chunk_len > WAV_FMT_CHUNK_MAX || chunk_len < WAV_FMT_CHUNK_SIZE {
                    return Err(WavParseError::Malformed("bad fmt chunk length"));
                }
                let mut body = vec![0u8; chunk_len as usize];
                reader.read_exact(&mut body)?;
                let format = le_u16(&body[0..2]);
                let channels = le_u16(&body[2..4]);
                let sample_rate = le_u32(&body[4..8]);
                let bits = le_u16(&body[14..16]);
                if format != WAV_FORMAT_PCM || bits != 16 || channels == 0 || channels > 2 {
                    return Err(WavParseError::Unsupported {
                        format,
                        bits,
                        channels,
                    });
                }
                fmt = Some((channels, sample_rate, bits));
            }
            b"data" => {
                data = Some((walked + 20, chunk_len));
                reader.seek(SeekFrom::Current(i64::from(chunk_len)))?;
            }
            other => {
                tracing::debug!(
                    chunk = %String::from_utf8_lossy(other),
                    len = chunk_len,
                    "skipping wave subchunk"
                );
                reader.seek(SeekFrom::Current(i64::from(chunk_len)))?;
            }
        }
        walked += u64::from(chunk_len) + 8;
    }

    let ((channel_qty, sample_rate, bits_per_sample), (data_offset, data_len)) = fmt
        .zip(data)
        .ok_or(WavParseError::Malformed("missing fmt or data subchunk"))?;

    reader.seek(SeekFrom::Start(data_offset))?;
    Ok(WavInfo {
        channel_qty,
        sample_rate,
        bits_per_sample,
        data_offset,
        data_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav_bytes(samples: &[i16], channels: u16, extra_chunk: bool) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let mut out = Vec::new();
        let info: &[u8] = b"LIST\x04\x00\x00\x00abcd";
        let extra = if extra_chunk { info.len() as u32 } else { 0 };
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + extra + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(&header(channels, 16_000, 2, data_len)[12..36]);
        if extra_chunk {
            out.extend_from_slice(info);
        }
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_header_fields() {
        let h = header(2, 48_000, 2, 1000);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(le_u32(&h[4..8]), 1036);
        assert_eq!(le_u32(&h[28..32]), 48_000 * 4);
        assert_eq!(le_u16(&h[32..34]), 4);
        assert_eq!(le_u16(&h[34..36]), 16);
        assert_eq!(le_u32(&h[40..44]), 1000);
    }

    #[test]
    fn test_header_32_bit_described_as_24() {
        let h = header(1, 16_000, 4, 0);
        assert_eq!(le_u16(&h[34..36]), 24);
    }

    #[test]
    fn test_finalize_after_placeholder() {
        let mut cursor = Cursor::new(Vec::new());
        write_placeholder(&mut cursor).unwrap();
        cursor.write_all(&[0u8; 100]).unwrap();
        finalize(&mut cursor, 1, 16_000, 2, 100).unwrap();

        let bytes = cursor.into_inner();
        assert_eq!(bytes.len(), 144);
        assert_eq!(le_u32(&bytes[4..8]) as usize, bytes.len() - 8);
        assert_eq!(le_u32(&bytes[40..44]), 100);
    }

    #[test]
    fn test_update_sizes() {
        let mut cursor = Cursor::new(header(1, 16_000, 2, 0).to_vec());
        cursor.seek(SeekFrom::End(0)).unwrap();
        cursor.write_all(&[1u8; 64]).unwrap();
        update_sizes(&mut cursor, 64).unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(le_u32(&bytes[4..8]), 100);
        assert_eq!(le_u32(&bytes[40..44]), 64);
    }

    #[test]
    fn test_parse_positions_at_data() {
        let mut cursor = Cursor::new(wav_bytes(&[1, 2, 3, 4], 2, false));
        let info = parse(&mut cursor).unwrap();
        assert_eq!(info.channel_qty, 2);
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.data_offset, 44);
        assert_eq!(info.data_len, 8);
        assert_eq!(cursor.position(), 44);
    }

    #[test]
    fn test_parse_skips_unknown_chunks() {
        let mut cursor = Cursor::new(wav_bytes(&[7; 10], 1, true));
        let info = parse(&mut cursor).unwrap();
        assert_eq!(info.data_offset, 56);
        assert_eq!(info.data_len, 20);
    }

    #[test]
    fn test_parse_rejects_non_riff() {
        let mut cursor = Cursor::new(b"RIFX\x00\x00\x00\x00WAVE".to_vec());
        assert!(matches!(parse(&mut cursor), Err(WavParseError::Malformed(_))));
    }

    #[test]
    fn test_parse_rejects_unsupported_bits() {
        let mut bytes = wav_bytes(&[0; 4], 1, false);
        bytes[34] = 8;
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            parse(&mut cursor),
            Err(WavParseError::Unsupported { bits: 8, .. })
        ));
    }
}
