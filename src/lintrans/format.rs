//! On-disk encoding of a single diagonal
//!
//! ```text
//! [4 bytes] magic: b"LTDG"
//! [1 byte]  version: 1
//! [4 bytes] chunk length in values (u32 LE)
//! [8 bytes] total number of values (u64 LE)
//! per chunk:
//!   [4 bytes] compressed size (u32 LE)
//!   [n bytes] zstd-compressed little-endian f64 values
//! ```
//!
//! Values round-trip bit for bit.

use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;

const MAGIC: &[u8; 4] = b"LTDG";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4 + 8;

/// Values per compressed chunk
pub const CHUNK_LEN: usize = 4096;

const ZSTD_LEVEL: i32 = 3;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Encode `values` into `writer`
pub fn encode_diagonal<W: Write>(mut writer: W, values: &[f64]) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_u8(VERSION)?;
    writer.write_u32::<LittleEndian>(CHUNK_LEN as u32)?;
    writer.write_u64::<LittleEndian>(values.len() as u64)?;

    let mut raw = Vec::with_capacity(CHUNK_LEN * 8);
    for chunk in values.chunks(CHUNK_LEN) {
        raw.clear();
        for &v in chunk {
            raw.write_f64::<LittleEndian>(v)?;
        }
        let compressed = zstd::bulk::compress(&raw, ZSTD_LEVEL)?;
        writer.write_u32::<LittleEndian>(compressed.len() as u32)?;
        writer.write_all(&compressed)?;
    }
    writer.flush()
}

/// Decode a diagonal previously written by [`encode_diagonal`]
pub fn decode_diagonal(bytes: &[u8]) -> io::Result<Vec<f64>> {
    let mut cursor = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(invalid("not a diagonal file"));
    }
    let version = cursor.read_u8()?;
    if version != VERSION {
        return Err(invalid(format!("unsupported diagonal format version {}", version)));
    }
    let chunk_len = cursor.read_u32::<LittleEndian>()? as usize;
    let total = cursor.read_u64::<LittleEndian>()?;
    if chunk_len == 0 || chunk_len > CHUNK_LEN {
        return Err(invalid(format!("unsupported chunk length {}", chunk_len)));
    }
    // each chunk costs at least its size prefix
    let max_chunks = (bytes.len() - HEADER_LEN) / 4;
    let total = usize::try_from(total)
        .ok()
        .filter(|&t| t <= max_chunks.saturating_mul(chunk_len))
        .ok_or_else(|| invalid(format!("implausible value count {}", total)))?;

    let mut values = Vec::with_capacity(total.min(chunk_len));
    while values.len() < total {
        let expected = chunk_len.min(total - values.len());
        let size = cursor.read_u32::<LittleEndian>()? as usize;
        let start = cursor.position() as usize;
        let end = start
            .checked_add(size)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| invalid("truncated chunk"))?;

        let raw = zstd::bulk::decompress(&bytes[start..end], expected * 8)?;
        if raw.len() != expected * 8 {
            return Err(invalid(format!(
                "chunk holds {} bytes, expected {}",
                raw.len(),
                expected * 8
            )));
        }
        let mut chunk = Cursor::new(raw.as_slice());
        for _ in 0..expected {
            values.push(chunk.read_f64::<LittleEndian>()?);
        }
        cursor.set_position(end as u64);
    }

    if (cursor.position() as usize) != bytes.len() {
        return Err(invalid("trailing bytes after last chunk"));
    }
    Ok(values)
}

pub fn write_diagonal_file(path: &Path, values: &[f64]) -> io::Result<()> {
    let file = File::create(path)?;
    encode_diagonal(BufWriter::new(file), values)?;
    Ok(())
}

pub fn read_diagonal_file(path: &Path) -> io::Result<Vec<f64>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(invalid("empty diagonal file"));
    }
    // SAFETY: the file is opened read-only and cache entries are only ever
    // replaced by renaming a new directory into place, never rewritten.
    let mmap = unsafe { Mmap::map(&file)? };
    decode_diagonal(&mmap[..])
}
