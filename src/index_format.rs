//! Binary layout of the `index.symdb` file.
//!
//! The index is the entry point of a v2 block: a magic/version header
//! followed by one header per partition, in the order the partitions were
//! written. Everything is little-endian.
//!
//! ```text
//! index.symdb := magic "symb" | version: u32
//!              | partition_count: u32 | partition_header*
//! partition_header := partition: u64
//!                   | row_ranges(strings) | row_ranges(functions)
//!                   | row_ranges(locations) | row_ranges(mappings)
//!                   | chunk_count: u32 | stacktrace_chunk_header*
//! row_ranges := count: u32 | { row_group: u32, index: u32, rows: u32 }*
//! stacktrace_chunk_header := offset: u64 | size: u64 | partition: u64
//!                          | chunk_index: u16 | encoding: u8
//!                          | stacks: u32 | nodes: u32 | max_depth: u32
//!                          | max_nodes: u32 | crc32c: u32
//! ```

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

pub(crate) const SYMDB_MAGIC: [u8; 4] = *b"symb";
pub(crate) const FORMAT_V2: u32 = 2;

/// Chunk body encoding tag. Group-varint is the only encoding today; the tag
/// exists so a block can mix encodings across chunks.
pub(crate) const CHUNK_ENCODING_GROUP_VARINT: u8 = 1;

const ROW_RANGE_SIZE: usize = 12;
const CHUNK_HEADER_SIZE: usize = 47;

/// Locates one partition's contiguous run of rows inside a shared parquet
/// table: row group, offset within the group, and row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRangeReference {
    pub row_group: u32,
    pub index: u32,
    pub rows: u32,
}

/// Describes one stacktrace chunk: where its body lives in the stacktrace
/// file and what it contains. Stored in the index, not inline in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StacktraceChunkHeader {
    pub offset: u64,
    pub size: u64,
    pub partition: u64,
    pub chunk_index: u16,
    pub encoding: u8,
    pub stacks: u32,
    pub nodes: u32,
    pub max_depth: u32,
    pub max_nodes: u32,
    pub crc32c: u32,
}

impl StacktraceChunkHeader {
    /// First stacktrace id addressed by this chunk.
    pub(crate) fn first_id(&self) -> u32 {
        u32::from(self.chunk_index) * self.max_nodes
    }
}

/// Per-partition slice of the block: four table row-range lists plus the
/// stacktrace chunk sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionHeader {
    pub partition: u64,
    pub strings: Vec<RowRangeReference>,
    pub functions: Vec<RowRangeReference>,
    pub locations: Vec<RowRangeReference>,
    pub mappings: Vec<RowRangeReference>,
    pub stacktrace_chunks: Vec<StacktraceChunkHeader>,
}

impl PartitionHeader {
    /// Exclusive upper bound of the partition's stacktrace id space.
    pub(crate) fn max_stacktrace_id(&self) -> u32 {
        match self.stacktrace_chunks.last() {
            Some(chunk) => chunk.first_id() + chunk.nodes,
            None => 0,
        }
    }

    pub(crate) fn stacktraces_total(&self) -> u32 {
        self.stacktrace_chunks.iter().map(|c| c.stacks).sum()
    }
}

/// Parsed `index.symdb`.
#[derive(Debug, Clone, Default)]
pub struct IndexFile {
    pub partitions: Vec<PartitionHeader>,
}

impl IndexFile {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(64 * self.partitions.len() + 12);
        dst.put_slice(&SYMDB_MAGIC);
        dst.put_u32_le(FORMAT_V2);
        dst.put_u32_le(self.partitions.len() as u32);
        for p in &self.partitions {
            dst.put_u64_le(p.partition);
            encode_row_ranges(&p.strings, &mut dst);
            encode_row_ranges(&p.functions, &mut dst);
            encode_row_ranges(&p.locations, &mut dst);
            encode_row_ranges(&p.mappings, &mut dst);
            dst.put_u32_le(p.stacktrace_chunks.len() as u32);
            for c in &p.stacktrace_chunks {
                dst.put_u64_le(c.offset);
                dst.put_u64_le(c.size);
                dst.put_u64_le(c.partition);
                dst.put_u16_le(c.chunk_index);
                dst.put_u8(c.encoding);
                dst.put_u32_le(c.stacks);
                dst.put_u32_le(c.nodes);
                dst.put_u32_le(c.max_depth);
                dst.put_u32_le(c.max_nodes);
                dst.put_u32_le(c.crc32c);
            }
        }
        dst
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < 8 {
            return Err(Error::CorruptIndex("file shorter than header".into()));
        }
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SYMDB_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }
        let version = buf.get_u32_le();
        if version != FORMAT_V2 {
            return Err(Error::UnsupportedVersion(version));
        }

        let partition_count = take_count(&mut buf, 8)?;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            let partition = take_u64(&mut buf)?;
            let strings = decode_row_ranges(&mut buf)?;
            let functions = decode_row_ranges(&mut buf)?;
            let locations = decode_row_ranges(&mut buf)?;
            let mappings = decode_row_ranges(&mut buf)?;
            let chunk_count = take_count(&mut buf, CHUNK_HEADER_SIZE)?;
            let mut stacktrace_chunks = Vec::with_capacity(chunk_count);
            for _ in 0..chunk_count {
                stacktrace_chunks.push(StacktraceChunkHeader {
                    offset: take_u64(&mut buf)?,
                    size: take_u64(&mut buf)?,
                    partition: take_u64(&mut buf)?,
                    chunk_index: take_u16(&mut buf)?,
                    encoding: take_u8(&mut buf)?,
                    stacks: take_u32(&mut buf)?,
                    nodes: take_u32(&mut buf)?,
                    max_depth: take_u32(&mut buf)?,
                    max_nodes: take_u32(&mut buf)?,
                    crc32c: take_u32(&mut buf)?,
                });
            }
            partitions.push(PartitionHeader {
                partition,
                strings,
                functions,
                locations,
                mappings,
                stacktrace_chunks,
            });
        }
        if buf.has_remaining() {
            return Err(Error::CorruptIndex("trailing bytes after partitions".into()));
        }
        Ok(Self { partitions })
    }
}

fn encode_row_ranges(ranges: &[RowRangeReference], dst: &mut Vec<u8>) {
    dst.put_u32_le(ranges.len() as u32);
    for r in ranges {
        dst.put_u32_le(r.row_group);
        dst.put_u32_le(r.index);
        dst.put_u32_le(r.rows);
    }
}

fn decode_row_ranges(buf: &mut &[u8]) -> Result<Vec<RowRangeReference>> {
    let count = take_count(buf, ROW_RANGE_SIZE)?;
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        ranges.push(RowRangeReference {
            row_group: take_u32(buf)?,
            index: take_u32(buf)?,
            rows: take_u32(buf)?,
        });
    }
    Ok(ranges)
}

/// Reads an element count and checks the buffer can possibly hold that many
/// elements of `min_size` bytes, so a corrupt count cannot trigger a huge
/// allocation.
fn take_count(buf: &mut &[u8], min_size: usize) -> Result<usize> {
    let count = take_u32(buf)? as usize;
    if count.saturating_mul(min_size) > buf.remaining() {
        return Err(Error::CorruptIndex(format!("implausible element count {count}")));
    }
    Ok(count)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(Error::CorruptIndex("unexpected end of index".into()));
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::CorruptIndex("unexpected end of index".into()));
    }
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::CorruptIndex("unexpected end of index".into()));
    }
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::CorruptIndex("unexpected end of index".into()));
    }
    Ok(buf.get_u64_le())
}
