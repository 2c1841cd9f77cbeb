//! Walking guest-published chunk lists.
//!
//! The guest controls every `next` pointer, every size field and the list
//! shape, so the walk trusts nothing: a hard chunk-count bound defeats
//! cycles without following them twice, and an aggregate size bound caps
//! host allocation per command.

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::memslot::{MemSlotError, MemSlotTable};
use crate::wire::{ChunkHeader, Reader, CHUNK_HEADER_SIZE};

/// Max size in bytes for any data field of a guest command. Fits in 31
/// bits so that later 32-bit arithmetic cannot overflow.
pub const MAX_DATA_CHUNK: u64 = 0x7fff_ffff;

/// DoS guard: a chunk list may not carry more records than this, so the
/// list bookkeeping can never outweigh the data it describes.
pub const MAX_CHUNKS: u64 = MAX_DATA_CHUNK / 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error(transparent)]
    MemSlot(#[from] MemSlotError),

    #[error("chunk list has more than {max} records", max = MAX_CHUNKS)]
    TooManyChunks { count: u64 },

    #[error("chunk list data exceeds {max} bytes", max = MAX_DATA_CHUNK)]
    TooMuchData { total: u64 },
}

/// A fully-copied chunk list. Chunk boundaries are preserved; empty
/// chunks are dropped during the walk.
#[derive(Debug, Clone, Default)]
pub struct ChunkedData {
    chunks: Vec<Bytes>,
    total: u64,
}

impl ChunkedData {
    /// A single-chunk list copied out of one flat guest span.
    pub fn from_flat(span: &[u8]) -> Self {
        if span.is_empty() {
            return Self::default();
        }
        Self {
            chunks: vec![Bytes::copy_from_slice(span)],
            total: span.len() as u64,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// One contiguous buffer; zero-copy when the list has a single chunk.
    pub fn linearize(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut out = Vec::with_capacity(self.total as usize);
                for c in &self.chunks {
                    out.extend_from_slice(c);
                }
                Bytes::from(out)
            }
        }
    }

    pub fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }
}

/// Walks a chunk list whose first header has already been read.
///
/// `first_data_addr` is the guest address of the first chunk's inline
/// payload. Every subsequent record is `{size, next, bytes}` at the
/// address its predecessor published.
pub fn read_chunk_list(
    slots: &MemSlotTable,
    first: ChunkHeader,
    first_data_addr: u64,
) -> Result<ChunkedData, ChunkError> {
    let mut out = ChunkedData::default();
    let mut count: u64 = 1;

    let mut size = u64::from(first.data_size);
    let mut data_addr = first_data_addr;
    let mut next = first.next;

    loop {
        if size > 0 {
            out.total += size;
            if out.total > MAX_DATA_CHUNK {
                warn!(total = out.total, "chunk list data too large, avoiding DoS");
                return Err(ChunkError::TooMuchData { total: out.total });
            }
            let span = slots.validate(data_addr, size)?;
            out.chunks.push(Bytes::copy_from_slice(span));
        }

        if next == 0 {
            break;
        }
        count += 1;
        if count > MAX_CHUNKS {
            warn!(count, "chunk list split in too many records, avoiding DoS");
            return Err(ChunkError::TooManyChunks { count });
        }

        let hdr_span = slots.validate(next, CHUNK_HEADER_SIZE)?;
        let hdr = ChunkHeader::read(&mut Reader::new(hdr_span))
            .expect("span length equals header size");
        data_addr = next
            .checked_add(CHUNK_HEADER_SIZE)
            .ok_or(MemSlotError::AddressOverflow { addr: next })?;
        size = u64::from(hdr.data_size);
        next = hdr.next;
    }

    Ok(out)
}

/// Walks a chunk list rooted at `addr` (header and first payload inline).
pub fn read_chunk_list_at(slots: &MemSlotTable, addr: u64) -> Result<ChunkedData, ChunkError> {
    let hdr_span = slots.validate(addr, CHUNK_HEADER_SIZE)?;
    let hdr = ChunkHeader::read(&mut Reader::new(hdr_span)).expect("span length equals header size");
    let data_addr = addr
        .checked_add(CHUNK_HEADER_SIZE)
        .ok_or(MemSlotError::AddressOverflow { addr })?;
    read_chunk_list(slots, hdr, data_addr)
}
