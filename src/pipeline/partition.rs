//! Splitting the input points between the peers.

use crate::errors::{Error, Result};

/// The half-open range of source point indices owned by one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRange {
    pub start: u64,
    pub end: u64,
}

impl PeerRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partition for LAS -> LAZ: whole chunks are dealt across the peers,
/// one extra to each of the lowest ranks when they don't divide evenly,
/// and the trailing partial chunk (if any) goes to the last rank.
///
/// Every peer except the last therefore starts and ends on a chunk
/// boundary, which is what lets it compress its range in isolation and
/// still produce the bytes a serial compressor would.
pub fn chunk_aligned(npoints: u64, chunk_size: u32, rank: usize, size: usize) -> Result<PeerRange> {
    let chunk_size = u64::from(chunk_size);
    let chunks = npoints / chunk_size;
    let leftover_points = npoints % chunk_size;

    if chunks < size as u64 {
        return Err(Error::InsufficientChunks {
            chunks,
            peers: size,
        });
    }

    let base = chunks / size as u64;
    let extra = chunks % size as u64;

    let chunks_before = |rank: u64| base * rank + rank.min(extra);
    let rank = rank as u64;

    let start = chunks_before(rank) * chunk_size;
    let mut end = chunks_before(rank + 1) * chunk_size;
    if rank == size as u64 - 1 {
        end += leftover_points;
    }
    Ok(PeerRange { start, end })
}

/// Partition for LAZ -> LAS: an even split by point count, with the
/// remainder going entirely to the last rank.
pub fn even_split(npoints: u64, rank: usize, size: usize) -> PeerRange {
    let per_peer = npoints / size as u64;
    let rank = rank as u64;
    let start = rank * per_peer;
    let mut end = start + per_peer;
    if rank == size as u64 - 1 {
        end += npoints % size as u64;
    }
    PeerRange { start, end }
}
