//! The per-peer conversion pipeline.
//!
//! Every peer of the cohort runs [`run_peer`] against the same job: it
//! opens the input on its own, the cohort agrees on what it is reading,
//! and the direction-specific pass does the rest. All peers must reach
//! the same collectives in the same order; any error is fatal to the
//! whole job.

use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info};

use crate::cohort::Communicator;
use crate::errors::{Error, Result};
use crate::las::PointReader;

mod compression;
mod decompression;
pub mod partition;

/// A conversion job, identical on every peer.
#[derive(Debug, Clone)]
pub struct Job {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Points per compressed chunk when writing LAZ.
    pub chunk_size: u32,
}

pub const DEFAULT_CHUNK_SIZE: u32 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LasToLaz,
    LazToLas,
}

/// What one peer did.
#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub direction: Direction,
    /// Points of the peer's range.
    pub points: u64,
    /// Bytes this peer wrote into the output's point region.
    pub bytes_written: u64,
    /// Compressed chunks this peer emitted (0 when writing LAS).
    pub chunks: u32,
}

/// Runs one peer of the conversion cohort to completion.
pub fn run_peer<C: Communicator>(comm: &C, job: &Job) -> Result<Summary> {
    let start = Instant::now();
    let mut reader = PointReader::open(&job.input)?;

    // Catch peers that see different bytes for the same path before any
    // of them writes anything.
    let num_points = reader.num_points();
    for (local, all) in [
        (num_points, comm.all_gather_u64(num_points)?),
        (
            u64::from(job.chunk_size),
            comm.all_gather_u64(u64::from(job.chunk_size))?,
        ),
    ] {
        if let Some(peer) = all.iter().position(|&value| value != local) {
            return Err(Error::PartitionMismatch {
                rank: comm.rank(),
                local,
                peer,
                remote: all[peer],
            });
        }
    }

    let direction = if reader.header().is_compressed() {
        Direction::LazToLas
    } else {
        Direction::LasToLaz
    };
    debug!(
        "rank {}/{}: {:?}, {} points, chunk size {}",
        comm.rank(),
        comm.size(),
        direction,
        num_points,
        job.chunk_size,
    );

    let summary = match direction {
        Direction::LasToLaz => compression::compress(comm, &mut reader, job)?,
        Direction::LazToLas => decompression::decompress(comm, &mut reader, job)?,
    };

    info!(
        "rank {} wrote {} points ({} bytes) in {:.3}s",
        comm.rank(),
        summary.points,
        summary.bytes_written,
        start.elapsed().as_secs_f64(),
    );
    Ok(summary)
}
