//! The LAZ -> LAS side of the cohort protocol.
//!
//! Output records are fixed-size, so there is no sizing traversal: each
//! peer's byte count is its range length times the record length. The
//! placement exchange still runs so the cohort agrees on every peer's
//! offset before anyone writes, and there is no chunk table to emit.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};

use log::debug;

use crate::cohort::Communicator;
use crate::errors::{Error, Result};
use crate::las::PointReader;
use crate::pipeline::partition;
use crate::pipeline::{Direction, Job, Summary};

pub(super) fn decompress<C: Communicator>(
    comm: &C,
    reader: &mut PointReader<'_>,
    job: &Job,
) -> Result<Summary> {
    let rank = comm.rank();
    let header = reader.header().clone();

    let range = partition::even_split(header.num_points, rank, comm.size());
    debug!(
        "rank {} owns points [{}, {}) of {}",
        rank,
        range.start,
        range.end,
        header.num_points
    );
    comm.barrier()?;

    // Fixed-size records make the sizing pass analytic.
    let local_bytes = range.len() * u64::from(header.point_size);
    comm.barrier()?;

    let all_bytes = comm.all_gather_u64(local_bytes)?;

    let header_bytes = header.uncompressed_header_bytes()?;
    let header_end = header_bytes.len() as u64;
    let broadcast_end = comm.broadcast_u64(0, header_end)?;
    if broadcast_end != header_end {
        return Err(Error::HeaderMismatch {
            rank,
            broadcast: broadcast_end,
            computed: header_end,
        });
    }
    let my_offset = header_end + all_bytes[..rank].iter().sum::<u64>();
    debug!(
        "rank {} writes {} bytes at offset {}",
        rank, local_bytes, my_offset
    );

    if rank == 0 {
        let mut file = File::create(&job.output)?;
        file.write_all(&header_bytes)?;
    }
    comm.barrier()?;

    let mut out = BufWriter::new(OpenOptions::new().write(true).open(&job.output)?);
    out.seek(SeekFrom::Start(my_offset))?;
    reader.seek(range.start)?;
    for index in range.start..range.end {
        if !reader.read_point()? {
            return Err(Error::TruncatedPointData { index });
        }
        out.write_all(reader.point())?;
    }
    let written = out.seek(SeekFrom::Current(0))? - my_offset;
    out.flush()?;
    if written != local_bytes {
        return Err(Error::SizingMismatch {
            rank,
            sized: local_bytes,
            written,
        });
    }
    debug!("rank {} finished its final pass", rank);
    comm.barrier()?;

    Ok(Summary {
        direction: Direction::LazToLas,
        points: range.len(),
        bytes_written: written,
        chunks: 0,
    })
}
