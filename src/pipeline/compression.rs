//! The LAS -> LAZ side of the cohort protocol.
//!
//! Every peer compresses its chunk-aligned range twice: once into a
//! counting sink to learn its exact compressed size, then into the real
//! file at the absolute offset derived from the exchanged byte counts.
//! The last rank collects every peer's per-chunk byte lengths and writes
//! the global chunk table.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use laz::laszip::{ChunkTable, ChunkTableEntry};
use laz::LazVlr;
use log::debug;

use crate::chunks::{laz_vlr_for, ChunkAccounting, ChunkedWriter};
use crate::cohort::{Communicator, CHUNK_BYTES, TABLE_POS};
use crate::errors::{Error, Result};
use crate::las::PointReader;
use crate::pipeline::partition::{self, PeerRange};
use crate::pipeline::{Direction, Job, Summary};
use crate::sink::CountingSink;

/// Size of the chunk-table offset slot that sits between the header and
/// the first chunk.
const TABLE_OFFSET_SIZE: u64 = 8;

pub(super) fn compress<C: Communicator>(
    comm: &C,
    reader: &mut PointReader<'_>,
    job: &Job,
) -> Result<Summary> {
    let rank = comm.rank();
    let last = comm.size() - 1;

    let header = reader.header().clone();
    let vlr = laz_vlr_for(
        header.point_format_id(),
        header.num_extra_bytes()?,
        job.chunk_size,
    )?;

    let range = partition::chunk_aligned(header.num_points, job.chunk_size, rank, comm.size())?;
    debug!(
        "rank {} owns points [{}, {}) of {}",
        rank,
        range.start,
        range.end,
        header.num_points
    );
    comm.barrier()?;

    // Sizing pass: same encoding, bytes go nowhere.
    let mut writer = ChunkedWriter::new(CountingSink::new(), &vlr, ChunkAccounting::starting_at(0))?;
    encode_range(reader, &mut writer, range)?;
    let (sink, sizing) = writer.finish()?;
    let local_bytes = sink.position();
    debug!(
        "rank {} sized its range: {} bytes in {} chunks",
        rank,
        local_bytes,
        sizing.chunk_count()
    );
    comm.barrier()?;

    // Placement exchange.
    let all_bytes = comm.all_gather_u64(local_bytes)?;
    let all_chunks = comm.gather_u32(last, sizing.chunk_count())?;
    let merged_chunk_bytes = exchange_chunk_bytes(comm, &sizing, all_chunks.as_deref())?;

    let header_bytes = header.compressed_header_bytes(&vlr)?;
    let header_end = header_bytes.len() as u64 + TABLE_OFFSET_SIZE;
    let broadcast_end = comm.broadcast_u64(0, header_end)?;
    if broadcast_end != header_end {
        return Err(Error::HeaderMismatch {
            rank,
            broadcast: broadcast_end,
            computed: header_end,
        });
    }

    let my_offset = header_end + all_bytes[..rank].iter().sum::<u64>();
    let table_pos = header_end + all_bytes.iter().sum::<u64>();
    debug!(
        "rank {} writes {} bytes at offset {}",
        rank, local_bytes, my_offset
    );

    // The original driver routes the table position from rank 0 to the
    // table writer even though both can compute it; the redundancy is
    // kept as a cross-check on the placement arithmetic.
    if rank == 0 && last != 0 {
        comm.send_u64(last, TABLE_POS, table_pos)?;
    }
    let table_pos = if rank == last && last != 0 {
        let received = comm.recv_u64(0, TABLE_POS)?;
        if received != table_pos {
            return Err(Error::TablePositionMismatch {
                received,
                computed: table_pos,
            });
        }
        received
    } else {
        table_pos
    };

    if rank == 0 {
        write_header(job, &header_bytes)?;
    }
    comm.barrier()?;

    // Final pass, at the exchanged absolute offset.
    let mut out = BufWriter::new(OpenOptions::new().write(true).open(&job.output)?);
    out.seek(SeekFrom::Start(my_offset))?;
    let mut writer = ChunkedWriter::new(out, &vlr, ChunkAccounting::starting_at(my_offset))?;
    encode_range(reader, &mut writer, range)?;
    let (mut out, placed) = writer.finish()?;
    let written = out.seek(SeekFrom::Current(0))? - my_offset;
    out.flush()?;

    verify_sizing(rank, local_bytes, written, &sizing, &placed)?;
    debug!("rank {} finished its final pass", rank);
    comm.barrier()?;

    if let Some(chunk_bytes) = merged_chunk_bytes {
        write_chunk_table(job, &vlr, &chunk_bytes, table_pos, header_bytes.len() as u64)?;
        debug!(
            "rank {} wrote the chunk table: {} chunks at offset {}",
            rank,
            chunk_bytes.len(),
            table_pos
        );
    }

    Ok(Summary {
        direction: Direction::LasToLaz,
        points: range.len(),
        bytes_written: written,
        chunks: sizing.chunk_count(),
    })
}

fn encode_range<W: Write + Seek>(
    reader: &mut PointReader<'_>,
    writer: &mut ChunkedWriter<'_, W>,
    range: PeerRange,
) -> Result<()> {
    reader.seek(range.start)?;
    for index in range.start..range.end {
        if !reader.read_point()? {
            return Err(Error::TruncatedPointData { index });
        }
        writer.write_point(reader.point())?;
    }
    Ok(())
}

/// Ships every peer's per-chunk byte lengths to the last rank, which
/// returns them concatenated in rank order.
fn exchange_chunk_bytes<C: Communicator>(
    comm: &C,
    sizing: &ChunkAccounting,
    all_chunks: Option<&[u32]>,
) -> Result<Option<Vec<u32>>> {
    let last = comm.size() - 1;
    if comm.rank() != last {
        comm.send_u32_slice(last, CHUNK_BYTES, sizing.chunk_bytes())?;
        return Ok(None);
    }

    // Only the last rank got the gathered chunk counts.
    let all_chunks = all_chunks.ok_or(Error::InvalidPeer {
        peer: last,
        size: comm.size(),
    })?;
    let total: usize = all_chunks.iter().map(|&c| c as usize).sum();
    let mut merged = Vec::with_capacity(total);
    for peer in 0..comm.size() {
        if peer == last {
            merged.extend_from_slice(sizing.chunk_bytes());
        } else {
            let bytes = comm.recv_u32_vec(peer, CHUNK_BYTES)?;
            if bytes.len() != all_chunks[peer] as usize {
                return Err(Error::MalformedMessage {
                    from: peer,
                    expected: all_chunks[peer] as usize * 4,
                    got: bytes.len() * 4,
                });
            }
            merged.extend_from_slice(&bytes);
        }
    }
    Ok(Some(merged))
}

fn write_header(job: &Job, header_bytes: &[u8]) -> Result<()> {
    let mut file = File::create(&job.output)?;
    file.write_all(header_bytes)?;
    // Chunk table offset slot; the table writer patches it at the end.
    file.write_i64::<LittleEndian>(-1)?;
    Ok(())
}

fn verify_sizing(
    rank: usize,
    sized_bytes: u64,
    written: u64,
    sizing: &ChunkAccounting,
    placed: &ChunkAccounting,
) -> Result<()> {
    if written != sized_bytes || placed.chunk_count() != sizing.chunk_count() {
        return Err(Error::SizingMismatch {
            rank,
            sized: sized_bytes,
            written,
        });
    }
    for (chunk, (&sized, &placed)) in sizing
        .chunk_bytes()
        .iter()
        .zip(placed.chunk_bytes())
        .enumerate()
    {
        if sized != placed {
            return Err(Error::ChunkSizeMismatch {
                rank,
                chunk,
                sized,
                written: placed,
            });
        }
    }
    Ok(())
}

/// The designated writer's last act: the chunk table at its absolute
/// position, then the offset slot pointing at it.
fn write_chunk_table(
    job: &Job,
    vlr: &LazVlr,
    chunk_bytes: &[u32],
    table_pos: u64,
    offset_slot: u64,
) -> Result<()> {
    let mut table = ChunkTable::with_capacity(chunk_bytes.len());
    for &byte_count in chunk_bytes {
        table.push(ChunkTableEntry {
            point_count: u64::from(vlr.chunk_size()),
            byte_count: u64::from(byte_count),
        });
    }

    let mut file = OpenOptions::new().write(true).open(&job.output)?;
    file.seek(SeekFrom::Start(table_pos))?;
    table.write_to(&mut file, vlr)?;
    file.seek(SeekFrom::Start(offset_slot))?;
    file.write_i64::<LittleEndian>(table_pos as i64)?;
    Ok(())
}
