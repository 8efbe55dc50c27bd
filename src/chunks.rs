//! Chunk-aligned compression of point ranges.
//!
//! [`ChunkedWriter`] feeds points to a `laz` record compressor and closes
//! the entropy coder every `chunk_size` points, so each chunk is an
//! independently decodable stream. The byte length of every finished
//! chunk is recorded in a [`ChunkAccounting`] owned by the caller: the
//! same accounting type travels through the sizing pass (over a counting
//! sink) and the final pass (over the output file), which is what lets
//! the pipeline verify that both passes produced the same bytes.

use std::io::{Seek, SeekFrom, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use laz::record::{
    LayeredPointRecordCompressor, RecordCompressor, SequentialPointRecordCompressor,
};
use laz::{LasZipError, LazItem, LazItemRecordBuilder, LazVlr};

use crate::errors::Result;

/// Builds the laszip descriptor for compressing `point_format_id` points
/// into fixed-size chunks of `chunk_size` points.
pub fn laz_vlr_for(point_format_id: u8, num_extra_bytes: u16, chunk_size: u32) -> Result<LazVlr> {
    let items = LazItemRecordBuilder::default_for_point_format_id(point_format_id, num_extra_bytes)?;

    // Serialized record_data, as `LazVlr::write_to` lays it out.
    let mut record = Vec::new();
    let compressor: u16 = match items
        .first()
        .map(LazItem::version)
        .ok_or(LasZipError::UnsupportedPointFormat(point_format_id))?
    {
        1 | 2 => 2, // point-wise chunked
        _ => 3,     // layered chunked
    };
    record.write_u16::<LittleEndian>(compressor)?;
    record.write_u16::<LittleEndian>(0)?; // coder: arithmetic
    record.write_u8(2)?; // version of the compression scheme
    record.write_u8(2)?;
    record.write_u16::<LittleEndian>(0)?;
    record.write_u32::<LittleEndian>(0)?; // options
    record.write_u32::<LittleEndian>(chunk_size)?;
    record.write_i64::<LittleEndian>(-1)?; // special evlrs: unused
    record.write_i64::<LittleEndian>(-1)?;
    record.write_u16::<LittleEndian>(items.len() as u16)?;
    for item in &items {
        record.write_u16::<LittleEndian>(u16::from(item.item_type()))?;
        record.write_u16::<LittleEndian>(item.size())?;
        record.write_u16::<LittleEndian>(item.version())?;
    }

    Ok(LazVlr::from_buffer(&record)?)
}

fn record_compressor_for<'a, W: Write + 'a>(
    items: &Vec<LazItem>,
    dst: W,
) -> Result<Box<dyn RecordCompressor<W> + 'a>> {
    let first_item = items
        .first()
        .ok_or(LasZipError::UnsupportedPointFormat(0))?;

    let mut compressor = match first_item.version() {
        1 | 2 => {
            Box::new(SequentialPointRecordCompressor::new(dst)) as Box<dyn RecordCompressor<W>>
        }
        3 | 4 => Box::new(LayeredPointRecordCompressor::new(dst)) as Box<dyn RecordCompressor<W>>,
        version => {
            return Err(
                LasZipError::UnsupportedLazItemVersion(first_item.item_type(), version).into(),
            );
        }
    };
    compressor.set_fields_from(items)?;
    Ok(compressor)
}

/// Chunk bookkeeping for one peer's range.
///
/// `chunk_start` tracks the stream position where the chunk currently
/// being written began; each finished chunk appends its compressed byte
/// length. Seeding the start position with the peer's absolute file
/// offset makes the same arithmetic work for the sizing sink (which
/// starts at 0) and the output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAccounting {
    chunk_start: u64,
    chunk_bytes: Vec<u32>,
}

impl ChunkAccounting {
    pub fn starting_at(offset: u64) -> Self {
        Self {
            chunk_start: offset,
            chunk_bytes: Vec::new(),
        }
    }

    fn end_chunk(&mut self, position: u64) {
        self.chunk_bytes.push((position - self.chunk_start) as u32);
        self.chunk_start = position;
    }

    /// Compressed byte length of every finished chunk, in order.
    pub fn chunk_bytes(&self) -> &[u32] {
        &self.chunk_bytes
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_bytes.len() as u32
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunk_bytes.iter().map(|&b| u64::from(b)).sum()
    }
}

/// Writes points as a sequence of fixed-size compressed chunks.
///
/// Unlike a full laszip writer this never reserves or writes the chunk
/// table offset, and never writes a chunk table: in the cohort protocol
/// those bytes belong to peer 0 and to the designated table writer. The
/// destination is expected to be positioned where the accounting says the
/// first chunk starts.
pub struct ChunkedWriter<'a, W: Write + Seek + 'a> {
    items: Vec<LazItem>,
    chunk_size: u64,
    points_in_chunk: u64,
    record: Box<dyn RecordCompressor<W> + 'a>,
    accounting: ChunkAccounting,
}

impl<'a, W: Write + Seek + 'a> ChunkedWriter<'a, W> {
    pub fn new(dst: W, vlr: &LazVlr, accounting: ChunkAccounting) -> Result<Self> {
        let record = record_compressor_for(vlr.items(), dst)?;
        Ok(Self {
            items: vlr.items().clone(),
            chunk_size: u64::from(vlr.chunk_size()),
            points_in_chunk: 0,
            record,
            accounting,
        })
    }

    /// Compresses one raw point record.
    pub fn write_point(&mut self, point: &[u8]) -> Result<()> {
        if self.points_in_chunk == self.chunk_size {
            self.finish_chunk()?;
        }
        self.record.compress_next(point)?;
        self.points_in_chunk += 1;
        Ok(())
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.record.get_mut().seek(SeekFrom::Current(0))?)
    }

    fn finish_chunk(&mut self) -> Result<()> {
        self.record.done()?;
        self.record.reset();
        self.record.set_fields_from(&self.items)?;
        let position = self.position()?;
        self.accounting.end_chunk(position);
        self.points_in_chunk = 0;
        Ok(())
    }

    /// Closes the trailing (possibly partial) chunk and hands back the
    /// destination together with the accounting.
    pub fn finish(mut self) -> Result<(W, ChunkAccounting)> {
        if self.points_in_chunk > 0 {
            self.record.done()?;
            let position = self.position()?;
            self.accounting.end_chunk(position);
        }
        Ok((self.record.box_into_inner(), self.accounting))
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;
    use crate::sink::CountingSink;

    #[test]
    fn test_vlr_for_format_1() {
        let vlr = laz_vlr_for(1, 0, 1500).unwrap();
        assert_eq!(vlr.chunk_size(), 1500);
        assert_eq!(vlr.items_size(), 28);
        assert!(!vlr.uses_variable_size_chunks());
    }

    #[test]
    fn test_vlr_rejects_waveform_formats() {
        assert!(laz_vlr_for(4, 0, 1000).is_err());
        assert!(laz_vlr_for(5, 0, 1000).is_err());
    }

    #[test]
    fn test_chunk_rollover_accounting() {
        let vlr = laz_vlr_for(0, 0, 10).unwrap();
        let accounting = ChunkAccounting::starting_at(0);
        let mut writer = ChunkedWriter::new(CountingSink::new(), &vlr, accounting).unwrap();

        let point = vec![0u8; 20];
        for _ in 0..25 {
            writer.write_point(&point).unwrap();
        }
        let (sink, accounting) = writer.finish().unwrap();

        // 25 points in chunks of 10 -> 10, 10 and a trailing 5.
        assert_eq!(accounting.chunk_count(), 3);
        assert_eq!(accounting.total_bytes(), sink.position());
        assert!(accounting.chunk_bytes().iter().all(|&b| b > 0));
    }

    #[test]
    fn test_sizing_matches_real_output() {
        let vlr = laz_vlr_for(0, 0, 7).unwrap();

        let points: Vec<Vec<u8>> = (0..40u8)
            .map(|i| (0..20).map(|j| i.wrapping_mul(31).wrapping_add(j)).collect())
            .collect();

        let mut sized = ChunkedWriter::new(
            CountingSink::new(),
            &vlr,
            ChunkAccounting::starting_at(0),
        )
        .unwrap();
        let mut real = ChunkedWriter::new(
            Cursor::new(Vec::new()),
            &vlr,
            ChunkAccounting::starting_at(0),
        )
        .unwrap();
        for point in &points {
            sized.write_point(point).unwrap();
            real.write_point(point).unwrap();
        }
        let (sink, sized_accounting) = sized.finish().unwrap();
        let (cursor, real_accounting) = real.finish().unwrap();

        assert_eq!(sized_accounting, real_accounting);
        assert_eq!(sink.position(), cursor.into_inner().len() as u64);
    }
}
