//! A point reader that knows just enough about LAS and LAZ sources to
//! feed the conversion pipeline: it can seek to an arbitrary point index
//! and hand out raw point records one at a time.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use laz::LasZipDecompressor;

use crate::errors::Result;
use crate::las::header::LasHeader;

trait PointProducer {
    fn seek(&mut self, index: u64) -> Result<()>;
    fn read_into(&mut self, buf: &mut [u8]) -> Result<()>;
}

struct RawPoints<R> {
    src: R,
    data_start: u64,
    point_size: u64,
}

impl<R: Read + Seek> PointProducer for RawPoints<R> {
    fn seek(&mut self, index: u64) -> Result<()> {
        self.src
            .seek(SeekFrom::Start(self.data_start + index * self.point_size))?;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.src.read_exact(buf)?;
        Ok(())
    }
}

impl<'a, R: Read + Seek + Send + Sync + 'a> PointProducer for LasZipDecompressor<'a, R> {
    fn seek(&mut self, index: u64) -> Result<()> {
        LasZipDecompressor::seek(self, index)?;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.decompress_one(buf)?;
        Ok(())
    }
}

/// Reader over the points of a LAS or LAZ file.
///
/// Ranges are driven from the outside: `seek` to the first point of a
/// range, then `read_point` until it returns `false` or the range is
/// done. For LAZ sources, seeking lands on the containing chunk and
/// decompresses up to the requested point.
pub struct PointReader<'a> {
    header: LasHeader,
    producer: Box<dyn PointProducer + 'a>,
    point: Vec<u8>,
    index: u64,
}

impl<'a> PointReader<'a> {
    pub fn new<R: Read + Seek + Send + Sync + 'a>(mut src: R) -> Result<Self> {
        let header = LasHeader::read_from(&mut src)?;
        src.seek(SeekFrom::Start(u64::from(header.offset_to_points)))?;

        let producer: Box<dyn PointProducer> = if header.is_compressed() {
            let vlr = header.laz_vlr()?;
            Box::new(LasZipDecompressor::new(src, vlr)?)
        } else {
            Box::new(RawPoints {
                src,
                data_start: u64::from(header.offset_to_points),
                point_size: u64::from(header.point_size),
            })
        };

        let point = vec![0u8; header.point_size as usize];
        Ok(Self {
            header,
            producer,
            point,
            index: 0,
        })
    }

    pub fn open(path: &Path) -> Result<PointReader<'static>> {
        PointReader::new(BufReader::new(File::open(path)?))
    }

    pub fn header(&self) -> &LasHeader {
        &self.header
    }

    pub fn num_points(&self) -> u64 {
        self.header.num_points
    }

    /// Position the reader on `index`, so the next `read_point` returns
    /// that point.
    pub fn seek(&mut self, index: u64) -> Result<()> {
        self.producer.seek(index)?;
        self.index = index;
        Ok(())
    }

    /// Reads the next point into the internal buffer. Returns `false`
    /// once all points of the file were read.
    pub fn read_point(&mut self) -> Result<bool> {
        if self.index >= self.header.num_points {
            return Ok(false);
        }
        self.producer.read_into(&mut self.point)?;
        self.index += 1;
        Ok(true)
    }

    /// The record read by the last successful `read_point`.
    pub fn point(&self) -> &[u8] {
        &self.point
    }
}

impl std::fmt::Debug for PointReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointReader")
            .field("num_points", &self.header.num_points)
            .field("index", &self.index)
            .finish()
    }
}
