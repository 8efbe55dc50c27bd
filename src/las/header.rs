//! Byte-preserving LAS header and VLR handling.
//!
//! The header is kept as raw bytes next to the parsed fields, and the
//! compressed/uncompressed output headers are derived by patching only the
//! fields that actually differ between a LAS and a LAZ container (the
//! point-format compression bit, the VLR count and the offset to point
//! data). Everything else round-trips untouched, which is what makes a
//! LAS -> LAZ -> LAS conversion reproduce the source bytes exactly.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use laz::LazVlr;

use crate::errors::{Error, Result};

const SIGNATURE: &[u8; 4] = b"LASF";

/// Minimum size of a LAS 1.0/1.1/1.2 header.
const HEADER_SIZE: usize = 227;

/// Size of the fixed part of a variable length record.
pub const VLR_HEADER_SIZE: usize = 54;

/// Bit 7 of the point format id marks the point data as laszip-compressed.
const COMPRESSED_FORMAT_MASK: u8 = 0x80;

// Field offsets inside the raw header.
const VERSION_OFFSET: usize = 24;
const HEADER_SIZE_OFFSET: usize = 94;
const OFFSET_TO_POINTS_OFFSET: usize = 96;
const NUM_VLRS_OFFSET: usize = 100;
const POINT_FORMAT_OFFSET: usize = 104;
const POINT_SIZE_OFFSET: usize = 105;
const NUM_POINTS_OFFSET: usize = 107;

pub fn is_point_format_compressed(point_format: u8) -> bool {
    point_format & COMPRESSED_FORMAT_MASK == COMPRESSED_FORMAT_MASK
}

/// A variable length record, kept as the raw bytes read from the file.
#[derive(Debug, Clone)]
pub struct RawVlr {
    header: [u8; VLR_HEADER_SIZE],
    pub data: Vec<u8>,
}

impl RawVlr {
    fn read_from<R: Read>(src: &mut R) -> Result<Self> {
        let mut header = [0u8; VLR_HEADER_SIZE];
        src.read_exact(&mut header)?;
        let record_length = LittleEndian::read_u16(&header[20..22]);
        let mut data = vec![0u8; record_length as usize];
        src.read_exact(&mut data)?;
        Ok(Self { header, data })
    }

    pub fn user_id(&self) -> &[u8] {
        &self.header[2..18]
    }

    pub fn record_id(&self) -> u16 {
        LittleEndian::read_u16(&self.header[18..20])
    }

    /// Is this the laszip descriptor record?
    pub fn is_laszip(&self) -> bool {
        self.record_id() == LazVlr::RECORD_ID
            && String::from_utf8_lossy(self.user_id()).trim_end_matches('\0') == LazVlr::USER_ID
    }

    /// Full on-disk length, record header included.
    pub fn total_len(&self) -> usize {
        VLR_HEADER_SIZE + self.data.len()
    }

    fn append_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.data);
    }
}

/// Builds the on-disk laszip VLR (record header + record data) for `vlr`.
fn laszip_vlr_bytes(vlr: &LazVlr) -> Result<Vec<u8>> {
    let mut record_data = Vec::new();
    vlr.write_to(&mut record_data)?;

    let mut out = Vec::with_capacity(VLR_HEADER_SIZE + record_data.len());
    out.extend_from_slice(&0u16.to_le_bytes()); // reserved
    let mut user_id = [0u8; 16];
    user_id[..LazVlr::USER_ID.len()].copy_from_slice(LazVlr::USER_ID.as_bytes());
    out.extend_from_slice(&user_id);
    out.extend_from_slice(&LazVlr::RECORD_ID.to_le_bytes());
    out.extend_from_slice(&(record_data.len() as u16).to_le_bytes());
    let mut description = [0u8; 32];
    description[..LazVlr::DESCRIPTION.len()].copy_from_slice(LazVlr::DESCRIPTION.as_bytes());
    out.extend_from_slice(&description);
    out.extend_from_slice(&record_data);
    Ok(out)
}

/// A LAS 1.0/1.1/1.2 header together with its VLRs and the padding bytes
/// sitting between the last VLR and the start of point data.
#[derive(Debug, Clone)]
pub struct LasHeader {
    raw: Vec<u8>,
    pub vlrs: Vec<RawVlr>,
    pub padding: Vec<u8>,

    pub version_major: u8,
    pub version_minor: u8,
    /// Raw format byte, compression bit included.
    pub point_format: u8,
    pub point_size: u16,
    pub num_points: u64,
    pub offset_to_points: u32,
}

impl LasHeader {
    pub fn read_from<R: Read + Seek>(src: &mut R) -> Result<Self> {
        src.seek(SeekFrom::Start(0))?;
        let mut signature = [0u8; 4];
        src.read_exact(&mut signature)?;
        if &signature != SIGNATURE {
            return Err(Error::NotALasFile);
        }

        src.seek(SeekFrom::Start(HEADER_SIZE_OFFSET as u64))?;
        let mut header_size = [0u8; 2];
        src.read_exact(&mut header_size)?;
        let header_size = u16::from_le_bytes(header_size) as usize;
        if header_size < HEADER_SIZE {
            return Err(Error::NotALasFile);
        }

        src.seek(SeekFrom::Start(0))?;
        let mut raw = vec![0u8; header_size];
        src.read_exact(&mut raw)?;

        let version_major = raw[VERSION_OFFSET];
        let version_minor = raw[VERSION_OFFSET + 1];
        if version_major != 1 || version_minor > 2 {
            return Err(Error::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }

        let offset_to_points = LittleEndian::read_u32(&raw[OFFSET_TO_POINTS_OFFSET..]);
        let num_vlrs = LittleEndian::read_u32(&raw[NUM_VLRS_OFFSET..]);
        let point_format = raw[POINT_FORMAT_OFFSET];
        let point_size = LittleEndian::read_u16(&raw[POINT_SIZE_OFFSET..]);
        let num_points = u64::from(LittleEndian::read_u32(&raw[NUM_POINTS_OFFSET..]));

        let mut vlrs = Vec::with_capacity(num_vlrs as usize);
        let mut position = header_size;
        for _ in 0..num_vlrs {
            let vlr = RawVlr::read_from(src)?;
            position += vlr.total_len();
            vlrs.push(vlr);
        }
        if position > offset_to_points as usize {
            return Err(Error::NotALasFile);
        }
        let mut padding = vec![0u8; offset_to_points as usize - position];
        src.read_exact(&mut padding)?;

        Ok(Self {
            raw,
            vlrs,
            padding,
            version_major,
            version_minor,
            point_format,
            point_size,
            num_points,
            offset_to_points,
        })
    }

    /// The format id with the compression bit stripped.
    pub fn point_format_id(&self) -> u8 {
        self.point_format & 0x3f
    }

    pub fn laszip_vlr(&self) -> Option<&RawVlr> {
        self.vlrs.iter().find(|vlr| vlr.is_laszip())
    }

    /// Whether the point data is laszip-compressed; the descriptor VLR is
    /// the authority, as readers of truncated files rely on it too.
    pub fn is_compressed(&self) -> bool {
        self.laszip_vlr().is_some() || is_point_format_compressed(self.point_format)
    }

    /// Parses the laszip descriptor carried by this header.
    pub fn laz_vlr(&self) -> Result<LazVlr> {
        let vlr = self.laszip_vlr().ok_or(Error::MissingLaszipVlr)?;
        Ok(LazVlr::from_buffer(&vlr.data)?)
    }

    /// Number of extra bytes appended to each point record beyond the
    /// format's standard layout.
    pub fn num_extra_bytes(&self) -> Result<u16> {
        let base: u16 = match self.point_format_id() {
            0 => 20,
            1 => 28,
            2 => 26,
            3 => 34,
            other => return Err(Error::UnsupportedPointFormat(other)),
        };
        if self.point_size < base {
            return Err(Error::UnsupportedPointFormat(self.point_format_id()));
        }
        Ok(self.point_size - base)
    }

    /// Derives the LAZ output header prefix: the patched header, the
    /// original VLRs, the laszip descriptor and the original padding.
    ///
    /// Identical on every peer, as it only depends on the shared input
    /// header and the writer configuration.
    pub fn compressed_header_bytes(&self, vlr: &LazVlr) -> Result<Vec<u8>> {
        let laszip_vlr = laszip_vlr_bytes(vlr)?;

        let mut raw = self.raw.clone();
        raw[POINT_FORMAT_OFFSET] |= COMPRESSED_FORMAT_MASK;
        let num_vlrs = LittleEndian::read_u32(&raw[NUM_VLRS_OFFSET..]);
        LittleEndian::write_u32(&mut raw[NUM_VLRS_OFFSET..NUM_VLRS_OFFSET + 4], num_vlrs + 1);
        LittleEndian::write_u32(
            &mut raw[OFFSET_TO_POINTS_OFFSET..OFFSET_TO_POINTS_OFFSET + 4],
            self.offset_to_points + laszip_vlr.len() as u32,
        );

        let mut out = raw;
        for vlr in &self.vlrs {
            vlr.append_to(&mut out);
        }
        out.extend_from_slice(&laszip_vlr);
        out.extend_from_slice(&self.padding);
        Ok(out)
    }

    /// Derives the LAS output header prefix by dropping the laszip
    /// descriptor and clearing the compression bit.
    pub fn uncompressed_header_bytes(&self) -> Result<Vec<u8>> {
        let laszip_len = self
            .laszip_vlr()
            .ok_or(Error::MissingLaszipVlr)?
            .total_len();

        let mut raw = self.raw.clone();
        raw[POINT_FORMAT_OFFSET] &= 0x3f;
        let num_vlrs = LittleEndian::read_u32(&raw[NUM_VLRS_OFFSET..]);
        LittleEndian::write_u32(&mut raw[NUM_VLRS_OFFSET..NUM_VLRS_OFFSET + 4], num_vlrs - 1);
        LittleEndian::write_u32(
            &mut raw[OFFSET_TO_POINTS_OFFSET..OFFSET_TO_POINTS_OFFSET + 4],
            self.offset_to_points - laszip_len as u32,
        );

        let mut out = raw;
        for vlr in self.vlrs.iter().filter(|vlr| !vlr.is_laszip()) {
            vlr.append_to(&mut out);
        }
        out.extend_from_slice(&self.padding);
        Ok(out)
    }
}
