//! The LAS/LAZ container side of the converter: header and VLR parsing
//! and a seekable point reader over both kinds of sources.

pub mod header;
pub mod reader;

pub use header::LasHeader;
pub use reader::PointReader;
