//! The byte sink backing the sizing pass.

use std::io::{Seek, SeekFrom, Write};

/// A `Write + Seek` sink that discards everything written to it while
/// keeping track of the stream position.
///
/// The sizing pass binds the chunked writer to one of these, so the
/// compressed size of a point range is discovered without touching the
/// output file.
#[derive(Debug, Default)]
pub struct CountingSink {
    position: u64,
    len: u64,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stream position, the `tell` of this sink.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Highest position ever written to.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.position += buf.len() as u64;
        self.len = self.len.max(self.position);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for CountingSink {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
        };
        match target {
            Some(p) => {
                self.position = p;
                Ok(p)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before byte 0",
            )),
        }
    }
}
