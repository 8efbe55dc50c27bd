//! The message substrate the peers cooperate through.
//!
//! A [`Communicator`] provides ranked, tagged point-to-point byte
//! messages; the collective operations the conversion protocol needs
//! (barrier, broadcast, gather, all-gather) are built on top of them,
//! relayed through a root rank and ordered by rank. Two transports
//! exist: [`LocalCohort`] wires the peers of one process together with
//! channels, [`TcpCohort`] wires one process per peer over a localhost
//! TCP mesh.

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::{Error, Result};

mod local;
mod tcp;

pub use local::LocalCohort;
pub use tcp::TcpCohort;

/// Message tags.
///
/// `CHUNK_BYTES` and `TABLE_POS` are the tags of the placement protocol;
/// the higher values are internal to the collectives.
pub const CHUNK_BYTES: u16 = 2;
pub const TABLE_POS: u16 = 3;
const BARRIER: u16 = 100;
const GATHER: u16 = 101;
const ALL_GATHER: u16 = 102;
const BROADCAST: u16 = 103;

/// A member of a cohort of communicating peers.
///
/// Implementations provide the tagged point-to-point layer; every
/// collective has a default implementation over it. All calls are
/// blocking and every peer of the cohort must issue the same sequence of
/// collectives, in the same order.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sends `payload` to `to`. Sending to oneself is a protocol error.
    fn send_bytes(&self, to: usize, tag: u16, payload: &[u8]) -> Result<()>;

    /// Receives the next message from `from`, which must carry `tag`.
    fn recv_bytes(&self, from: usize, tag: u16) -> Result<Vec<u8>>;

    fn send_u64(&self, to: usize, tag: u16, value: u64) -> Result<()> {
        self.send_bytes(to, tag, &value.to_le_bytes())
    }

    fn recv_u64(&self, from: usize, tag: u16) -> Result<u64> {
        let payload = self.recv_bytes(from, tag)?;
        decode_u64(from, &payload)
    }

    fn send_u32(&self, to: usize, tag: u16, value: u32) -> Result<()> {
        self.send_bytes(to, tag, &value.to_le_bytes())
    }

    fn recv_u32(&self, from: usize, tag: u16) -> Result<u32> {
        let payload = self.recv_bytes(from, tag)?;
        if payload.len() != 4 {
            return Err(Error::MalformedMessage {
                from,
                expected: 4,
                got: payload.len(),
            });
        }
        Ok(LittleEndian::read_u32(&payload))
    }

    fn send_u32_slice(&self, to: usize, tag: u16, values: &[u32]) -> Result<()> {
        let mut payload = vec![0u8; values.len() * 4];
        LittleEndian::write_u32_into(values, &mut payload);
        self.send_bytes(to, tag, &payload)
    }

    fn recv_u32_vec(&self, from: usize, tag: u16) -> Result<Vec<u32>> {
        let payload = self.recv_bytes(from, tag)?;
        if payload.len() % 4 != 0 {
            return Err(Error::MalformedMessage {
                from,
                expected: payload.len() / 4 * 4,
                got: payload.len(),
            });
        }
        let mut values = vec![0u32; payload.len() / 4];
        LittleEndian::read_u32_into(&payload, &mut values);
        Ok(values)
    }

    /// Blocks until every peer of the cohort reached this call.
    fn barrier(&self) -> Result<()> {
        if self.size() == 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for peer in 1..self.size() {
                self.recv_bytes(peer, BARRIER)?;
            }
            for peer in 1..self.size() {
                self.send_bytes(peer, BARRIER, &[])?;
            }
        } else {
            self.send_bytes(0, BARRIER, &[])?;
            self.recv_bytes(0, BARRIER)?;
        }
        Ok(())
    }

    /// Collects one value per peer on `root`, in rank order. Returns
    /// `Some` on the root, `None` everywhere else.
    fn gather_u32(&self, root: usize, value: u32) -> Result<Option<Vec<u32>>> {
        if self.rank() == root {
            let mut values = Vec::with_capacity(self.size());
            for peer in 0..self.size() {
                if peer == root {
                    values.push(value);
                } else {
                    values.push(self.recv_u32(peer, GATHER)?);
                }
            }
            Ok(Some(values))
        } else {
            self.send_u32(root, GATHER, value)?;
            Ok(None)
        }
    }

    fn gather_u64(&self, root: usize, value: u64) -> Result<Option<Vec<u64>>> {
        if self.rank() == root {
            let mut values = Vec::with_capacity(self.size());
            for peer in 0..self.size() {
                if peer == root {
                    values.push(value);
                } else {
                    values.push(self.recv_u64(peer, GATHER)?);
                }
            }
            Ok(Some(values))
        } else {
            self.send_u64(root, GATHER, value)?;
            Ok(None)
        }
    }

    /// Distributes `value` as seen by `root` to every peer.
    fn broadcast_u64(&self, root: usize, value: u64) -> Result<u64> {
        if self.rank() == root {
            for peer in 0..self.size() {
                if peer != root {
                    self.send_u64(peer, BROADCAST, value)?;
                }
            }
            Ok(value)
        } else {
            self.recv_u64(root, BROADCAST)
        }
    }

    /// Collects one value per peer, in rank order, visible on every peer.
    /// Gathers on rank 0 and fans the vector back out.
    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>> {
        match self.gather_u64(0, value)? {
            Some(values) => {
                let mut payload = vec![0u8; values.len() * 8];
                LittleEndian::write_u64_into(&values, &mut payload);
                for peer in 1..self.size() {
                    self.send_bytes(peer, ALL_GATHER, &payload)?;
                }
                Ok(values)
            }
            None => {
                let payload = self.recv_bytes(0, ALL_GATHER)?;
                if payload.len() != self.size() * 8 {
                    return Err(Error::MalformedMessage {
                        from: 0,
                        expected: self.size() * 8,
                        got: payload.len(),
                    });
                }
                let mut values = vec![0u64; self.size()];
                LittleEndian::read_u64_into(&payload, &mut values);
                Ok(values)
            }
        }
    }
}

fn decode_u64(from: usize, payload: &[u8]) -> Result<u64> {
    if payload.len() != 8 {
        return Err(Error::MalformedMessage {
            from,
            expected: 8,
            got: payload.len(),
        });
    }
    Ok(LittleEndian::read_u64(payload))
}
