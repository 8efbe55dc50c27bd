//! Cohort of OS processes over a localhost TCP mesh.
//!
//! Every peer listens on its own port; peers dial every lower rank and
//! accept a connection from every higher rank, so each pair of peers
//! shares exactly one full-duplex stream. The dialer identifies itself
//! with a single rank word. Messages are tagged, length-prefixed frames.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::{Error, Result};

use super::Communicator;

/// How long a peer keeps dialing a lower rank that has not bound its
/// listener yet.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Frames larger than this are treated as stream corruption.
const MAX_FRAME_LEN: u32 = 1 << 30;

pub struct TcpCohort {
    rank: usize,
    // One stream per peer, None at our own rank.
    links: Vec<Option<Mutex<TcpStream>>>,
}

impl TcpCohort {
    /// Connects this peer into a cohort of `ports.len()` peers, where
    /// `ports[r]` is the port rank `r` listens on.
    pub fn connect(rank: usize, ports: &[u16]) -> Result<Self> {
        let size = ports.len();
        let mut links: Vec<Option<Mutex<TcpStream>>> = (0..size).map(|_| None).collect();
        if size == 1 {
            return Ok(Self { rank, links });
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, ports[rank]))
            .map_err(|source| Error::PeerLost { peer: rank, source })?;

        for peer in 0..rank {
            let mut stream = dial((Ipv4Addr::LOCALHOST, ports[peer]).into(), peer)?;
            // Identify ourselves so the acceptor can place this stream.
            stream
                .write_all(&(rank as u32).to_le_bytes())
                .map_err(|source| Error::PeerLost { peer, source })?;
            links[peer] = Some(Mutex::new(stream));
        }
        for _ in rank + 1..size {
            let (mut stream, _) = listener
                .accept()
                .map_err(|source| Error::PeerLost { peer: rank, source })?;
            let mut word = [0u8; 4];
            stream
                .read_exact(&mut word)
                .map_err(|source| Error::PeerLost { peer: rank, source })?;
            let peer = u32::from_le_bytes(word) as usize;
            if peer <= rank || peer >= size {
                return Err(Error::InvalidPeer { peer, size });
            }
            stream.set_nodelay(true).ok();
            links[peer] = Some(Mutex::new(stream));
        }

        Ok(Self { rank, links })
    }

    fn link(&self, peer: usize) -> Result<&Mutex<TcpStream>> {
        self.links
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidPeer {
                peer,
                size: self.links.len(),
            })
    }
}

fn dial(addr: SocketAddr, peer: usize) -> Result<TcpStream> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(source) => {
                if Instant::now() >= deadline {
                    return Err(Error::PeerLost { peer, source });
                }
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
}

fn lock(link: &Mutex<TcpStream>) -> std::sync::MutexGuard<'_, TcpStream> {
    // A peer is single-threaded; a poisoned lock can only come from a
    // previous failure that is already fatal.
    match link.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Communicator for TcpCohort {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.links.len()
    }

    fn send_bytes(&self, to: usize, tag: u16, payload: &[u8]) -> Result<()> {
        let link = self.link(to)?;
        let mut stream = lock(link);
        let mut frame = Vec::with_capacity(6 + payload.len());
        frame.extend_from_slice(&tag.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        stream
            .write_all(&frame)
            .map_err(|source| Error::PeerLost { peer: to, source })
    }

    fn recv_bytes(&self, from: usize, tag: u16) -> Result<Vec<u8>> {
        let link = self.link(from)?;
        let mut stream = lock(link);

        let mut header = [0u8; 6];
        stream
            .read_exact(&mut header)
            .map_err(|source| Error::PeerLost { peer: from, source })?;
        let got = u16::from_le_bytes([header[0], header[1]]);
        let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
        if len > MAX_FRAME_LEN {
            return Err(Error::MalformedMessage {
                from,
                expected: MAX_FRAME_LEN as usize,
                got: len as usize,
            });
        }
        let mut payload = vec![0u8; len as usize];
        stream
            .read_exact(&mut payload)
            .map_err(|source| Error::PeerLost { peer: from, source })?;
        if got != tag {
            return Err(Error::UnexpectedMessage {
                from,
                expected: tag,
                got,
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    fn free_ports(n: usize) -> Vec<u16> {
        // Bind ephemeral listeners to reserve distinct ports, then free
        // them for the cohort to rebind.
        let listeners: Vec<TcpListener> = (0..n)
            .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap())
            .collect();
        listeners
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    #[test]
    fn test_tcp_mesh_collectives() {
        let ports = free_ports(3);
        thread::scope(|scope| {
            for rank in 0..3 {
                let ports = ports.clone();
                scope.spawn(move || {
                    let comm = TcpCohort::connect(rank, &ports).unwrap();
                    comm.barrier().unwrap();
                    let values = comm.all_gather_u64(rank as u64 + 1).unwrap();
                    assert_eq!(values, vec![1, 2, 3]);
                    let gathered = comm.gather_u32(2, rank as u32).unwrap();
                    if rank == 2 {
                        assert_eq!(gathered, Some(vec![0, 1, 2]));
                    }
                    comm.barrier().unwrap();
                });
            }
        });
    }
}
