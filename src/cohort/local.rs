//! In-process cohort over channels, one thread per peer.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::errors::{Error, Result};

use super::Communicator;

type Message = (u16, Vec<u8>);

/// One peer of an in-process cohort.
///
/// [`LocalCohort::cohort`] builds the whole mesh at once; each handle is
/// then moved to its own thread. Used by the tests and by single-peer
/// runs, where spawning processes would be pure overhead.
pub struct LocalCohort {
    rank: usize,
    // Indexed by destination/origin rank; the slot of our own rank is None.
    senders: Vec<Option<Sender<Message>>>,
    receivers: Vec<Option<Receiver<Message>>>,
}

impl LocalCohort {
    /// Creates the `size` connected peers of a cohort, in rank order.
    pub fn cohort(size: usize) -> Vec<LocalCohort> {
        let mut senders: Vec<Vec<Option<Sender<Message>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Receiver<Message>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();

        for from in 0..size {
            for to in 0..size {
                if from == to {
                    continue;
                }
                let (tx, rx) = unbounded();
                senders[from][to] = Some(tx);
                receivers[to][from] = Some(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| LocalCohort {
                rank,
                senders,
                receivers,
            })
            .collect()
    }

    fn peer_slot<'a, T>(&self, slots: &'a [Option<T>], peer: usize) -> Result<&'a T> {
        slots
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidPeer {
                peer,
                size: self.senders.len(),
            })
    }
}

impl Communicator for LocalCohort {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send_bytes(&self, to: usize, tag: u16, payload: &[u8]) -> Result<()> {
        let sender = self.peer_slot(&self.senders, to)?;
        sender
            .send((tag, payload.to_vec()))
            .map_err(|_| Error::PeerLost {
                peer: to,
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer hung up"),
            })
    }

    fn recv_bytes(&self, from: usize, tag: u16) -> Result<Vec<u8>> {
        let receiver = self.peer_slot(&self.receivers, from)?;
        let (got, payload) = receiver.recv().map_err(|_| Error::PeerLost {
            peer: from,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer hung up"),
        })?;
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
