use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors of a conversion job.
///
/// Every variant is fatal to the whole cohort: a peer that hits one
/// reports it and exits, and the peers blocked on it fail with a
/// transport error of their own.
#[derive(Debug, Error)]
pub enum Error {
    /// The input has fewer whole chunks than there are peers, so no
    /// chunk-aligned partition exists.
    #[error("cannot split {chunks} chunks between {peers} peers")]
    InsufficientChunks { chunks: u64, peers: usize },

    /// Peers do not see the same input file.
    #[error("peer {rank} counts {local} input points but peer {peer} counts {remote}")]
    PartitionMismatch {
        rank: usize,
        local: u64,
        peer: usize,
        remote: u64,
    },

    /// The final pass emitted a different number of bytes than the
    /// sizing pass measured, meaning the encoder is not deterministic.
    #[error("peer {rank} wrote {written} bytes where the sizing pass measured {sized}")]
    SizingMismatch { rank: usize, sized: u64, written: u64 },

    /// Like [`Error::SizingMismatch`], but detected on an individual chunk.
    #[error("peer {rank} chunk {chunk}: wrote {written} bytes where the sizing pass measured {sized}")]
    ChunkSizeMismatch {
        rank: usize,
        chunk: usize,
        sized: u32,
        written: u32,
    },

    /// The chunk table position sent by rank 0 disagrees with the one the
    /// designated writer derived from the exchanged byte counts.
    #[error("chunk table position mismatch: rank 0 sent {received}, local value is {computed}")]
    TablePositionMismatch { received: u64, computed: u64 },

    /// The header length broadcast by rank 0 disagrees with the locally
    /// derived one.
    #[error("peer {rank} derived a header of {computed} bytes but rank 0 wrote {broadcast}")]
    HeaderMismatch {
        rank: usize,
        broadcast: u64,
        computed: u64,
    },

    /// A peer of the cohort went away or never came up.
    #[error("lost contact with peer {peer}: {source}")]
    PeerLost {
        peer: usize,
        #[source]
        source: io::Error,
    },

    /// A message carried a different tag than the protocol step expected.
    #[error("peer {from} sent a message with tag {got} where tag {expected} was expected")]
    UnexpectedMessage { from: usize, expected: u16, got: u16 },

    /// A message payload does not have the length its type requires.
    #[error("peer {from} sent a {got}-byte payload where {expected} bytes were expected")]
    MalformedMessage {
        from: usize,
        expected: usize,
        got: usize,
    },

    /// A send/recv was addressed to a rank outside the cohort.
    #[error("peer {peer} is not a member of this cohort of {size}")]
    InvalidPeer { peer: usize, size: usize },

    /// The input does not start with the LASF signature.
    #[error("input file is not a LAS/LAZ file")]
    NotALasFile,

    #[error("LAS version {major}.{minor} is not supported, only 1.0, 1.1 and 1.2 are")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("point format {0} is not supported")]
    UnsupportedPointFormat(u8),

    /// The input claims to be compressed but carries no laszip VLR.
    #[error("input has no laszip VLR")]
    MissingLaszipVlr,

    /// The reader ran out of points before the end of the peer's range.
    #[error("input ended at point {index} before the end of the assigned range")]
    TruncatedPointData { index: u64 },

    /// One or more child peers exited non-zero; the launcher relays it.
    #[error("peers {ranks:?} exited with an error")]
    PeersFailed { ranks: Vec<usize> },

    #[error("{0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Laz(#[from] laz::LasZipError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
