//! Parallel LAS <-> LAZ conversion over a cohort of peers.
//!
//! A cohort of `P` ranked peers (processes over a TCP mesh, or threads
//! over channels) converts one LAS file to LAZ or back cooperatively:
//! each peer owns a chunk-aligned range of the input points, discovers
//! its compressed size with a pass into a counting sink, learns its
//! absolute output offset from a byte-count exchange, then encodes its
//! range straight into the shared output file. The last rank assembles
//! the global chunk table. The output is byte-identical to what a serial
//! laszip writer produces, and each peer's memory use is independent of
//! the input size.
//!
//! The chunked point codec (arithmetic coder, per-point predictors,
//! chunk-table entropy coding) comes from the [`laz`] crate; this crate
//! is the coordination around it.

pub mod chunks;
pub mod cohort;
pub mod errors;
pub mod las;
pub mod pipeline;
pub mod sink;

pub use errors::{Error, Result};
pub use pipeline::{run_peer, Direction, Job, Summary, DEFAULT_CHUNK_SIZE};
