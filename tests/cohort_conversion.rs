//! End-to-end cohort conversions over in-process peers, checked against
//! the serial `laz` compressor and against round-trip identity.

use std::io::{Cursor, Seek, SeekFrom};

use laz::laszip::ChunkTable;

use parlaz::las::{LasHeader, PointReader};
use parlaz::{Direction, Error, Job};

mod common;
use common::{run_cohort, serial_laz, synthetic_las};

fn write_input(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn job(dir: &tempfile::TempDir, input: &std::path::Path, output: &str, chunk_size: u32) -> Job {
    Job {
        input: input.to_path_buf(),
        output: dir.path().join(output),
        chunk_size,
    }
}

/// Every point of `laz_bytes`, decompressed, must equal the points of
/// `las_bytes`.
fn assert_decodes_to(laz_bytes: &[u8], las_bytes: &[u8]) {
    let mut laz_reader = PointReader::new(Cursor::new(laz_bytes.to_vec())).unwrap();
    let mut las_reader = PointReader::new(Cursor::new(las_bytes.to_vec())).unwrap();
    assert_eq!(laz_reader.num_points(), las_reader.num_points());
    for index in 0..las_reader.num_points() {
        assert!(laz_reader.read_point().unwrap());
        assert!(las_reader.read_point().unwrap());
        assert_eq!(laz_reader.point(), las_reader.point(), "point {}", index);
    }
}

#[test]
fn test_single_peer_matches_serial_compressor() {
    let dir = tempfile::tempdir().unwrap();
    let las = synthetic_las(7_500, 1, false, 1);
    let input = write_input(&dir, "input.las", &las);

    let job = job(&dir, &input, "output.laz", 1_000);
    let results = run_cohort(1, &job);
    assert_eq!(results.len(), 1);
    let summary = results.into_iter().next().unwrap().unwrap();
    assert_eq!(summary.direction, Direction::LasToLaz);
    assert_eq!(summary.points, 7_500);
    assert_eq!(summary.chunks, 8); // 7 full chunks and a 500-point tail

    let produced = std::fs::read(&job.output).unwrap();
    assert_eq!(produced, serial_laz(&las, 1_000));
}

#[test]
fn test_cohort_output_is_byte_identical_to_serial() {
    let dir = tempfile::tempdir().unwrap();
    let las = synthetic_las(7_500, 1, false, 2);
    let input = write_input(&dir, "input.las", &las);
    let reference = serial_laz(&las, 1_000);

    for peers in [2, 3, 4] {
        let job = job(&dir, &input, &format!("output_{}.laz", peers), 1_000);
        let results = run_cohort(peers, &job);
        let summaries: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(summaries.iter().map(|s| s.points).sum::<u64>(), 7_500);

        let produced = std::fs::read(&job.output).unwrap();
        assert_eq!(produced, reference, "with {} peers", peers);
    }
}

#[test]
fn test_chunk_distribution_with_trailing_points() {
    // 3001 points in chunks of 1000: one chunk per peer, the last peer
    // also carries the single trailing point as a fourth chunk.
    let dir = tempfile::tempdir().unwrap();
    let las = synthetic_las(3_001, 0, false, 3);
    let input = write_input(&dir, "input.las", &las);

    let job = job(&dir, &input, "output.laz", 1_000);
    let summaries: Vec<_> = run_cohort(3, &job).into_iter().map(Result::unwrap).collect();
    assert_eq!(
        summaries.iter().map(|s| s.points).collect::<Vec<_>>(),
        vec![1_000, 1_000, 1_001]
    );
    assert_eq!(
        summaries.iter().map(|s| s.chunks).collect::<Vec<_>>(),
        vec![1, 1, 2]
    );

    let produced = std::fs::read(&job.output).unwrap();
    assert_eq!(produced, serial_laz(&las, 1_000));
    assert_decodes_to(&produced, &las);

    // The chunk table must list all four chunks.
    let header = LasHeader::read_from(&mut Cursor::new(produced.clone())).unwrap();
    let vlr = header.laz_vlr().unwrap();
    let mut src = Cursor::new(produced);
    src.seek(SeekFrom::Start(u64::from(header.offset_to_points))).unwrap();
    let table = ChunkTable::read_from(&mut src, &vlr).unwrap();
    assert_eq!(table.as_ref().len(), 4);
}

#[test]
fn test_chunks_are_dealt_to_low_ranks_first() {
    // 5 chunks over 3 peers: 2, 2, 1.
    let dir = tempfile::tempdir().unwrap();
    let las = synthetic_las(5_000, 0, false, 4);
    let input = write_input(&dir, "input.las", &las);

    let job = job(&dir, &input, "output.laz", 1_000);
    let summaries: Vec<_> = run_cohort(3, &job).into_iter().map(Result::unwrap).collect();
    assert_eq!(
        summaries.iter().map(|s| s.points).collect::<Vec<_>>(),
        vec![2_000, 2_000, 1_000]
    );
    assert_eq!(
        summaries.iter().map(|s| s.chunks).collect::<Vec<_>>(),
        vec![2, 2, 1]
    );
}

#[test]
fn test_fewer_chunks_than_peers_aborts_every_peer() {
    let dir = tempfile::tempdir().unwrap();
    let las = synthetic_las(2_000, 0, false, 5);
    let input = write_input(&dir, "input.las", &las);

    let job = job(&dir, &input, "output.laz", 1_000);
    for result in run_cohort(3, &job) {
        assert!(matches!(
            result,
            Err(Error::InsufficientChunks { chunks: 2, peers: 3 })
        ));
    }
}

#[test]
fn test_round_trip_reproduces_the_source_bytes() {
    let dir = tempfile::tempdir().unwrap();
    // A VLR and padding ride along to prove the container is preserved.
    let las = synthetic_las(4_200, 3, true, 6);
    let input = write_input(&dir, "input.las", &las);

    let compress = job(&dir, &input, "roundtrip.laz", 1_000);
    for result in run_cohort(3, &compress) {
        result.unwrap();
    }

    let decompress = job(&dir, &compress.output, "roundtrip.las", 1_000);
    let summaries: Vec<_> = run_cohort(3, &decompress)
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert!(summaries.iter().all(|s| s.direction == Direction::LazToLas));
    assert_eq!(summaries.iter().map(|s| s.points).sum::<u64>(), 4_200);

    let round_tripped = std::fs::read(&decompress.output).unwrap();
    assert_eq!(round_tripped, las);
}

#[test]
fn test_decompression_splits_points_evenly() {
    let dir = tempfile::tempdir().unwrap();
    let las = synthetic_las(1_201, 2, false, 7);
    let input = write_input(&dir, "input.las", &las);

    let compress = job(&dir, &input, "even.laz", 500);
    for result in run_cohort(2, &compress) {
        result.unwrap();
    }

    // Peers of the LAZ -> LAS direction start mid-chunk; the reader's
    // seek has to resynchronize the decompressor.
    let decompress = job(&dir, &compress.output, "even.las", 500);
    let summaries: Vec<_> = run_cohort(3, &decompress)
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(
        summaries.iter().map(|s| s.points).collect::<Vec<_>>(),
        vec![400, 400, 401]
    );
    assert_eq!(std::fs::read(&decompress.output).unwrap(), las);
}
