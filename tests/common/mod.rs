//! Shared helpers for the cohort tests: synthetic LAS inputs, in-process
//! cohorts, and a serial laszip reference writer.

use std::io::{Cursor, Write};
use std::thread;

use byteorder::{LittleEndian, WriteBytesExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use parlaz::chunks::laz_vlr_for;
use parlaz::cohort::LocalCohort;
use parlaz::las::LasHeader;
use parlaz::{Job, Summary};

const HEADER_SIZE: u16 = 227;

fn point_size_for(format: u8) -> u16 {
    match format {
        0 => 20,
        1 => 28,
        2 => 26,
        3 => 34,
        _ => panic!("unsupported point format {}", format),
    }
}

fn write_padded(out: &mut Vec<u8>, text: &str, len: usize) {
    let mut field = vec![0u8; len];
    field[..text.len()].copy_from_slice(text.as_bytes());
    out.extend_from_slice(&field);
}

/// Builds a complete LAS 1.2 file in memory, with `num_points` pseudo
/// random points of the given format, and optionally a user VLR plus a
/// few padding bytes before the point data.
pub fn synthetic_las(num_points: u32, format: u8, with_vlr: bool, seed: u64) -> Vec<u8> {
    let point_size = point_size_for(format);
    let vlr_data: &[u8] = &[0xDE, 0xAD, 0xBE, 0xEF, 0x01];
    let vlr_len: u32 = if with_vlr { 54 + vlr_data.len() as u32 } else { 0 };
    let padding_len: u32 = if with_vlr { 6 } else { 0 };
    let offset_to_points = u32::from(HEADER_SIZE) + vlr_len + padding_len;

    let mut out = Vec::new();
    out.extend_from_slice(b"LASF");
    out.write_u16::<LittleEndian>(0).unwrap(); // file source id
    out.write_u16::<LittleEndian>(0).unwrap(); // global encoding
    out.extend_from_slice(&[0u8; 16]); // project guid
    out.push(1); // version
    out.push(2);
    write_padded(&mut out, "SYNTHETIC", 32);
    write_padded(&mut out, "parlaz test suite", 32);
    out.write_u16::<LittleEndian>(180).unwrap(); // day of year
    out.write_u16::<LittleEndian>(2024).unwrap();
    out.write_u16::<LittleEndian>(HEADER_SIZE).unwrap();
    out.write_u32::<LittleEndian>(offset_to_points).unwrap();
    out.write_u32::<LittleEndian>(u32::from(with_vlr)).unwrap();
    out.push(format);
    out.write_u16::<LittleEndian>(point_size).unwrap();
    out.write_u32::<LittleEndian>(num_points).unwrap();
    out.write_u32::<LittleEndian>(num_points).unwrap(); // returns by number
    for _ in 0..4 {
        out.write_u32::<LittleEndian>(0).unwrap();
    }
    for _ in 0..3 {
        out.write_f64::<LittleEndian>(0.01).unwrap(); // scales
    }
    for _ in 0..3 {
        out.write_f64::<LittleEndian>(0.0).unwrap(); // offsets
    }
    for _ in 0..6 {
        out.write_f64::<LittleEndian>(0.0).unwrap(); // min/max
    }
    assert_eq!(out.len(), HEADER_SIZE as usize);

    if with_vlr {
        out.write_u16::<LittleEndian>(0).unwrap(); // reserved
        write_padded(&mut out, "test_suite", 16);
        out.write_u16::<LittleEndian>(42).unwrap(); // record id
        out.write_u16::<LittleEndian>(vlr_data.len() as u16).unwrap();
        write_padded(&mut out, "not a real record", 32);
        out.extend_from_slice(vlr_data);
        out.extend_from_slice(&[0u8; 6]); // padding before point data
    }
    assert_eq!(out.len(), offset_to_points as usize);

    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..num_points {
        // A coarse random walk; realistic enough for the predictors.
        out.write_i32::<LittleEndian>(rng.gen_range(-100_000..100_000)).unwrap();
        out.write_i32::<LittleEndian>(rng.gen_range(-100_000..100_000)).unwrap();
        out.write_i32::<LittleEndian>(rng.gen_range(-5_000..5_000)).unwrap();
        out.write_u16::<LittleEndian>(rng.gen_range(0..4096)).unwrap(); // intensity
        out.push(rng.gen::<u8>() & 0b0011_1001); // return bits
        out.push(rng.gen_range(0..32)); // classification
        out.push(rng.gen_range(0..180)); // scan angle
        out.push(rng.gen::<u8>()); // user data
        out.write_u16::<LittleEndian>(rng.gen_range(0..8)).unwrap(); // point source
        if format == 1 || format == 3 {
            out.write_f64::<LittleEndian>(rng.gen_range(0.0..604_800.0)).unwrap();
        }
        if format == 2 || format == 3 {
            for _ in 0..3 {
                out.write_u16::<LittleEndian>(rng.gen::<u16>()).unwrap();
            }
        }
    }
    out
}

/// Runs a full cohort of `peers` in-process peers against `job` and
/// returns each peer's result, in rank order.
pub fn run_cohort(peers: usize, job: &Job) -> Vec<parlaz::Result<Summary>> {
    let cohorts = LocalCohort::cohort(peers);
    thread::scope(|scope| {
        let handles: Vec<_> = cohorts
            .into_iter()
            .map(|comm| {
                let job = job.clone();
                scope.spawn(move || parlaz::run_peer(&comm, &job))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("peer thread panicked"))
            .collect()
    })
}

/// Compresses `las_bytes` with the plain serial `laz` compressor, using
/// the same header derivation as the cohort. This is the reference the
/// parallel output must match byte for byte.
pub fn serial_laz(las_bytes: &[u8], chunk_size: u32) -> Vec<u8> {
    let header = LasHeader::read_from(&mut Cursor::new(las_bytes)).unwrap();
    let vlr = laz_vlr_for(
        header.point_format_id(),
        header.num_extra_bytes().unwrap(),
        chunk_size,
    )
    .unwrap();
    let header_bytes = header.compressed_header_bytes(&vlr).unwrap();

    let mut dst = Cursor::new(Vec::new());
    dst.write_all(&header_bytes).unwrap();
    let mut compressor = laz::LasZipCompressor::new(&mut dst, vlr).unwrap();
    let point_size = header.point_size as usize;
    let points_start = header.offset_to_points as usize;
    for index in 0..header.num_points as usize {
        let start = points_start + index * point_size;
        compressor.compress_one(&las_bytes[start..start + point_size]).unwrap();
    }
    compressor.done().unwrap();
    drop(compressor);
    dst.into_inner()
}
