//! Command line front-end and peer launcher.
//!
//! Run as `parlaz -i in.las -o out.laz --peers 4`: the launcher
//! reserves one localhost port per rank, spawns one copy of itself per
//! peer with `PARLAZ_RANK`/`PARLAZ_SIZE`/`PARLAZ_PORTS` set, and folds
//! the children's exit codes. A child finds those variables, joins the
//! TCP mesh and runs the pipeline. With `--peers 1` the conversion runs
//! in-process.

use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::{Command, ExitCode};

use clap::Parser;
use log::{error, LevelFilter};

use parlaz::cohort::{LocalCohort, TcpCohort};
use parlaz::las::LasHeader;
use parlaz::{run_peer, Error, Job, DEFAULT_CHUNK_SIZE};

const RANK_VAR: &str = "PARLAZ_RANK";
const SIZE_VAR: &str = "PARLAZ_SIZE";
const PORTS_VAR: &str = "PARLAZ_PORTS";

#[derive(Debug, Parser)]
#[command(
    name = "parlaz",
    version,
    about = "Compresses LAS to LAZ and back, in parallel across a cohort of peer processes"
)]
struct Cli {
    /// Input file (.las or .laz)
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: PathBuf,

    /// Output file (.laz or .las)
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: PathBuf,

    /// Print per-peer progress and timings
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Number of peer processes
    #[arg(long = "peers", value_name = "P", default_value_t = 1)]
    peers: usize,

    /// Points per compressed chunk
    #[arg(long = "chunk-size", value_name = "N", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u32,

    /// Read from standard input (not available in parallel operation)
    #[arg(long = "stdin")]
    use_stdin: bool,

    /// Write to standard output (not available in parallel operation)
    #[arg(long = "stdout")]
    use_stdout: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match peer_env() {
        Ok(Some(env)) => run_as_peer(&cli, env),
        Ok(None) => run_as_launcher(&cli),
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            eprintln!("parlaz: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let rank = std::env::var(RANK_VAR).ok();
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    builder.format_timestamp(None);
    if let Some(rank) = rank {
        use std::io::Write;
        builder.format(move |buf, record| {
            writeln!(buf, "[peer {}] {}: {}", rank, record.level(), record.args())
        });
    }
    // Tests and nested invocations may have initialized a logger already.
    let _ = builder.try_init();
}

struct PeerEnv {
    rank: usize,
    ports: Vec<u16>,
}

/// A set `PARLAZ_RANK` means the process was spawned as a peer; from
/// there any inconsistency in the rest of the environment is an error,
/// never a reason to fall back to launcher mode (a confused child that
/// relaunched the cohort would spawn children of its own).
fn peer_env() -> Result<Option<PeerEnv>, Error> {
    let rank = match std::env::var(RANK_VAR) {
        Ok(rank) => rank,
        Err(_) => return Ok(None),
    };
    let bad_env = |what: &str| Error::InvalidConfig(format!("bad peer environment: {}", what));

    let rank: usize = rank.parse().map_err(|_| bad_env(RANK_VAR))?;
    let size: usize = std::env::var(SIZE_VAR)
        .map_err(|_| bad_env(SIZE_VAR))?
        .parse()
        .map_err(|_| bad_env(SIZE_VAR))?;
    let ports = std::env::var(PORTS_VAR).map_err(|_| bad_env(PORTS_VAR))?;
    let ports: Vec<u16> = ports
        .split(',')
        .map(|port| port.parse().map_err(|_| bad_env(PORTS_VAR)))
        .collect::<Result<_, Error>>()?;
    if ports.len() != size || rank >= size {
        return Err(bad_env("rank/size/ports disagree"));
    }
    Ok(Some(PeerEnv { rank, ports }))
}

fn validate(cli: &Cli) -> Result<Job, Error> {
    if cli.use_stdin || cli.use_stdout {
        return Err(Error::InvalidConfig(
            "piped input/output is disabled under parallel operation".to_string(),
        ));
    }
    if cli.peers == 0 {
        return Err(Error::InvalidConfig("--peers must be at least 1".to_string()));
    }
    if cli.chunk_size == 0 {
        return Err(Error::InvalidConfig(
            "--chunk-size must be at least 1".to_string(),
        ));
    }
    if cli.input == cli.output {
        return Err(Error::InvalidConfig(
            "input and output file name are identical".to_string(),
        ));
    }
    Ok(Job {
        input: cli.input.clone(),
        output: cli.output.clone(),
        chunk_size: cli.chunk_size,
    })
}

fn run_as_peer(cli: &Cli, env: PeerEnv) -> Result<(), Error> {
    let job = validate(cli)?;
    let comm = TcpCohort::connect(env.rank, &env.ports)?;
    run_peer(&comm, &job)?;
    Ok(())
}

/// The original tool flips the output format when none is given; here the
/// output name is mandatory, so the equivalent guard is to refuse an
/// output extension that contradicts the conversion direction.
fn check_output_extension(job: &Job) -> Result<(), Error> {
    let extension = job
        .output
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    let extension = match extension.as_deref() {
        Some(e @ ("las" | "laz")) => e.to_string(),
        _ => return Ok(()),
    };

    let mut input = std::fs::File::open(&job.input)?;
    let header = LasHeader::read_from(&mut input)?;
    let expected = if header.is_compressed() { "las" } else { "laz" };
    if extension != expected {
        return Err(Error::InvalidConfig(format!(
            "input is {}compressed, the output should be a .{} file",
            if header.is_compressed() { "" } else { "un" },
            expected,
        )));
    }
    Ok(())
}

fn run_as_launcher(cli: &Cli) -> Result<(), Error> {
    let job = validate(cli)?;
    check_output_extension(&job)?;

    if cli.peers == 1 {
        let mut peers = LocalCohort::cohort(1);
        let comm = peers.remove(0);
        run_peer(&comm, &job)?;
        return Ok(());
    }

    let ports = reserve_ports(cli.peers)?;
    let ports_value = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let exe = std::env::current_exe()?;
    let mut children = Vec::with_capacity(cli.peers);
    for rank in 0..cli.peers {
        let mut command = Command::new(&exe);
        command
            .arg("-i")
            .arg(&cli.input)
            .arg("-o")
            .arg(&cli.output)
            .arg("--chunk-size")
            .arg(cli.chunk_size.to_string())
            .env(RANK_VAR, rank.to_string())
            .env(SIZE_VAR, cli.peers.to_string())
            .env(PORTS_VAR, &ports_value);
        if cli.verbose {
            command.arg("-v");
        }
        children.push(command.spawn()?);
    }

    let mut failed = Vec::new();
    for (rank, child) in children.iter_mut().enumerate() {
        let status = child.wait()?;
        if !status.success() {
            failed.push(rank);
        }
    }
    if !failed.is_empty() {
        return Err(Error::PeersFailed { ranks: failed });
    }
    Ok(())
}

/// Reserves one distinct localhost port per rank by binding ephemeral
/// listeners and releasing them just before the peers start. The window
/// between release and rebind is small but real; a clashing service
/// makes the affected peer fail to bind and the job abort.
fn reserve_ports(count: usize) -> Result<Vec<u16>, Error> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind((Ipv4Addr::LOCALHOST, 0)))
        .collect::<std::io::Result<Vec<_>>>()?;
    let ports = listeners
        .iter()
        .map(|listener| Ok(listener.local_addr()?.port()))
        .collect::<std::io::Result<Vec<_>>>()?;
    Ok(ports)
}
