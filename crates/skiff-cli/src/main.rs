//! skiff command-line interface

mod link;
mod progress;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::RecvTimeoutError;
use link::{LinkStats, lossy_link, pump};
use progress::{Position, TrackedReader, TrackedWriter, TransferProgress, format_bytes, format_duration};
use skiff_core::{
    Client, Config, Error, ProtocolVersion, Status, TransferOptions, TransferService, TransferThread, shared,
};
use skiff_files::{FileHandler, FileReader, FileWriter, hash_file};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often the progress display refreshes while a transfer runs
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "skiff")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer a file between an in-process client and server over a lossy link
    Simulate {
        /// File to transfer
        source: PathBuf,

        /// Where the received copy is stored
        #[arg(short, long)]
        output: PathBuf,

        /// Whether the client reads the file from the server or writes it
        #[arg(short, long, value_enum, default_value_t = Direction::Read)]
        direction: Direction,

        /// Probability that a chunk is lost, in each direction
        #[arg(short, long, default_value_t = 0.0)]
        loss: f64,

        /// Seed of the loss pattern (random when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Speak the legacy protocol
        #[arg(long)]
        legacy: bool,

        /// Resource id the server serves the file under
        #[arg(long, default_value_t = 1)]
        resource: u32,

        /// Keep this many bytes of an existing output and resume after them
        #[arg(long, default_value_t = 0)]
        resume_from: u64,
    },

    /// Print the default configuration
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Direction {
    /// The client reads the resource (server transmits)
    Read,
    /// The client writes the resource (server receives)
    Write,
}

/// Options of one simulated transfer
struct Simulation {
    source: PathBuf,
    output: PathBuf,
    direction: Direction,
    loss: f64,
    seed: u64,
    legacy: bool,
    resource: u32,
    resume_from: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.validate()?;

    match cli.command {
        Commands::Simulate {
            source,
            output,
            direction,
            loss,
            seed,
            legacy,
            resource,
            resume_from,
        } => simulate(
            &config,
            Simulation {
                source,
                output,
                direction,
                loss,
                seed: seed.unwrap_or_else(rand::random),
                legacy,
                resource,
                resume_from,
            },
        ),
        Commands::Config => {
            print!("{}", Config::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn simulate(config: &Config, sim: Simulation) -> anyhow::Result<()> {
    if !(0.0..1.0).contains(&sim.loss) {
        bail!("loss must be in [0, 1), got {}", sim.loss);
    }
    if sim.legacy && sim.resume_from != 0 {
        bail!("resuming requires the current protocol version");
    }

    let size = std::fs::metadata(&sim.source)
        .with_context(|| format!("reading {}", sim.source.display()))?
        .len();
    if sim.resume_from > size {
        bail!("cannot resume at {} of a {} byte file", sim.resume_from, size);
    }

    let mut transfer = config.transfer;
    if sim.legacy {
        transfer.protocol_version = ProtocolVersion::Legacy;
    }

    tracing::info!(
        "Simulating {:?} of {} ({}) with {:.1}% loss, seed {}",
        sim.direction,
        sim.source.display(),
        format_bytes(size),
        sim.loss * 100.0,
        sim.seed
    );

    let client_thread = Arc::new(TransferThread::spawn(config.thread)?);
    let server_thread = Arc::new(TransferThread::spawn(config.thread)?);
    let _guard = ThreadGuard(vec![client_thread.clone(), server_thread.clone()]);
    let client = Arc::new(Client::with_config(client_thread.clone(), transfer)?);
    let service = Arc::new(TransferService::new(server_thread.clone(), transfer)?);

    let upstream = Arc::new(LinkStats::default());
    let downstream = Arc::new(LinkStats::default());
    let (client_read, to_server_read) = lossy_link(sim.loss, sim.seed, upstream.clone());
    let (client_write, to_server_write) = lossy_link(sim.loss, sim.seed.wrapping_add(1), upstream.clone());
    let (server_read, from_server_read) = lossy_link(sim.loss, sim.seed.wrapping_add(2), downstream.clone());
    let (server_write, from_server_write) = lossy_link(sim.loss, sim.seed.wrapping_add(3), downstream.clone());
    client.connect(client_read, client_write)?;
    service.connect(server_read, server_write)?;

    let pumps = vec![
        pump("skiff-up-read", to_server_read, {
            let service = service.clone();
            move |chunk| tolerate_malformed(service.handle_read_chunk(chunk))
        })?,
        pump("skiff-up-write", to_server_write, {
            let service = service.clone();
            move |chunk| tolerate_malformed(service.handle_write_chunk(chunk))
        })?,
        pump("skiff-down-read", from_server_read, {
            let client = client.clone();
            move |chunk| client.handle_chunk(chunk)
        })?,
        pump("skiff-down-write", from_server_write, {
            let client = client.clone();
            move |chunk| client.handle_chunk(chunk)
        })?,
    ];

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let on_completion = move |status: Status| {
        let _ = done_tx.send(status);
    };
    let options = TransferOptions {
        config: None,
        initial_offset: sim.resume_from,
    };
    let position = Position::default();

    match sim.direction {
        Direction::Read => {
            service.register_handler(shared(FileHandler::read_only(sim.resource, &sim.source)))?;
            let writer = if sim.resume_from == 0 {
                FileWriter::create(&sim.output)
            } else {
                FileWriter::resume(&sim.output, sim.resume_from)
            }
            .with_context(|| format!("opening {}", sim.output.display()))?;
            let writer = TrackedWriter::new(writer, position.clone(), sim.resume_from);
            client.read_with(sim.resource, writer, options, on_completion)?;
        }
        Direction::Write => {
            service.register_handler(shared(FileHandler::write_only(sim.resource, &sim.output)))?;
            let reader = FileReader::open(&sim.source)
                .with_context(|| format!("opening {}", sim.source.display()))?;
            let handle = client.write_with(
                sim.resource,
                TrackedReader::new(reader, position.clone()),
                options,
                on_completion,
            )?;
            client.set_transfer_size(handle, size)?;
        }
    }

    let started = Instant::now();
    let progress = TransferProgress::new(size, &sim.source.display().to_string());
    let status = loop {
        match done_rx.recv_timeout(PROGRESS_INTERVAL) {
            Ok(status) => break status,
            Err(RecvTimeoutError::Timeout) => progress.update(position.get()),
            Err(RecvTimeoutError::Disconnected) => {
                progress.abandon();
                bail!("transfer thread stopped without reporting a status");
            }
        }
    };
    let elapsed = started.elapsed();

    client_thread.terminate();
    server_thread.terminate();
    for handle in pumps {
        let _ = handle.join();
    }

    if !status.is_ok() {
        progress.abandon();
        bail!("transfer failed: {status}");
    }
    progress.update(size);
    progress.finish_with_message(format!("Transferred {} in {}", format_bytes(size), format_duration(elapsed)));

    let expected = hash_file(&sim.source)?;
    let actual = hash_file(&sim.output)?;

    println!("Chunks sent:     {} to server, {} to client", upstream.sent(), downstream.sent());
    println!(
        "Chunks dropped:  {} to server, {} to client",
        upstream.dropped(),
        downstream.dropped()
    );
    println!("Source BLAKE3:   {}", hex::encode(expected));
    println!("Output BLAKE3:   {}", hex::encode(actual));

    if expected != actual {
        bail!("output does not match source");
    }
    println!("Output matches source");
    Ok(())
}

/// Terminates transfer threads when a simulation ends early
struct ThreadGuard(Vec<Arc<TransferThread>>);

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        for thread in &self.0 {
            thread.terminate();
        }
    }
}

/// Chunks the service rejects as malformed are dropped, not fatal to the link
fn tolerate_malformed(result: skiff_core::Result<()>) -> skiff_core::Result<()> {
    match result {
        Err(Error::Chunk(e)) => {
            tracing::debug!("Dropping malformed chunk: {}", e);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn run(sim: Simulation) -> anyhow::Result<()> {
        let mut config = Config::default();
        config.transfer.timeout_ms = 50;
        config.transfer.initial_chunk_timeout_ms = 50;
        config.transfer.max_retries = 20;
        config.transfer.max_lifetime_retries = 10_000;
        simulate(&config, sim)
    }

    fn sample(dir: &std::path::Path, len: usize) -> PathBuf {
        let path = dir.join("source.bin");
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "skiff", "-v", "simulate", "in.bin", "-o", "out.bin", "-d", "write", "--loss", "0.1", "--legacy",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Simulate {
                direction, loss, legacy, resource, ..
            } => {
                assert_eq!(direction, Direction::Write);
                assert!((loss - 0.1).abs() < f64::EPSILON);
                assert!(legacy);
                assert_eq!(resource, 1);
            }
            Commands::Config => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_simulated_read_matches() {
        let dir = tempfile::tempdir().unwrap();
        let source = sample(dir.path(), 100_000);
        let output = dir.path().join("out.bin");
        run(Simulation {
            source: source.clone(),
            output: output.clone(),
            direction: Direction::Read,
            loss: 0.0,
            seed: 1,
            legacy: false,
            resource: 1,
            resume_from: 0,
        })
        .unwrap();
        assert_eq!(fs::read(&source).unwrap(), fs::read(&output).unwrap());
    }

    #[test]
    fn test_simulated_write_with_loss_matches() {
        let dir = tempfile::tempdir().unwrap();
        let source = sample(dir.path(), 40_000);
        let output = dir.path().join("out.bin");
        run(Simulation {
            source: source.clone(),
            output: output.clone(),
            direction: Direction::Write,
            loss: 0.05,
            seed: 42,
            legacy: false,
            resource: 9,
            resume_from: 0,
        })
        .unwrap();
        assert_eq!(fs::read(&source).unwrap(), fs::read(&output).unwrap());
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let source = sample(dir.path(), 10);
        let sim = |loss, legacy, resume_from| Simulation {
            source: source.clone(),
            output: dir.path().join("out.bin"),
            direction: Direction::Read,
            loss,
            seed: 0,
            legacy,
            resource: 1,
            resume_from,
        };
        assert!(run(sim(1.0, false, 0)).is_err());
        assert!(run(sim(0.0, true, 4)).is_err());
        assert!(run(sim(0.0, false, 11)).is_err());
    }
}
