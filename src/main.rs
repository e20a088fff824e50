use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use num_traits::FromPrimitive;

use rinspect::discovery::ClientDirectory;
use rinspect::event::{op_or_task, OpKind, OpOrTask};
use rinspect::resolv::ResolvService;
use rinspect::{Error, HandshakeStatus, Worker};

#[derive(Parser)]
#[command(name = "rinspect", about = "Headless viewer for rinspect frame telemetry")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for UDP beacons and list instrumented processes
    Discover {
        /// How long to listen
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Capture a live session into a file
    Record {
        /// Host of the instrumented process
        #[arg(long, default_value = "127.0.0.1")]
        addr: String,
        /// Advertised data port
        #[arg(long)]
        port: u16,
        /// Capture file to write
        #[arg(short, long)]
        output: PathBuf,
        /// Capture duration
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Print a summary of a capture file
    Info { file: PathBuf },
}

fn main() {
    env_logger::init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> rinspect::Result<()> {
    match cli.command {
        Command::Discover { seconds } => discover(seconds),
        Command::Record { addr, port, output, seconds } => record(&addr, port, &output, seconds),
        Command::Info { file } => info(&file),
    }
}

fn discover(seconds: u64) -> rinspect::Result<()> {
    let mut directory = ClientDirectory::new(ResolvService::new());
    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        directory.poll();
        thread::sleep(Duration::from_secs(1));
    }
    if directory.is_empty() {
        println!("no instrumented processes found");
        return Ok(());
    }
    println!(
        "{:<24} {:>8} {:<16} {:>6} {:>5} {:>8}",
        "program", "pid", "address", "port", "ver", "uptime"
    );
    for client in directory.clients() {
        let host = directory
            .resolved_name(&client.address)
            .unwrap_or_else(|| client.address.clone());
        println!(
            "{:<24} {:>8} {:<16} {:>6} {:>5} {:>7}s",
            client.program_name, client.pid, host, client.port, client.protocol_version,
            client.active_time
        );
    }
    Ok(())
}

fn record(addr: &str, port: u16, output: &PathBuf, seconds: u64) -> rinspect::Result<()> {
    println!("connecting to {addr}:{port}");
    let worker = Worker::connect(addr, port)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        if let Some(status) = worker.handshake() {
            break status;
        }
        if Instant::now() > deadline {
            return Err(Error::HandshakeDropped);
        }
        thread::sleep(Duration::from_millis(10));
    };
    if status != HandshakeStatus::Welcome {
        return Err(if status == HandshakeStatus::ProtocolMismatch {
            Error::ProtocolMismatch
        } else {
            Error::HandshakeRejected(status)
        });
    }

    println!("recording for {seconds}s");
    let stop = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < stop && worker.is_connected() {
        thread::sleep(Duration::from_millis(100));
    }
    worker.shutdown();
    for message in worker.errors() {
        eprintln!("session error: {message}");
    }
    worker.save(output)?;
    println!(
        "wrote {} ({} frames, {} ops, {} KiB received, {} KiB decoded)",
        output.display(),
        worker.frame_count(),
        worker.context().op_tasks.len(),
        worker.bytes_received() / 1024,
        worker.bytes_decoded() / 1024
    );
    Ok(())
}

fn info(file: &PathBuf) -> rinspect::Result<()> {
    let worker = Worker::open(file)?;
    let ctx = worker.context();

    println!("capture: {}", file.display());
    println!("frames:  {}", ctx.frame_count());
    if ctx.frame_count() > 1 {
        let fd = &ctx.frame_data;
        let closed = ctx.frame_count() as i64;
        println!(
            "  span total {:.2} ms, min {:.3} ms, max {:.3} ms, mean {:.3} ms",
            fd.total as f64 / 1e6,
            fd.min as f64 / 1e6,
            fd.max as f64 / 1e6,
            fd.total as f64 / closed as f64 / 1e6
        );
        println!("  last frame {:.3} ms", ctx.frame_time(ctx.frame_count() - 1) as f64 / 1e6);
    }

    let mut ops = 0usize;
    let mut tasks = 0usize;
    for op in &ctx.op_tasks {
        match OpKind::from_u8(op.kind).map(op_or_task) {
            Some(OpOrTask::Op) => ops += 1,
            Some(OpOrTask::Task) => tasks += 1,
            _ => {}
        }
    }
    println!("ops:     {} ({} draw ops, {} tasks)", ctx.op_tasks.len(), ops, tasks);
    println!("childs:  {} parents", ctx.op_childs.len());
    println!("attrs:   {} ops carry values", ctx.properties.len());
    println!("names:   {} resolved", ctx.name_map.len());
    for (handle, name) in ctx.name_map.iter().take(10) {
        println!("  {handle:#018x} = {name}");
    }
    Ok(())
}
