use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use flood_core::payload::LINE_SEP;
use flood_core::{affinity, logging, params};

/// A connection is released after this long without completing a roundtrip.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Growth step for the per-connection line buffer.
const READ_CHUNK: usize = 1500;

/// Blocking variant of the line-reversing echo server. One accept thread
/// per port feeds a shared queue; each queued connection gets its own
/// thread, pinned to a random CPU of the set.
#[derive(Parser, Debug)]
#[command(name = "flood-server-sync", version, about)]
struct Args {
    /// Ports to listen on
    #[arg(long, value_delimiter = ',', default_value = "9999")]
    local_ports: Vec<u16>,

    /// CPUs to run on (default: all hardware CPUs)
    #[arg(long, value_delimiter = ',')]
    cpu_set: Option<Vec<usize>>,
}

fn all_cpus() -> Vec<usize> {
    let count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (0..count).collect()
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();
    let cpus = args.cpu_set.clone().unwrap_or_else(all_cpus);

    params::report("local-ports", params::list(&args.local_ports));
    params::report("cpu-set", params::list(&cpus));

    anyhow::ensure!(!cpus.is_empty(), "cpu set is empty");

    let (queue, accepted) = mpsc::channel::<TcpStream>();
    for &port in &args.local_ports {
        let queue = queue.clone();
        let cpus = cpus.clone();
        thread::Builder::new()
            .name(format!("accept{port}"))
            .spawn(move || accept_loop(port, &cpus, queue))
            .with_context(|| format!("spawn acceptor for port {port}"))?;
    }
    drop(queue);

    let mut rng = SmallRng::from_entropy();
    loop {
        let stream = accepted.recv().context("all acceptors terminated")?;
        let cpu = cpus[rng.gen_range(0..cpus.len())];
        let spawned = thread::Builder::new().spawn(move || {
            if let Err(err) = affinity::pin_current_thread(&[cpu]) {
                warn!("session create failed: {err:#}");
                return;
            }
            serve(stream);
        });
        if let Err(err) = spawned {
            warn!("session create failed: {err}");
        }
    }
}

/// Accept connections on one port and push them onto the shared queue.
/// Accept errors are transient; setup errors are fatal to the process.
fn accept_loop(port: u16, cpus: &[usize], queue: mpsc::Sender<TcpStream>) {
    if let Err(err) = affinity::pin_current_thread(cpus) {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("ERROR: bind port {port}: {err}");
            std::process::exit(1);
        }
    };
    loop {
        match listener.accept() {
            Ok((stream, _peer)) => {
                if queue.send(stream).is_err() {
                    return;
                }
            }
            Err(err) => warn!("socket accept failed: {err}"),
        }
    }
}

/// Serve one connection: read a line, reverse it in place (the separator
/// stays last), write it back. The idle deadline is absolute across each
/// full roundtrip and re-arms after every answered line.
fn serve(stream: TcpStream) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!("session create failed: {err}");
        return;
    }
    let mut stream = stream;
    let mut buffer: Vec<u8> = Vec::new();
    let mut scanned = 0usize;
    loop {
        let deadline = Instant::now() + IDLE_TIMEOUT;

        let length = loop {
            if let Some(at) = buffer[scanned..].iter().position(|&b| b == LINE_SEP) {
                break scanned + at + 1;
            }
            scanned = buffer.len();
            match read_some(&mut stream, &mut buffer, deadline) {
                Ok(0) => {
                    if !buffer.is_empty() {
                        warn!("protocol violation");
                    }
                    return;
                }
                Ok(_) => {}
                Err(err) if timed_out(&err) => {
                    warn!("operation timeout: receiving line from client");
                    return;
                }
                Err(err) => {
                    warn!("operation error: receiving line from client ({err})");
                    return;
                }
            }
        };

        buffer[..length - 1].reverse();
        match write_all_by(&mut stream, &buffer[..length], deadline) {
            Ok(()) => {}
            Err(err) if timed_out(&err) => {
                warn!("operation timeout: sending data to client");
                return;
            }
            Err(err) => {
                warn!("operation error: sending data to client ({err})");
                return;
            }
        }
        buffer.drain(..length);
        scanned = 0;
    }
}

fn timed_out(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Read once into the buffer's tail, within the remaining deadline budget.
/// Returns the number of bytes read; zero is end of stream.
fn read_some(stream: &mut TcpStream, buffer: &mut Vec<u8>, deadline: Instant) -> io::Result<usize> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(io::ErrorKind::TimedOut.into());
    }
    stream.set_read_timeout(Some(remaining))?;
    if buffer.try_reserve(READ_CHUNK).is_err() {
        return Err(io::ErrorKind::OutOfMemory.into());
    }
    let len = buffer.len();
    buffer.resize(len + READ_CHUNK, 0);
    match stream.read(&mut buffer[len..]) {
        Ok(n) => {
            buffer.truncate(len + n);
            Ok(n)
        }
        Err(err) => {
            buffer.truncate(len);
            Err(err)
        }
    }
}

fn write_all_by(stream: &mut TcpStream, mut data: &[u8], deadline: Instant) -> io::Result<()> {
    while !data.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        stream.set_write_timeout(Some(remaining))?;
        match stream.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
