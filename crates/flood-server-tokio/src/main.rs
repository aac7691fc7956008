use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use flood_core::payload::LINE_SEP;
use flood_core::{affinity, logging, params};

/// A connection is released after this long without completing a roundtrip.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Growth step for the per-connection line buffer.
const READ_CHUNK: usize = 1500;

/// Line-reversing echo server. One listener per port; accepted connections
/// are distributed round-robin over a pool of pinned single-threaded
/// reactors. For every received line the reversed line is written back.
#[derive(Parser, Debug)]
#[command(name = "flood-server-tokio", version, about)]
struct Args {
    /// Ports to listen on
    #[arg(long, value_delimiter = ',', default_value = "9999")]
    local_ports: Vec<u16>,

    /// CPUs to pin reactors to (default: all hardware CPUs)
    #[arg(long, value_delimiter = ',')]
    cpu_set: Option<Vec<usize>>,
}

fn all_cpus() -> Vec<usize> {
    let count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (0..count).collect()
}

/// One pinned current-thread runtime per CPU. The threads park inside
/// `block_on` and only ever run spawned listener and connection tasks.
struct ReactorPool {
    handles: Vec<Handle>,
    cursor: AtomicUsize,
}

impl ReactorPool {
    fn start(cpus: &[usize]) -> anyhow::Result<Self> {
        let mut handles = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            let (ready, started) = mpsc::channel();
            thread::Builder::new()
                .name(format!("reactor{cpu}"))
                .spawn(move || {
                    let runtime = affinity::pin_current_thread(&[cpu]).and_then(|()| {
                        tokio::runtime::Builder::new_current_thread()
                            .enable_io()
                            .enable_time()
                            .build()
                            .context("build reactor runtime")
                    });
                    match runtime {
                        Ok(runtime) => {
                            let _ = ready.send(Ok(runtime.handle().clone()));
                            runtime.block_on(std::future::pending::<()>());
                        }
                        Err(err) => {
                            let _ = ready.send(Err(err));
                        }
                    }
                })
                .with_context(|| format!("spawn reactor for cpu {cpu}"))?;
            let handle = started
                .recv()
                .context("reactor thread died during startup")?
                .with_context(|| format!("start reactor for cpu {cpu}"))?;
            handles.push(handle);
        }
        Ok(Self {
            handles,
            cursor: AtomicUsize::new(0),
        })
    }

    fn next(&self) -> &Handle {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        &self.handles[index]
    }
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();
    let cpus = args.cpu_set.clone().unwrap_or_else(all_cpus);

    params::report("local-ports", params::list(&args.local_ports));
    params::report("cpu-set", params::list(&cpus));

    anyhow::ensure!(!cpus.is_empty(), "cpu set is empty");

    let pool = Arc::new(ReactorPool::start(&cpus)?);
    for &port in &args.local_ports {
        // Bind synchronously so a bad port is a startup error, then hand
        // the listener to a reactor.
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = StdTcpListener::bind(addr).with_context(|| format!("bind port {port}"))?;
        listener
            .set_nonblocking(true)
            .with_context(|| format!("configure listener on port {port}"))?;
        let tasks = pool.clone();
        pool.next().spawn(async move {
            if let Err(err) = accept_loop(listener, tasks).await {
                eprintln!("ERROR: {err:#}");
                std::process::exit(1);
            }
        });
    }

    // The reactors never exit; keep the main thread out of the way.
    loop {
        thread::park();
    }
}

async fn accept_loop(listener: StdTcpListener, pool: Arc<ReactorPool>) -> anyhow::Result<()> {
    let listener = TcpListener::from_std(listener).context("register listener")?;
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                // Re-register the socket on the reactor that will serve it.
                let stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!("session create failed: {err}");
                        continue;
                    }
                };
                pool.next().spawn(async move {
                    match TcpStream::from_std(stream) {
                        Ok(stream) => serve(stream).await,
                        Err(err) => warn!("session create failed: {err}"),
                    }
                });
            }
            Err(err) => warn!("socket accept failed: {err}"),
        }
    }
}

/// Serve one connection: read a line, reverse it in place (the separator
/// stays last), write it back. A single idle deadline covers each full
/// roundtrip. Every exit path releases just this connection.
async fn serve(stream: TcpStream) {
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
            if buffer.try_reserve(READ_CHUNK).is_err() {
                warn!("operation error: receiving line from client (out of memory)");
                return;
            }
            match timeout_at(deadline, stream.read_buf(&mut buffer)).await {
                Err(_) => {
                    warn!("operation timeout: receiving line from client");
                    return;
                }
                Ok(Err(err)) => {
                    warn!("operation error: receiving line from client ({err})");
                    return;
                }
                Ok(Ok(0)) => {
                    if !buffer.is_empty() {
                        warn!("protocol violation");
                    }
                    return;
                }
                Ok(Ok(_)) => {}
            }
        };

        buffer[..length - 1].reverse();
        match timeout_at(deadline, stream.write_all(&buffer[..length])).await {
            Err(_) => {
                warn!("operation timeout: sending data to client");
                return;
            }
            Ok(Err(err)) => {
                warn!("operation error: sending data to client ({err})");
                return;
            }
            Ok(Ok(())) => {}
        }
        buffer.drain(..length);
        scanned = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn served_connection() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve(stream).await;
        });
        TcpStream::connect(addr).await.unwrap()
    }

    #[tokio::test]
    async fn lines_come_back_reversed() {
        let mut client = served_connection().await;
        client.write_all(b"HELLO\n").await.unwrap();
        let mut response = [0u8; 6];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"OLLEH\n");
    }

    #[tokio::test]
    async fn pipelined_lines_are_answered_in_order() {
        let mut client = served_connection().await;
        client.write_all(b"AB\nXYZ\n").await.unwrap();
        let mut response = [0u8; 7];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"BA\nZYX\n");
    }

    #[tokio::test]
    async fn close_after_clean_lines_ends_the_session() {
        let mut client = served_connection().await;
        client.write_all(b"PING\n").await.unwrap();
        let mut response = [0u8; 5];
        client.read_exact(&mut response).await.unwrap();
        drop(client);
    }
}
