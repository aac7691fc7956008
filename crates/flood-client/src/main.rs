use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;

use flood_core::affinity;
use flood_core::clock::WallClock;
use flood_core::dispatcher::Dispatcher;
use flood_core::driver::Driver;
use flood_core::pacer::Pacer;
use flood_core::params;
use flood_core::partition::partition;
use flood_core::payload::Payload;
use flood_core::stats::Controller;

/// TCP load generator. Opens a fixed set of connections and drives
/// pipelined line-terminated roundtrips at a target aggregate rate, with
/// one pinned reactor per CPU. Runs until killed; interval statistics go to
/// stdout as `STATUS:` lines.
#[derive(Parser, Debug)]
#[command(name = "flood-client", version, about)]
struct Args {
    /// Target address
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    remote_addr: IpAddr,

    /// Target ports; connections are assigned round-robin
    #[arg(long, value_delimiter = ',', default_value = "9999")]
    remote_ports: Vec<u16>,

    /// Total connections to open
    #[arg(long, default_value_t = 100)]
    connections: usize,

    /// Aggregate target rate
    #[arg(long, default_value_t = 1000)]
    requests_per_second: usize,

    /// Upper bound on request size; payloads are 1..=range bytes
    #[arg(long, default_value_t = 100)]
    message_size_range: usize,

    /// CPUs to pin workers to (default: all hardware CPUs)
    #[arg(long, value_delimiter = ',')]
    cpu_set: Option<Vec<usize>>,

    /// Per-worker cap on connect attempts in flight
    /// (default: the system listen backlog maximum)
    #[arg(long)]
    bulk_connect: Option<usize>,
}

fn all_cpus() -> Vec<usize> {
    let count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (0..count).collect()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cpus = args.cpu_set.clone().unwrap_or_else(all_cpus);
    let bulk_connect = args.bulk_connect.unwrap_or(libc::SOMAXCONN as usize);

    params::report("remote-addr", params::quoted(args.remote_addr));
    params::report("remote-ports", params::list(&args.remote_ports));
    params::report("connections", args.connections);
    params::report("requests-per-second", args.requests_per_second);
    params::report("message-size-range", args.message_size_range);
    params::report("cpu-set", params::list(&cpus));
    params::report("bulk-connect", bulk_connect);

    anyhow::ensure!(!cpus.is_empty(), "cpu set is empty");
    anyhow::ensure!(args.message_size_range >= 1, "message size range must be at least 1");
    anyhow::ensure!(
        args.connections >= cpus.len(),
        "need at least one connection per worker ({} workers)",
        cpus.len()
    );

    let mut endpoints = Vec::with_capacity(args.connections);
    for i in 0..args.connections {
        let port = args.remote_ports[i % args.remote_ports.len()];
        endpoints.push(SocketAddr::new(args.remote_addr, port));
    }

    let clock = WallClock::new();
    let start = clock.now();
    let controller = Arc::new(Controller::new(cpus.len(), start));

    let shares = partition(args.connections, cpus.len());
    let rates = partition(args.requests_per_second, cpus.len());
    let budgets = partition(bulk_connect, cpus.len());

    let mut workers = Vec::with_capacity(cpus.len());
    for (((cpu, count), rate), budget) in cpus.into_iter().zip(shares).zip(rates).zip(budgets) {
        // Endpoint slices are carved from the tail, matching the
        // remainder-to-later-workers partitioning.
        let slice = endpoints.split_off(endpoints.len() - count);
        let controller = controller.clone();
        let range = args.message_size_range;
        let handle = thread::Builder::new()
            .name(format!("worker{cpu}"))
            .spawn(move || {
                // Workers share no error state: a failure in any one of
                // them invalidates the run, so it takes the process down.
                if let Err(err) = run_worker(cpu, slice, range, budget, rate, start, clock, controller)
                {
                    eprintln!("ERROR: {err:#}");
                    std::process::exit(1);
                }
            })
            .with_context(|| format!("spawn worker for cpu {cpu}"))?;
        workers.push(handle);
    }

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    cpu: usize,
    endpoints: Vec<SocketAddr>,
    range: usize,
    budget: usize,
    rate: usize,
    start: std::time::Duration,
    clock: WallClock,
    controller: Arc<Controller>,
) -> anyhow::Result<()> {
    affinity::pin_current_thread(&[cpu])?;
    let pacer = Pacer::new(controller, start, rate as f64, endpoints.len(), clock.now());
    let driver = Driver::new(
        clock,
        Dispatcher::new(&endpoints),
        pacer,
        Payload::new(range),
        budget,
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("build worker runtime")?;
    runtime.block_on(driver.run())
}
