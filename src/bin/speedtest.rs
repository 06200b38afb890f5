//! Buffer pool speed test
//!
//! Several threads each hold a set of buffers and keep disposing and
//! re-acquiring them. The whole run is repeated `--loops` times and the total
//! wall-clock time is reported.
//!
//! # Examples
//!
//! ```bash
//! # Defaults: 4 threads, 20 buffers each, 1 MiB slabs
//! slabbuf-speedtest
//!
//! # Pool settings from a file, Prometheus text dump at the end
//! slabbuf-speedtest --config pool.toml --metrics
//! ```

use anyhow::Context;
use clap::Parser;
use slabbuf::pool::{export_metrics, init_metrics};
use slabbuf::{BufferPool, ManagedBuffer, PoolConfig};
use std::path::PathBuf;
use std::sync::Barrier;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// slabbuf speed test
#[derive(Parser, Debug)]
#[command(name = "slabbuf-speedtest")]
#[command(version = slabbuf::VERSION)]
#[command(about = "Hammer a slab buffer pool from several threads", long_about = None)]
struct Cli {
    /// Worker threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Number of timed repetitions
    #[arg(long, default_value_t = 10)]
    loops: usize,

    /// Dispose / acquire operations per thread and loop
    #[arg(long, default_value_t = 1_000_000)]
    ops: usize,

    /// Buffers held by each thread
    #[arg(long, default_value_t = 20)]
    buffers: usize,

    /// Smallest buffer size in bytes
    #[arg(long, default_value_t = 27_000)]
    min_size: u64,

    /// Largest buffer size in bytes
    #[arg(long, default_value_t = 30_000)]
    max_size: u64,

    /// Slab size in bytes (ignored with --config)
    #[arg(long, default_value_t = 1024 * 1024)]
    slab_size: u64,

    /// Pool configuration file; SLABBUF_* variables override it
    #[arg(long, env = "SLABBUF_CONFIG")]
    config: Option<PathBuf>,

    /// Print Prometheus metrics when done
    #[arg(long)]
    metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli)?;

    anyhow::ensure!(cli.threads > 0, "--threads must be at least 1");
    anyhow::ensure!(cli.buffers > 0, "--buffers must be at least 1");
    anyhow::ensure!(
        cli.min_size <= cli.max_size,
        "--min-size must not exceed --max-size"
    );

    init_metrics();

    let config = match &cli.config {
        Some(path) => PoolConfig::load(path)
            .with_context(|| format!("loading pool config from {}", path.display()))?,
        None => PoolConfig::new(cli.slab_size, 1, 1),
    };
    let pool = BufferPool::with_config(config)?;

    info!(
        threads = cli.threads,
        loops = cli.loops,
        ops = cli.ops,
        buffers = cli.buffers,
        "Running speed test"
    );

    let mut total = Duration::ZERO;
    for round in 0..cli.loops {
        let elapsed = run_round(&pool, &cli)?;
        debug!(round, elapsed_ms = elapsed.as_millis() as u64, "Round finished");
        total += elapsed;
    }

    let stats = pool.stats();
    info!(
        slabs = stats.slab_count,
        empty_slabs = stats.empty_slabs,
        capacity = stats.capacity,
        "Pool state after test"
    );

    println!(
        "Speed test complete. {} loops over {} buffer operations across {} threads took {:?}",
        cli.loops,
        cli.ops * cli.threads,
        cli.threads,
        total
    );

    if cli.metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

/// Run every worker once and return the time between the start signal and
/// the last worker finishing
fn run_round(pool: &BufferPool, cli: &Cli) -> anyhow::Result<Duration> {
    let start = Barrier::new(cli.threads + 1);

    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..cli.threads)
            .map(|worker| {
                let start = &start;
                scope.spawn(move || {
                    start.wait();
                    run_worker(pool, cli, worker)
                })
            })
            .collect();

        start.wait();
        let timer = Instant::now();
        for handle in workers {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("speed test worker panicked"))??;
        }
        Ok(timer.elapsed())
    })
}

fn run_worker(pool: &BufferPool, cli: &Cli, worker: usize) -> anyhow::Result<()> {
    let sizes = SizeCycle::new(cli.min_size, cli.max_size, worker);
    let mut step = worker;

    let mut buffers: Vec<ManagedBuffer> = Vec::with_capacity(cli.buffers);
    for _ in 0..cli.buffers {
        buffers.push(pool.get_buffer(sizes.size(step))?);
        step += 1;
    }

    for op in 0..cli.ops {
        // Stride coprime with most buffer counts so every slot gets visited
        let selected = (op * 7 + worker) % cli.buffers;
        if buffers[selected].is_disposed() {
            buffers[selected] = pool.get_buffer(sizes.size(step))?;
            step += 1;
        } else {
            buffers[selected].dispose();
        }
    }

    for buffer in &mut buffers {
        buffer.dispose();
    }
    Ok(())
}

/// Buffer sizes in 101 even steps between the minimum and maximum
struct SizeCycle {
    min: u64,
    step: u64,
    offset: usize,
}

impl SizeCycle {
    fn new(min: u64, max: u64, worker: usize) -> Self {
        Self {
            min,
            step: (max - min) / 100,
            offset: worker * 13,
        }
    }

    fn size(&self, n: usize) -> u64 {
        let slot = ((n * 37 + self.offset) % 101) as u64;
        self.min + slot * self.step
    }
}

fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(())
}
