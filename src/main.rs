use std::path::Path;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use pool_supervisor::shutdown::install_shutdown_handler;
use pool_supervisor::{
    Completion, EntryTarget, HandlerError, PoolStats, Supervisor, SupervisorConfig, Worker,
    WorkerError,
};

#[derive(Parser, Debug)]
#[command(name = "pool-supervisor")]
#[command(version)]
#[command(about = "Offload work to a supervised pool of worker processes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a pool and run a batch of fibonacci requests through it
    Run(RunArgs),

    /// Serve requests as a pool worker (started by the controller)
    Worker,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Number of workers (defaults to the available parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// Number of requests to issue
    #[arg(long, default_value = "100")]
    requests: usize,

    /// Fibonacci index each request computes
    #[arg(long, default_value = "40")]
    n: u64,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,

    /// Worker liveness timeout in milliseconds
    #[arg(long, default_value = "5000")]
    liveness_ms: u64,

    /// Delay before replacing an exited worker, in milliseconds
    #[arg(long, default_value = "500")]
    grace_ms: u64,

    /// Log pool stats on this interval (milliseconds)
    #[arg(long)]
    stats_ms: Option<u64>,

    /// Output format for the final stats
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_tracing() {
    // stdout belongs to the wire protocol in workers and to results in the
    // controller, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Run(run_args) => run_controller(run_args).await?,
        Commands::Worker => {
            let code = match run_worker().await {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "Worker stopped");
                    1
                }
            };
            // Exit explicitly: the runtime would otherwise wait on the
            // blocking stdin reader during shutdown.
            std::process::exit(code);
        }
    }

    Ok(())
}

// =============================================================================
// Controller
// =============================================================================

async fn run_controller(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;

    let config = SupervisorConfig::default()
        .with_heartbeat_interval_ms(args.heartbeat_ms)
        .with_liveness_timeout_ms(args.liveness_ms)
        .with_respawn_grace_ms(args.grace_ms)
        .with_stats_interval_ms(args.stats_ms);
    let supervisor = Supervisor::start(config)?;

    let target = EntryTarget::current_exe()?.arg("worker");
    let workers = supervisor.cluster(target, args.workers).await?;
    tracing::info!(workers = workers.len(), requests = args.requests, n = args.n, "Pool started");

    let started = Instant::now();
    let completions: Vec<Completion> = (0..args.requests)
        .map(|_| supervisor.request("fibonacci", vec![json!(args.n)]))
        .collect();

    tokio::select! {
        (ok, failed) = collect(completions) => {
            tracing::info!(
                ok,
                failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "All requests finished"
            );
        }
        _ = shutdown.cancelled() => {
            tracing::warn!("Interrupted before all requests finished");
        }
    }

    let stats = supervisor.stats().await?;
    print_stats(&stats, &args.output)?;
    supervisor.shutdown().await?;
    Ok(())
}

async fn collect(completions: Vec<Completion>) -> (usize, usize) {
    let mut ok = 0;
    let mut failed = 0;
    for completion in completions {
        let id = completion.id();
        match completion.await {
            Ok(value) => {
                tracing::debug!(request_id = %id, result = %value, "Request resolved");
                ok += 1;
            }
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Request failed");
                failed += 1;
            }
        }
    }
    (ok, failed)
}

fn print_stats(stats: &PoolStats, format: &OutputFormat) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(stats)?),
        OutputFormat::Table => {
            println!("{:<8} {:<8} {:<10} {:<10} {:<10} CAPABILITIES", "WORKER", "PID", "STATE", "IN FLIGHT", "DONE");
            for worker in &stats.workers {
                println!(
                    "{:<8} {:<8} {:<10} {:<10} {:<10} {}",
                    worker.id,
                    worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    worker.state,
                    worker.in_flight,
                    worker.completed,
                    worker.capabilities.join(",")
                );
            }
            println!("{stats}");
        }
    }
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker() -> Result<(), WorkerError> {
    let mut worker = Worker::stdio();

    worker.provide_fn("fibonacci", fibonacci)?;
    worker.provide_fn("square", square)?;
    worker.provide("ping", |_| async { Ok::<_, HandlerError>(json!("pong")) })?;
    worker.provide("echo", |args: Vec<Value>| async move {
        Ok::<_, HandlerError>(args.into_iter().next().unwrap_or(Value::Null))
    })?;
    worker.provide_fn("crash-once", crash_once)?;

    worker
        .logger()
        .info(format!("worker {} ready", std::process::id()));
    worker.run().await
}

fn integer_arg(args: &[Value]) -> Result<i64, HandlerError> {
    args.first()
        .and_then(Value::as_i64)
        .ok_or_else(|| HandlerError::new("expected an integer argument"))
}

fn fibonacci(args: Vec<Value>) -> Result<Value, HandlerError> {
    let n = integer_arg(&args)?;
    if n < 0 {
        return Err(HandlerError::new("fibonacci index must not be negative"));
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a
            .checked_add(b)
            .ok_or_else(|| HandlerError::new(format!("fibonacci({n}) overflows u64")))?;
        a = b;
        b = next;
    }
    Ok(json!(a))
}

fn square(args: Vec<Value>) -> Result<Value, HandlerError> {
    let n = integer_arg(&args)?;
    n.checked_mul(n)
        .map(|sq| json!(sq))
        .ok_or_else(|| HandlerError::new(format!("square({n}) overflows i64")))
}

/// Exits the process the first time it runs for a marker path, then succeeds
/// on every later call.
fn crash_once(args: Vec<Value>) -> Result<Value, HandlerError> {
    let marker = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::new("expected a marker path"))?;

    if Path::new(marker).exists() {
        return Ok(json!("recovered"));
    }
    std::fs::write(marker, std::process::id().to_string())?;
    tracing::warn!(marker, "Crashing on purpose");
    std::process::exit(3);
}
