//! quick-counter-client: load-generating client for the counter server.
//!
//! Sends pseudo-random increments over one connection, printing each new
//! counter value, with a random pause between requests.

use clap::Parser;
use quick_counter::workload::Workload;
use quick_counter::Client;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the counter client
#[derive(Parser, Debug)]
#[command(name = "quick-counter-client")]
#[command(author = "quick-counter authors")]
#[command(version = "0.1.0")]
#[command(about = "Send increment requests to a quick-counter server", long_about = None)]
struct ClientArgs {
    /// Server address (e.g., tcp://127.0.0.1:8080)
    #[arg(short = 'r', long, default_value = "tcp://127.0.0.1:8080")]
    remote: String,

    /// Number of increments to send (0 = until interrupted)
    #[arg(short = 'n', long, default_value_t = 0)]
    count: u64,

    /// Increment amounts are drawn from [0, max-amount)
    #[arg(long, default_value_t = 100)]
    max_amount: u64,

    /// Pauses between requests are drawn from [0, max-pause-ms) milliseconds
    #[arg(long, default_value_t = 100)]
    max_pause_ms: u64,

    /// Seed for the amount and pause sequence (defaults to the clock)
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ClientArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let seed = args.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    });
    let mut workload = Workload::new(seed);
    let max_pause = Duration::from_millis(args.max_pause_ms);

    let mut client = Client::connect(&args.remote).await?;
    info!(remote = %args.remote, seed, "Connected");

    let mut sent = 0u64;
    while args.count == 0 || sent < args.count {
        let amount = workload.next_amount(args.max_amount);
        let total = client.increment(amount).await?;
        debug!(amount, total, "Increment acknowledged");
        println!("New counter value: {}", total);
        sent += 1;

        tokio::time::sleep(workload.next_pause(max_pause)).await;
    }

    client.close().await?;
    Ok(())
}
