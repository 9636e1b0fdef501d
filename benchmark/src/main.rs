use clap::Parser;
use hdrhistogram::Histogram;
use kvraft::clerk::{Clerk, RemoteKv};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clerks
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Pause between requests of one clerk, in ms
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Comma separated client addresses of every server
    #[arg(short, long, default_value = "127.0.0.1:4000")]
    servers: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    let servers: Vec<String> = args
        .servers
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    anyhow::ensure!(!servers.is_empty(), "no server address given");

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clerks against {} servers, interval: {} ms",
        args.concurrency,
        servers.len(),
        args.interval
    );

    let mut handles = vec![];
    for c in 0..args.concurrency {
        let remotes = servers.iter().map(|addr| RemoteKv::new(addr.clone())).collect();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();

        let handle = tokio::spawn(async move {
            let mut clerk = Clerk::new(remotes);
            let key = format!("bench-{}", c);
            let mut counter = 0u64;

            loop {
                let start = Instant::now();
                // Alternate writes and reads so both paths go through the log.
                if counter % 2 == 0 {
                    clerk.append(&key, "x").await;
                } else {
                    let _ = clerk.get(&key).await;
                }
                let duration = start.elapsed();
                {
                    let mut hist = histogram.lock().await;
                    if let Err(e) = hist.record(duration.as_micros() as u64) {
                        log::warn!("failed to record latency: {}", e);
                    }
                }
                *total_requests.lock().await += 1;
                counter += 1;

                sleep(Duration::from_millis(args.interval)).await;
            }
        });

        handles.push(handle);
    }

    sleep(Duration::from_secs(args.duration)).await;

    for handle in handles {
        handle.abort();
    }

    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
