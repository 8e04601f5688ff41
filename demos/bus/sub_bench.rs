//! Subscriber benchmark with a worker pool.
//!
//! Connects a [`SubscriberBus`] to a running `pub-bench`, simulates a little
//! CPU work per message, and prints a metrics line every second until
//! SIGINT/SIGTERM. Exit code 0 on clean shutdown, 1 on startup failure.
use anyhow::{Context, Result};
use milo_bus::{BusConfig, Message, SubscriberBus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct Args {
    sub_addr: String,
    workers: usize,
    topics: Vec<String>,
}

fn parse_args_from<I>(mut args: I) -> Args
where
    I: Iterator<Item = String>,
{
    let mut sub_addr = "tcp://127.0.0.1:5556".to_string();
    let mut workers = 4;
    let mut topics = vec![
        "topic0".to_string(),
        "topic1".to_string(),
        "topic2".to_string(),
        "topic3".to_string(),
    ];

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--sub" => {
                if let Some(value) = args.next() {
                    sub_addr = value;
                }
            }
            "--workers" => {
                if let Some(value) = args.next() {
                    workers = value.parse().unwrap_or(workers);
                }
            }
            "--topics" => {
                if let Some(value) = args.next() {
                    topics = value.split(',').map(str::to_string).collect();
                }
            }
            _ => {}
        }
    }

    Args {
        sub_addr,
        workers,
        topics,
    }
}

fn print_usage() {
    println!("sub-bench: subscriber benchmark with a worker pool");
    println!("  --sub <addr>    publisher address (default tcp://127.0.0.1:5556)");
    println!("  --workers <n>   compute pool size (default 4)");
    println!("  --topics <csv>  topic prefixes (default topic0,topic1,topic2,topic3)");
}

// Simulate ~0.5 ms of CPU work and log a sample line every 1000th message.
fn handle_message(message: &Message, counter: &AtomicU64) {
    let mut sum = 0u64;
    for i in 0..10_000u64 {
        sum = sum.wrapping_add(std::hint::black_box(i * i));
    }
    std::hint::black_box(sum);

    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
    if count % 1000 == 0 {
        let body = message.payload.get(8..).unwrap_or(&[]);
        let preview: String = String::from_utf8_lossy(body)
            .chars()
            .take(20)
            .collect();
        println!(
            "Processed {count} messages. Topic: {}, Data: {preview}...",
            String::from_utf8_lossy(&message.topic)
        );
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = parse_args_from(std::env::args().skip(1));
    println!("Starting subscriber with worker pool:");
    println!("  Subscriber address: {}", args.sub_addr);
    println!("  Worker threads: {}", args.workers);
    println!("  Topics: {}", args.topics.join(" "));
    println!();

    let running = Arc::new(AtomicBool::new(true));
    let signal_flag = Arc::clone(&running);
    ctrlc::set_handler(move || signal_flag.store(false, Ordering::Relaxed))
        .context("install signal handler")?;

    let mut config = BusConfig::from_env();
    config.sub_connect_addr = args.sub_addr.clone();
    config.worker_threads = args.workers;
    config.hwm = 10_000;

    let handled = Arc::new(AtomicU64::new(0));
    let handler_count = Arc::clone(&handled);
    let bus = SubscriberBus::new(
        config,
        args.topics,
        Arc::new(move |message: &Message| handle_message(message, &handler_count)),
    );
    bus.start().context("start subscriber bus")?;

    println!("Subscriber started. Waiting for messages...");
    println!("Press Ctrl+C to stop.");
    println!();

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));
        if running.load(Ordering::Relaxed) {
            println!("METRICS: {}", bus.metrics());
        }
    }

    println!();
    println!("Shutting down...");
    bus.stop();
    println!("FINAL METRICS: {}", bus.metrics());
    println!("Subscriber stopped.");
    Ok(())
}
