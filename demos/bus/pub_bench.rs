//! Multithreaded publisher benchmark.
//!
//! Starts a [`PublisherBus`], fans `--producers` threads into it, and prints
//! the aggregate publish rate. Payloads follow the bus benchmark convention:
//! an 8-byte monotonic nanosecond stamp followed by a 64-byte body, so a
//! `sub-bench` on the other end can report end-to-end latency.
use anyhow::{Context, Result};
use milo_bus::{BusConfig, Message, PublisherBus, stamp};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const BODY_BYTES: usize = 64;
// Producer threads shard over this many topic suffixes.
const TOPIC_SHARDS: usize = 4;

struct Args {
    pub_addr: String,
    producers: usize,
    messages: usize,
    topic_prefix: String,
}

fn parse_args_from<I>(mut args: I) -> Args
where
    I: Iterator<Item = String>,
{
    let mut pub_addr = "tcp://*:5556".to_string();
    let mut producers = 4;
    let mut messages = 10_000;
    let mut topic_prefix = "topic".to_string();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--pub" => {
                if let Some(value) = args.next() {
                    pub_addr = value;
                }
            }
            "--producers" => {
                if let Some(value) = args.next() {
                    producers = value.parse().unwrap_or(producers);
                }
            }
            "--messages" => {
                if let Some(value) = args.next() {
                    messages = value.parse().unwrap_or(messages);
                }
            }
            "--topics" => {
                if let Some(value) = args.next() {
                    topic_prefix = value;
                }
            }
            _ => {}
        }
    }

    Args {
        pub_addr,
        producers,
        messages,
        topic_prefix,
    }
}

fn print_usage() {
    println!("pub-bench: multithreaded publisher benchmark");
    println!("  --pub <addr>       publisher bind address (default tcp://*:5556)");
    println!("  --producers <n>    producer thread count (default 4)");
    println!("  --messages <n>     messages per producer (default 10000)");
    println!("  --topics <prefix>  topic prefix; threads shard over <prefix>0..3");
}

fn producer_loop(bus: &PublisherBus, thread_id: usize, messages: usize, topic_prefix: &str) {
    let topic = format!("{topic_prefix}{}", thread_id % TOPIC_SHARDS);
    for i in 0..messages {
        let mut body = [0u8; BODY_BYTES];
        let text = format!("thread {thread_id} msg {i}");
        let len = text.len().min(BODY_BYTES);
        body[..len].copy_from_slice(&text.as_bytes()[..len]);
        bus.produce(Message::new(topic.clone(), stamp::stamp_payload(&body)));

        // Brief pause every 100 messages to avoid overwhelming the system.
        if i % 100 == 0 {
            thread::sleep(Duration::from_micros(10));
        }
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = parse_args_from(std::env::args().skip(1));
    let total = args.producers * args.messages;
    println!("Starting multithreaded publisher:");
    println!("  Producers: {}", args.producers);
    println!("  Messages per producer: {}", args.messages);
    println!("  Total messages: {total}");
    println!("  Publisher address: {}", args.pub_addr);
    println!("  Topic prefix: {}", args.topic_prefix);
    println!();

    let mut config = BusConfig::from_env();
    config.pub_bind_addr = args.pub_addr.clone();
    config.hwm = 10_000;

    let bus = PublisherBus::new(config);
    bus.start().context("start publisher bus")?;
    println!("Publisher started. Starting producer threads...");

    let start = Instant::now();
    thread::scope(|scope| {
        for thread_id in 0..args.producers {
            let bus = &bus;
            let topic_prefix = args.topic_prefix.as_str();
            scope.spawn(move || producer_loop(bus, thread_id, args.messages, topic_prefix));
        }
    });
    let elapsed = start.elapsed();

    println!("All messages sent in {} ms", elapsed.as_millis());
    if !elapsed.is_zero() {
        println!(
            "Rate: {:.0} messages/sec",
            total as f64 / elapsed.as_secs_f64()
        );
    }

    // Let the egress queue drain before tearing the sockets down.
    thread::sleep(Duration::from_millis(100));
    bus.stop();
    println!("Publisher stopped.");
    Ok(())
}
