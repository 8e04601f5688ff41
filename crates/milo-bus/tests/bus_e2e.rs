// End-to-end scenarios over loopback TCP. Each test owns a distinct port so
// the suite can run in parallel.
use anyhow::Result;
use milo_bus::{BusConfig, Message, PublisherBus, SubscriberBus, stamp};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// Warm-up long enough to beat the slow joiner on loopback, short enough to
// keep the suite fast.
const TEST_WARMUP: Duration = Duration::from_millis(300);
const JOIN_DELAY: Duration = Duration::from_millis(300);
const DEADLINE: Duration = Duration::from_secs(10);

fn config_for_port(port: u16) -> BusConfig {
    let mut config = BusConfig::default();
    config.pub_bind_addr = format!("tcp://127.0.0.1:{port}");
    config.sub_connect_addr = format!("tcp://127.0.0.1:{port}");
    config.hwm = 100_000;
    config.warmup = TEST_WARMUP;
    config
}

fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Handler that archives every message it sees.
fn recording_handler(seen: Arc<Mutex<Vec<Message>>>) -> milo_bus::MessageHandler {
    Arc::new(move |message: &Message| {
        seen.lock().expect("seen lock").push(message.clone());
    })
}

#[test]
fn roundtrip_is_byte_exact_and_ordered() -> Result<()> {
    let mut config = config_for_port(5610);
    // One worker so the archive order equals the receive order.
    config.worker_threads = 1;
    let publisher = PublisherBus::new(config.clone());
    publisher.start()?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = SubscriberBus::new(config, ["t0"], recording_handler(Arc::clone(&seen)));
    subscriber.start()?;
    thread::sleep(JOIN_DELAY);

    for i in 0..100u64 {
        let payload = stamp::stamp_payload(&i.to_ne_bytes());
        publisher.produce(Message::new("t0", payload));
    }

    assert!(
        wait_until(DEADLINE, || subscriber.metrics().processed == 100),
        "processed {} of 100",
        subscriber.metrics().processed
    );

    let seen = seen.lock().expect("seen lock");
    assert_eq!(seen.len(), 100);
    for (i, message) in seen.iter().enumerate() {
        assert_eq!(message.topic, "t0");
        let body = &message.payload[stamp::STAMP_LEN..];
        assert_eq!(body, &(i as u64).to_ne_bytes()[..]);
    }

    // Stamped payloads produced latency samples.
    let stats = subscriber.metrics();
    assert!(stats.p50 <= stats.p90 && stats.p90 <= stats.p99);
    assert!(stats.p99 > Duration::ZERO);

    subscriber.stop();
    publisher.stop();
    Ok(())
}

#[test]
fn empty_prefix_receives_every_topic() -> Result<()> {
    let mut config = config_for_port(5611);
    config.worker_threads = 1;
    let publisher = PublisherBus::new(config.clone());
    publisher.start()?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = SubscriberBus::new(config, [""], recording_handler(Arc::clone(&seen)));
    subscriber.start()?;
    thread::sleep(JOIN_DELAY);

    publisher.produce(Message::new("alpha", "1"));
    publisher.produce(Message::new("beta", "2"));
    // Empty topic and empty payload are legal; only an empty-prefix
    // subscriber can see an empty topic.
    publisher.produce(Message::new("", ""));

    assert!(wait_until(DEADLINE, || subscriber.metrics().processed == 3));
    let topics: Vec<Vec<u8>> = seen
        .lock()
        .expect("seen lock")
        .iter()
        .map(|message| message.topic.to_vec())
        .collect();
    assert_eq!(topics, vec![b"alpha".to_vec(), b"beta".to_vec(), Vec::new()]);

    subscriber.stop();
    publisher.stop();
    Ok(())
}

#[test]
fn prefix_filtering_matches_prefixes_only() -> Result<()> {
    let config = config_for_port(5612);
    let publisher = PublisherBus::new(config.clone());
    publisher.start()?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = SubscriberBus::new(config, ["foo"], recording_handler(Arc::clone(&seen)));
    subscriber.start()?;
    thread::sleep(JOIN_DELAY);

    for topic in ["foo", "food", "foobar", "fo", "bar"] {
        publisher.produce(Message::new(topic, "x"));
    }

    assert!(wait_until(DEADLINE, || subscriber.metrics().processed == 3));
    // Give any stray non-matching delivery a moment to show up.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(subscriber.metrics().processed, 3);

    let topics: HashSet<Vec<u8>> = seen
        .lock()
        .expect("seen lock")
        .iter()
        .map(|message| message.topic.to_vec())
        .collect();
    let expected: HashSet<Vec<u8>> = [b"foo".to_vec(), b"food".to_vec(), b"foobar".to_vec()]
        .into_iter()
        .collect();
    assert_eq!(topics, expected);

    subscriber.stop();
    publisher.stop();
    Ok(())
}

#[test]
fn per_producer_ordering_is_preserved() -> Result<()> {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: u64 = 500;

    let mut config = config_for_port(5613);
    config.worker_threads = 1;
    let publisher = PublisherBus::new(config.clone());
    publisher.start()?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = SubscriberBus::new(
        config,
        ["topic0", "topic1", "topic2", "topic3"],
        recording_handler(Arc::clone(&seen)),
    );
    subscriber.start()?;
    thread::sleep(JOIN_DELAY);

    thread::scope(|scope| {
        for tid in 0..PRODUCERS {
            let publisher = &publisher;
            scope.spawn(move || {
                let topic = format!("topic{tid}");
                for seq in 0..PER_PRODUCER {
                    publisher.produce(Message::new(topic.clone(), seq.to_ne_bytes().to_vec()));
                }
            });
        }
    });

    let total = PRODUCERS as u64 * PER_PRODUCER;
    assert!(
        wait_until(DEADLINE, || subscriber.metrics().processed == total),
        "processed {} of {total}",
        subscriber.metrics().processed
    );

    // Within one topic (= one producer) sequence numbers arrive in order.
    let seen = seen.lock().expect("seen lock");
    for tid in 0..PRODUCERS {
        let topic = format!("topic{tid}");
        let sequence: Vec<u64> = seen
            .iter()
            .filter(|message| message.topic == topic.as_bytes())
            .map(|message| {
                u64::from_ne_bytes(message.payload[..8].try_into().expect("8-byte payload"))
            })
            .collect();
        let expected: Vec<u64> = (0..PER_PRODUCER).collect();
        assert_eq!(sequence, expected, "producer {tid} reordered");
    }

    subscriber.stop();
    publisher.stop();
    Ok(())
}

#[test]
fn stop_is_clean_under_load_and_final() -> Result<()> {
    let config = config_for_port(5614);
    let publisher = Arc::new(PublisherBus::new(config.clone()));
    publisher.start()?;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let subscriber = SubscriberBus::new(
        config,
        [""],
        Arc::new(move |_message: &Message| {
            handler_calls.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(1));
        }),
    );
    subscriber.start()?;
    thread::sleep(JOIN_DELAY);

    let feeder_publisher = Arc::clone(&publisher);
    let feeding = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let feeder_flag = Arc::clone(&feeding);
    let feeder = thread::spawn(move || {
        let mut i = 0u64;
        while feeder_flag.load(Ordering::Relaxed) {
            feeder_publisher.produce(Message::new("t", i.to_ne_bytes().to_vec()));
            i += 1;
            // Pace the feeder so the drain at stop stays short.
            thread::sleep(Duration::from_micros(100));
        }
    });

    assert!(wait_until(DEADLINE, || subscriber.metrics().processed > 100));
    subscriber.stop();
    assert!(!subscriber.is_running());

    // No handler runs after stop and the counters stay frozen.
    let processed_at_stop = subscriber.metrics().processed;
    let calls_at_stop = calls.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(subscriber.metrics().processed, processed_at_stop);
    assert_eq!(calls.load(Ordering::Relaxed), calls_at_stop);
    assert_eq!(processed_at_stop, calls_at_stop as u64);

    feeding.store(false, Ordering::Relaxed);
    feeder.join().expect("feeder join");
    publisher.stop();
    Ok(())
}

#[test]
fn lifecycle_is_idempotent_and_restartable() -> Result<()> {
    let mut config = config_for_port(5615);
    config.warmup = Duration::from_millis(5);

    let publisher = PublisherBus::new(config.clone());
    let subscriber = SubscriberBus::new(
        config.clone(),
        ["t"],
        Arc::new(|_message: &Message| {}),
    );

    for _ in 0..25 {
        publisher.start()?;
        publisher.start()?;
        assert!(publisher.is_running());
        subscriber.start()?;
        subscriber.start()?;
        assert!(subscriber.is_running());
        subscriber.stop();
        subscriber.stop();
        assert!(!subscriber.is_running());
        publisher.stop();
        publisher.stop();
        assert!(!publisher.is_running());
    }

    // A restarted pair still delivers.
    config.warmup = TEST_WARMUP;
    let publisher = PublisherBus::new(config.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = SubscriberBus::new(config, ["t"], recording_handler(Arc::clone(&seen)));
    publisher.start()?;
    subscriber.start()?;
    thread::sleep(JOIN_DELAY);
    publisher.produce(Message::new("t", "after-restart"));
    assert!(wait_until(DEADLINE, || subscriber.metrics().processed == 1));
    assert_eq!(
        seen.lock().expect("seen lock")[0],
        Message::new("t", "after-restart")
    );

    subscriber.stop();
    publisher.stop();
    Ok(())
}

#[test]
fn metrics_survive_stop_and_keep_counting_after_restart() -> Result<()> {
    let config = config_for_port(5616);
    let publisher = PublisherBus::new(config.clone());
    publisher.start()?;

    let subscriber = SubscriberBus::new(
        config,
        ["t"],
        Arc::new(|_message: &Message| {}),
    );
    subscriber.start()?;
    thread::sleep(JOIN_DELAY);

    for _ in 0..10 {
        publisher.produce(Message::new("t", stamp::stamp_payload(b"x")));
    }
    assert!(wait_until(DEADLINE, || subscriber.metrics().processed == 10));

    subscriber.stop();
    // Snapshots on a stopped bus stay valid and monotone.
    let first = subscriber.metrics();
    let second = subscriber.metrics();
    assert_eq!(first.processed, 10);
    assert!(second.processed >= first.processed);

    // The same bus restarts cleanly and keeps counting.
    subscriber.start()?;
    thread::sleep(JOIN_DELAY);
    publisher.produce(Message::new("t", stamp::stamp_payload(b"y")));
    assert!(wait_until(DEADLINE, || subscriber.metrics().processed == 11));

    subscriber.stop();
    publisher.stop();
    Ok(())
}
